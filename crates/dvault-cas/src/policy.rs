//! Chunk-size policy shared by client and server.
//!
//! The chunk size is part of the sync protocol: both sides derive it from
//! the file length and must agree exactly.

/// Chunk size per hex-digit length of the file size.
///
/// Index 0 covers files up to `0xFFF` bytes; every further entry covers one
/// more hex digit. Lengths beyond the table use the last entry.
const CHUNK_SIZE_TABLE: [usize; 6] = [256, 512, 2048, 8 * 1024, 32 * 1024, 128 * 1024];

/// Largest chunk size the policy ever returns.
pub const MAX_CHUNK_SIZE: usize = 512 * 1024;

/// Number of hexadecimal digits needed to print `len` (0 for 0).
pub fn hex_digits(len: u64) -> u32 {
    (u64::BITS - len.leading_zeros()).div_ceil(4)
}

/// Chunk size for a file of `len` bytes.
pub fn chunk_size_for(len: u64) -> usize {
    let digits = hex_digits(len);
    if digits <= 3 {
        return CHUNK_SIZE_TABLE[0];
    }
    CHUNK_SIZE_TABLE
        .get((digits - 3) as usize)
        .copied()
        .unwrap_or(MAX_CHUNK_SIZE)
}
