//! Weak (rolling) and strong block hashes.
//!
//! The weak hash is the rsync-style additive checksum over a window of
//! `N` bytes, kept as two accumulators modulo `2^31`:
//!
//! ```text
//! A = sum(x_i)                 mod M
//! B = sum((N - i) * x_i)       mod M      for i in 0..N
//! weak = A + M * B
//! ```
//!
//! Sliding the window by one byte is O(1). Windows shorter than `N` (the
//! tail of a file) hash exactly as if they were zero-padded to `N`, which
//! is also how the strong hash treats them.

use std::collections::VecDeque;
use std::io::{self, Read};

/// BLAKE3 digest (32 bytes)
pub type StrongHash = [u8; 32];

/// Combined rolling checksum (`A + M * B`)
pub type WeakHash = u64;

/// Modulus of both rolling accumulators.
pub const MODULUS: u64 = 1 << 31;

/// Fixed-capacity sliding window with O(1) weak-hash updates.
#[derive(Debug, Clone)]
pub struct RollingHash {
    window: VecDeque<u8>,
    capacity: usize,
    a: u64,
    b: u64,
}

impl RollingHash {
    /// Create an empty window of `capacity` bytes (the chunk size).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            a: 0,
            b: 0,
        }
    }

    /// Push a byte. Once the window is full, the oldest byte is evicted
    /// and returned.
    #[inline]
    pub fn push(&mut self, byte: u8) -> Option<u8> {
        let x = u64::from(byte);
        let n = self.capacity as u64;

        if self.window.len() == self.capacity {
            let old = self.window.pop_front().map(u64::from).unwrap_or(0);
            self.a = (self.a + MODULUS - old + x) % MODULUS;
            self.b = (self.b + MODULUS - (n * old) % MODULUS + self.a) % MODULUS;
            self.window.push_back(byte);
            Some(old as u8)
        } else {
            let weight = n - self.window.len() as u64;
            self.a = (self.a + x) % MODULUS;
            self.b = (self.b + (weight * x) % MODULUS) % MODULUS;
            self.window.push_back(byte);
            None
        }
    }

    /// Current weak hash.
    #[inline]
    pub fn digest(&self) -> WeakHash {
        self.a + MODULUS * self.b
    }

    /// Strong hash of the current window, zero-padded to capacity.
    pub fn strong(&self) -> StrongHash {
        let (head, tail) = self.window.as_slices();
        let mut hasher = blake3::Hasher::new();
        hasher.update(head);
        hasher.update(tail);
        pad_zeros(&mut hasher, self.capacity - self.window.len());
        *hasher.finalize().as_bytes()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.window.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every byte and reset the accumulators.
    pub fn clear(&mut self) {
        self.window.clear();
        self.a = 0;
        self.b = 0;
    }

    /// Iterate over the window contents, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.window.iter().copied()
    }
}

fn pad_zeros(hasher: &mut blake3::Hasher, mut count: usize) {
    const ZEROS: [u8; 4096] = [0u8; 4096];
    while count > 0 {
        let step = count.min(ZEROS.len());
        hasher.update(&ZEROS[..step]);
        count -= step;
    }
}

/// Weak hash of `data` computed from scratch, as a window of `chunk_size`.
///
/// `data` longer than `chunk_size` is truncated to its first `chunk_size`
/// bytes.
pub fn weak_hash(data: &[u8], chunk_size: usize) -> WeakHash {
    let n = chunk_size.max(1);
    let data = &data[..data.len().min(n)];
    let mut a = 0u64;
    let mut b = 0u64;
    for (i, &byte) in data.iter().enumerate() {
        let x = u64::from(byte);
        a = (a + x) % MODULUS;
        b = (b + ((n - i) as u64 * x) % MODULUS) % MODULUS;
    }
    a + MODULUS * b
}

/// Strong hash of a block payload, zero-padded to `chunk_size`.
pub fn strong_hash(data: &[u8], chunk_size: usize) -> StrongHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(data);
    pad_zeros(&mut hasher, chunk_size.saturating_sub(data.len()));
    *hasher.finalize().as_bytes()
}

/// Whole-content hash used to detect unchanged uploads.
#[inline]
pub fn content_hash(data: &[u8]) -> StrongHash {
    *blake3::hash(data).as_bytes()
}

/// Whole-content hash of a stream.
pub fn content_hash_reader<R: Read>(mut reader: R) -> io::Result<StrongHash> {
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(*hasher.finalize().as_bytes())
}

/// Convert a hash to its hex string representation.
#[inline]
pub fn hash_to_hex(hash: &StrongHash) -> String {
    hex::encode(hash)
}

/// Parse a hex string into a hash.
pub fn hex_to_hash(s: &str) -> Option<StrongHash> {
    let mut hash = [0u8; 32];
    hex::decode_to_slice(s, &mut hash).ok()?;
    Some(hash)
}
