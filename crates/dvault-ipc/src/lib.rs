//! # dvault-ipc
//!
//! Request/response protocol between `dvault` and `dvaultd`.
//!
//! Every message is one frame: a little-endian `u32` payload length
//! followed by the bincode encoding of a [`Request`] or [`Response`].
//! Requests on one connection are answered strictly in order, and an
//! upload session belongs to the connection that opened it.
//!
//! ```text
//! client                               server
//!   BeginUpload{path, chunk_size, ..} →
//!                                     ← UploadReady | Unchanged
//!   Chunk(Raw | Match)  ...           →
//!                                     ← Ack
//!   Chunk(End)                        →
//!                                     ← Ack
//!   EndUpload                         →
//!                                     ← Committed{index, is_script}
//! ```
//!
//! Answers that may not fit one frame are sent as a run of frames, see
//! [`split_response`]: a download is a `Content{total, ..}` frame followed
//! by `ContentMore` frames until `total` bytes have arrived, and the block
//! index arrives as `Index{part, more}` frames until `more` is false.

use dvault_cas::{ChunkMessage, StrongHash};
use dvault_manifest::{
    BlockIndex, Committed, ErrorKind, GcReport, ListEntry, StoreStatus, VersionInfo,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "tokio")]
pub mod client;
#[cfg(feature = "tokio")]
pub mod frame;

/// Default largest frame accepted by either side.
pub const DEFAULT_MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Default daemon address
pub fn default_server_addr() -> &'static str {
    "127.0.0.1:7341"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Handshake {
        client_version: String,
    },
    Status,
    MakeDir {
        path: String,
    },
    List {
        path: String,
    },
    Versions {
        path: String,
    },
    IndexSnapshot,
    /// Open an upload. `content_hash` is the BLAKE3 hash of the whole file.
    BeginUpload {
        path: String,
        chunk_size: u32,
        size: u64,
        content_hash: StrongHash,
    },
    Chunk(ChunkMessage),
    EndUpload,
    AbortUpload,
    /// `index: None` fetches the latest version.
    Download {
        path: String,
        index: Option<usize>,
    },
    DeleteVersion {
        path: String,
        index: usize,
    },
    Remove {
        path: String,
    },
    Gc,
}

impl Request {
    /// Short tag for logs; never includes payload bytes.
    pub fn tag(&self) -> &'static str {
        match self {
            Request::Handshake { .. } => "Handshake",
            Request::Status => "Status",
            Request::MakeDir { .. } => "MakeDir",
            Request::List { .. } => "List",
            Request::Versions { .. } => "Versions",
            Request::IndexSnapshot => "IndexSnapshot",
            Request::BeginUpload { .. } => "BeginUpload",
            Request::Chunk(_) => "Chunk",
            Request::EndUpload => "EndUpload",
            Request::AbortUpload => "AbortUpload",
            Request::Download { .. } => "Download",
            Request::DeleteVersion { .. } => "DeleteVersion",
            Request::Remove { .. } => "Remove",
            Request::Gc => "Gc",
        }
    }

    /// Whether a successful answer changed persistent state.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Request::MakeDir { .. }
                | Request::EndUpload
                | Request::DeleteVersion { .. }
                | Request::Remove { .. }
                | Request::Gc
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    HandshakeAck { server_version: String },
    Status(StoreStatus),
    Ack,
    Listing(Vec<ListEntry>),
    Versions(Vec<VersionInfo>),
    /// One part of the block index; `more` announces further parts.
    Index { part: BlockIndex, more: bool },
    /// The latest version already has the announced content.
    Unchanged,
    UploadReady,
    Committed(Committed),
    /// First piece of a download of `total` bytes.
    Content { total: u64, data: Vec<u8> },
    /// Continuation of a download.
    ContentMore(Vec<u8>),
    Removed { versions: usize },
    GcDone(GcReport),
    Error { kind: ErrorKind, message: String },
}

impl Response {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error {
            kind,
            message: message.into(),
        }
    }
}

/// An error answer from the daemon, kept typed so callers can match on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Framing failures.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: u32 },

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Frame bytes reserved around a piece for the enum tag and length fields.
const PIECE_OVERHEAD: usize = 64;

/// Upper bound on one index entry in a frame: weak key, bucket length,
/// strong hash and valid length.
const INDEX_ENTRY_BYTES: usize = 52;

/// Cut an answer into frames of at most `max_frame` bytes.
///
/// Only `Content` and `Index` are ever split; everything else is returned
/// as is.
pub fn split_response(response: Response, max_frame: u32) -> Vec<Response> {
    let room = (max_frame as usize).saturating_sub(PIECE_OVERHEAD).max(1);
    match response {
        Response::Content { total, data } if data.len() > room => {
            let mut pieces = data.chunks(room);
            let first = pieces.next().map(<[u8]>::to_vec).unwrap_or_default();
            let mut out = vec![Response::Content { total, data: first }];
            out.extend(pieces.map(|piece| Response::ContentMore(piece.to_vec())));
            out
        }
        Response::Index { part, more } if part.len() * INDEX_ENTRY_BYTES > room => {
            let parts = part.split(room / INDEX_ENTRY_BYTES);
            let last = parts.len().saturating_sub(1);
            parts
                .into_iter()
                .enumerate()
                .map(|(i, part)| Response::Index {
                    part,
                    more: more || i < last,
                })
                .collect()
        }
        other => vec![other],
    }
}

/// Encode `value` as a complete frame (length prefix included).
pub fn encode_frame<T: Serialize>(value: &T, max_frame: u32) -> Result<Vec<u8>, FrameError> {
    let payload = bincode::serialize(value)?;
    if payload.len() > max_frame as usize {
        return Err(FrameError::TooLarge {
            len: payload.len(),
            max: max_frame,
        });
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = Request::BeginUpload {
            path: "/docs/a.txt".to_string(),
            chunk_size: 256,
            size: 12,
            content_hash: [7u8; 32],
        };
        let bytes = bincode::serialize(&req).unwrap();
        let decoded: Request = bincode::deserialize(&bytes).unwrap();
        assert!(matches!(
            decoded,
            Request::BeginUpload { chunk_size: 256, size: 12, .. }
        ));
    }

    #[test]
    fn test_chunk_request_serialization() {
        let req = Request::Chunk(ChunkMessage::Match {
            weak: 42,
            strong: [1u8; 32],
            valid: 3,
        });
        let bytes = bincode::serialize(&req).unwrap();
        let decoded: Request = bincode::deserialize(&bytes).unwrap();
        match decoded {
            Request::Chunk(ChunkMessage::Match { weak, valid, .. }) => {
                assert_eq!(weak, 42);
                assert_eq!(valid, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_response_serialization() {
        let resp = Response::error(ErrorKind::TooFewVersions, "last version of /a");
        let bytes = bincode::serialize(&resp).unwrap();
        let decoded: Response = bincode::deserialize(&bytes).unwrap();
        assert!(matches!(
            decoded,
            Response::Error { kind: ErrorKind::TooFewVersions, .. }
        ));
    }

    #[test]
    fn test_mutating_requests() {
        assert!(Request::EndUpload.is_mutating());
        assert!(Request::Gc.is_mutating());
        assert!(!Request::Status.is_mutating());
        assert!(!Request::Chunk(ChunkMessage::End).is_mutating());
    }

    #[test]
    fn test_encode_frame_prefix() {
        let frame = encode_frame(&Request::Status, DEFAULT_MAX_FRAME).unwrap();
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
    }

    #[test]
    fn test_encode_frame_limit() {
        let resp = Response::ContentMore(vec![0u8; 100]);
        assert!(matches!(
            encode_frame(&resp, 50),
            Err(FrameError::TooLarge { max: 50, .. })
        ));
    }

    #[test]
    fn test_large_download_is_split_into_frames() {
        let data: Vec<u8> = (0..17 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let total = data.len() as u64;
        let pieces = split_response(
            Response::Content {
                total,
                data: data.clone(),
            },
            DEFAULT_MAX_FRAME,
        );
        assert_eq!(pieces.len(), 2);

        let mut joined = Vec::new();
        for (i, piece) in pieces.iter().enumerate() {
            assert!(encode_frame(piece, DEFAULT_MAX_FRAME).is_ok());
            match piece {
                Response::Content { total: t, data } if i == 0 => {
                    assert_eq!(*t, total);
                    joined.extend_from_slice(data);
                }
                Response::ContentMore(data) if i > 0 => joined.extend_from_slice(data),
                other => panic!("unexpected piece {:?}", other),
            }
        }
        assert_eq!(joined, data);
    }

    #[test]
    fn test_small_answers_stay_whole() {
        let pieces = split_response(
            Response::Content {
                total: 3,
                data: b"abc".to_vec(),
            },
            DEFAULT_MAX_FRAME,
        );
        assert!(matches!(pieces.as_slice(), [Response::Content { total: 3, .. }]));
        assert_eq!(split_response(Response::Ack, 128).len(), 1);
    }

    #[test]
    fn test_index_is_split_into_frames() {
        let mut index = BlockIndex::default();
        for weak in 0..200u64 {
            index.insert(weak, [weak as u8; 32], 256);
        }
        let max_frame = 1024;
        let parts = split_response(
            Response::Index {
                part: index.clone(),
                more: false,
            },
            max_frame,
        );
        assert!(parts.len() > 1);

        let last = parts.len() - 1;
        let mut merged = BlockIndex::default();
        for (i, part) in parts.into_iter().enumerate() {
            assert!(encode_frame(&part, max_frame).is_ok());
            match part {
                Response::Index { part, more } => {
                    assert_eq!(more, i != last);
                    merged.merge(part);
                }
                other => panic!("unexpected part {:?}", other),
            }
        }
        assert_eq!(merged, index);
    }

    #[test]
    fn test_default_server_addr() {
        assert!(default_server_addr().parse::<std::net::SocketAddr>().is_ok());
    }
}
