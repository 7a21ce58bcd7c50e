//! Rolling-window chunker for the sync protocol.
//!
//! The chunker slides a window of `chunk_size` bytes over a stream and asks
//! a [`ChunkSink`] whether the current window is an already-stored block.
//! On a hit it flushes the bytes that fell out of the window so far as one
//! [`ChunkMessage::Raw`], sends a [`ChunkMessage::Match`] and skips a whole
//! window ahead. On a miss the oldest byte joins the unmatched buffer.
//!
//! The same driver runs on the client (against an index snapshot fetched
//! from the server) and on the server when a script-form version is turned
//! back into blocks (against the live index).

use std::io::{self, BufReader, Bytes, Read};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::hash::{RollingHash, StrongHash, WeakHash};

/// One element of a chunk stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkMessage {
    /// Bytes with no known block; the receiver splits them into new blocks.
    Raw(Vec<u8>),
    /// Reference to a stored block. `valid` is below the chunk size only
    /// for the final block of a stream.
    Match {
        weak: WeakHash,
        strong: StrongHash,
        valid: u32,
    },
    /// End of stream.
    End,
}

/// Block lookup and message delivery for [`Chunker::run`].
pub trait ChunkSink {
    type Error: From<io::Error>;

    /// Cheap first check on the weak hash alone.
    fn contains_weak(&mut self, weak: WeakHash) -> Result<bool, Self::Error>;

    /// Confirm a weak hit with the strong hash of the same window.
    fn contains(
        &mut self,
        weak: WeakHash,
        strong: &StrongHash,
        valid: usize,
    ) -> Result<bool, Self::Error>;

    /// Deliver a message. Implementations that cache the index refresh it
    /// after a `Raw` message.
    fn send(&mut self, message: ChunkMessage) -> Result<(), Self::Error>;
}

/// Counters for a finished chunk run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub bytes_read: u64,
    pub raw_bytes: u64,
    pub raw_messages: u64,
    pub matched_blocks: u64,
}

/// Drives a [`RollingHash`] over a byte stream.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Chunk `reader` into `sink`, finishing with [`ChunkMessage::End`].
    pub fn run<R: Read, S: ChunkSink>(
        &self,
        reader: R,
        sink: &mut S,
    ) -> Result<ChunkStats, S::Error> {
        let n = self.chunk_size;
        let mut bytes = BufReader::new(reader).bytes();
        let mut window = RollingHash::new(n);
        let mut unmatched = Vec::new();
        let mut stats = ChunkStats::default();

        stats.bytes_read += fill(&mut window, &mut bytes, n - 1)?;

        while let Some(byte) = bytes.next().transpose()? {
            stats.bytes_read += 1;
            if let Some(evicted) = window.push(byte) {
                unmatched.push(evicted);
            }
            if lookup(&window, sink)? {
                flush(&mut unmatched, sink, &mut stats)?;
                send_match(&window, sink, &mut stats)?;
                window.clear();
                stats.bytes_read += fill(&mut window, &mut bytes, n - 1)?;
            }
        }

        // A short tail gets one more lookup of its own before it is sent raw.
        if !window.is_empty() {
            if !window.is_full() && lookup(&window, sink)? {
                flush(&mut unmatched, sink, &mut stats)?;
                send_match(&window, sink, &mut stats)?;
            } else {
                unmatched.extend(window.iter());
            }
        }
        flush(&mut unmatched, sink, &mut stats)?;
        sink.send(ChunkMessage::End)?;

        trace!(
            bytes = stats.bytes_read,
            raw = stats.raw_bytes,
            matched = stats.matched_blocks,
            "chunk run finished"
        );
        Ok(stats)
    }

    /// Chunk an in-memory buffer.
    pub fn run_slice<S: ChunkSink>(&self, data: &[u8], sink: &mut S) -> Result<ChunkStats, S::Error> {
        self.run(data, sink)
    }
}

fn fill<R: Read>(
    window: &mut RollingHash,
    bytes: &mut Bytes<BufReader<R>>,
    count: usize,
) -> io::Result<u64> {
    let mut read = 0;
    while read < count as u64 {
        match bytes.next().transpose()? {
            Some(byte) => {
                window.push(byte);
                read += 1;
            }
            None => break,
        }
    }
    Ok(read)
}

fn lookup<S: ChunkSink>(window: &RollingHash, sink: &mut S) -> Result<bool, S::Error> {
    let weak = window.digest();
    if !sink.contains_weak(weak)? {
        return Ok(false);
    }
    sink.contains(weak, &window.strong(), window.len())
}

fn send_match<S: ChunkSink>(
    window: &RollingHash,
    sink: &mut S,
    stats: &mut ChunkStats,
) -> Result<(), S::Error> {
    sink.send(ChunkMessage::Match {
        weak: window.digest(),
        strong: window.strong(),
        valid: window.len() as u32,
    })?;
    stats.matched_blocks += 1;
    Ok(())
}

fn flush<S: ChunkSink>(
    unmatched: &mut Vec<u8>,
    sink: &mut S,
    stats: &mut ChunkStats,
) -> Result<(), S::Error> {
    if unmatched.is_empty() {
        return Ok(());
    }
    stats.raw_bytes += unmatched.len() as u64;
    stats.raw_messages += 1;
    sink.send(ChunkMessage::Raw(std::mem::take(unmatched)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{strong_hash, weak_hash};
    use std::collections::{HashMap, HashSet};

    /// In-memory sink that learns every raw chunk as a block, the way the
    /// server does after a raw flush.
    #[derive(Default)]
    struct LearningSink {
        chunk_size: usize,
        index: HashMap<WeakHash, HashSet<(StrongHash, usize)>>,
        blocks: HashMap<(StrongHash, usize), Vec<u8>>,
        messages: Vec<ChunkMessage>,
    }

    impl LearningSink {
        fn new(chunk_size: usize) -> Self {
            Self {
                chunk_size,
                ..Default::default()
            }
        }

        fn learn(&mut self, data: &[u8]) {
            for piece in data.chunks(self.chunk_size) {
                let weak = weak_hash(piece, self.chunk_size);
                let strong = strong_hash(piece, self.chunk_size);
                self.index
                    .entry(weak)
                    .or_default()
                    .insert((strong, piece.len()));
                self.blocks.insert((strong, piece.len()), piece.to_vec());
            }
        }

        fn rebuild(&self) -> Vec<u8> {
            let mut out = Vec::new();
            for message in &self.messages {
                match message {
                    ChunkMessage::Raw(data) => out.extend_from_slice(data),
                    ChunkMessage::Match { strong, valid, .. } => {
                        out.extend_from_slice(&self.blocks[&(*strong, *valid as usize)])
                    }
                    ChunkMessage::End => {}
                }
            }
            out
        }
    }

    impl ChunkSink for LearningSink {
        type Error = io::Error;

        fn contains_weak(&mut self, weak: WeakHash) -> io::Result<bool> {
            Ok(self.index.contains_key(&weak))
        }

        fn contains(&mut self, weak: WeakHash, strong: &StrongHash, valid: usize) -> io::Result<bool> {
            Ok(self
                .index
                .get(&weak)
                .is_some_and(|set| set.contains(&(*strong, valid))))
        }

        fn send(&mut self, message: ChunkMessage) -> io::Result<()> {
            if let ChunkMessage::Raw(data) = &message {
                let data = data.clone();
                self.learn(&data);
            }
            self.messages.push(message);
            Ok(())
        }
    }

    #[test]
    fn test_empty_index_sends_everything_raw() {
        let mut sink = LearningSink::new(4);
        let stats = Chunker::new(4).run_slice(b"AAAABBBBCCCC", &mut sink).unwrap();

        assert_eq!(
            sink.messages,
            vec![ChunkMessage::Raw(b"AAAABBBBCCCC".to_vec()), ChunkMessage::End]
        );
        assert_eq!(stats.raw_bytes, 12);
        assert_eq!(stats.matched_blocks, 0);
        assert_eq!(stats.bytes_read, 12);
    }

    #[test]
    fn test_known_blocks_are_matched() {
        let mut sink = LearningSink::new(4);
        sink.learn(b"AAAABBBBCCCC");

        let stats = Chunker::new(4).run_slice(b"AAAABBBBCCCC", &mut sink).unwrap();
        assert_eq!(stats.matched_blocks, 3);
        assert_eq!(stats.raw_bytes, 0);
        assert_eq!(sink.messages.len(), 4);
        assert_eq!(sink.rebuild(), b"AAAABBBBCCCC");
    }

    #[test]
    fn test_shifted_content_realigns() {
        let mut sink = LearningSink::new(4);
        sink.learn(b"AAAABBBBCCCC");

        // One inserted byte in front: everything after it still matches.
        let stats = Chunker::new(4).run_slice(b"xAAAABBBBCCCC", &mut sink).unwrap();
        assert_eq!(stats.matched_blocks, 3);
        assert_eq!(stats.raw_bytes, 1);
        assert_eq!(sink.messages[0], ChunkMessage::Raw(b"x".to_vec()));
        assert_eq!(sink.rebuild(), b"xAAAABBBBCCCC");
    }

    #[test]
    fn test_short_tail_is_looked_up() {
        let mut sink = LearningSink::new(4);
        sink.learn(b"AAAAZZ");

        let stats = Chunker::new(4).run_slice(b"AAAAZZ", &mut sink).unwrap();
        assert_eq!(stats.matched_blocks, 2);
        match &sink.messages[1] {
            ChunkMessage::Match { valid, .. } => assert_eq!(*valid, 2),
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn test_stream_shorter_than_window() {
        let mut sink = LearningSink::new(16);
        Chunker::new(16).run_slice(b"abc", &mut sink).unwrap();
        assert_eq!(
            sink.messages,
            vec![ChunkMessage::Raw(b"abc".to_vec()), ChunkMessage::End]
        );
    }

    #[test]
    fn test_empty_stream_only_ends() {
        let mut sink = LearningSink::new(8);
        let stats = Chunker::new(8).run_slice(b"", &mut sink).unwrap();
        assert_eq!(sink.messages, vec![ChunkMessage::End]);
        assert_eq!(stats, ChunkStats::default());
    }

    #[test]
    fn test_rebuild_roundtrip_over_many_edits() {
        let mut state = 17u64;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            (state >> 33) as u8
        };
        let base: Vec<u8> = (0..5000).map(|_| next()).collect();
        let mut sink = LearningSink::new(64);
        Chunker::new(64).run_slice(&base, &mut sink).unwrap();
        assert_eq!(sink.rebuild(), base);

        for round in 0..5 {
            let mut edited = base.clone();
            let at = 300 * (round + 1);
            edited.splice(at..at + 10, (0..round * 7).map(|_| next()));
            sink.messages.clear();
            let stats = Chunker::new(64).run_slice(&edited, &mut sink).unwrap();
            assert_eq!(sink.rebuild(), edited);
            assert!(stats.matched_blocks > 50, "round {round}: {stats:?}");
        }
    }
}
