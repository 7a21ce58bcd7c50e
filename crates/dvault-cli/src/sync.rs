//! # Client half of the sync protocol
//!
//! An upload announces the whole-file hash first. If the daemon already
//! has that content as the latest version nothing else is sent. Otherwise
//! the client fetches the daemon's block index and runs the rolling-hash
//! chunker over the file, sending `Match` for blocks the daemon has and
//! `Raw` bytes for everything else.
//!
//! The chunker is synchronous and runs on the blocking pool. Its messages
//! reach the async connection through a bounded channel.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use dvault_cas::{
    chunk_size_for, content_hash_reader, strong_hash, weak_hash, ChunkMessage, ChunkSink,
    ChunkStats, Chunker, StrongHash, WeakHash,
};
use dvault_config::{log_sync_debug, log_sync_info};
use dvault_ipc::client::{DaemonClient, UploadStart};
use dvault_ipc::RemoteError;
use dvault_manifest::{BlockIndex, Committed, ErrorKind};
use tokio::sync::mpsc;
use walkdir::WalkDir;

/// Chunk messages buffered between the chunker and the connection.
const CHANNEL_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadResult {
    Unchanged,
    Committed(Committed),
}

#[derive(Debug, Clone)]
pub struct UploadReport {
    pub remote: String,
    pub size: u64,
    pub result: UploadResult,
    pub stats: ChunkStats,
}

/// Upload one local file as a new version of `remote`.
///
/// A match against a block the daemon dropped in the meantime fails with
/// `BlockNotFound`; the upload is retried once with a fresh index.
pub async fn upload_file(client: &mut DaemonClient, local: &Path, remote: &str) -> Result<UploadReport> {
    match upload_once(client, local, remote).await {
        Err(e) if remote_kind(&e) == Some(ErrorKind::BlockNotFound) => {
            log_sync_info!("Block index went stale, retrying", remote = remote);
            upload_once(client, local, remote).await
        }
        other => other,
    }
}

async fn upload_once(client: &mut DaemonClient, local: &Path, remote: &str) -> Result<UploadReport> {
    let size = std::fs::metadata(local)
        .with_context(|| format!("Failed to stat {}", local.display()))?
        .len();
    let chunk_size = chunk_size_for(size);
    let hash = hash_file(local.to_path_buf()).await?;

    let unchanged = UploadReport {
        remote: remote.to_string(),
        size,
        result: UploadResult::Unchanged,
        stats: ChunkStats::default(),
    };
    if client.begin_upload(remote, chunk_size as u32, size, hash).await? == UploadStart::Unchanged {
        log_sync_debug!("Unchanged", remote = remote);
        return Ok(unchanged);
    }

    let index = match client.index_snapshot().await {
        Ok(index) => index,
        Err(e) => {
            let _ = client.abort_upload().await;
            return Err(e);
        }
    };
    log_sync_debug!("Index fetched", remote = remote, blocks = index.len(), chunk_size = chunk_size);

    let raw_limit = raw_limit(chunk_size, client.max_frame());
    let (tx, mut rx) = mpsc::channel::<ChunkMessage>(CHANNEL_DEPTH);
    let path = local.to_path_buf();
    let chunker = tokio::task::spawn_blocking(move || -> Result<ChunkStats> {
        let file = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut sink = PlanSink::new(index, chunk_size, raw_limit, |message| {
            tx.blocking_send(message)
                .map_err(|_| anyhow!("upload connection went away"))
        });
        Chunker::new(chunk_size).run(file, &mut sink)
    });

    let mut send_error = None;
    while let Some(message) = rx.recv().await {
        if let Err(e) = client.chunk(message).await {
            send_error = Some(e);
            break;
        }
    }
    // Unblocks the chunker if sending stopped early.
    drop(rx);

    let stats = match (send_error, chunker.await?) {
        (None, Ok(stats)) => stats,
        (Some(e), _) | (None, Err(e)) => {
            let _ = client.abort_upload().await;
            return Err(e);
        }
    };

    let committed = client.end_upload().await?;
    log_sync_info!(
        "Uploaded",
        remote = remote,
        index = committed.index,
        script = committed.is_script,
        raw = stats.raw_bytes,
        matched = stats.matched_blocks
    );
    Ok(UploadReport {
        result: UploadResult::Committed(committed),
        stats,
        ..unchanged
    })
}

/// Upload every regular file under `local` to `remote/<relative path>`.
pub async fn upload_tree(client: &mut DaemonClient, local: &Path, remote: &str) -> Result<Vec<UploadReport>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(local).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }

    let mut reports = Vec::with_capacity(files.len());
    for file in files {
        let relative = file.strip_prefix(local).unwrap_or(&file);
        let target = remote_join(remote, relative);
        reports.push(upload_file(client, &file, &target).await?);
    }
    Ok(reports)
}

/// Fetch a version of `remote` into `local`, replacing it atomically.
pub async fn download_file(
    client: &mut DaemonClient,
    remote: &str,
    index: Option<usize>,
    local: &Path,
) -> Result<u64> {
    let parent = match local.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(&parent)?;
    let size = client
        .download_with(remote, index, |piece| Ok(temp.write_all(piece)?))
        .await?;
    temp.as_file().sync_all()?;
    temp.persist(local)
        .with_context(|| format!("Failed to write {}", local.display()))?;
    log_sync_debug!("Downloaded", remote = remote, bytes = size);
    Ok(size)
}

/// Join a remote prefix and a local relative path with `/`.
pub fn remote_join(prefix: &str, relative: &Path) -> String {
    let mut out = prefix.trim_end_matches('/').to_string();
    for component in relative.components() {
        out.push('/');
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}

/// Largest raw message, a whole number of chunks that fits a frame.
fn raw_limit(chunk_size: usize, max_frame: u32) -> usize {
    let chunks = (max_frame as usize / 2) / chunk_size;
    chunks.max(1) * chunk_size
}

fn remote_kind(e: &anyhow::Error) -> Option<ErrorKind> {
    e.downcast_ref::<RemoteError>().map(|r| r.kind)
}

async fn hash_file(path: PathBuf) -> Result<StrongHash> {
    tokio::task::spawn_blocking(move || -> Result<StrongHash> {
        let file = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(content_hash_reader(file)?)
    })
    .await?
}

/// Chunk sink over a local copy of the daemon's block index.
///
/// Raw runs are learned into the index the same way the daemon splits
/// them into blocks, so later repeats of those bytes go out as matches.
struct PlanSink<F> {
    index: BlockIndex,
    chunk_size: usize,
    raw_limit: usize,
    deliver: F,
}

impl<F> PlanSink<F>
where
    F: FnMut(ChunkMessage) -> Result<()>,
{
    fn new(index: BlockIndex, chunk_size: usize, raw_limit: usize, deliver: F) -> Self {
        Self {
            index,
            chunk_size,
            raw_limit,
            deliver,
        }
    }
}

impl<F> ChunkSink for PlanSink<F>
where
    F: FnMut(ChunkMessage) -> Result<()>,
{
    type Error = anyhow::Error;

    fn contains_weak(&mut self, weak: WeakHash) -> Result<bool> {
        Ok(self.index.contains_weak(weak))
    }

    fn contains(&mut self, weak: WeakHash, strong: &StrongHash, valid: usize) -> Result<bool> {
        Ok(self.index.contains(weak, strong, valid as u32))
    }

    fn send(&mut self, message: ChunkMessage) -> Result<()> {
        match message {
            ChunkMessage::Raw(data) => {
                for piece in data.chunks(self.chunk_size) {
                    self.index.insert(
                        weak_hash(piece, self.chunk_size),
                        strong_hash(piece, self.chunk_size),
                        piece.len() as u32,
                    );
                }
                for part in data.chunks(self.raw_limit) {
                    (self.deliver)(ChunkMessage::Raw(part.to_vec()))?;
                }
                Ok(())
            }
            other => (self.deliver)(other),
        }
    }
}
