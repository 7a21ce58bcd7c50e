//! IPC client for communicating with dvaultd

use anyhow::{anyhow, bail, Context};
use dvault_cas::{ChunkMessage, StrongHash};
use dvault_manifest::{BlockIndex, Committed, GcReport, ListEntry, StoreStatus, VersionInfo};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::frame::{read_frame, write_frame};
use crate::{default_server_addr, RemoteError, Request, Response, DEFAULT_MAX_FRAME};

/// Answer to [`DaemonClient::begin_upload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStart {
    Unchanged,
    Ready,
}

pub struct DaemonClient {
    stream: TcpStream,
    max_frame: u32,
}

impl DaemonClient {
    /// Connect to daemon at the default address
    pub async fn connect() -> anyhow::Result<Self> {
        Self::connect_to(default_server_addr()).await
    }

    /// Connect to daemon at a custom address
    pub async fn connect_to<A: ToSocketAddrs>(addr: A) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .context("Failed to connect to dvaultd")?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            max_frame: DEFAULT_MAX_FRAME,
        })
    }

    pub fn with_max_frame(mut self, max_frame: u32) -> Self {
        self.max_frame = max_frame;
        self
    }

    pub fn max_frame(&self) -> u32 {
        self.max_frame
    }

    /// Send a request and receive its response
    pub async fn send(&mut self, request: Request) -> anyhow::Result<Response> {
        write_frame(&mut self.stream, &request, self.max_frame).await?;
        self.receive().await
    }

    /// Read the next frame of a multi-frame answer.
    async fn receive(&mut self) -> anyhow::Result<Response> {
        read_frame(&mut self.stream, self.max_frame)
            .await?
            .ok_or_else(|| anyhow!("dvaultd closed the connection"))
    }

    /// Like [`send`](Self::send), but error answers become [`RemoteError`].
    async fn call(&mut self, request: Request) -> anyhow::Result<Response> {
        match self.send(request).await? {
            Response::Error { kind, message } => Err(RemoteError { kind, message }.into()),
            response => Ok(response),
        }
    }

    /// Handshake with daemon
    pub async fn handshake(&mut self) -> anyhow::Result<String> {
        let request = Request::Handshake {
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        match self.call(request).await? {
            Response::HandshakeAck { server_version } => Ok(server_version),
            other => bail!("Unexpected response to Handshake: {:?}", other),
        }
    }

    /// Get daemon status
    pub async fn status(&mut self) -> anyhow::Result<StoreStatus> {
        match self.call(Request::Status).await? {
            Response::Status(status) => Ok(status),
            other => bail!("Unexpected response to Status: {:?}", other),
        }
    }

    pub async fn make_dir(&mut self, path: &str) -> anyhow::Result<()> {
        self.expect_ack(Request::MakeDir {
            path: path.to_string(),
        })
        .await
    }

    pub async fn list(&mut self, path: &str) -> anyhow::Result<Vec<ListEntry>> {
        match self
            .call(Request::List {
                path: path.to_string(),
            })
            .await?
        {
            Response::Listing(entries) => Ok(entries),
            other => bail!("Unexpected response to List: {:?}", other),
        }
    }

    pub async fn versions(&mut self, path: &str) -> anyhow::Result<Vec<VersionInfo>> {
        match self
            .call(Request::Versions {
                path: path.to_string(),
            })
            .await?
        {
            Response::Versions(versions) => Ok(versions),
            other => bail!("Unexpected response to Versions: {:?}", other),
        }
    }

    /// Fetch the daemon's block index, reassembling it from its parts.
    pub async fn index_snapshot(&mut self) -> anyhow::Result<BlockIndex> {
        let (mut index, mut more) = match self.call(Request::IndexSnapshot).await? {
            Response::Index { part, more } => (part, more),
            other => bail!("Unexpected response to IndexSnapshot: {:?}", other),
        };
        while more {
            match self.receive().await? {
                Response::Index { part, more: rest } => {
                    index.merge(part);
                    more = rest;
                }
                other => bail!("Unexpected frame inside IndexSnapshot: {:?}", other),
            }
        }
        Ok(index)
    }

    pub async fn begin_upload(
        &mut self,
        path: &str,
        chunk_size: u32,
        size: u64,
        content_hash: StrongHash,
    ) -> anyhow::Result<UploadStart> {
        let request = Request::BeginUpload {
            path: path.to_string(),
            chunk_size,
            size,
            content_hash,
        };
        match self.call(request).await? {
            Response::Unchanged => Ok(UploadStart::Unchanged),
            Response::UploadReady => Ok(UploadStart::Ready),
            other => bail!("Unexpected response to BeginUpload: {:?}", other),
        }
    }

    pub async fn chunk(&mut self, message: ChunkMessage) -> anyhow::Result<()> {
        self.expect_ack(Request::Chunk(message)).await
    }

    pub async fn end_upload(&mut self) -> anyhow::Result<Committed> {
        match self.call(Request::EndUpload).await? {
            Response::Committed(committed) => Ok(committed),
            other => bail!("Unexpected response to EndUpload: {:?}", other),
        }
    }

    pub async fn abort_upload(&mut self) -> anyhow::Result<()> {
        self.expect_ack(Request::AbortUpload).await
    }

    /// Download a version into memory.
    pub async fn download(&mut self, path: &str, index: Option<usize>) -> anyhow::Result<Vec<u8>> {
        let mut data = Vec::new();
        self.download_with(path, index, |piece| {
            data.extend_from_slice(piece);
            Ok(())
        })
        .await?;
        Ok(data)
    }

    /// Download a version, handing each received piece to `sink` in order.
    /// Returns the total size.
    pub async fn download_with<F>(&mut self, path: &str, index: Option<usize>, mut sink: F) -> anyhow::Result<u64>
    where
        F: FnMut(&[u8]) -> anyhow::Result<()>,
    {
        let request = Request::Download {
            path: path.to_string(),
            index,
        };
        let (total, first) = match self.call(request).await? {
            Response::Content { total, data } => (total, data),
            other => bail!("Unexpected response to Download: {:?}", other),
        };

        // A failing sink still drains the remaining frames so the
        // connection stays in step.
        let mut received = first.len() as u64;
        let mut failed = sink(&first).err();
        while received < total {
            match self.receive().await? {
                Response::ContentMore(piece) if !piece.is_empty() => {
                    received += piece.len() as u64;
                    if failed.is_none() {
                        failed = sink(&piece).err();
                    }
                }
                other => bail!("Unexpected frame inside Download: {:?}", other),
            }
        }
        if let Some(e) = failed {
            return Err(e);
        }
        if received != total {
            bail!("Download of {} delivered {} bytes, expected {}", path, received, total);
        }
        Ok(total)
    }

    pub async fn delete_version(&mut self, path: &str, index: usize) -> anyhow::Result<()> {
        self.expect_ack(Request::DeleteVersion {
            path: path.to_string(),
            index,
        })
        .await
    }

    /// Remove a file or directory; returns the number of versions dropped.
    pub async fn remove(&mut self, path: &str) -> anyhow::Result<usize> {
        match self
            .call(Request::Remove {
                path: path.to_string(),
            })
            .await?
        {
            Response::Removed { versions } => Ok(versions),
            other => bail!("Unexpected response to Remove: {:?}", other),
        }
    }

    pub async fn gc(&mut self) -> anyhow::Result<GcReport> {
        match self.call(Request::Gc).await? {
            Response::GcDone(report) => Ok(report),
            other => bail!("Unexpected response to Gc: {:?}", other),
        }
    }

    async fn expect_ack(&mut self, request: Request) -> anyhow::Result<()> {
        let tag = request.tag();
        match self.call(request).await? {
            Response::Ack => Ok(()),
            other => bail!("Unexpected response to {}: {:?}", tag, other),
        }
    }
}
