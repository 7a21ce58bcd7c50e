//! The store actor: a single blocking task that owns the [`Store`].
//!
//! Connection tasks never touch the store directly. They send commands
//! over a bounded channel and wait on a oneshot for the answer, so every
//! request is applied in full before the next one starts.

use std::collections::HashMap;

use dvault_cas::chunk_size_for;
use dvault_config::{log_daemon_error, log_daemon_info, log_daemon_warn, log_sync_debug};
use dvault_ipc::{Request, Response};
use dvault_manifest::{BeginUpload, ErrorKind, SessionId, Store, StoreError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Identifies one client connection for the lifetime of the daemon.
pub type ConnectionId = u64;

enum Command {
    Request {
        conn: ConnectionId,
        request: Request,
        reply: oneshot::Sender<Response>,
    },
    Disconnect {
        conn: ConnectionId,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable sender side of the store actor.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<Command>,
}

impl StoreHandle {
    /// Run one request on behalf of `conn`.
    pub async fn request(&self, conn: ConnectionId, request: Request) -> Response {
        let (reply, rx) = oneshot::channel();
        let command = Command::Request {
            conn,
            request,
            reply,
        };
        if self.tx.send(command).await.is_err() {
            return Response::error(ErrorKind::Internal, "store is shutting down");
        }
        rx.await
            .unwrap_or_else(|_| Response::error(ErrorKind::Internal, "store dropped the request"))
    }

    /// Forget `conn`, aborting its upload if one is open.
    pub async fn disconnect(&self, conn: ConnectionId) {
        let _ = self.tx.send(Command::Disconnect { conn }).await;
    }

    /// Save and stop the actor. Later requests are answered with an error.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Start the actor on the blocking pool.
pub fn spawn_store_actor(store: Store, queue: usize) -> (StoreHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(queue.max(1));
    let actor = StoreActor::new(store);
    let join = tokio::task::spawn_blocking(move || actor.run(rx));
    (StoreHandle { tx }, join)
}

pub struct StoreActor {
    store: Store,
    sessions: HashMap<ConnectionId, SessionId>,
}

impl StoreActor {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            sessions: HashMap::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut on_shutdown = None;
        while let Some(command) = rx.blocking_recv() {
            match command {
                Command::Request {
                    conn,
                    request,
                    reply,
                } => {
                    let response = self.handle(conn, request);
                    // The connection may be gone; its answer is simply lost.
                    let _ = reply.send(response);
                }
                Command::Disconnect { conn } => self.disconnect(conn),
                Command::Shutdown { reply } => {
                    on_shutdown = Some(reply);
                    break;
                }
            }
        }

        self.close();
        if let Some(reply) = on_shutdown {
            let _ = reply.send(());
        }
    }

    /// Abort every open upload and write the final snapshot.
    pub fn close(&mut self) {
        for (_, session) in self.sessions.drain() {
            let _ = self.store.abort_upload(session);
        }
        match self.store.save() {
            Ok(()) => log_daemon_info!("Store saved on shutdown"),
            Err(e) => log_daemon_error!("Failed to save store on shutdown", error = e.to_string()),
        }
    }

    pub fn disconnect(&mut self, conn: ConnectionId) {
        if let Some(session) = self.sessions.remove(&conn) {
            log_sync_debug!("Connection lost mid-upload", conn = conn, session = session.0);
            let _ = self.store.abort_upload(session);
        }
    }

    /// Answer one request. Failures become [`Response::Error`]; the actor
    /// keeps serving.
    ///
    /// The snapshot is saved after every successful mutating request, and
    /// after any request (failed ones included) during which GC removed
    /// versions or payloads.
    pub fn handle(&mut self, conn: ConnectionId, request: Request) -> Response {
        let tag = request.tag();
        let mutating = request.is_mutating();

        let result = self.dispatch(conn, request);
        if self.store.is_dirty() || (mutating && result.is_ok()) {
            if let Err(e) = self.store.save() {
                log_daemon_error!("Failed to save store", request = tag, error = e.to_string());
                if result.is_ok() {
                    return error_response(&e);
                }
            }
        }

        match result {
            Ok(response) => response,
            Err(e) => {
                log_daemon_warn!(
                    "Request failed",
                    conn = conn,
                    request = tag,
                    kind = e.kind().to_string(),
                    error = e.to_string()
                );
                error_response(&e)
            }
        }
    }

    fn dispatch(&mut self, conn: ConnectionId, request: Request) -> Result<Response, StoreError> {
        let response = match request {
            Request::Handshake { client_version } => {
                log_daemon_info!("Handshake", conn = conn, client_version = client_version.as_str());
                Response::HandshakeAck {
                    server_version: env!("CARGO_PKG_VERSION").to_string(),
                }
            }
            Request::Status => Response::Status(self.store.status()?),
            Request::MakeDir { path } => {
                self.store.make_dir(&path)?;
                Response::Ack
            }
            Request::List { path } => Response::Listing(self.store.list(&path)?),
            Request::Versions { path } => Response::Versions(self.store.versions(&path)?),
            Request::IndexSnapshot => Response::Index {
                part: self.store.index_snapshot(),
                more: false,
            },
            Request::BeginUpload {
                path,
                chunk_size,
                size,
                content_hash,
            } => {
                if let Some(stale) = self.sessions.remove(&conn) {
                    let _ = self.store.abort_upload(stale);
                }
                let expected = chunk_size_for(size);
                if chunk_size as usize != expected {
                    return Err(StoreError::ChunkSizeMismatch {
                        declared: chunk_size as usize,
                        expected,
                    });
                }
                match self.store.begin_upload(&path, expected, size, content_hash)? {
                    BeginUpload::Unchanged => Response::Unchanged,
                    BeginUpload::Ready(session) => {
                        self.sessions.insert(conn, session);
                        Response::UploadReady
                    }
                }
            }
            Request::Chunk(message) => {
                let session = self.session(conn)?;
                if let Err(e) = self.store.upload_chunk(session, message) {
                    self.sessions.remove(&conn);
                    let _ = self.store.abort_upload(session);
                    return Err(e);
                }
                Response::Ack
            }
            Request::EndUpload => {
                let session = self.session(conn)?;
                self.sessions.remove(&conn);
                Response::Committed(self.store.finish_upload(session)?)
            }
            Request::AbortUpload => {
                if let Some(session) = self.sessions.remove(&conn) {
                    self.store.abort_upload(session)?;
                }
                Response::Ack
            }
            Request::Download { path, index } => {
                let data = self.store.read_version(&path, index)?;
                Response::Content {
                    total: data.len() as u64,
                    data,
                }
            }
            Request::DeleteVersion { path, index } => {
                self.store.delete_version(&path, index)?;
                Response::Ack
            }
            Request::Remove { path } => Response::Removed {
                versions: self.store.remove(&path)?,
            },
            Request::Gc => {
                let report = self.store.reclaim_once()?;
                log_daemon_info!(
                    "Explicit GC finished",
                    versions = report.versions_removed,
                    blocks = report.blocks_freed,
                    bytes = report.bytes_freed
                );
                Response::GcDone(report)
            }
        };
        Ok(response)
    }

    fn session(&self, conn: ConnectionId) -> Result<SessionId, StoreError> {
        self.sessions
            .get(&conn)
            .copied()
            .ok_or_else(|| StoreError::UploadState("no upload in progress on this connection".into()))
    }
}

fn error_response(e: &StoreError) -> Response {
    Response::error(e.kind(), e.to_string())
}
