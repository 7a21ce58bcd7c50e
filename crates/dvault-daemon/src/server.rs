//! TCP accept loop and per-connection request loop.

use std::future::Future;
use std::net::SocketAddr;

use anyhow::Context;
use dvault_config::{log_daemon_info, log_daemon_warn, log_ipc_debug, Config};
use dvault_ipc::frame::{read_frame, write_frame};
use dvault_ipc::{split_response, FrameError, Request, Response};
use dvault_manifest::{ErrorKind, Store, StoreOptions};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::actor::{spawn_store_actor, ConnectionId, StoreHandle};

/// Commands buffered between connection tasks and the store actor.
const COMMAND_QUEUE: usize = 64;

pub struct Daemon {
    listener: TcpListener,
    handle: StoreHandle,
    actor: JoinHandle<()>,
    max_frame: u32,
}

impl Daemon {
    /// Open the store and bind the listen address from `config`.
    pub async fn bind(config: &Config) -> anyhow::Result<Self> {
        let root = config.store_root();
        let options = StoreOptions::from(config);
        let open_root = root.clone();
        let store = tokio::task::spawn_blocking(move || Store::open(&open_root, options))
            .await?
            .with_context(|| format!("Failed to open store at {}", root.display()))?;
        log_daemon_info!(
            "Store opened",
            root = root.display().to_string(),
            blocks = store.database().block_count(),
            available = store.available_space()
        );

        let listener = TcpListener::bind(&config.daemon.listen)
            .await
            .with_context(|| format!("Failed to bind {}", config.daemon.listen))?;
        let (handle, actor) = spawn_store_actor(store, COMMAND_QUEUE);

        Ok(Self {
            listener,
            handle,
            actor,
            max_frame: config.daemon.max_frame,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` resolves, then save the store and stop.
    pub async fn run_until<F: Future>(self, shutdown: F) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        log_daemon_info!("Listening", addr = addr.to_string());
        tokio::pin!(shutdown);

        let mut next_conn: ConnectionId = 0;
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            next_conn += 1;
                            log_daemon_info!("Connection accepted", conn = next_conn, peer = peer.to_string());
                            tokio::spawn(handle_connection(
                                stream,
                                self.handle.clone(),
                                next_conn,
                                self.max_frame,
                            ));
                        }
                        Err(err) => {
                            log_daemon_warn!("Accept error", error = err.to_string());
                        }
                    }
                }
                _ = &mut shutdown => {
                    log_daemon_info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.handle.shutdown().await;
        self.actor.await.context("Store actor panicked")?;
        log_daemon_info!("Shut down");
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    handle: StoreHandle,
    conn: ConnectionId,
    max_frame: u32,
) {
    let _ = stream.set_nodelay(true);

    loop {
        let request = match read_frame::<_, Request>(&mut stream, max_frame).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(FrameError::Codec(e)) => {
                let response = Response::error(ErrorKind::Internal, format!("Invalid request: {}", e));
                if write_frame(&mut stream, &response, max_frame).await.is_err() {
                    break;
                }
                continue;
            }
            Err(e) => {
                log_daemon_warn!("Dropping connection", conn = conn, error = e.to_string());
                break;
            }
        };

        log_ipc_debug!("Request received", conn = conn, request = request.tag());
        let response = handle.request(conn, request).await;

        if let Err(e) = send_response(&mut stream, response, max_frame).await {
            log_daemon_warn!("Write failed", conn = conn, error = e.to_string());
            break;
        }
    }

    log_daemon_info!("Connection closed", conn = conn);
    handle.disconnect(conn).await;
}

/// Write an answer, split over as many frames as it needs.
async fn send_response(stream: &mut TcpStream, response: Response, max_frame: u32) -> Result<(), FrameError> {
    for piece in split_response(response, max_frame) {
        match write_frame(stream, &piece, max_frame).await {
            Ok(()) => {}
            Err(FrameError::TooLarge { len, max }) => {
                let response = Response::error(
                    ErrorKind::Internal,
                    format!("response of {} bytes exceeds the {} byte frame limit", len, max),
                );
                return write_frame(stream, &response, max_frame).await;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
