// SPDX-License-Identifier: GPL-3.0-only

//! WebSocket broadcast server
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  accept   ┌────────────────────┐
//! │ accept loop  │──────────▶│ connection task ×N │  handshake, push frames
//! └──────┬───────┘           └─────────┬──────────┘
//!        │ fault                       │ register / unregister
//!        ▼                             ▼
//! ┌──────────────┐  Broadcast ┌────────────────────┐
//! │ StateChannel │  ────────▶ │     client hub     │  sole owner of the set
//! └──────────────┘            └────────────────────┘
//! ```
//!
//! One episode (listener, hub, connection tasks) exists per Running state and
//! shares one cancellation token; stopping cancels it and waits for every
//! task to release its socket.

pub mod clients;
mod connection;
pub mod events;
mod state;

pub use clients::{ClientId, ClientInfo, ClientRegistry, ClientSink, LatestFrameSink};
pub use events::{ConnectionEvent, InboundKind};
pub use state::{ServerInfo, ServerState};

use crate::errors::{ServerError, ServerResult};
use crate::pipeline::FrameSink;
use bytes::Bytes;
use clients::{HubCommand, run_hub};
use futures::stream::BoxStream;
use events::EventBus;
use state::StateChannel;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Resources of one Running episode
struct Episode {
    id: u64,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    hub: mpsc::UnboundedSender<HubCommand>,
    accept_task: JoinHandle<()>,
    hub_task: JoinHandle<()>,
}

struct Shared {
    state: StateChannel,
    events: EventBus,
    episode: Mutex<Option<Episode>>,
    next_episode: AtomicU64,
    /// Serializes `start` so concurrent callers cannot orphan an episode
    starting: tokio::sync::Mutex<()>,
}

impl Shared {
    fn episode(&self) -> MutexGuard<'_, Option<Episode>> {
        self.episode.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Listener-level fault: end the episode unless a stop already took it
    fn fault(&self, episode_id: u64, cause: ServerError) {
        let mut slot = self.episode();
        if slot.as_ref().map(|e| e.id) != Some(episode_id) {
            return;
        }
        let episode = slot.take();
        error!(error = %cause, "Server fault, stopping");
        self.events.emit(ConnectionEvent::Error {
            client: None,
            cause: cause.to_string(),
        });
        self.state.fail(cause);
        drop(slot);

        if let Some(episode) = episode {
            episode.cancel.cancel();
        }
    }
}

/// Push-only WebSocket server broadcasting binary frames to every client
pub struct BroadcastServer {
    shared: Arc<Shared>,
}

impl BroadcastServer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: StateChannel::new(),
                events: EventBus::new(),
                episode: Mutex::new(None),
                next_episode: AtomicU64::new(1),
                starting: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Bind `address:port` and start accepting clients
    ///
    /// A running episode is stopped first. On failure the state moves to
    /// `Error` and then straight back to `Stopped`. Port 0 binds an ephemeral
    /// port; the returned info carries the actual one.
    pub async fn start(&self, address: IpAddr, port: u16) -> ServerResult<ServerInfo> {
        let _starting = self.shared.starting.lock().await;
        if self.shared.episode().is_some() {
            info!("Server already running, restarting");
            self.stop().await?;
        }

        let bind_addr = SocketAddr::new(address, port);
        info!(address = %bind_addr, "Starting broadcast server");

        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(e) => return Err(self.start_failed(ServerError::from_bind(bind_addr.to_string(), &e))),
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => return Err(self.start_failed(ServerError::Start(e.to_string()))),
        };

        let id = self.shared.next_episode.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (hub_tx, hub_rx) = mpsc::unbounded_channel();

        let info = ServerInfo {
            address: address.to_string(),
            port: local_addr.port(),
        };

        // Hold the slot while publishing so a fault cannot slip in between
        let mut slot = self.shared.episode();
        let hub_task = tokio::spawn(run_hub(hub_rx, self.shared.events.clone(), cancel.clone()));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            id,
            hub_tx.clone(),
            cancel.clone(),
        ));
        *slot = Some(Episode {
            id,
            local_addr,
            cancel,
            hub: hub_tx,
            accept_task,
            hub_task,
        });
        self.shared.state.set(ServerState::Running(info.clone()));
        drop(slot);

        info!(url = %info.url(), "Broadcast server running");
        Ok(info)
    }

    /// Shut the listener and every client socket down
    ///
    /// Idempotent. Always ends in `Stopped`; a shutdown problem is reported
    /// as a transient `Error` right before it. The shutdown runs in its own
    /// task so cancelling the caller cannot leave the state half-way.
    pub async fn stop(&self) -> ServerResult<()> {
        let episode = self.shared.episode().take();
        let Some(episode) = episode else {
            self.shared.state.set(ServerState::Stopped);
            return Ok(());
        };

        info!(address = %episode.local_addr, "Stopping broadcast server");
        let shared = Arc::clone(&self.shared);
        let shutdown = tokio::spawn(async move {
            episode.cancel.cancel();
            let mut problems = Vec::new();
            if let Err(e) = episode.accept_task.await {
                problems.push(format!("accept loop: {}", e));
            }
            if let Err(e) = episode.hub_task.await {
                problems.push(format!("client hub: {}", e));
            }

            if problems.is_empty() {
                shared.state.set(ServerState::Stopped);
                info!("Broadcast server stopped");
                Ok(())
            } else {
                let cause = ServerError::Stop(problems.join("; "));
                warn!(error = %cause, "Broadcast server stopped with errors");
                shared.state.fail(cause.clone());
                Err(cause)
            }
        });

        match shutdown.await {
            Ok(result) => result,
            Err(e) => {
                let cause = ServerError::Stop(e.to_string());
                self.shared.state.fail(cause.clone());
                Err(cause)
            }
        }
    }

    /// Record a start attempt that failed before a listener was bound
    pub fn reject_start(&self, cause: ServerError) {
        let _ = self.start_failed(cause);
    }

    fn start_failed(&self, cause: ServerError) -> ServerError {
        error!(error = %cause, "Broadcast server failed to start");
        self.shared.events.emit(ConnectionEvent::Error {
            client: None,
            cause: cause.to_string(),
        });
        self.shared.state.fail(cause.clone());
        cause
    }

    /// Best-effort fan-out of one binary message to every connected client
    ///
    /// Never blocks and never fails; without a running episode or clients it
    /// does nothing.
    pub fn broadcast(&self, frame: Bytes) {
        let slot = self.shared.episode();
        match slot.as_ref() {
            Some(episode) => {
                let _ = episode.hub.send(HubCommand::Broadcast(frame));
            }
            None => trace!("Broadcast while stopped, dropping frame"),
        }
    }

    /// Snapshot of the connected clients
    pub async fn clients(&self) -> Vec<ClientInfo> {
        let hub = self.shared.episode().as_ref().map(|e| e.hub.clone());
        let Some(hub) = hub else {
            return Vec::new();
        };
        let (reply, rx) = oneshot::channel();
        if hub.send(HubCommand::Snapshot(reply)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn current_state(&self) -> ServerState {
        self.shared.state.current()
    }

    /// Latest state; intermediate values may be coalesced
    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.shared.state.watch()
    }

    /// Every transition, in order
    pub fn transitions(&self) -> broadcast::Receiver<ServerState> {
        self.shared.state.transitions()
    }

    /// Current state, then every transition in order
    ///
    /// Unlike [`state`](Self::state) this never coalesces the transient
    /// `Error` that precedes `Stopped`.
    pub fn state_updates(&self) -> BoxStream<'static, ServerState> {
        self.shared.state.updates()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Address the listener is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.episode().as_ref().map(|e| e.local_addr)
    }
}

impl FrameSink for BroadcastServer {
    fn broadcast(&self, frame: Bytes) {
        BroadcastServer::broadcast(self, frame);
    }
}

impl Default for BroadcastServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BroadcastServer {
    fn drop(&mut self) {
        if let Some(episode) = self.shared.episode().take() {
            debug!("BroadcastServer dropped while running, cancelling tasks");
            episode.cancel.cancel();
        }
    }
}

/// Errors from `accept` that concern a single pending connection
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    episode_id: u64,
    hub: mpsc::UnboundedSender<HubCommand>,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();

    let fault = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break None,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    debug!(client = %remote_addr, "Accepted TCP connection");
                    connections.spawn(connection::serve_connection(
                        stream,
                        remote_addr,
                        hub.clone(),
                        shared.events.clone(),
                        cancel.clone(),
                    ));
                }
                Err(e) if is_connection_error(&e) => {
                    debug!(error = %e, "Pending connection failed");
                }
                Err(e) => break Some(ServerError::Transport(e.to_string())),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    };

    drop(listener);
    if fault.is_some() {
        cancel.cancel();
    }
    while connections.join_next().await.is_some() {}

    if let Some(cause) = fault {
        shared.fault(episode_id, cause);
    }
    debug!("Accept loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn test_start_then_stop_ends_stopped() {
        let server = BroadcastServer::new();
        let mut transitions = server.transitions();

        let info = server.start(LOCALHOST, 0).await.unwrap();
        assert_ne!(info.port, 0);
        server.stop().await.unwrap();

        assert_eq!(transitions.recv().await.unwrap(), ServerState::Running(info));
        assert_eq!(transitions.recv().await.unwrap(), ServerState::Stopped);
        assert_eq!(server.current_state(), ServerState::Stopped);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let server = BroadcastServer::new();
        let mut transitions = server.transitions();
        server.start(LOCALHOST, 0).await.unwrap();

        server.stop().await.unwrap();
        server.stop().await.unwrap();

        assert!(transitions.recv().await.unwrap().is_running());
        assert_eq!(transitions.recv().await.unwrap(), ServerState::Stopped);
        assert!(transitions.try_recv().is_err());
        assert_eq!(server.current_state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_bind_failure_reports_error_then_stopped() {
        let occupied = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = occupied.local_addr().unwrap().port();

        let server = BroadcastServer::new();
        let mut transitions = server.transitions();

        let err = server.start(LOCALHOST, port).await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));

        assert_eq!(transitions.recv().await.unwrap(), ServerState::Error(err));
        assert_eq!(transitions.recv().await.unwrap(), ServerState::Stopped);
        assert_eq!(server.current_state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_broadcast_without_clients_is_noop() {
        let server = BroadcastServer::new();
        server.broadcast(Bytes::from_static(b"while stopped"));

        server.start(LOCALHOST, 0).await.unwrap();
        server.broadcast(Bytes::from_static(b"nobody listening"));
        assert!(server.clients().await.is_empty());
        assert!(server.current_state().is_running());

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_replaces_episode() {
        let server = BroadcastServer::new();
        server.start(LOCALHOST, 0).await.unwrap();
        let second = server.start(LOCALHOST, 0).await.unwrap();

        assert_eq!(server.current_state(), ServerState::Running(second.clone()));
        assert_eq!(server.local_addr().map(|a| a.port()), Some(second.port));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reject_start_emits_error_then_stopped() {
        let server = BroadcastServer::new();
        let mut transitions = server.transitions();
        let cause = ServerError::HostResolution("no address".into());

        server.reject_start(cause.clone());

        assert_eq!(transitions.recv().await.unwrap(), ServerState::Error(cause));
        assert_eq!(transitions.recv().await.unwrap(), ServerState::Stopped);
    }
}
