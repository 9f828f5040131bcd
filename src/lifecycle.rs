// SPDX-License-Identifier: GPL-3.0-only

//! Server lifecycle management
//!
//! [`ServerLifecycleManager`] owns the [`BroadcastServer`] and turns a start
//! request plus the current `ServerSettings` into a bind address. Only one
//! start attempt is ever in flight: a new start or a stop cancels and awaits
//! the previous attempt before doing anything else.

use crate::config::ServerSettings;
use crate::constants::ROUTE_PROBE_ADDR;
use crate::errors::{ServerError, ServerResult};
use crate::pipeline::FrameSink;
use crate::server::{BroadcastServer, ServerInfo, ServerState};
use crate::settings::SettingsStore;
use crate::supervisor::ServerControl;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source of the device's current local network address
pub trait AddressResolver: Send + Sync + 'static {
    /// `None` when no usable address exists (offline, loopback only)
    fn local_address(&self) -> Option<IpAddr>;
}

/// Asks the routing table which local address reaches outside hosts
#[derive(Debug, Clone)]
pub struct RouteProbeResolver {
    probe: String,
}

impl RouteProbeResolver {
    pub fn new() -> Self {
        Self {
            probe: ROUTE_PROBE_ADDR.to_string(),
        }
    }

    pub fn with_probe(probe: impl Into<String>) -> Self {
        Self {
            probe: probe.into(),
        }
    }

    fn probe(&self) -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        // connect() on UDP only selects a route; nothing is sent
        socket.connect(self.probe.as_str())?;
        Ok(socket.local_addr()?.ip())
    }
}

impl Default for RouteProbeResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressResolver for RouteProbeResolver {
    fn local_address(&self) -> Option<IpAddr> {
        match self.probe() {
            Ok(ip) if !ip.is_unspecified() && !ip.is_loopback() => Some(ip),
            Ok(ip) => {
                debug!(%ip, "Route probe gave no usable address");
                None
            }
            Err(e) => {
                debug!(error = %e, "Route probe failed");
                None
            }
        }
    }
}

/// Always answers with the same address
#[derive(Debug, Clone, Copy)]
pub struct FixedResolver(pub Option<IpAddr>);

impl AddressResolver for FixedResolver {
    fn local_address(&self) -> Option<IpAddr> {
        self.0
    }
}

/// Keeps the process visible and alive while the server runs
pub trait KeepAlive: Send + Sync + 'static {
    fn hold(&self, info: &ServerInfo);
    fn release(&self);
}

/// Announces the server URL in the log while held
#[derive(Debug, Default, Clone, Copy)]
pub struct LogKeepAlive;

impl KeepAlive for LogKeepAlive {
    fn hold(&self, info: &ServerInfo) {
        info!(url = %info.url(), "Streaming; clients can connect");
    }

    fn release(&self) {
        info!("Streaming ended");
    }
}

struct StartAttempt {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl StartAttempt {
    async fn cancel(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Start attempt ended abnormally");
        }
    }
}

/// Owner of the broadcast server and its start/stop sequencing
pub struct ServerLifecycleManager {
    settings: Arc<SettingsStore<ServerSettings>>,
    resolver: Arc<dyn AddressResolver>,
    server: Arc<BroadcastServer>,
    attempt: Mutex<Option<StartAttempt>>,
    keep_alive_cancel: CancellationToken,
}

impl ServerLifecycleManager {
    pub fn new(
        settings: Arc<SettingsStore<ServerSettings>>,
        resolver: Arc<dyn AddressResolver>,
        keep_alive: Arc<dyn KeepAlive>,
    ) -> Self {
        let server = Arc::new(BroadcastServer::new());
        let keep_alive_cancel = CancellationToken::new();
        tokio::spawn(track_keep_alive(
            server.state(),
            keep_alive,
            keep_alive_cancel.clone(),
        ));

        Self {
            settings,
            resolver,
            server,
            attempt: Mutex::new(None),
            keep_alive_cancel,
        }
    }

    pub fn server(&self) -> &Arc<BroadcastServer> {
        &self.server
    }

    pub fn settings(&self) -> &Arc<SettingsStore<ServerSettings>> {
        &self.settings
    }

    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.server.state()
    }

    pub fn broadcast(&self, frame: Bytes) {
        self.server.broadcast(frame);
    }

    /// Start with freshly read settings, superseding any attempt in flight
    ///
    /// A start that is itself superseded resolves to
    /// [`ServerError::Superseded`] and leaves the state to its successor.
    pub async fn start(&self) -> ServerResult<ServerInfo> {
        let token = CancellationToken::new();
        let (result_tx, result_rx) = oneshot::channel();

        {
            let mut slot = self.attempt.lock().await;
            if let Some(previous) = slot.take() {
                debug!("Superseding previous start attempt");
                previous.cancel().await;
            }
            let handle = tokio::spawn(run_attempt(
                self.settings.get(),
                Arc::clone(&self.resolver),
                Arc::clone(&self.server),
                token.clone(),
                result_tx,
            ));
            *slot = Some(StartAttempt { token, handle });
        }

        result_rx.await.unwrap_or(Err(ServerError::Superseded))
    }

    /// Cancel any start in flight, then stop the server
    pub async fn stop(&self) -> ServerResult<()> {
        {
            let mut slot = self.attempt.lock().await;
            if let Some(previous) = slot.take() {
                previous.cancel().await;
            }
        }
        self.server.stop().await
    }
}

impl Drop for ServerLifecycleManager {
    fn drop(&mut self) {
        self.keep_alive_cancel.cancel();
    }
}

impl ServerControl for ServerLifecycleManager {
    fn start_server(&self) -> BoxFuture<'_, ServerResult<ServerInfo>> {
        Box::pin(self.start())
    }

    fn stop_server(&self) -> BoxFuture<'_, ServerResult<()>> {
        Box::pin(self.stop())
    }

    fn broadcast(&self, frame: Bytes) {
        self.server.broadcast(frame);
    }

    fn server_state(&self) -> BoxStream<'static, ServerState> {
        self.server.state_updates()
    }
}

impl FrameSink for ServerLifecycleManager {
    fn broadcast(&self, frame: Bytes) {
        self.server.broadcast(frame);
    }
}

async fn run_attempt(
    settings: ServerSettings,
    resolver: Arc<dyn AddressResolver>,
    server: Arc<BroadcastServer>,
    token: CancellationToken,
    result: oneshot::Sender<ServerResult<ServerInfo>>,
) {
    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => Err(ServerError::Superseded),
        outcome = attempt_start(settings, resolver.as_ref(), &server) => outcome,
    };
    // The requester may have gone away
    let _ = result.send(outcome);
}

async fn attempt_start(
    settings: ServerSettings,
    resolver: &dyn AddressResolver,
    server: &BroadcastServer,
) -> ServerResult<ServerInfo> {
    let address = if settings.listen_on_all_interfaces {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        match resolver.local_address() {
            Some(address) => address,
            None => {
                let cause = ServerError::HostResolution("no usable local network address".into());
                if server.current_state().is_running() {
                    server.stop().await?;
                }
                server.reject_start(cause.clone());
                return Err(cause);
            }
        }
    };

    if settings.is_reserved_port() {
        warn!(port = settings.port, "Port is in the reserved range and may need privileges");
    }
    server.start(address, settings.port).await
}

async fn track_keep_alive(
    mut state: watch::Receiver<ServerState>,
    keep_alive: Arc<dyn KeepAlive>,
    cancel: CancellationToken,
) {
    let mut held: Option<ServerInfo> = None;

    loop {
        let current = state.borrow_and_update().clone();
        match current {
            ServerState::Running(info) if held.as_ref() != Some(&info) => {
                if held.is_some() {
                    keep_alive.release();
                }
                keep_alive.hold(&info);
                held = Some(info);
            }
            ServerState::Running(_) => {}
            _ => {
                if held.take().is_some() {
                    keep_alive.release();
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    if held.is_some() {
        keep_alive.release();
    }
}
