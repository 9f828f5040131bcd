// SPDX-License-Identifier: GPL-3.0-only

//! Supervised control channel to the server component
//!
//! Consumers get a possibly-absent handle to the live server plus a state
//! stream that follows whichever handle is current. A small task owns the
//! link: it connects on request, clears the handle and reconnects when the
//! link is lost unexpectedly, and stays down after an explicit disconnect.

use crate::constants::timing::RECONNECT_DELAY;
use crate::errors::{ConnectError, ServerResult};
use crate::lifecycle::ServerLifecycleManager;
use crate::pipeline::FrameSink;
use crate::server::{ServerInfo, ServerState};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Operations the surrounding application may invoke on the server
pub trait ServerControl: Send + Sync {
    fn start_server(&self) -> BoxFuture<'_, ServerResult<ServerInfo>>;

    fn stop_server(&self) -> BoxFuture<'_, ServerResult<()>>;

    /// Best-effort, never blocks
    fn broadcast(&self, frame: Bytes);

    /// Current state, then every transition in order, transient errors included
    fn server_state(&self) -> BoxStream<'static, ServerState>;
}

/// A live control handle and the signal that it went away
pub struct ControlLink {
    pub control: Arc<dyn ServerControl>,
    /// Cancelled when the link is lost without being asked to
    pub lost: CancellationToken,
}

/// Establishes control links
pub trait ServerConnector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<ControlLink, ConnectError>>;
}

/// In-process connector to a lifecycle manager
pub struct LocalConnector {
    manager: Arc<ServerLifecycleManager>,
    current: Mutex<Option<CancellationToken>>,
    available: AtomicBool,
}

impl LocalConnector {
    pub fn new(manager: Arc<ServerLifecycleManager>) -> Self {
        Self {
            manager,
            current: Mutex::new(None),
            available: AtomicBool::new(true),
        }
    }

    /// Break the current link as if the component had gone away
    pub fn sever(&self) {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(token) = current {
            info!("Severing control link");
            token.cancel();
        }
    }

    /// Make subsequent connection attempts succeed or fail
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl ServerConnector for LocalConnector {
    fn connect(&self) -> BoxFuture<'_, Result<ControlLink, ConnectError>> {
        Box::pin(async move {
            if !self.available.load(Ordering::SeqCst) {
                return Err(ConnectError::Unavailable("server component not running".into()));
            }
            let lost = CancellationToken::new();
            *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(lost.clone());
            let control: Arc<dyn ServerControl> = self.manager.clone();
            Ok(ControlLink { control, lost })
        })
    }
}

enum Command {
    Connect,
    Disconnect,
}

type Handle = Option<Arc<dyn ServerControl>>;

/// Keeps a control handle alive across unexpected losses
pub struct ControlChannelSupervisor {
    commands: mpsc::UnboundedSender<Command>,
    handle: watch::Receiver<Handle>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ControlChannelSupervisor {
    /// Spawn the supervising task; nothing connects until [`Self::connect`]
    pub fn spawn(connector: Arc<dyn ServerConnector>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (handle_tx, handle) = watch::channel(None);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(connector, rx, handle_tx, cancel.clone()));

        Self {
            commands,
            handle,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Drop the link and stay disconnected
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Current handle, if connected
    pub fn handle(&self) -> Option<Arc<dyn ServerControl>> {
        self.handle.borrow().clone()
    }

    pub fn watch_handle(&self) -> watch::Receiver<Handle> {
        self.handle.clone()
    }

    /// Wait for a handle to be available
    pub async fn connected(&self) -> Option<Arc<dyn ServerControl>> {
        let mut handle = self.handle.clone();
        let ready = handle.wait_for(|h| h.is_some()).await.ok()?;
        ready.clone()
    }

    /// Server state of whichever handle is current
    ///
    /// Yields the new handle's current state as soon as a handle appears or
    /// is replaced, then every transition of that handle in order; nothing
    /// is yielded while disconnected. Ends when the supervisor shuts down.
    pub fn server_state(&self) -> impl Stream<Item = ServerState> + Send + 'static {
        let mut handles = self.handle.clone();

        async_stream::stream! {
            loop {
                let current = handles.borrow_and_update().clone();
                let Some(control) = current else {
                    if handles.changed().await.is_err() {
                        return;
                    }
                    continue;
                };

                let mut states = control.server_state();

                loop {
                    let step = tokio::select! {
                        biased;
                        state = states.next() => Follow::State(state),
                        changed = handles.changed() => Follow::Switch(changed.is_ok()),
                    };
                    match step {
                        Follow::Switch(true) => break,
                        Follow::Switch(false) => return,
                        Follow::State(Some(state)) => yield state,
                        Follow::State(None) => {
                            // Component went away; wait for the next handle
                            if handles.changed().await.is_err() {
                                return;
                            }
                            break;
                        }
                    }
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Supervisor task ended abnormally");
        }
    }
}

/// Frames go to whichever server is currently linked; dropped while unlinked
impl FrameSink for ControlChannelSupervisor {
    fn broadcast(&self, frame: Bytes) {
        if let Some(control) = self.handle.borrow().as_ref() {
            control.broadcast(frame);
        }
    }
}

impl Drop for ControlChannelSupervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Follow {
    Switch(bool),
    State(Option<ServerState>),
}

async fn lost(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn retry_at(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn supervise(
    connector: Arc<dyn ServerConnector>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    handle: watch::Sender<Handle>,
    cancel: CancellationToken,
) {
    let mut wanted = false;
    let mut link: Option<ControlLink> = None;
    let mut retry: Option<Instant> = None;

    loop {
        let lost_token = link.as_ref().map(|l| l.lost.clone());

        let reconnect = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                None => break,
                Some(Command::Connect) => {
                    wanted = true;
                    link.is_none()
                }
                Some(Command::Disconnect) => {
                    info!("Control channel disconnect requested");
                    wanted = false;
                    retry = None;
                    link = None;
                    handle.send_replace(None);
                    false
                }
            },
            _ = lost(lost_token) => {
                warn!("Control link lost unexpectedly");
                link = None;
                handle.send_replace(None);
                wanted
            }
            _ = retry_at(retry) => {
                retry = None;
                wanted && link.is_none()
            }
        };

        if !reconnect {
            continue;
        }

        match connector.connect().await {
            Ok(established) => {
                info!("Control link established");
                retry = None;
                handle.send_replace(Some(Arc::clone(&established.control)));
                link = Some(established);
            }
            Err(e) => {
                debug!(error = %e, delay_ms = RECONNECT_DELAY.as_millis() as u64, "Connect failed, retrying");
                retry = Some(Instant::now() + RECONNECT_DELAY);
            }
        }
    }

    handle.send_replace(None);
    debug!("Supervisor stopped");
}
