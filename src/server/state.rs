// SPDX-License-Identifier: GPL-3.0-only

//! Server lifecycle state

use crate::constants::STATE_CHANNEL_CAPACITY;
use crate::errors::ServerError;
use futures::stream::BoxStream;
use std::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

/// Address the server is reachable at during one Running episode
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerInfo {
    /// Bind address as a string (wildcard or the resolved local address)
    pub address: String,
    pub port: u16,
}

impl ServerInfo {
    /// `ws://` URL clients connect to
    pub fn url(&self) -> String {
        if self.address.contains(':') {
            format!("ws://[{}]:{}", self.address, self.port)
        } else {
            format!("ws://{}:{}", self.address, self.port)
        }
    }
}

impl std::fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url())
    }
}

/// Broadcast server state machine
///
/// ```text
/// Stopped --start--> Running --stop--> Stopped
/// Stopped --start(fail)--> Error --(auto)--> Stopped
/// Running --fault--> Error --(auto)--> Stopped
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ServerState {
    #[default]
    Stopped,
    Running(ServerInfo),
    Error(ServerError),
}

impl ServerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ServerState::Running(_))
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, ServerState::Stopped)
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        match self {
            ServerState::Running(info) => Some(info),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Stopped => write!(f, "stopped"),
            ServerState::Running(info) => write!(f, "running at {}", info),
            ServerState::Error(cause) => write!(f, "error: {}", cause),
        }
    }
}

/// Single-writer holder of the current state
///
/// `watch` gives observers the latest value; the broadcast channel carries
/// every transition in order so transient `Error` states are never coalesced
/// away for subscribers that need the full sequence.
pub(crate) struct StateChannel {
    latest: watch::Sender<ServerState>,
    transitions: broadcast::Sender<ServerState>,
    write: Mutex<()>,
}

impl StateChannel {
    pub(crate) fn new() -> Self {
        let (latest, _) = watch::channel(ServerState::Stopped);
        let (transitions, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            latest,
            transitions,
            write: Mutex::new(()),
        }
    }

    pub(crate) fn current(&self) -> ServerState {
        self.latest.borrow().clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ServerState> {
        self.latest.subscribe()
    }

    pub(crate) fn transitions(&self) -> broadcast::Receiver<ServerState> {
        self.transitions.subscribe()
    }

    /// Current state followed by every later transition, in order
    ///
    /// Seeding happens under the write lock so no transition is missed or
    /// repeated. The stream ends once the channel is dropped.
    pub(crate) fn updates(&self) -> BoxStream<'static, ServerState> {
        let (current, mut transitions) = {
            let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
            (self.current(), self.transitions())
        };

        Box::pin(async_stream::stream! {
            yield current;
            loop {
                match transitions.recv().await {
                    Ok(state) => yield state,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "State subscriber lagged behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Move to `state`; repeating the current non-error state is a no-op
    pub(crate) fn set(&self, state: ServerState) -> bool {
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        self.publish(state)
    }

    /// Emit `Error(cause)` immediately followed by `Stopped`
    pub(crate) fn fail(&self, cause: ServerError) {
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        self.publish(ServerState::Error(cause));
        self.publish(ServerState::Stopped);
    }

    fn publish(&self, state: ServerState) -> bool {
        if *self.latest.borrow() == state && !matches!(state, ServerState::Error(_)) {
            return false;
        }
        info!(state = %state, "Server state changed");
        self.latest.send_replace(state.clone());
        // No subscribers is fine
        let _ = self.transitions.send(state);
        true
    }
}
