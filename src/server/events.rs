// SPDX-License-Identifier: GPL-3.0-only

//! Connection events
//!
//! Observers subscribe to a channel of events instead of overriding
//! callbacks. Slow subscribers lag and lose events; the server never waits
//! for them.

use super::clients::ClientInfo;
use crate::constants::EVENT_CHANNEL_CAPACITY;
use tokio::sync::broadcast;

/// Kind of an inbound message (payloads are discarded)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Text,
    Binary,
}

/// Something that happened to a connection or the listener
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Handshake accepted and client added to the set
    Opened(ClientInfo),
    /// Client removed from the set
    Closed(ClientInfo),
    /// Client sent a message; it was accepted and ignored
    Message {
        client: ClientInfo,
        kind: InboundKind,
        len: usize,
    },
    /// `client == None` is a server-level fault, otherwise a per-connection one
    Error {
        client: Option<ClientInfo>,
        cause: String,
    },
}

impl ConnectionEvent {
    pub fn is_server_fault(&self) -> bool {
        matches!(self, ConnectionEvent::Error { client: None, .. })
    }
}

#[derive(Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let _ = self.tx.send(event);
    }
}
