// SPDX-License-Identifier: GPL-3.0-only

//! Connected client set
//!
//! The set is owned by a single hub task; connection tasks and the broadcast
//! path talk to it through [`HubCommand`]s, so additions, removals and
//! fan-out are serialised without locks.

use super::events::{ConnectionEvent, EventBus};
use crate::errors::ClientFault;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Connection identifier
pub type ClientId = Uuid;

/// Information about a connected client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    /// Transport address of the peer
    pub remote_addr: SocketAddr,
    pub connected_at: Instant,
}

impl ClientInfo {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            connected_at: Instant::now(),
        }
    }
}

/// Outbound lane of one client
///
/// `deliver` must not block: a slow client may only affect itself.
pub trait ClientSink: Send + 'static {
    fn deliver(&mut self, frame: Bytes) -> Result<(), ClientFault>;
}

/// Latest-wins lane feeding a connection task
///
/// Holds at most one undelivered frame; a newer frame replaces it.
pub struct LatestFrameSink {
    tx: watch::Sender<Option<Bytes>>,
}

impl LatestFrameSink {
    pub fn new() -> (Self, watch::Receiver<Option<Bytes>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }
}

impl ClientSink for LatestFrameSink {
    fn deliver(&mut self, frame: Bytes) -> Result<(), ClientFault> {
        if self.tx.is_closed() {
            return Err(ClientFault::Disconnected);
        }
        self.tx.send_replace(Some(frame));
        Ok(())
    }
}

struct Entry {
    info: ClientInfo,
    sink: Box<dyn ClientSink>,
}

/// The set of connected clients
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, Entry>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, info: ClientInfo, sink: Box<dyn ClientSink>) {
        self.clients.insert(info.id, Entry { info, sink });
    }

    pub fn remove(&mut self, id: &ClientId) -> Option<ClientInfo> {
        self.clients.remove(id).map(|entry| entry.info)
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.clients.values().map(|e| e.info.clone()).collect()
    }

    /// Deliver `frame` to every client
    ///
    /// Clients whose lane fails are removed and returned with their fault;
    /// the others still receive the frame.
    pub fn broadcast(&mut self, frame: &Bytes) -> Vec<(ClientInfo, ClientFault)> {
        let mut failed = Vec::new();
        for (id, entry) in self.clients.iter_mut() {
            if let Err(fault) = entry.sink.deliver(frame.clone()) {
                failed.push((*id, fault));
            }
        }

        failed
            .into_iter()
            .filter_map(|(id, fault)| self.remove(&id).map(|info| (info, fault)))
            .collect()
    }

    /// Remove every client
    pub fn drain(&mut self) -> Vec<ClientInfo> {
        self.clients.drain().map(|(_, e)| e.info).collect()
    }
}

/// Requests served by the hub task
pub(crate) enum HubCommand {
    Register {
        info: ClientInfo,
        sink: Box<dyn ClientSink>,
    },
    Unregister {
        id: ClientId,
        fault: Option<ClientFault>,
    },
    Broadcast(Bytes),
    Snapshot(oneshot::Sender<Vec<ClientInfo>>),
}

/// Hub task: sole owner of the client set for one server episode
pub(crate) async fn run_hub(
    mut commands: mpsc::UnboundedReceiver<HubCommand>,
    events: EventBus,
    cancel: CancellationToken,
) {
    let mut registry = ClientRegistry::new();

    loop {
        let command = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            HubCommand::Register { info, sink } => {
                info!(client = %info.remote_addr, id = %info.id, "Client connected");
                registry.add(info.clone(), sink);
                events.emit(ConnectionEvent::Opened(info));
            }
            HubCommand::Unregister { id, fault } => {
                let Some(info) = registry.remove(&id) else {
                    continue;
                };
                if let Some(fault) = fault {
                    debug!(client = %info.remote_addr, error = %fault, "Client connection failed");
                    events.emit(ConnectionEvent::Error {
                        client: Some(info.clone()),
                        cause: fault.to_string(),
                    });
                }
                info!(client = %info.remote_addr, id = %info.id, "Client disconnected");
                events.emit(ConnectionEvent::Closed(info));
            }
            HubCommand::Broadcast(frame) => {
                trace!(bytes = frame.len(), clients = registry.len(), "Broadcasting frame");
                for (info, fault) in registry.broadcast(&frame) {
                    warn!(client = %info.remote_addr, error = %fault, "Dropping client after send failure");
                    events.emit(ConnectionEvent::Error {
                        client: Some(info.clone()),
                        cause: fault.to_string(),
                    });
                    events.emit(ConnectionEvent::Closed(info));
                }
            }
            HubCommand::Snapshot(reply) => {
                let _ = reply.send(registry.clients());
            }
        }
    }

    // Dropping the sinks tells every connection task to close its socket
    for info in registry.drain() {
        events.emit(ConnectionEvent::Closed(info));
    }
    debug!("Client hub stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingSink {
        received: Arc<Mutex<Vec<Bytes>>>,
    }

    impl ClientSink for RecordingSink {
        fn deliver(&mut self, frame: Bytes) -> Result<(), ClientFault> {
            self.received.lock().unwrap().push(frame);
            Ok(())
        }
    }

    struct FailingSink;

    impl ClientSink for FailingSink {
        fn deliver(&mut self, _frame: Bytes) -> Result<(), ClientFault> {
            Err(ClientFault::Send("broken pipe".into()))
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_broadcast_without_clients_is_noop() {
        let mut registry = ClientRegistry::new();
        assert!(registry.broadcast(&Bytes::from_static(b"frame")).is_empty());
    }

    #[test]
    fn test_failing_client_is_removed_and_others_receive() {
        let mut registry = ClientRegistry::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let healthy = ClientInfo::new(addr(5000));
        let broken = ClientInfo::new(addr(5001));
        registry.add(
            healthy.clone(),
            Box::new(RecordingSink {
                received: Arc::clone(&received),
            }),
        );
        registry.add(broken.clone(), Box::new(FailingSink));

        let failed = registry.broadcast(&Bytes::from_static(b"jpeg"));

        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, broken);
        assert!(registry.contains(&healthy.id));
        assert!(!registry.contains(&broken.id));
        assert_eq!(received.lock().unwrap().as_slice(), &[Bytes::from_static(b"jpeg")]);
    }

    #[test]
    fn test_latest_frame_sink_keeps_newest() {
        let (mut sink, mut rx) = LatestFrameSink::new();
        sink.deliver(Bytes::from_static(b"one")).unwrap();
        sink.deliver(Bytes::from_static(b"two")).unwrap();

        assert_eq!(rx.borrow_and_update().clone(), Some(Bytes::from_static(b"two")));

        drop(rx);
        assert_eq!(
            sink.deliver(Bytes::from_static(b"three")),
            Err(ClientFault::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_hub_emits_open_and_close() {
        let events = EventBus::new();
        let mut event_rx = events.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let hub = tokio::spawn(run_hub(rx, events, cancel.clone()));

        let info = ClientInfo::new(addr(6000));
        let (sink, _frames) = LatestFrameSink::new();
        tx.send(HubCommand::Register {
            info: info.clone(),
            sink: Box::new(sink),
        })
        .unwrap();

        let (reply, snapshot) = oneshot::channel();
        tx.send(HubCommand::Snapshot(reply)).unwrap();
        assert_eq!(snapshot.await.unwrap(), vec![info.clone()]);

        cancel.cancel();
        hub.await.unwrap();

        assert!(matches!(event_rx.recv().await.unwrap(), ConnectionEvent::Opened(i) if i == info));
        assert!(matches!(event_rx.recv().await.unwrap(), ConnectionEvent::Closed(i) if i == info));
    }
}
