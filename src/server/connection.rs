// SPDX-License-Identifier: GPL-3.0-only

//! Per-connection task
//!
//! Performs the WebSocket handshake, registers the client with the hub and
//! then pushes the newest frame whenever one is available. Inbound messages
//! are read and discarded; the channel is push-only.

use super::clients::{ClientInfo, HubCommand, LatestFrameSink};
use super::events::{ConnectionEvent, EventBus, InboundKind};
use crate::constants::timing::{CLOSE_TIMEOUT, HANDSHAKE_TIMEOUT};
use crate::errors::ClientFault;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub(crate) async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    hub: mpsc::UnboundedSender<HubCommand>,
    events: EventBus,
    cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);

    let handshake = tokio::select! {
        _ = cancel.cancelled() => return,
        result = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream)) => result,
    };

    let ws = match handshake {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            report_handshake_failure(&events, remote_addr, ClientFault::Handshake(e.to_string()));
            return;
        }
        Err(_) => {
            report_handshake_failure(&events, remote_addr, ClientFault::Handshake("timed out".into()));
            return;
        }
    };

    let info = ClientInfo::new(remote_addr);
    let id = info.id;
    let (sink, mut frames) = LatestFrameSink::new();
    if hub
        .send(HubCommand::Register {
            info: info.clone(),
            sink: Box::new(sink),
        })
        .is_err()
    {
        // Hub already gone, the server is shutting down
        return;
    }

    let (mut outbound, mut inbound) = ws.split();

    let fault = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break None,
            changed = frames.changed() => {
                if changed.is_err() {
                    // Hub dropped our lane: removed from the set
                    break None;
                }
                let Some(frame) = frames.borrow_and_update().clone() else {
                    continue;
                };
                // A peer that stops reading must not hold up shutdown
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break None,
                    sent = outbound.send(Message::Binary(frame)) => {
                        if let Err(e) = sent {
                            break Some(ClientFault::Send(e.to_string()));
                        }
                    }
                }
            }
            message = inbound.next() => match message {
                None | Some(Ok(Message::Close(_))) => break None,
                Some(Ok(Message::Text(text))) => {
                    trace!(client = %remote_addr, len = text.len(), "Ignoring text message");
                    events.emit(ConnectionEvent::Message {
                        client: info.clone(),
                        kind: InboundKind::Text,
                        len: text.len(),
                    });
                }
                Some(Ok(Message::Binary(data))) => {
                    trace!(client = %remote_addr, len = data.len(), "Ignoring binary message");
                    events.emit(ConnectionEvent::Message {
                        client: info.clone(),
                        kind: InboundKind::Binary,
                        len: data.len(),
                    });
                }
                // Ping replies are queued by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(ClientFault::Receive(e.to_string())),
            },
        }
    };

    // Best effort; the peer may already be gone
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, outbound.send(Message::Close(None))).await;
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, outbound.close()).await;

    debug!(client = %remote_addr, "Connection task finished");
    let _ = hub.send(HubCommand::Unregister { id, fault });
}

fn report_handshake_failure(events: &EventBus, remote_addr: SocketAddr, fault: ClientFault) {
    debug!(client = %remote_addr, error = %fault, "WebSocket handshake failed");
    events.emit(ConnectionEvent::Error {
        client: Some(ClientInfo::new(remote_addr)),
        cause: fault.to_string(),
    });
}
