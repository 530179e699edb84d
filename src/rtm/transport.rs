//! Transport seam between a connection worker and a socket implementation.
//!
//! A transport is a pair of channels. The connection worker holds a
//! [`TransportHandle`] (commands out, notifications in); the socket
//! implementation drives the matching [`TransportPeer`]. Dropping the handle
//! detaches the worker from every notification at once.

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

/// Notification raised by a transport.
#[derive(Debug)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(TransportError),
    Close,
}

/// Request issued to a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCommand {
    /// Transmit one text frame.
    Send(String),
    /// Close gracefully, optionally with a reason.
    Close(Option<String>),
}

/// Errors produced by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// The transport no longer accepts commands.
    #[error("transport is closed")]
    Closed,
}

/// Opens transports to resolved connection targets.
pub trait TransportFactory: Send + Sync + 'static {
    /// Starts opening a transport to `target`.
    ///
    /// The returned handle reports [`TransportEvent::Open`] once the transport
    /// is usable, or [`TransportEvent::Close`] if it never gets there.
    fn open(&self, target: &str) -> TransportHandle;
}

/// Session-side end of a transport.
#[derive(Debug)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<TransportCommand>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportHandle {
    /// Creates a connected handle/peer pair.
    pub fn pair() -> (TransportHandle, TransportPeer) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            TransportHandle {
                commands: commands_tx,
                events: events_rx,
            },
            TransportPeer {
                events: events_tx,
                commands: commands_rx,
            },
        )
    }

    /// Queues a text frame for transmission.
    pub fn send(&self, text: String) -> Result<(), TransportError> {
        self.commands
            .send(TransportCommand::Send(text))
            .map_err(|_| TransportError::Closed)
    }

    /// Requests a graceful close.
    pub fn close(&self, reason: Option<String>) {
        let _ = self.commands.send(TransportCommand::Close(reason));
    }

    /// Receives the next transport notification.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

/// Implementation-side end of a transport.
#[derive(Debug)]
pub struct TransportPeer {
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: mpsc::UnboundedReceiver<TransportCommand>,
}

impl TransportPeer {
    /// Delivers a notification. Returns `false` once the session has detached.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Receives the next command; `None` once the session dropped its handle.
    pub async fn recv_command(&mut self) -> Option<TransportCommand> {
        self.commands.recv().await
    }

    /// Returns an already queued command without waiting.
    pub fn try_recv_command(&mut self) -> Option<TransportCommand> {
        self.commands.try_recv().ok()
    }

    /// Returns whether the session stopped listening to notifications.
    pub fn is_detached(&self) -> bool {
        self.events.is_closed()
    }
}

/// [`TransportFactory`] backed by `tokio-tungstenite`.
///
/// Each transport runs in its own task, which owns the websocket.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketTransport;

impl TransportFactory for WebSocketTransport {
    fn open(&self, target: &str) -> TransportHandle {
        let (handle, peer) = TransportHandle::pair();
        let url = target.to_string();
        tokio::spawn(async move {
            websocket_transport_worker(url, peer).await;
        });
        handle
    }
}

async fn websocket_transport_worker(url: String, mut peer: TransportPeer) {
    let connect = connect_async(url.as_str());
    tokio::pin!(connect);

    let mut socket = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok((socket, _)) => break socket,
                Err(err) => {
                    debug!(event = "websocket_connect_failed", error = %err);
                    peer.emit(TransportEvent::Error(err.into()));
                    peer.emit(TransportEvent::Close);
                    return;
                }
            },
            command = peer.recv_command() => match command {
                Some(TransportCommand::Send(_)) => {
                    debug!(event = "websocket_send_before_open_dropped");
                }
                Some(TransportCommand::Close(_)) | None => {
                    peer.emit(TransportEvent::Close);
                    return;
                }
            },
        }
    };

    peer.emit(TransportEvent::Open);

    let mut closing = false;
    loop {
        tokio::select! {
            command = peer.recv_command(), if !closing => {
                match command {
                    Some(TransportCommand::Send(text)) => {
                        if let Err(err) = socket.send(Message::Text(text)).await {
                            peer.emit(TransportEvent::Error(err.into()));
                        }
                    }
                    Some(TransportCommand::Close(reason)) => {
                        closing = true;
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: reason.unwrap_or_default().into(),
                        };
                        if let Err(err) = socket.close(Some(frame)).await {
                            debug!(event = "websocket_close_failed", error = %err);
                        }
                    }
                    None => {
                        closing = true;
                        let _ = socket.close(None).await;
                    }
                }
            }
            inbound = socket.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        peer.emit(TransportEvent::Message(text));
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            peer.emit(TransportEvent::Message(text));
                        }
                        Err(_) => debug!(event = "websocket_binary_frame_dropped"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = socket.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(WsError::ConnectionClosed)) | None => {
                        peer.emit(TransportEvent::Close);
                        return;
                    }
                    Some(Err(err)) => {
                        peer.emit(TransportEvent::Error(err.into()));
                        peer.emit(TransportEvent::Close);
                        return;
                    }
                }
            }
        }
    }
}
