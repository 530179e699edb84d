//! Transport session: one live transport with heartbeat and call correlation.
//!
//! [`RtmConnection::spawn`] starts a worker task that owns the transport and
//! the pending-call table. Callers talk to it through a cloneable
//! [`ConnectionHandle`]; lifecycle notifications are delivered to the owner
//! as [`ConnectionEvent`]s tagged with the connection id.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Sleep};
use tracing::{debug, warn};

use crate::invariant::{InvariantMode, InvariantViolation};
use crate::retry::{delay, CancelError, DelayCanceller};
use crate::rtm::proto::{Message, MessageType};
use crate::rtm::transport::{TransportError, TransportEvent, TransportHandle};

/// Identifier assigned to a connection by its owner.
pub type ConnectionId = u64;

type ReplySender = oneshot::Sender<Result<Message, ConnectionError>>;

/// Lifecycle of a single transport session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Initial,
    Connected,
    Closing,
    Closed,
}

/// Notification emitted by a connection worker.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Transport opened; the heartbeat is running.
    Open,
    /// Inbound message that is not a reply or a legacy acknowledgement.
    Message(Message),
    /// Non-fatal error. A fatal one is followed by [`ConnectionEvent::Close`].
    Error(ConnectionError),
    /// Connection reached [`ConnectionState::Closed`]; no further events.
    Close,
}

/// Errors produced by a transport session.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The session is not in [`ConnectionState::Connected`].
    #[error("connection is not open (state: {0:?})")]
    NotOpen(ConnectionState),

    /// No reply arrived within the ping timeout.
    #[error("no reply to call {call_id} within ping timeout")]
    PingTimeout { call_id: u64 },

    /// The session stopped before the call completed.
    #[error("connection closed")]
    Closed,

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Precondition violated by the caller.
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

/// Timing and invariant settings for a connection.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionOptions {
    /// Maximum idle time before a heartbeat ping is sent.
    pub ping_interval: Duration,
    /// How long any call may wait for its reply.
    pub ping_timeout: Duration,
    pub invariant_mode: InvariantMode,
}

/// Cloneable handle to a running connection worker.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    state: Arc<RwLock<ConnectionState>>,
    invariant_mode: InvariantMode,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Sends `message` and waits for the matching reply.
    ///
    /// A `call_id` is assigned when the message has none. Reusing the id of a
    /// call that is still pending is a precondition violation.
    pub async fn send(&self, message: Message) -> Result<Message, ConnectionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ConnectionCommand::Send {
                message,
                reply_tx: Some(reply_tx),
            })
            .map_err(|_| ConnectionError::Closed)?;

        match reply_rx.await {
            Ok(Err(ConnectionError::Invariant(violation))) => {
                Err(self.invariant_mode.enforce(violation).into())
            }
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Closed),
        }
    }

    /// Requests a graceful close carrying `reason`.
    pub fn close(&self, reason: Option<String>) {
        let _ = self.commands.send(ConnectionCommand::Close(reason));
    }
}

#[derive(Debug)]
enum ConnectionCommand {
    Send {
        message: Message,
        reply_tx: Option<ReplySender>,
    },
    Close(Option<String>),
}

struct PendingCall {
    seq: u64,
    reply_tx: Option<ReplySender>,
    timer: DelayCanceller,
}

/// Worker owning one transport and its pending-call table.
pub struct RtmConnection {
    id: ConnectionId,
    options: ConnectionOptions,
    current: ConnectionState,
    shared_state: Arc<RwLock<ConnectionState>>,
    transport: TransportHandle,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    timeouts_tx: mpsc::UnboundedSender<(u64, u64)>,
    timeouts_rx: mpsc::UnboundedReceiver<(u64, u64)>,
    events: mpsc::UnboundedSender<(ConnectionId, ConnectionEvent)>,
    pending: HashMap<u64, PendingCall>,
    call_counter: u64,
    seq_counter: u64,
    last_send: Option<Instant>,
}

impl RtmConnection {
    /// Spawns a worker for `transport` and returns its handle.
    ///
    /// Events are sent to `events` as `(id, event)` pairs.
    pub fn spawn(
        id: ConnectionId,
        transport: TransportHandle,
        options: ConnectionOptions,
        events: mpsc::UnboundedSender<(ConnectionId, ConnectionEvent)>,
    ) -> ConnectionHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (timeouts_tx, timeouts_rx) = mpsc::unbounded_channel();
        let shared_state = Arc::new(RwLock::new(ConnectionState::Initial));

        let worker = RtmConnection {
            id,
            options,
            current: ConnectionState::Initial,
            shared_state: Arc::clone(&shared_state),
            transport,
            commands: commands_rx,
            timeouts_tx,
            timeouts_rx,
            events,
            pending: HashMap::new(),
            call_counter: 0,
            seq_counter: 0,
            last_send: None,
        };
        tokio::spawn(worker.run());

        ConnectionHandle {
            id,
            commands: commands_tx,
            state: shared_state,
            invariant_mode: options.invariant_mode,
        }
    }

    async fn run(mut self) {
        let heartbeat = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(heartbeat);
        let mut commands_open = true;

        loop {
            let connected = self.current == ConnectionState::Connected;
            tokio::select! {
                event = self.transport.recv() => match event {
                    Some(event) => self.handle_transport_event(event, heartbeat.as_mut()),
                    None => self.handle_transport_close(),
                },
                command = self.commands.recv(), if commands_open => match command {
                    Some(ConnectionCommand::Send { message, reply_tx }) => {
                        self.start_call(message, reply_tx);
                    }
                    Some(ConnectionCommand::Close(reason)) => self.close(reason),
                    None => {
                        commands_open = false;
                        self.close(None);
                    }
                },
                Some((call_id, seq)) = self.timeouts_rx.recv() => {
                    self.handle_call_timeout(call_id, seq);
                }
                () = &mut heartbeat, if connected => self.heartbeat_tick(heartbeat.as_mut()),
            }

            if self.current == ConnectionState::Closed {
                break;
            }
        }

        self.fail_pending();
        debug!(event = "connection_stopped", connection_id = self.id);
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.current = state;
        match self.shared_state.write() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send((self.id, event));
    }

    fn handle_transport_event(&mut self, event: TransportEvent, heartbeat: Pin<&mut Sleep>) {
        match event {
            TransportEvent::Open => {
                if self.current != ConnectionState::Initial {
                    debug!(event = "late_transport_open_ignored", connection_id = self.id);
                    return;
                }
                self.set_state(ConnectionState::Connected);
                self.emit(ConnectionEvent::Open);
                heartbeat.reset(Instant::now());
            }
            TransportEvent::Message(text) => self.handle_message(&text),
            TransportEvent::Error(err) => {
                self.emit(ConnectionEvent::Error(ConnectionError::Transport(err)));
            }
            TransportEvent::Close => self.handle_transport_close(),
        }
    }

    fn handle_transport_close(&mut self) {
        self.set_state(ConnectionState::Closed);
        self.emit(ConnectionEvent::Close);
    }

    fn handle_message(&mut self, text: &str) {
        let message = match Message::from_text(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(event = "unparseable_frame", connection_id = self.id, error = %err);
                self.emit(ConnectionEvent::Error(ConnectionError::Json(err)));
                return;
            }
        };

        match message.message_type() {
            // Deprecated acknowledgements; replies carry the real result.
            MessageType::Pong | MessageType::Ok => {}
            MessageType::Reply => self.handle_reply(message),
            MessageType::Ping | MessageType::Event => {
                self.emit(ConnectionEvent::Message(message));
            }
        }
    }

    fn handle_reply(&mut self, message: Message) {
        let Some(call_id) = message.call_id else {
            debug!(event = "reply_without_call_id", connection_id = self.id);
            return;
        };

        match self.pending.remove(&call_id) {
            Some(call) => {
                call.timer.cancel();
                if let Some(reply_tx) = call.reply_tx {
                    let _ = reply_tx.send(Ok(message));
                }
            }
            None => debug!(event = "reply_dropped", connection_id = self.id, call_id),
        }
    }

    fn heartbeat_tick(&mut self, heartbeat: Pin<&mut Sleep>) {
        let now = Instant::now();
        if let Some(last_send) = self.last_send {
            let due = last_send + self.options.ping_interval;
            if due > now {
                heartbeat.reset(due);
                return;
            }
        }

        debug!(event = "heartbeat_ping", connection_id = self.id);
        self.start_call(Message::ping(), None);
        heartbeat.reset(now + self.options.ping_interval);
    }

    fn start_call(&mut self, mut message: Message, reply_tx: Option<ReplySender>) {
        match self.transmit(&mut message) {
            Ok(call_id) => self.register(call_id, reply_tx),
            Err(err) => match reply_tx {
                Some(reply_tx) => {
                    let _ = reply_tx.send(Err(err));
                }
                None => debug!(event = "call_not_sent", connection_id = self.id, error = %err),
            },
        }
    }

    fn transmit(&mut self, message: &mut Message) -> Result<u64, ConnectionError> {
        if self.current != ConnectionState::Connected {
            return Err(ConnectionError::NotOpen(self.current));
        }

        let call_id = match message.call_id {
            Some(call_id) => call_id,
            None => {
                let call_id = self.next_call_id();
                message.call_id = Some(call_id);
                call_id
            }
        };
        if self.pending.contains_key(&call_id) {
            return Err(InvariantViolation(format!("duplicate call id {call_id}")).into());
        }

        let text = message.to_text()?;
        self.transport.send(text)?;
        self.last_send = Some(Instant::now());
        Ok(call_id)
    }

    fn next_call_id(&mut self) -> u64 {
        while self.pending.contains_key(&self.call_counter) {
            self.call_counter += 1;
        }
        let call_id = self.call_counter;
        self.call_counter += 1;
        call_id
    }

    fn register(&mut self, call_id: u64, reply_tx: Option<ReplySender>) {
        let seq = self.seq_counter;
        self.seq_counter += 1;

        let timer = delay::<(), CancelError>(self.options.ping_timeout, ());
        let canceller = timer.canceller();
        let timeouts_tx = self.timeouts_tx.clone();
        tokio::spawn(async move {
            if timer.await.is_ok() {
                let _ = timeouts_tx.send((call_id, seq));
            }
        });

        self.pending.insert(
            call_id,
            PendingCall {
                seq,
                reply_tx,
                timer: canceller,
            },
        );
    }

    fn handle_call_timeout(&mut self, call_id: u64, seq: u64) {
        // A reply or a reused id may have replaced the entry since the timer
        // was armed.
        if self.pending.get(&call_id).map(|call| call.seq) != Some(seq) {
            return;
        }
        if let Some(call) = self.pending.remove(&call_id) {
            if let Some(reply_tx) = call.reply_tx {
                let _ = reply_tx.send(Err(ConnectionError::PingTimeout { call_id }));
            }
        }

        if self.current == ConnectionState::Closed {
            return;
        }
        warn!(event = "ping_timeout", connection_id = self.id, call_id);
        self.emit(ConnectionEvent::Error(ConnectionError::PingTimeout {
            call_id,
        }));
        self.terminate();
    }

    /// Forced termination: treated by the owner exactly like a remote close.
    fn terminate(&mut self) {
        self.set_state(ConnectionState::Closed);
        self.emit(ConnectionEvent::Close);
        self.transport.close(Some("ping timeout".to_string()));
    }

    fn close(&mut self, reason: Option<String>) {
        if matches!(
            self.current,
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return;
        }
        self.set_state(ConnectionState::Closing);
        self.transport.close(reason);
    }

    fn fail_pending(&mut self) {
        for (_, call) in self.pending.drain() {
            call.timer.cancel();
            if let Some(reply_tx) = call.reply_tx {
                let _ = reply_tx.send(Err(ConnectionError::Closed));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::{
        ConnectionError, ConnectionEvent, ConnectionHandle, ConnectionId, ConnectionOptions,
        ConnectionState, RtmConnection,
    };
    use crate::invariant::InvariantMode;
    use crate::rtm::proto::{Message, MessageType};
    use crate::rtm::transport::{
        TransportCommand, TransportError, TransportEvent, TransportHandle, TransportPeer,
    };

    type Events = mpsc::UnboundedReceiver<(ConnectionId, ConnectionEvent)>;

    fn options(ping_interval_ms: u64, ping_timeout_ms: u64) -> ConnectionOptions {
        ConnectionOptions {
            ping_interval: Duration::from_millis(ping_interval_ms),
            ping_timeout: Duration::from_millis(ping_timeout_ms),
            invariant_mode: InvariantMode::Report,
        }
    }

    fn spawn_connection(options: ConnectionOptions) -> (ConnectionHandle, TransportPeer, Events) {
        let (transport, peer) = TransportHandle::pair();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = RtmConnection::spawn(7, transport, options, events_tx);
        (handle, peer, events_rx)
    }

    async fn open_connection(options: ConnectionOptions) -> (ConnectionHandle, TransportPeer, Events) {
        let (handle, peer, mut events) = spawn_connection(options);
        peer.emit(TransportEvent::Open);
        let (id, event) = events.recv().await.expect("open event");
        assert_eq!(id, 7);
        assert!(matches!(event, ConnectionEvent::Open));
        (handle, peer, events)
    }

    async fn next_sent(peer: &mut TransportPeer) -> Message {
        match peer.recv_command().await {
            Some(TransportCommand::Send(text)) => Message::from_text(&text).expect("decode frame"),
            other => panic!("expected a sent frame, got {other:?}"),
        }
    }

    fn reply_to(peer: &TransportPeer, request: &Message) {
        let reply = json!({
            "type": "reply",
            "call_id": request.call_id.expect("call id"),
            "status": "ok",
            "code": 0,
            "ts": 1,
            "echo": request.field("n").cloned(),
        });
        peer.emit(TransportEvent::Message(reply.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn open_transitions_to_connected_and_pings_immediately() {
        let (handle, mut peer, _events) = open_connection(options(100, 1000)).await;
        assert_eq!(handle.state(), ConnectionState::Connected);

        let ping = next_sent(&mut peer).await;
        assert_eq!(ping.message_type(), MessageType::Ping);
        assert_eq!(ping.call_id, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn send_before_open_is_rejected() {
        let (handle, _peer, _events) = spawn_connection(options(100, 1000));
        let result = handle.send(Message::new("message")).await;
        assert!(matches!(
            result,
            Err(ConnectionError::NotOpen(ConnectionState::Initial))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_resolve_to_their_own_reply() {
        let (handle, mut peer, _events) = open_connection(options(10_000, 5_000)).await;
        let ping = next_sent(&mut peer).await;
        reply_to(&peer, &ping);

        let mut calls = Vec::new();
        for n in 0..8u64 {
            let handle = handle.clone();
            calls.push(tokio::spawn(async move {
                let message = Message::new("message")
                    .with_call_id(100 + n)
                    .with_field("n", n);
                (n, handle.send(message).await)
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..8 {
            requests.push(next_sent(&mut peer).await);
        }
        for request in requests.iter().rev() {
            reply_to(&peer, request);
        }

        for call in calls {
            let (n, result) = call.await.expect("join");
            let reply = result.expect("reply");
            assert_eq!(reply.call_id, Some(100 + n));
            assert_eq!(reply.field("echo"), Some(&json!(n)));
            assert_eq!(reply.status(), Some("ok"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn auto_assigned_ids_skip_pending_explicit_ids() {
        let (handle, mut peer, _events) = open_connection(options(10_000, 5_000)).await;
        let ping = next_sent(&mut peer).await;
        assert_eq!(ping.call_id, Some(0));

        let explicit = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send(Message::new("message").with_call_id(1)).await }
        });
        let first = next_sent(&mut peer).await;
        assert_eq!(first.call_id, Some(1));

        let automatic = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send(Message::default()).await }
        });
        let second = next_sent(&mut peer).await;
        assert_eq!(second.call_id, Some(2));

        reply_to(&peer, &ping);
        reply_to(&peer, &first);
        reply_to(&peer, &second);
        assert_eq!(explicit.await.expect("join").expect("reply").call_id, Some(1));
        assert_eq!(automatic.await.expect("join").expect("reply").call_id, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_pending_call_id_is_reported() {
        let (handle, mut peer, _events) = open_connection(options(10_000, 5_000)).await;
        let _ping = next_sent(&mut peer).await;

        let first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send(Message::new("message").with_call_id(5)).await }
        });
        let request = next_sent(&mut peer).await;
        assert_eq!(request.call_id, Some(5));

        let duplicate = handle.send(Message::new("message").with_call_id(5)).await;
        assert!(matches!(duplicate, Err(ConnectionError::Invariant(_))));

        reply_to(&peer, &request);
        assert!(first.await.expect("join").is_ok());
    }

    #[tokio::test(start_paused = true)]
    #[should_panic(expected = "duplicate call id 5")]
    async fn duplicate_pending_call_id_panics_in_panic_mode() {
        let mut options = options(10_000, 5_000);
        options.invariant_mode = InvariantMode::Panic;
        let (handle, mut peer, _events) = open_connection(options).await;
        let _ping = next_sent(&mut peer).await;

        let _first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send(Message::new("message").with_call_id(5)).await }
        });
        let _request = next_sent(&mut peer).await;

        let _ = handle.send(Message::new("message").with_call_id(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn recent_send_suppresses_heartbeat() {
        let started = Instant::now();
        let (handle, mut peer, _events) = open_connection(options(100, 1_000)).await;

        let ping = next_sent(&mut peer).await;
        assert_eq!(ping.message_type(), MessageType::Ping);
        reply_to(&peer, &ping);

        tokio::time::sleep_until(started + Duration::from_millis(60)).await;
        let call = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send(Message::new("message")).await }
        });
        let request = next_sent(&mut peer).await;
        reply_to(&peer, &request);
        call.await.expect("join").expect("reply");

        tokio::time::sleep_until(started + Duration::from_millis(150)).await;
        assert_eq!(peer.try_recv_command(), None, "ping sent despite recent call");

        tokio::time::sleep_until(started + Duration::from_millis(170)).await;
        match peer.try_recv_command() {
            Some(TransportCommand::Send(text)) => {
                let ping = Message::from_text(&text).expect("decode");
                assert_eq!(ping.message_type(), MessageType::Ping);
            }
            other => panic!("expected heartbeat ping, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_ping_terminates_the_session() {
        let (handle, mut peer, mut events) = open_connection(options(100, 50)).await;
        let ping = next_sent(&mut peer).await;
        assert_eq!(ping.message_type(), MessageType::Ping);

        let (_, event) = events.recv().await.expect("error event");
        assert!(matches!(
            event,
            ConnectionEvent::Error(ConnectionError::PingTimeout { call_id: 0 })
        ));
        let (_, event) = events.recv().await.expect("close event");
        assert!(matches!(event, ConnectionEvent::Close));
        assert_eq!(handle.state(), ConnectionState::Closed);

        assert!(matches!(
            peer.recv_command().await,
            Some(TransportCommand::Close(Some(_)))
        ));
        assert_eq!(peer.recv_command().await, None);
        assert!(events.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn legacy_acks_are_ignored_and_events_forwarded() {
        let (_handle, mut peer, mut events) = open_connection(options(10_000, 5_000)).await;
        let _ping = next_sent(&mut peer).await;

        peer.emit(TransportEvent::Message(
            json!({"type": "pong", "reply_to": 0}).to_string(),
        ));
        peer.emit(TransportEvent::Message(
            json!({"type": "ok", "reply_to": 0, "text": "hi"}).to_string(),
        ));
        peer.emit(TransportEvent::Message(
            json!({"type": "reply", "call_id": 999, "status": "ok"}).to_string(),
        ));
        peer.emit(TransportEvent::Message(
            json!({"type": "update_user_connection", "data": {"connection": "connected"}})
                .to_string(),
        ));

        let (_, event) = events.recv().await.expect("message event");
        match event {
            ConnectionEvent::Message(message) => {
                assert_eq!(message.kind.as_deref(), Some("update_user_connection"));
                assert_eq!(message.field("data"), Some(&json!({"connection": "connected"})));
            }
            other => panic!("expected forwarded message, got {other:?}"),
        }

        peer.emit(TransportEvent::Message("not json".to_string()));
        let (_, event) = events.recv().await.expect("error event");
        assert!(matches!(event, ConnectionEvent::Error(ConnectionError::Json(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn loosely_typed_events_are_forwarded_verbatim() {
        let (_handle, mut peer, mut events) = open_connection(options(10_000, 5_000)).await;
        let _ping = next_sent(&mut peer).await;

        let frames = [
            json!({"type": "message", "call_id": "abc", "text": "hi"}),
            json!({"type": "message", "call_id": -1}),
            json!({"type": 7, "text": "hi"}),
        ];
        for frame in &frames {
            peer.emit(TransportEvent::Message(frame.to_string()));
        }

        for frame in frames {
            let (_, event) = events.recv().await.expect("message event");
            match event {
                ConnectionEvent::Message(message) => {
                    assert_eq!(serde_json::to_value(&message).expect("encode"), frame);
                }
                other => panic!("expected forwarded message for {frame}, got {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn close_requests_graceful_transport_close() {
        let (handle, mut peer, mut events) = open_connection(options(10_000, 5_000)).await;
        let _ping = next_sent(&mut peer).await;

        handle.close(Some("bye".to_string()));
        assert_eq!(
            peer.recv_command().await,
            Some(TransportCommand::Close(Some("bye".to_string())))
        );
        assert_eq!(handle.state(), ConnectionState::Closing);

        peer.emit(TransportEvent::Close);
        let (_, event) = events.recv().await.expect("close event");
        assert!(matches!(event, ConnectionEvent::Close));
        assert_eq!(handle.state(), ConnectionState::Closed);

        let result = handle.send(Message::new("message")).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Closed) | Err(ConnectionError::NotOpen(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_calls_fail_when_transport_closes() {
        let (handle, mut peer, _events) = open_connection(options(10_000, 5_000)).await;
        let _ping = next_sent(&mut peer).await;

        let call = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send(Message::new("message")).await }
        });
        let _request = next_sent(&mut peer).await;

        peer.emit(TransportEvent::Close);
        assert!(matches!(
            call.await.expect("join"),
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_does_not_change_state() {
        let (handle, peer, mut events) = open_connection(options(10_000, 5_000)).await;

        peer.emit(TransportEvent::Error(TransportError::Closed));
        let (_, event) = events.recv().await.expect("error event");
        assert!(matches!(
            event,
            ConnectionEvent::Error(ConnectionError::Transport(_))
        ));
        assert_eq!(handle.state(), ConnectionState::Connected);
    }

    mod proptests {
        use std::collections::HashMap;

        use proptest::prelude::*;

        use super::*;

        fn distinct_ids_and_reply_order() -> impl Strategy<Value = (Vec<u64>, Vec<u64>)> {
            // Id 0 belongs to the heartbeat ping sent on open.
            proptest::collection::btree_set(1u64..1_000_000, 1..24)
                .prop_map(|ids| ids.into_iter().collect::<Vec<_>>())
                .prop_flat_map(|ids| (Just(ids.clone()), Just(ids).prop_shuffle()))
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(48))]

            #[test]
            fn distinct_concurrent_calls_resolve_to_their_own_reply(
                (ids, reply_order) in distinct_ids_and_reply_order(),
            ) {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .start_paused(true)
                    .build()
                    .expect("runtime");

                runtime.block_on(async {
                    let (handle, mut peer, _events) = open_connection(options(10_000, 5_000)).await;
                    let ping = next_sent(&mut peer).await;
                    reply_to(&peer, &ping);

                    let calls: Vec<_> = ids
                        .iter()
                        .map(|&id| {
                            let handle = handle.clone();
                            tokio::spawn(async move {
                                let message = Message::new("message")
                                    .with_call_id(id)
                                    .with_field("n", id);
                                (id, handle.send(message).await)
                            })
                        })
                        .collect();

                    let mut requests = HashMap::new();
                    for _ in 0..ids.len() {
                        let request = next_sent(&mut peer).await;
                        requests.insert(request.call_id.expect("call id"), request);
                    }
                    assert_eq!(requests.len(), ids.len());
                    for id in &reply_order {
                        reply_to(&peer, &requests[id]);
                    }

                    for call in calls {
                        let (id, result) = call.await.expect("join");
                        let reply = result.expect("reply");
                        assert_eq!(reply.call_id, Some(id));
                        assert_eq!(reply.field("echo"), Some(&json!(id)));
                    }
                });
            }
        }
    }
}
