//! Session manager: the caller-facing RTM client.
//!
//! [`RtmClient`] keeps one logical session alive across transport drops. A
//! background worker owns the client state, resolves the connection target,
//! attaches at most one [`RtmConnection`] at a time and runs the reconnect
//! backoff loop. Lifecycle and inbound traffic are surfaced as
//! [`ClientEvent`]s.
//!
//! ```text
//!                    Initial
//!                       |
//!          error        |
//!      +-------------+  v        connect
//!  Reconnect ------> Connecting <--------- Closed
//!      ^                |                    ^
//!      |    server      |                    |
//!      |    close/      v        close       |
//!      +------------ Connected ---------> Closing
//!           error
//! ```

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::invariant::{InvariantMode, InvariantViolation};
use crate::retry::{delay, with_timeout, CancelError, DelayCanceller, ReconnectBackoff};
use crate::rtm::connection::{
    ConnectionError, ConnectionEvent, ConnectionHandle, ConnectionId, ConnectionOptions,
    RtmConnection,
};
use crate::rtm::proto::Message;
use crate::rtm::transport::{TransportFactory, WebSocketTransport};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RtmClientDefaults;

impl RtmClientDefaults {
    pub const PING_INTERVAL: Duration = Duration::from_millis(15_000);
    pub const PING_TIMEOUT: Duration = Duration::from_millis(15_000);
    pub const RECONNECT_TIMEOUT: Duration = Duration::from_millis(60_000);
    pub const BACKOFF_MULTIPLIER: Duration = Duration::from_millis(1_000);
}

/// Future returned by a target resolver.
pub type ResolveFuture = BoxFuture<'static, Result<String, String>>;

/// Where to connect: a fixed URL or an async resolver called on every attempt.
#[derive(Clone)]
pub enum ConnectTarget {
    Url(SecretString),
    Resolver(Arc<dyn Fn() -> ResolveFuture + Send + Sync>),
}

impl ConnectTarget {
    pub fn url(url: impl Into<String>) -> Self {
        Self::Url(SecretString::new(url.into()))
    }

    /// Wraps an async function producing the URL for the next attempt.
    pub fn resolver<F, Fut, E>(resolve: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        Self::Resolver(Arc::new(move || {
            let pending = resolve();
            Box::pin(async move { pending.await.map_err(|err| err.to_string()) })
        }))
    }

    async fn resolve(&self) -> Result<SecretString, RtmClientError> {
        match self {
            Self::Url(url) => Ok(url.clone()),
            Self::Resolver(resolve) => resolve()
                .await
                .map(SecretString::new)
                .map_err(RtmClientError::Resolve),
        }
    }
}

impl std::fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Self::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

impl From<&str> for ConnectTarget {
    fn from(url: &str) -> Self {
        Self::url(url)
    }
}

impl From<String> for ConnectTarget {
    fn from(url: String) -> Self {
        Self::url(url)
    }
}

/// Client configuration.
#[derive(Clone)]
pub struct RtmClientOptions {
    pub target: ConnectTarget,
    pub transport: Arc<dyn TransportFactory>,
    /// Maximum idle time before a heartbeat ping is sent.
    pub ping_interval: Duration,
    /// Reply deadline for every call, heartbeats included. Expiry terminates
    /// the connection.
    pub ping_timeout: Duration,
    /// Deadline for resolving the connection target.
    pub reconnect_timeout: Duration,
    /// Unit of the reconnect backoff.
    pub backoff_multiplier: Duration,
    pub invariant_mode: InvariantMode,
}

impl RtmClientOptions {
    pub fn new(target: impl Into<ConnectTarget>, transport: Arc<dyn TransportFactory>) -> Self {
        Self {
            target: target.into(),
            transport,
            ping_interval: RtmClientDefaults::PING_INTERVAL,
            ping_timeout: RtmClientDefaults::PING_TIMEOUT,
            reconnect_timeout: RtmClientDefaults::RECONNECT_TIMEOUT,
            backoff_multiplier: RtmClientDefaults::BACKOFF_MULTIPLIER,
            invariant_mode: InvariantMode::from_build(),
        }
    }

    /// Options using [`WebSocketTransport`].
    pub fn websocket(target: impl Into<ConnectTarget>) -> Self {
        Self::new(target, Arc::new(WebSocketTransport))
    }

    pub fn with_ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }

    pub fn with_ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.ping_timeout = ping_timeout;
        self
    }

    pub fn with_reconnect_timeout(mut self, reconnect_timeout: Duration) -> Self {
        self.reconnect_timeout = reconnect_timeout;
        self
    }

    pub fn with_backoff_multiplier(mut self, backoff_multiplier: Duration) -> Self {
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    pub fn with_invariant_mode(mut self, invariant_mode: InvariantMode) -> Self {
        self.invariant_mode = invariant_mode;
        self
    }

    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            ping_interval: self.ping_interval,
            ping_timeout: self.ping_timeout,
            invariant_mode: self.invariant_mode,
        }
    }
}

impl std::fmt::Debug for RtmClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtmClientOptions")
            .field("target", &self.target)
            .field("ping_interval", &self.ping_interval)
            .field("ping_timeout", &self.ping_timeout)
            .field("reconnect_timeout", &self.reconnect_timeout)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("invariant_mode", &self.invariant_mode)
            .finish_non_exhaustive()
    }
}

/// Session state exposed by [`RtmClient::state`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientState {
    Initial,
    Connecting,
    Connected,
    Reconnect,
    Closing,
    Closed,
}

/// Session-level notification.
#[derive(Debug)]
pub enum ClientEvent {
    /// A transport opened.
    Online,
    /// The transport went away, voluntarily or not.
    Offline,
    /// Inbound server message.
    Event(Message),
    /// Transient error; the session recovers on its own.
    Error(RtmClientError),
    /// The session reached [`ClientState::Closed`] through [`RtmClient::close`].
    Close,
}

/// Errors produced by the session manager.
#[derive(Debug, Error)]
pub enum RtmClientError {
    /// No open connection to send through.
    #[error("client currently not connected, the current state is: {state:?}")]
    NotConnected {
        state: ClientState,
        message: Box<Message>,
    },

    /// Caller-supplied send deadline elapsed before the reply.
    #[error("rtm message send timeout")]
    SendTimeout { message: Box<Message> },

    /// Resolving the connection target took longer than `reconnect_timeout`.
    #[error("timed out resolving the connection url")]
    ReconnectTimeout,

    /// The target resolver failed.
    #[error("failed to resolve the connection url: {0}")]
    Resolve(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error(transparent)]
    Cancelled(#[from] CancelError),

    /// The background worker is gone.
    #[error("client worker stopped")]
    WorkerStopped,
}

/// Receiver for [`ClientEvent`]s.
#[derive(Debug)]
pub struct ClientEvents {
    receiver: mpsc::UnboundedReceiver<ClientEvent>,
}

impl ClientEvents {
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.receiver.recv().await
    }

    /// Returns an already queued event without waiting.
    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn into_inner(self) -> mpsc::UnboundedReceiver<ClientEvent> {
        self.receiver
    }
}

/// Cloneable handle to the session manager.
///
/// The worker stops, closing any open connection, when the last handle is
/// dropped.
#[derive(Clone, Debug)]
pub struct RtmClient {
    commands: mpsc::UnboundedSender<ClientCommand>,
    state: Arc<RwLock<ClientState>>,
    invariant_mode: InvariantMode,
}

impl RtmClient {
    /// Spawns the session worker in state [`ClientState::Initial`].
    ///
    /// Must be called from within a Tokio runtime. Call
    /// [`RtmClient::connect`] to start connecting.
    pub fn new(options: RtmClientOptions) -> Result<(Self, ClientEvents), RtmClientError> {
        let (client, events, worker) = Self::prepare(options)?;
        tokio::spawn(worker.run());
        Ok((client, events))
    }

    /// Like [`RtmClient::new`], also reporting every state change as a
    /// `(from, to)` pair.
    #[cfg(test)]
    fn with_transition_log(
        options: RtmClientOptions,
    ) -> Result<
        (
            Self,
            ClientEvents,
            mpsc::UnboundedReceiver<(ClientState, ClientState)>,
        ),
        RtmClientError,
    > {
        let (client, events, mut worker) = Self::prepare(options)?;
        let (transitions_tx, transitions_rx) = mpsc::unbounded_channel();
        worker.transitions = Some(transitions_tx);
        tokio::spawn(worker.run());
        Ok((client, events, transitions_rx))
    }

    fn prepare(
        options: RtmClientOptions,
    ) -> Result<(Self, ClientEvents, ClientWorker), RtmClientError> {
        validate_options(&options)?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ClientState::Initial));
        let invariant_mode = options.invariant_mode;

        let worker = ClientWorker::new(options, Arc::clone(&state), commands_rx, events_tx);

        Ok((
            Self {
                commands: commands_tx,
                state,
                invariant_mode,
            },
            ClientEvents {
                receiver: events_rx,
            },
            worker,
        ))
    }

    pub fn state(&self) -> ClientState {
        match self.state.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Starts connecting.
    ///
    /// Valid from `Initial`, `Closed` or `Reconnect`; returns once the client
    /// is `Connecting`. Progress is reported through [`ClientEvent`]s.
    pub async fn connect(&self) -> Result<(), RtmClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ClientCommand::Connect(reply_tx))
            .map_err(|_| RtmClientError::WorkerStopped)?;

        match reply_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(violation)) => Err(self.invariant_mode.enforce(violation).into()),
            Err(_) => Err(RtmClientError::WorkerStopped),
        }
    }

    /// Closes the session. Repeated calls are no-ops.
    pub fn close(&self) {
        let _ = self.commands.send(ClientCommand::Close);
    }

    /// Sends `message` and waits for its reply.
    ///
    /// With a non-zero `timeout`, fails with [`RtmClientError::SendTimeout`]
    /// once it elapses. The call itself stays registered on the connection, so
    /// a late reply is discarded silently.
    pub async fn send(
        &self,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Message, RtmClientError> {
        let Some(connection) = self.current_connection().await? else {
            return Err(self.not_connected(message));
        };

        match timeout.filter(|limit| !limit.is_zero()) {
            None => self.deliver(connection, message).await,
            Some(limit) => {
                let expired = RtmClientError::SendTimeout {
                    message: Box::new(message.clone()),
                };
                with_timeout(limit, expired, self.deliver(connection, message)).await
            }
        }
    }

    async fn deliver(
        &self,
        connection: ConnectionHandle,
        message: Message,
    ) -> Result<Message, RtmClientError> {
        match connection.send(message.clone()).await {
            Err(ConnectionError::NotOpen(_)) => Err(self.not_connected(message)),
            result => Ok(result?),
        }
    }

    async fn current_connection(&self) -> Result<Option<ConnectionHandle>, RtmClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ClientCommand::CurrentConnection(reply_tx))
            .map_err(|_| RtmClientError::WorkerStopped)?;
        reply_rx.await.map_err(|_| RtmClientError::WorkerStopped)
    }

    fn not_connected(&self, message: Message) -> RtmClientError {
        RtmClientError::NotConnected {
            state: self.state(),
            message: Box::new(message),
        }
    }
}

pub(crate) fn validate_options(options: &RtmClientOptions) -> Result<(), RtmClientError> {
    validate_duration(options.ping_interval, "ping_interval")?;
    validate_duration(options.ping_timeout, "ping_timeout")?;
    validate_duration(options.reconnect_timeout, "reconnect_timeout")?;
    Ok(())
}

fn validate_duration(value: Duration, field: &str) -> Result<(), RtmClientError> {
    if value.is_zero() {
        return Err(RtmClientError::InvalidOptions(format!("{field} must be > 0")));
    }
    Ok(())
}

#[derive(Debug)]
enum ClientCommand {
    Connect(oneshot::Sender<Result<(), InvariantViolation>>),
    Close,
    CurrentConnection(oneshot::Sender<Option<ConnectionHandle>>),
}

/// Completion of work started by the worker, tagged with the cycle that
/// started it.
enum WorkerNotice {
    Resolved {
        cycle: u64,
        result: Result<SecretString, RtmClientError>,
    },
    BackoffElapsed {
        cycle: u64,
    },
}

enum PendingWork {
    Resolving(JoinHandle<()>),
    Backoff(DelayCanceller),
}

impl PendingWork {
    fn cancel(self) {
        match self {
            Self::Resolving(task) => task.abort(),
            Self::Backoff(canceller) => canceller.cancel(),
        }
    }
}

struct ClientWorker {
    options: RtmClientOptions,
    backoff: ReconnectBackoff,
    current: ClientState,
    shared_state: Arc<RwLock<ClientState>>,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    events: mpsc::UnboundedSender<ClientEvent>,
    connection_events_tx: mpsc::UnboundedSender<(ConnectionId, ConnectionEvent)>,
    connection_events_rx: mpsc::UnboundedReceiver<(ConnectionId, ConnectionEvent)>,
    notices_tx: mpsc::UnboundedSender<WorkerNotice>,
    notices_rx: mpsc::UnboundedReceiver<WorkerNotice>,
    connection: Option<ConnectionHandle>,
    force_close: bool,
    reconnect_attempts: u32,
    next_connection_id: ConnectionId,
    cycle: u64,
    pending_work: Option<PendingWork>,
    #[cfg(test)]
    transitions: Option<mpsc::UnboundedSender<(ClientState, ClientState)>>,
}

impl ClientWorker {
    fn new(
        options: RtmClientOptions,
        shared_state: Arc<RwLock<ClientState>>,
        commands: mpsc::UnboundedReceiver<ClientCommand>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        let (connection_events_tx, connection_events_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        Self {
            backoff: ReconnectBackoff::new(options.backoff_multiplier),
            options,
            current: ClientState::Initial,
            shared_state,
            commands,
            events,
            connection_events_tx,
            connection_events_rx,
            notices_tx,
            notices_rx,
            connection: None,
            force_close: false,
            reconnect_attempts: 1,
            next_connection_id: 0,
            cycle: 0,
            pending_work: None,
            #[cfg(test)]
            transitions: None,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some((id, event)) = self.connection_events_rx.recv() => {
                    self.handle_connection_event(id, event);
                }
                Some(notice) = self.notices_rx.recv() => self.handle_notice(notice),
            }
        }

        self.cancel_pending_work();
        if let Some(connection) = self.connection.take() {
            connection.close(None);
        }
        debug!(event = "client_stopped");
    }

    fn set_state(&mut self, state: ClientState) {
        debug!(event = "client_state", from = ?self.current, to = ?state);
        #[cfg(test)]
        if let Some(transitions) = &self.transitions {
            let _ = transitions.send((self.current, state));
        }
        self.current = state;
        match self.shared_state.write() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Connect(reply_tx) => {
                let _ = reply_tx.send(self.connect());
            }
            ClientCommand::Close => self.close(),
            ClientCommand::CurrentConnection(reply_tx) => {
                let _ = reply_tx.send(self.connection.clone());
            }
        }
    }

    fn connect(&mut self) -> Result<(), InvariantViolation> {
        if !matches!(
            self.current,
            ClientState::Initial | ClientState::Closed | ClientState::Reconnect
        ) {
            return Err(InvariantViolation(format!(
                "connect() requires state Initial, Closed or Reconnect, but the current state is {:?}",
                self.current
            )));
        }

        self.cancel_pending_work();
        self.set_state(ClientState::Connecting);
        let cycle = self.next_cycle();

        let target = self.options.target.clone();
        let reconnect_timeout = self.options.reconnect_timeout;
        let notices_tx = self.notices_tx.clone();
        let task = tokio::spawn(async move {
            let result =
                with_timeout(reconnect_timeout, RtmClientError::ReconnectTimeout, target.resolve())
                    .await;
            let _ = notices_tx.send(WorkerNotice::Resolved { cycle, result });
        });
        self.pending_work = Some(PendingWork::Resolving(task));
        Ok(())
    }

    fn schedule_reconnect(&mut self) {
        self.cancel_pending_work();
        self.set_state(ClientState::Reconnect);
        let cycle = self.next_cycle();

        let wait = self.backoff.delay_for_attempt(self.reconnect_attempts);
        debug!(
            event = "reconnect_scheduled",
            attempt = self.reconnect_attempts,
            delay_ms = wait.as_millis() as u64
        );

        let backoff = delay::<(), CancelError>(wait, ());
        let canceller = backoff.canceller();
        let notices_tx = self.notices_tx.clone();
        tokio::spawn(async move {
            match backoff.await {
                Ok(()) => {
                    let _ = notices_tx.send(WorkerNotice::BackoffElapsed { cycle });
                }
                Err(CancelError) => debug!(event = "reconnect_cancelled", cycle),
            }
        });
        self.pending_work = Some(PendingWork::Backoff(canceller));
    }

    fn close(&mut self) {
        if let Some(connection) = self.connection.as_ref() {
            if self.current != ClientState::Closing {
                connection.close(None);
                self.force_close = true;
                self.set_state(ClientState::Closing);
            }
        } else if self.current != ClientState::Closed {
            self.cancel_pending_work();
            self.next_cycle();
            self.set_state(ClientState::Closed);
            self.emit(ClientEvent::Close);
        }
    }

    fn handle_notice(&mut self, notice: WorkerNotice) {
        match notice {
            WorkerNotice::Resolved { cycle, result } => {
                if cycle != self.cycle || self.current != ClientState::Connecting {
                    debug!(event = "stale_resolution_ignored", cycle);
                    return;
                }
                self.pending_work = None;
                match result {
                    Ok(url) => {
                        self.reconnect_attempts = 1;
                        self.open_connection(&url);
                    }
                    Err(err) => {
                        warn!(event = "resolve_failed", error = %err);
                        self.schedule_reconnect();
                        self.emit(ClientEvent::Error(err));
                    }
                }
            }
            WorkerNotice::BackoffElapsed { cycle } => {
                if cycle != self.cycle || self.current != ClientState::Reconnect {
                    debug!(event = "stale_backoff_ignored", cycle);
                    return;
                }
                self.pending_work = None;
                self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
                if let Err(violation) = self.connect() {
                    self.options.invariant_mode.enforce(violation);
                }
            }
        }
    }

    fn open_connection(&mut self, url: &SecretString) {
        let id = self.next_connection_id;
        self.next_connection_id += 1;

        let transport = self.options.transport.open(url.expose_secret());
        let connection = RtmConnection::spawn(
            id,
            transport,
            self.options.connection_options(),
            self.connection_events_tx.clone(),
        );
        self.attach(connection);
    }

    fn attach(&mut self, connection: ConnectionHandle) {
        let attached = self.connection.as_ref().map(ConnectionHandle::id);
        let checked = self.options.invariant_mode.check(attached.is_none(), || {
            format!("connection {attached:?} is still attached")
        });
        if checked.is_err() {
            if let Some(stale) = self.connection.take() {
                stale.close(None);
            }
        }
        debug!(event = "connection_attached", connection_id = connection.id());
        self.connection = Some(connection);
    }

    fn detach(&mut self) {
        let detached = self.connection.take();
        let _ = self
            .options
            .invariant_mode
            .check(detached.is_some(), || "no connection to detach".to_string());
    }

    fn handle_connection_event(&mut self, id: ConnectionId, event: ConnectionEvent) {
        if self.connection.as_ref().map(ConnectionHandle::id) != Some(id) {
            debug!(event = "detached_connection_event_ignored", connection_id = id);
            return;
        }

        match event {
            ConnectionEvent::Open => {
                if self.current == ClientState::Closing {
                    return;
                }
                self.set_state(ClientState::Connected);
                self.emit(ClientEvent::Online);
            }
            ConnectionEvent::Close => {
                self.detach();
                if self.force_close {
                    self.force_close = false;
                    self.set_state(ClientState::Closed);
                    self.emit(ClientEvent::Offline);
                    self.emit(ClientEvent::Close);
                } else {
                    self.schedule_reconnect();
                    self.emit(ClientEvent::Offline);
                }
            }
            ConnectionEvent::Error(err) => self.emit(ClientEvent::Error(err.into())),
            ConnectionEvent::Message(message) => self.emit(ClientEvent::Event(message)),
        }
    }

    fn next_cycle(&mut self) -> u64 {
        self.cycle += 1;
        self.cycle
    }

    fn cancel_pending_work(&mut self) {
        if let Some(work) = self.pending_work.take() {
            work.cancel();
        }
    }
}
