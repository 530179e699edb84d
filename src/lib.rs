//! Resilient real-time messaging (RTM) client.
//!
//! The crate is organized in layers:
//! - `rtm::client`: long-lived session that reconnects with jittered backoff.
//! - `rtm::connection`: one transport session with heartbeat pings and
//!   `call_id` reply correlation.
//! - `retry`: cancellable delays, timeout races and the backoff policy.
//! - `invariant`: how precondition violations are surfaced.

/// Precondition enforcement shared by the client layers.
pub mod invariant;
/// Delay, timeout and backoff helpers.
pub mod retry;
/// RTM client, connection, protocol and transport.
pub mod rtm;

pub use invariant::{InvariantMode, InvariantViolation};
pub use rtm::client::{
    ClientEvent, ClientEvents, ClientState, ConnectTarget, RtmClient, RtmClientDefaults,
    RtmClientError, RtmClientOptions,
};
pub use rtm::proto::{Message, MessageType};
