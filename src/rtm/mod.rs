//! Realtime messaging modules.
//!
//! - `client`: session manager with reconnect backoff and target resolution.
//! - `connection`: single transport session with heartbeat and call
//!   correlation.
//! - `proto`: JSON message envelope shared with the RTM service.
//! - `transport`: transport seam and the websocket implementation.

/// Session manager exposed to callers.
pub mod client;
/// One live transport session.
pub mod connection;
/// RTM message envelope.
pub mod proto;
/// Transport abstraction and websocket transport.
pub mod transport;
