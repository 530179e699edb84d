//! Retry and timeout utilities.
//!
//! The helpers in this module are transport-agnostic: a cancellable
//! [`Delay`], a deadline race built on it ([`with_timeout`]), and the jittered
//! reconnect backoff used by the session manager.

use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Sleep;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Error produced by a [`Delay`] that was cancelled before its timer fired.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("delay cancelled")]
pub struct CancelError;

/// Jittered exponential backoff between reconnect attempts.
///
/// The upper bound for attempt `n` is `min(30, 2^n - 1) * multiplier`; the
/// actual wait is drawn uniformly below it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReconnectBackoff {
    /// Unit applied to the backoff factor.
    pub multiplier: Duration,
}

impl ReconnectBackoff {
    /// Largest backoff factor; with the default multiplier this caps waits
    /// at 30 seconds.
    pub const MAX_FACTOR: u64 = 30;

    /// Creates a backoff with the given multiplier.
    pub fn new(multiplier: Duration) -> Self {
        Self { multiplier }
    }

    /// Upper bound of the wait before reconnect attempt `attempts` (1-based).
    pub fn max_delay_for_attempt(&self, attempts: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempts)
            .map_or(u64::MAX, |value| value - 1)
            .min(Self::MAX_FACTOR);
        self.multiplier.saturating_mul(factor as u32)
    }

    /// Computes a randomized wait in `[0, max_delay_for_attempt(attempts))`.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let ratio: f64 = rand::thread_rng().gen();
        self.max_delay_for_attempt(attempts).mul_f64(ratio)
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

/// Cancellable timer that settles with a preset outcome.
///
/// Built by [`delay`] (resolves with a value) or [`delay_reject`] (fails with
/// an error). Cancelling through a [`DelayCanceller`] settles it with
/// [`CancelError`] instead; dropping it clears the timer.
pub struct Delay<T, E> {
    sleep: Pin<Box<Sleep>>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    token: CancellationToken,
    outcome: Option<Result<T, E>>,
}

// The outcome is only ever moved out, never pinned.
impl<T, E> Unpin for Delay<T, E> {}

impl<T, E> Delay<T, E> {
    fn new(duration: Duration, outcome: Result<T, E>) -> Self {
        let token = CancellationToken::new();
        Self {
            sleep: Box::pin(tokio::time::sleep(duration)),
            cancelled: Box::pin(token.clone().cancelled_owned()),
            token,
            outcome: Some(outcome),
        }
    }

    /// Returns a handle that can cancel this delay from elsewhere.
    pub fn canceller(&self) -> DelayCanceller {
        DelayCanceller {
            token: self.token.clone(),
        }
    }
}

impl<T, E> std::fmt::Debug for Delay<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delay")
            .field("deadline", &self.sleep.deadline())
            .field("cancelled", &self.token.is_cancelled())
            .field("settled", &self.outcome.is_none())
            .finish()
    }
}

impl<T, E> Future for Delay<T, E>
where
    E: From<CancelError>,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        assert!(this.outcome.is_some(), "`Delay` polled after completion");

        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.outcome = None;
            return Poll::Ready(Err(E::from(CancelError)));
        }

        ready!(this.sleep.as_mut().poll(cx));
        match this.outcome.take() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Ready(Err(E::from(CancelError))),
        }
    }
}

/// Cloneable cancel handle for a [`Delay`].
#[derive(Clone, Debug)]
pub struct DelayCanceller {
    token: CancellationToken,
}

impl DelayCanceller {
    /// Cancels the delay. No effect once it has settled.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns whether [`DelayCanceller::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Returns a delay that resolves with `value` after `duration`.
pub fn delay<T, E>(duration: Duration, value: T) -> Delay<T, E>
where
    E: From<CancelError>,
{
    Delay::new(duration, Ok(value))
}

/// Returns a delay that fails with `error` after `duration`.
pub fn delay_reject<T, E>(duration: Duration, error: E) -> Delay<T, E>
where
    E: From<CancelError>,
{
    Delay::new(duration, Err(error))
}

/// Races `future` against a deadline that fails with `error`.
///
/// The deadline timer is cancelled when `future` wins. When the deadline wins,
/// `future` is dropped here, but side effects it already started elsewhere
/// keep running without an observer.
pub async fn with_timeout<T, E, Fut>(timeout: Duration, error: E, future: Fut) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: From<CancelError>,
{
    let deadline = delay_reject(timeout, error);
    let canceller = deadline.canceller();
    tokio::pin!(future);

    tokio::select! {
        biased;
        result = &mut future => {
            canceller.cancel();
            result
        }
        expired = deadline => expired,
    }
}
