//! Precondition enforcement.
//!
//! Violations such as a duplicate call id or an out-of-order state transition
//! are programming errors. [`InvariantMode`] selects whether they abort the
//! current task with a panic or are logged and returned as an error.

use thiserror::Error;
use tracing::error;

/// A violated precondition.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invariant violated: {0}")]
pub struct InvariantViolation(pub String);

/// How precondition violations are surfaced.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InvariantMode {
    /// Panic on the task that observes the violation.
    Panic,
    /// Log at `error` level and return the violation to the caller.
    Report,
}

impl InvariantMode {
    /// `Panic` for debug builds, `Report` for release builds.
    pub const fn from_build() -> Self {
        if cfg!(debug_assertions) {
            Self::Panic
        } else {
            Self::Report
        }
    }

    /// Logs `violation` and panics in [`InvariantMode::Panic`].
    pub fn enforce(self, violation: InvariantViolation) -> InvariantViolation {
        error!(event = "invariant_violated", reason = %violation.0);
        if self == Self::Panic {
            panic!("{violation}");
        }
        violation
    }

    /// Checks `condition`, enforcing a violation built from `reason` when it
    /// does not hold.
    pub fn check(
        self,
        condition: bool,
        reason: impl FnOnce() -> String,
    ) -> Result<(), InvariantViolation> {
        if condition {
            return Ok(());
        }
        Err(self.enforce(InvariantViolation(reason())))
    }
}

impl Default for InvariantMode {
    fn default() -> Self {
        Self::from_build()
    }
}
