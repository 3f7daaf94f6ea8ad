//! Request/response wait budget.

use std::time::Duration;

use super::SettingsError;

/// Budget for every request/response wait (keepalive ping and liveness probe).
///
/// There is no retry inside a single wait; retry policy lives in the
/// keepalive loop.
///
/// # Valid Range
///
/// - Minimum: anything above zero
/// - Maximum: 5 minutes
/// - Default: 20 seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageTimeout(Duration);

impl MessageTimeout {
    /// Default timeout: 20 seconds
    const DEFAULT_SECS: u64 = 20;

    /// Maximum valid timeout: 5 minutes
    const MAX_SECS: u64 = 300;

    /// Create a new MessageTimeout with validation.
    ///
    /// Zero is rejected since every wait would fail immediately. The ceiling
    /// is exact: 300s is accepted, 300s + 1ns is not.
    pub fn new(duration: Duration) -> Result<Self, SettingsError> {
        if duration.is_zero() {
            return Err(SettingsError::invalid("message timeout must be non-zero"));
        }
        if duration > Duration::from_secs(Self::MAX_SECS) {
            return Err(SettingsError::invalid(format!(
                "message timeout must be at most {}s, got {:?}",
                Self::MAX_SECS,
                duration
            )));
        }
        Ok(Self(duration))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Default for MessageTimeout {
    fn default() -> Self {
        Self(Duration::from_secs(Self::DEFAULT_SECS))
    }
}
