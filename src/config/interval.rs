//! Jittered sleep band between keepalive rounds.

use std::time::Duration;

use rand::Rng;

use super::SettingsError;

/// Half-open band `[min, max)` the keepalive loop samples its sleep from.
///
/// A fixed period would give the connection a recognisable traffic pattern;
/// sampling uniformly from the band avoids that while bounding the silence
/// between rounds to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeInterval {
    min: Duration,
    max: Duration,
}

impl ProbeInterval {
    const DEFAULT_MIN_MS: u64 = 20_000;
    const DEFAULT_MAX_MS: u64 = 30_000;

    /// Create a band from millisecond bounds.
    ///
    /// Requires `0 < min < max`; an empty band cannot be sampled.
    pub fn from_millis(min_ms: u64, max_ms: u64) -> Result<Self, SettingsError> {
        if min_ms == 0 {
            return Err(SettingsError::invalid("min interval must be non-zero"));
        }
        if min_ms >= max_ms {
            return Err(SettingsError::invalid(format!(
                "min interval ({min_ms}ms) must be below max interval ({max_ms}ms)"
            )));
        }
        Ok(Self {
            min: Duration::from_millis(min_ms),
            max: Duration::from_millis(max_ms),
        })
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Draw a uniformly random sleep in `[min, max)` at millisecond granularity.
    pub fn sample(&self) -> Duration {
        self.sample_with(&mut rand::thread_rng())
    }

    pub(crate) fn sample_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        Duration::from_millis(rng.gen_range(min_ms..max_ms))
    }
}

impl Default for ProbeInterval {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(Self::DEFAULT_MIN_MS),
            max: Duration::from_millis(Self::DEFAULT_MAX_MS),
        }
    }
}
