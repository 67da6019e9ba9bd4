//! Rotation schedule for issued credentials.

use std::time::Duration;

use crate::error::{Error, Result};

/// Validity periods above this rotate a fixed margin before expiry.
pub const LONG_VALIDITY_THRESHOLD: Duration = Duration::from_secs(4 * 60 * 60);

/// Margin before expiry for long validity periods.
pub const LONG_VALIDITY_MARGIN: Duration = Duration::from_secs(30 * 60);

/// Shortest validity period a manager accepts.
pub const MIN_VALIDITY_PERIOD: Duration = Duration::from_secs(1);

/// Returns how long after issuance a credential should be replaced.
///
/// Periods longer than four hours rotate thirty minutes before expiry.
/// Shorter periods rotate after seven eighths of the period has elapsed.
#[must_use]
pub fn rotation_interval(validity_period: Duration) -> Duration {
    if validity_period > LONG_VALIDITY_THRESHOLD {
        validity_period - LONG_VALIDITY_MARGIN
    } else {
        validity_period - validity_period / 8
    }
}

/// Validity and rotation timing shared by every supervision loop of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    validity_period: Duration,
    rotation_interval: Duration,
}

impl RotationPolicy {
    /// Creates a policy for credentials valid for `validity_period`.
    ///
    /// # Errors
    ///
    /// Returns an error if the period is shorter than [`MIN_VALIDITY_PERIOD`].
    pub fn new(validity_period: Duration) -> Result<Self> {
        if validity_period < MIN_VALIDITY_PERIOD {
            return Err(Error::Config(format!(
                "validity period {validity_period:?} is shorter than {MIN_VALIDITY_PERIOD:?}"
            )));
        }

        Ok(Self {
            validity_period,
            rotation_interval: rotation_interval(validity_period),
        })
    }

    /// Lifetime of each issued certificate.
    #[must_use]
    pub const fn validity_period(&self) -> Duration {
        self.validity_period
    }

    /// Delay between issuance and the next rotation.
    #[must_use]
    pub const fn rotation_interval(&self) -> Duration {
        self.rotation_interval
    }
}
