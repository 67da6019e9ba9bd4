//! Metrics emitted by the supervision loops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::Result;

/// Counter incremented after every successful generation.
pub const CRED_CREATION_SUCCEEDED_COUNT: &str = "CredCreationSucceededCount";

/// Duration of every successful generation.
pub const CRED_CREATION_SUCCEEDED_DURATION: &str = "CredCreationSucceededDuration";

/// Counter incremented after every failed generation.
pub const CRED_CREATION_FAILED_COUNT: &str = "CredCreationFailedCount";

/// Destination for manager metrics.
///
/// Failures are logged by the caller and otherwise ignored.
pub trait MetricsSink: Send + Sync {
    /// Increments the named counter by one.
    fn increment_counter(&self, name: &str) -> Result<()>;

    /// Records a duration sample for the named metric.
    fn send_duration(&self, name: &str, value: Duration) -> Result<()>;
}

/// A sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn send_duration(&self, _name: &str, _value: Duration) -> Result<()> {
        Ok(())
    }
}

/// A sink that keeps every sample in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetrics {
    counters: Arc<RwLock<HashMap<String, u64>>>,
    durations: Arc<RwLock<HashMap<String, Vec<Duration>>>>,
}

impl InMemoryMetrics {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, zero if never incremented.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    /// Every duration recorded under `name`, oldest first.
    #[must_use]
    pub fn durations(&self, name: &str) -> Vec<Duration> {
        self.durations.read().get(name).cloned().unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &str) -> Result<()> {
        *self.counters.write().entry(name.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn send_duration(&self, name: &str, value: Duration) -> Result<()> {
        self.durations
            .write()
            .entry(name.to_string())
            .or_default()
            .push(value);
        Ok(())
    }
}
