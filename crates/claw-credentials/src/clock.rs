//! Time source and rotation timers.
//!
//! Supervision loops never read the wall clock or sleep directly; they go
//! through a [`Clock`] so tests can drive rotation with [`ManualClock`].

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::time::{Instant, Sleep};

/// A source of the current time and of timers.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Returns a timer that fires once `after` has elapsed.
    fn new_timer(&self, after: Duration) -> Box<dyn Timer>;
}

/// A resettable one-shot timer.
pub trait Timer: Send {
    /// Completes when the timer fires. Cancel-safe.
    fn fired(&mut self) -> BoxFuture<'_, ()>;

    /// Re-arms the timer to fire `after` from now.
    fn reset(&mut self, after: Duration);
}

/// Wall clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn new_timer(&self, after: Duration) -> Box<dyn Timer> {
        Box::new(SystemTimer {
            sleep: Box::pin(tokio::time::sleep(after)),
        })
    }
}

struct SystemTimer {
    sleep: Pin<Box<Sleep>>,
}

impl Timer for SystemTimer {
    fn fired(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.sleep.as_mut())
    }

    fn reset(&mut self, after: Duration) {
        self.sleep.as_mut().reset(Instant::now() + after);
    }
}

/// A clock that only moves when told to.
///
/// Timers created from it fire once [`ManualClock::advance`] moves the
/// current time past their deadline.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<watch::Sender<DateTime<Utc>>>,
    armed: Arc<watch::Sender<usize>>,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(watch::Sender::new(start)),
            armed: Arc::new(watch::Sender::new(0)),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        self.now.send_modify(|now| {
            *now = now.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC);
        });
    }

    /// Number of times a timer has been created or reset.
    #[must_use]
    pub fn timers_armed(&self) -> usize {
        *self.armed.borrow()
    }

    /// Waits until timers have been created or reset at least `count` times.
    pub async fn wait_for_timers(&self, count: usize) {
        let mut armed = self.armed.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = armed.wait_for(|armed| *armed >= count).await;
    }

    fn deadline(&self, after: Duration) -> DateTime<Utc> {
        let after = chrono::Duration::from_std(after).unwrap_or(chrono::Duration::MAX);
        self.now()
            .checked_add_signed(after)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn record_armed(&self) {
        self.armed.send_modify(|armed| *armed += 1);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.borrow()
    }

    fn new_timer(&self, after: Duration) -> Box<dyn Timer> {
        let timer = ManualTimer {
            deadline: self.deadline(after),
            clock: self.clone(),
        };
        self.record_armed();
        Box::new(timer)
    }
}

struct ManualTimer {
    deadline: DateTime<Utc>,
    clock: ManualClock,
}

impl Timer for ManualTimer {
    fn fired(&mut self) -> BoxFuture<'_, ()> {
        let deadline = self.deadline;
        let mut now = self.clock.now.subscribe();
        Box::pin(async move {
            if now.wait_for(|now| *now >= deadline).await.is_err() {
                std::future::pending::<()>().await;
            }
        })
    }

    fn reset(&mut self, after: Duration) {
        self.deadline = self.clock.deadline(after);
        self.clock.record_armed();
    }
}
