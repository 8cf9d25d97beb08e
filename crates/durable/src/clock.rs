//! Time sources for stores and dispatchers
//!
//! Leases, timer due checks and turn timestamps all read time through a
//! [`Clock`], so tests can drive virtual time with a [`ManualClock`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Source of the current time
pub trait Clock: Send + Sync + 'static {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use taskhub_durable::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// let start = clock.now();
/// clock.advance(Duration::from_secs(5));
/// assert_eq!((clock.now() - start).num_seconds(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a manual clock starting at the current wall time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Create a manual clock starting at `start`
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = add_duration(*now, by);
    }

    /// Set the clock to an absolute instant (never moves backwards)
    pub fn set(&self, instant: DateTime<Utc>) {
        let mut now = self.now.lock();
        if instant > *now {
            *now = instant;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Add a std duration to a timestamp, saturating on overflow
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
