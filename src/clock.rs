//! Wall-clock abstraction so staleness, GC and persistence age checks can be
//! driven deterministically in tests.

use chrono::{DateTime, Duration, Utc};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use crate::lock::mutex_lock;

/// Source of "now" for every time-dependent decision in the cache.
pub trait Clock: Send + Sync + Debug {
  fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
  now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Arc::new(Mutex::new(start)),
    }
  }

  /// Move the clock forward.
  pub fn advance(&self, by: Duration) {
    let mut now = mutex_lock(&self.now, "clock", "advance");
    *now += by;
  }

  pub fn set(&self, to: DateTime<Utc>) {
    *mutex_lock(&self.now, "clock", "set") = to;
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new(Utc::now())
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *mutex_lock(&self.now, "clock", "now")
  }
}

/// Shared handle used by every component.
pub type SharedClock = Arc<dyn Clock>;

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn manual_clock_only_moves_when_advanced() {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let clock = ManualClock::new(start);
    assert_eq!(clock.now(), start);

    clock.advance(Duration::milliseconds(400_000));
    assert_eq!(clock.now(), start + Duration::milliseconds(400_000));

    let shared = clock.clone();
    shared.advance(Duration::seconds(1));
    assert_eq!(clock.now(), start + Duration::milliseconds(401_000));
  }
}
