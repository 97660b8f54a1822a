//! Cache entries and the events emitted when they change.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::key::QueryKey;

/// Lifecycle state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
  /// Created (e.g. by a subscriber) but never fetched
  Idle,
  /// A fetch is in flight; `data` may still hold the previous value
  Pending,
  Success,
  /// The last fetch failed; `data` holds the last good value, if any
  Error,
}

/// Details of the most recent failed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
  pub message: String,
  pub occurred_at: DateTime<Utc>,
  /// Consecutive failed fetches; reset by the next success.
  pub failure_count: u32,
}

/// A single cached item.
///
/// Invariants: `status == Success` implies `data.is_some()`; `status ==
/// Error` implies `error.is_some()`; `stale_at >= data_updated_at` whenever
/// both are set.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub key: QueryKey,
  pub data: Option<T>,
  pub status: EntryStatus,
  pub created_at: DateTime<Utc>,
  pub data_updated_at: Option<DateTime<Utc>>,
  /// `None` until data arrives; an entry without it is always stale.
  pub stale_at: Option<DateTime<Utc>>,
  /// Window used to compute `stale_at` from `data_updated_at`.
  pub stale_time: Duration,
  pub error: Option<ErrorInfo>,
  pub subscriber_count: usize,
}

impl<T> CacheEntry<T> {
  pub(crate) fn new(key: QueryKey, now: DateTime<Utc>, stale_time: Duration) -> Self {
    Self {
      key,
      data: None,
      status: EntryStatus::Idle,
      created_at: now,
      data_updated_at: None,
      stale_at: None,
      stale_time,
      error: None,
      subscriber_count: 0,
    }
  }

  /// `now >= stale_at`, or no data yet.
  pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
    self.stale_at.map_or(true, |stale_at| now >= stale_at)
  }

  pub fn is_fetching(&self) -> bool {
    self.status == EntryStatus::Pending
  }

  pub fn has_data(&self) -> bool {
    self.data.is_some()
  }

  /// Record freshly confirmed data.
  pub(crate) fn record_success(&mut self, data: T, updated_at: DateTime<Utc>) {
    self.data = Some(data);
    self.status = EntryStatus::Success;
    self.data_updated_at = Some(updated_at);
    self.stale_at = Some(updated_at + self.stale_time);
    self.error = None;
  }

  /// Record a failed fetch, keeping the last good data.
  pub(crate) fn record_error(&mut self, message: String, now: DateTime<Utc>) {
    let failure_count = self.error.as_ref().map_or(0, |e| e.failure_count) + 1;
    self.status = EntryStatus::Error;
    self.error = Some(ErrorInfo {
      message,
      occurred_at: now,
      failure_count,
    });
  }

  /// Mark stale as of `now` without touching the data.
  pub(crate) fn mark_stale(&mut self, now: DateTime<Utc>) {
    let at = match self.data_updated_at {
      Some(updated) if updated > now => updated,
      _ => now,
    };
    if self.stale_at.map_or(true, |current| current > at) {
      self.stale_at = Some(at);
    }
  }
}

/// Notification delivered to subscribers of a key.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryEvent<T> {
  /// The entry transitioned; carries its new state.
  Updated(CacheEntry<T>),
  /// The entry was removed from the store.
  Removed(QueryKey),
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query_key;
  use chrono::TimeZone;

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
  }

  #[test]
  fn new_entry_is_idle_and_stale() {
    let entry: CacheEntry<u32> = CacheEntry::new(query_key!["a"], t0(), Duration::minutes(5));
    assert_eq!(entry.status, EntryStatus::Idle);
    assert!(entry.is_stale(t0()));
    assert!(!entry.has_data());
  }

  #[test]
  fn success_computes_stale_at() {
    let mut entry = CacheEntry::new(query_key!["a"], t0(), Duration::milliseconds(300_000));
    entry.record_success(1u32, t0());
    assert_eq!(entry.stale_at, Some(t0() + Duration::milliseconds(300_000)));
    assert!(!entry.is_stale(t0() + Duration::milliseconds(299_999)));
    assert!(entry.is_stale(t0() + Duration::milliseconds(300_000)));
  }

  #[test]
  fn error_keeps_data_and_counts_failures() {
    let mut entry = CacheEntry::new(query_key!["a"], t0(), Duration::minutes(5));
    entry.record_success(1u32, t0());
    entry.record_error("boom".into(), t0());
    entry.record_error("boom again".into(), t0());

    assert_eq!(entry.status, EntryStatus::Error);
    assert_eq!(entry.data, Some(1));
    let error = entry.error.as_ref().unwrap();
    assert_eq!(error.failure_count, 2);
    assert_eq!(error.message, "boom again");

    entry.record_success(2u32, t0());
    assert!(entry.error.is_none());
  }

  #[test]
  fn mark_stale_never_precedes_data() {
    let mut entry = CacheEntry::new(query_key!["a"], t0(), Duration::minutes(5));
    entry.record_success(1u32, t0());

    entry.mark_stale(t0() + Duration::seconds(10));
    assert_eq!(entry.stale_at, Some(t0() + Duration::seconds(10)));

    // A clock behind the data timestamp clamps to the data timestamp.
    entry.mark_stale(t0() - Duration::seconds(10));
    assert_eq!(entry.stale_at, Some(t0()));
  }
}
