//! Core traits and types for the caching system.

use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::key::QueryKey;

/// Values that can be held in the cache.
///
/// Data must be cloneable (snapshots are deep copies) and serializable (the
/// persistence layer writes it to durable storage). Blanket-implemented.
pub trait CacheData: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> CacheData for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A boxed future produced by a fetcher.
pub type FetchFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// The injected transport: given a key, asynchronously produce its data.
pub type Fetcher<T> = Arc<dyn Fn(&QueryKey) -> FetchFuture<T> + Send + Sync>;

/// Wrap a closure that ignores the key.
///
/// # Example
///
/// ```ignore
/// let api = api.clone();
/// let f = fetcher(move || {
///   let api = api.clone();
///   async move { api.position("42").await }
/// });
/// ```
pub fn fetcher<T, F, Fut>(f: F) -> Fetcher<T>
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T>> + Send + 'static,
{
  Arc::new(move |_key: &QueryKey| Box::pin(f()) as FetchFuture<T>)
}

/// Wrap a closure that resolves data from the key itself, for fetchers shared
/// by a whole key family.
pub fn keyed_fetcher<T, F, Fut>(f: F) -> Fetcher<T>
where
  F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T>> + Send + 'static,
{
  Arc::new(move |key: &QueryKey| Box::pin(f(key.clone())) as FetchFuture<T>)
}

/// How many times a failed fetch is retried, and how long to wait between
/// attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_retries: u32,
  /// Delay before the first retry; doubles each attempt.
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl RetryPolicy {
  /// Fail on the first error.
  pub fn none() -> Self {
    Self {
      max_retries: 0,
      base_delay: Duration::ZERO,
      max_delay: Duration::ZERO,
    }
  }

  pub fn new(max_retries: u32, base_delay: Duration) -> Self {
    Self {
      max_retries,
      base_delay,
      max_delay: Duration::from_secs(30),
    }
  }

  /// Backoff before retry number `attempt` (zero based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(16);
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::new(3, Duration::from_secs(1))
  }
}

/// Per-call options for [`CacheStore::ensure`](super::CacheStore::ensure).
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
  /// Overrides the store's stale policy for this key.
  pub stale_time: Option<chrono::Duration>,
  pub retry: RetryPolicy,
}

impl FetchOptions {
  pub fn with_stale_time(mut self, stale_time: chrono::Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }
}

/// What to do when a refetch is requested for a key that already has a
/// fetch in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefetchMode {
  /// Join the running fetch.
  #[default]
  Dedupe,
  /// Abandon the running fetch and start a new one.
  CancelInFlight,
}

/// Result of a refetch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchOutcome {
  Started,
  /// A fetch was already in flight.
  Deduplicated,
  /// Neither the entry nor any registered family has a fetcher.
  NoFetcher,
  Missing,
  /// An open mutation owns the key.
  Held,
  Closed,
}
