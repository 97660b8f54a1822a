//! In-memory query cache.
//!
//! This module owns the cache table and everything that touches it directly:
//! - Entries keyed by [`QueryKey`](crate::QueryKey) with freshness tracking
//! - De-duplicated background fetches with retry and cancellation
//! - Stale-while-revalidate reads
//! - Per-key subscriptions and idle-entry garbage collection

mod entry;
mod store;
mod subscription;
mod traits;

pub use entry::{CacheEntry, EntryEvent, EntryStatus, ErrorInfo};
pub use store::{CacheStore, Listener, SetDataOptions, StorePolicy};
pub use subscription::Subscription;
pub use traits::{
  fetcher, keyed_fetcher, CacheData, FetchFuture, FetchOptions, Fetcher, RefetchMode,
  RefetchOutcome, RetryPolicy,
};
