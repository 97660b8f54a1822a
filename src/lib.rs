//! Client-side query cache: keyed server data held in memory with staleness
//! tracking, request de-duplication, optimistic mutations with rollback,
//! rule-driven invalidation, durable snapshots and background refetching.
//!
//! ```ignore
//! let client: QueryClient = QueryClient::from_config(&Config::load(None)?)?;
//! let sync = client.start().await?;
//!
//! let positions = client
//!   .fetch(&query_key!["position", "list", ""], fetcher(|| api.positions()))
//!   .await?;
//!
//! client
//!   .mutate(
//!     Mutation::new(ChangeEvent::updated("position", 42))
//!       .optimistic(query_key!["position", "detail", 42], |_| updated.clone()),
//!     api.update_position(42, updated),
//!   )
//!   .await?;
//!
//! sync.set_online(false);
//! client.close().await?;
//! ```

pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod key;
mod lock;
pub mod logging;
pub mod mutation;
pub mod observer;
pub mod persist;
pub mod sync;

pub use cache::{
  fetcher, keyed_fetcher, CacheData, CacheEntry, CacheStore, EntryEvent, EntryStatus, FetchOptions,
  Fetcher, RefetchMode, RefetchOutcome, RetryPolicy, SetDataOptions, StorePolicy, Subscription,
};
pub use client::{QueryClient, QueryClientBuilder};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use error::CacheError;
pub use invalidation::{
  ChangeEvent, Dependency, InvalidationEngine, InvalidationPlan, InvalidationReport,
  InvalidationRules, MutationKind, ResourceRule,
};
pub use key::{filter_fingerprint, fingerprint, KeyFilter, QueryKey, Segment};
pub use mutation::{Mutation, MutationCoordinator, MutationId, MutationState, RollbackReport, Snapshot};
pub use observer::Observer;
pub use persist::{PersistConfig, PersistedSize, Persister, RestoreOutcome, RestoreReport};
pub use sync::{SyncConfig, SyncHandle, SyncScheduler, SyncSignal};
