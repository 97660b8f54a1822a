//! Client facade wiring the cache store, invalidation, mutations,
//! persistence and background sync behind one cloneable handle.

use color_eyre::Result;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{
  CacheData, CacheEntry, CacheStore, EntryEvent, FetchOptions, Fetcher, StorePolicy, Subscription,
};
use crate::clock::SharedClock;
use crate::config::{Backend, Config};
use crate::error::CacheError;
use crate::invalidation::{ChangeEvent, InvalidationEngine, InvalidationReport};
use crate::key::QueryKey;
use crate::lock::mutex_lock;
use crate::mutation::{Mutation, MutationCoordinator};
use crate::observer::Observer;
use crate::persist::{PersistedSize, Persister, RestoreOutcome, RestoreReport};
use crate::sync::{SyncConfig, SyncHandle, SyncScheduler};

const SOURCE: &str = "client";

#[derive(Default)]
struct Lifecycle {
  shutdown: Option<watch::Sender<bool>>,
  sync: Option<SyncHandle>,
  tasks: Vec<JoinHandle<()>>,
  closed: bool,
}

/// Query cache client with transparent persistence and background refetch.
///
/// Cloning is cheap; every clone shares the same store and lifecycle.
/// Nothing runs in the background until [`start`](Self::start), and
/// [`close`](Self::close) stops it again.
pub struct QueryClient<T: CacheData = Value> {
  store: CacheStore<T>,
  mutations: MutationCoordinator<T>,
  persister: Option<Arc<Persister>>,
  sync: SyncConfig,
  restore_on_start: bool,
  lifecycle: Arc<Mutex<Lifecycle>>,
}

impl<T: CacheData> Clone for QueryClient<T> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      mutations: self.mutations.clone(),
      persister: self.persister.clone(),
      sync: self.sync.clone(),
      restore_on_start: self.restore_on_start,
      lifecycle: Arc::clone(&self.lifecycle),
    }
  }
}

impl<T: CacheData> fmt::Debug for QueryClient<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryClient")
      .field("entries", &self.store.len())
      .field("persistent", &self.persister.is_some())
      .field("sync", &self.sync)
      .finish_non_exhaustive()
  }
}

impl<T: CacheData> Default for QueryClient<T> {
  fn default() -> Self {
    Self::builder().build()
  }
}

/// Builder for [`QueryClient`].
pub struct QueryClientBuilder<T: CacheData = Value> {
  policy: StorePolicy,
  clock: Option<SharedClock>,
  engine: InvalidationEngine,
  persister: Option<Persister>,
  sync: SyncConfig,
  restore_on_start: bool,
  _data: std::marker::PhantomData<fn() -> T>,
}

impl<T: CacheData> QueryClientBuilder<T> {
  pub fn policy(mut self, policy: StorePolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn clock(mut self, clock: SharedClock) -> Self {
    self.clock = Some(clock);
    self
  }

  pub fn invalidation(mut self, engine: InvalidationEngine) -> Self {
    self.engine = engine;
    self
  }

  pub fn persister(mut self, persister: Persister) -> Self {
    self.persister = Some(persister);
    self
  }

  pub fn sync(mut self, sync: SyncConfig) -> Self {
    self.sync = sync;
    self
  }

  /// Load the persisted snapshot in [`QueryClient::start`].
  pub fn restore_on_start(mut self, restore: bool) -> Self {
    self.restore_on_start = restore;
    self
  }

  pub fn build(self) -> QueryClient<T> {
    let store = match self.clock {
      Some(clock) => CacheStore::with_clock(self.policy, clock),
      None => CacheStore::new(self.policy),
    };
    QueryClient {
      mutations: MutationCoordinator::new(store.clone(), self.engine),
      store,
      persister: self.persister.map(Arc::new),
      sync: self.sync,
      restore_on_start: self.restore_on_start,
      lifecycle: Arc::new(Mutex::new(Lifecycle::default())),
    }
  }
}

impl<T: CacheData> QueryClient<T> {
  pub fn builder() -> QueryClientBuilder<T> {
    QueryClientBuilder {
      policy: StorePolicy::default(),
      clock: None,
      engine: InvalidationEngine::default(),
      persister: None,
      sync: SyncConfig::default(),
      restore_on_start: false,
      _data: std::marker::PhantomData,
    }
  }

  /// Create a client from loaded configuration, opening the durable store.
  pub fn from_config(config: &Config) -> Result<Self> {
    let mut builder = Self::builder()
      .policy(config.store_policy())
      .invalidation(config.invalidation_engine())
      .sync(config.sync_config())
      .restore_on_start(config.persistence.restore_on_start);
    if config.persistence.backend != Backend::None {
      let persister = Persister::new(config.open_storage()?, config.persist_config())
        .with_codec(config.persistence.codec.build());
      builder = builder.persister(persister);
    }
    Ok(builder.build())
  }

  pub fn store(&self) -> &CacheStore<T> {
    &self.store
  }

  pub fn mutations(&self) -> &MutationCoordinator<T> {
    &self.mutations
  }

  pub fn engine(&self) -> &InvalidationEngine {
    self.mutations.engine()
  }

  pub fn persister(&self) -> Option<&Arc<Persister>> {
    self.persister.as_ref()
  }

  // --------------------------------------------------------------------------
  // Reads
  // --------------------------------------------------------------------------

  pub fn get(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
    self.store.get(key)
  }

  /// Current entry right away; a background fetch starts if it is missing
  /// or stale.
  pub fn ensure(&self, key: &QueryKey, fetcher: Fetcher<T>) -> CacheEntry<T> {
    self.store.ensure(key, fetcher, FetchOptions::default())
  }

  pub async fn fetch(&self, key: &QueryKey, fetcher: Fetcher<T>) -> Result<T, CacheError> {
    self.store.fetch(key, fetcher, FetchOptions::default()).await
  }

  /// Fetcher used for every key under `prefix` when a refetch has no
  /// fetcher of its own.
  pub fn register_family(&self, prefix: QueryKey, fetcher: Fetcher<T>) {
    self.store.register_family(prefix, fetcher);
  }

  pub fn subscribe<F>(&self, key: &QueryKey, listener: F) -> Subscription<T>
  where
    F: Fn(&EntryEvent<T>) + Send + Sync + 'static,
  {
    self.store.subscribe(key, listener)
  }

  pub fn observe(&self, key: QueryKey, fetcher: Fetcher<T>) -> Observer<T> {
    self.observe_with(key, fetcher, FetchOptions::default())
  }

  pub fn observe_with(&self, key: QueryKey, fetcher: Fetcher<T>, options: FetchOptions) -> Observer<T> {
    Observer::new(self.store.clone(), key, fetcher, options)
  }

  // --------------------------------------------------------------------------
  // Writes
  // --------------------------------------------------------------------------

  /// Run an optimistic mutation; see [`MutationCoordinator::run`].
  pub async fn mutate<R, Fut>(&self, mutation: Mutation<T, R>, write: Fut) -> Result<R, CacheError>
  where
    Fut: Future<Output = Result<R>>,
  {
    self.mutations.run(mutation, write).await
  }

  /// Invalidate for a change made outside [`mutate`](Self::mutate), e.g.
  /// one pushed by the server.
  pub fn on_change(&self, event: &ChangeEvent) -> InvalidationReport {
    self.engine().on_change(&self.store, event)
  }

  pub fn invalidate_all(&self) -> InvalidationReport {
    self.engine().invalidate(&self.store, |_| true)
  }

  pub fn invalidate_prefix(&self, prefix: &QueryKey) -> InvalidationReport {
    self.engine().invalidate_prefix(&self.store, prefix)
  }

  // --------------------------------------------------------------------------
  // Persistence
  // --------------------------------------------------------------------------

  /// Write the snapshot now. `None` when nothing was written.
  pub async fn persist(&self) -> Result<Option<PersistedSize>> {
    match &self.persister {
      Some(persister) => persister.persist(&self.store).await,
      None => Ok(None),
    }
  }

  pub async fn restore(&self) -> Result<RestoreReport> {
    match &self.persister {
      Some(persister) => persister.restore(&self.store).await,
      None => Ok(RestoreReport {
        restored: 0,
        skipped: 0,
        outcome: RestoreOutcome::Empty,
      }),
    }
  }

  pub async fn persisted_size(&self) -> Result<PersistedSize> {
    match &self.persister {
      Some(persister) => persister.persisted_size().await,
      None => Ok(PersistedSize::default()),
    }
  }

  pub async fn clear_persisted(&self) -> Result<()> {
    match &self.persister {
      Some(persister) => persister.clear().await,
      None => Ok(()),
    }
  }

  // --------------------------------------------------------------------------
  // Lifecycle
  // --------------------------------------------------------------------------

  /// Start background work: optional restore, then the sync scheduler and
  /// autosave. Calling it again returns the running scheduler's handle.
  pub async fn start(&self) -> Result<SyncHandle, CacheError> {
    {
      let lifecycle = mutex_lock(&self.lifecycle, SOURCE, "start");
      if lifecycle.closed {
        return Err(CacheError::Closed);
      }
      if let Some(handle) = &lifecycle.sync {
        return Ok(handle.clone());
      }
    }

    if self.restore_on_start {
      match self.restore().await {
        Ok(report) => debug!(restored = report.restored, outcome = ?report.outcome, "startup restore"),
        Err(e) => warn!(error = %e, "startup restore failed"),
      }
    }

    let mut lifecycle = mutex_lock(&self.lifecycle, SOURCE, "start");
    if lifecycle.closed {
      return Err(CacheError::Closed);
    }
    // A concurrent start may have won while restoring.
    if let Some(handle) = &lifecycle.sync {
      return Ok(handle.clone());
    }

    let (shutdown, signal) = watch::channel(false);
    let scheduler = SyncScheduler::new(self.store.clone(), self.sync.clone());
    let (handle, task) = scheduler.spawn(signal.clone());
    lifecycle.tasks.push(task);
    if let Some(persister) = &self.persister {
      lifecycle
        .tasks
        .push(Arc::clone(persister).spawn_autosave(self.store.clone(), signal));
    }
    lifecycle.shutdown = Some(shutdown);
    lifecycle.sync = Some(handle.clone());
    info!(tasks = lifecycle.tasks.len(), "query client started");
    Ok(handle)
  }

  pub fn is_closed(&self) -> bool {
    mutex_lock(&self.lifecycle, SOURCE, "is_closed").closed
  }

  /// Stop background work, abort fetches in flight and flush one final
  /// snapshot. Later calls do nothing.
  pub async fn close(&self) -> Result<()> {
    let (shutdown, tasks) = {
      let mut lifecycle = mutex_lock(&self.lifecycle, SOURCE, "close");
      if lifecycle.closed {
        return Ok(());
      }
      lifecycle.closed = true;
      lifecycle.sync = None;
      (lifecycle.shutdown.take(), std::mem::take(&mut lifecycle.tasks))
    };

    if let Some(shutdown) = shutdown {
      let _ = shutdown.send(true);
    }
    self.store.close();
    for task in tasks {
      if let Err(e) = task.await {
        warn!(error = %e, "background task ended abnormally");
      }
    }

    let flushed = self.persist().await?;
    info!(flushed = flushed.map_or(0, |size| size.entry_count), "query client closed");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{fetcher, EntryStatus, SetDataOptions};
  use crate::persist::{MemoryStorage, PersistConfig};
  use crate::query_key;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn persistent_client(storage: &Arc<MemoryStorage>) -> QueryClient {
    QueryClient::builder()
      .persister(Persister::new(storage.clone(), PersistConfig::default()))
      .restore_on_start(true)
      .build()
  }

  #[tokio::test]
  async fn test_fetch_through_client() {
    let client: QueryClient = QueryClient::default();
    let key = query_key!["position", "list", ""];
    let data = client
      .fetch(&key, fetcher(|| async { Ok(json!([{"id": 1}])) }))
      .await
      .unwrap();
    assert_eq!(data, json!([{"id": 1}]));
    assert_eq!(client.get(&key).unwrap().status, EntryStatus::Success);
  }

  #[tokio::test]
  async fn test_mutate_invalidates_dependents() {
    let client: QueryClient = QueryClient::default();
    let stats = query_key!["statistics", "overview"];
    let list = query_key!["interview", "list", ""];
    client.store().set_data(&stats, json!({"total": 3}), SetDataOptions::default());
    client.store().set_data(&list, json!([]), SetDataOptions::default());

    let event = ChangeEvent::created("interview").with_parent("position", 7);
    let mutation = Mutation::new(event).optimistic(list.clone(), |_| json!([{"id": "tmp"}]));
    let id = client.mutate(mutation, async { Ok(12) }).await.unwrap();

    assert_eq!(id, 12);
    let now = client.store().now();
    assert!(client.get(&stats).unwrap().is_stale(now));
    assert!(client.get(&list).unwrap().is_stale(now));
    assert_eq!(client.get(&list).unwrap().data, Some(json!([{"id": "tmp"}])));
  }

  #[tokio::test]
  async fn test_admin_surface_without_persistence() {
    let client: QueryClient = QueryClient::default();
    client.store().set_data(&query_key!["position", "detail", 1], json!(1), SetDataOptions::default());
    client.store().set_data(&query_key!["auth", "me"], json!(2), SetDataOptions::default());

    assert_eq!(client.invalidate_prefix(&query_key!["position"]).staled.len(), 1);
    assert_eq!(client.invalidate_all().staled.len(), 2);
    assert_eq!(client.persisted_size().await.unwrap(), PersistedSize::default());
    assert_eq!(client.persist().await.unwrap(), None);
    assert_eq!(client.restore().await.unwrap().outcome, RestoreOutcome::Empty);
    client.clear_persisted().await.unwrap();
  }

  #[tokio::test]
  async fn test_close_flushes_and_restart_restores() {
    let storage = Arc::new(MemoryStorage::new());
    let key = query_key!["position", "list", ""];

    let client = persistent_client(&storage);
    client.start().await.unwrap();
    client.store().set_data(&key, json!(["a"]), SetDataOptions::default());
    client.close().await.unwrap();
    assert!(client.is_closed());
    assert_eq!(client.persisted_size().await.unwrap().entry_count, 1);

    let reopened = persistent_client(&storage);
    reopened.start().await.unwrap();
    assert_eq!(reopened.get(&key).unwrap().data, Some(json!(["a"])));
    reopened.close().await.unwrap();
  }

  #[tokio::test]
  async fn test_start_twice_shares_scheduler() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let client: QueryClient = QueryClient::default();
    let key = query_key!["position", "list", ""];
    let _sub = client.subscribe(&key, |_| {});
    client.store().set_data(&key, json!([]), SetDataOptions::default());
    client.register_family(
      query_key!["position"],
      fetcher(move || {
        let counter = counter.clone();
        async move {
          counter.fetch_add(1, Ordering::SeqCst);
          Ok(json!(["fresh"]))
        }
      }),
    );

    let first = client.start().await.unwrap();
    let second = client.start().await.unwrap();
    assert!(first.set_online(false));
    assert!(second.set_online(true));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.get(&key).unwrap().data, Some(json!(["fresh"])));

    client.close().await.unwrap();
    assert!(!first.set_online(true));
    assert_eq!(client.start().await.unwrap_err(), CacheError::Closed);
  }
}
