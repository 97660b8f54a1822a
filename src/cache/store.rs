//! In-memory store that owns every cache entry and drives fetching.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::error::CacheError;
use crate::key::{KeyFilter, QueryKey};
use crate::lock::mutex_lock;

use super::entry::{CacheEntry, EntryEvent, EntryStatus};
use super::subscription::Subscription;
use super::traits::{
  CacheData, FetchOptions, Fetcher, RefetchMode, RefetchOutcome, RetryPolicy,
};

const SOURCE: &str = "cache::store";

/// Callback invoked on every transition of a subscribed key.
pub type Listener<T> = Arc<dyn Fn(&EntryEvent<T>) + Send + Sync>;

/// Outcome of one fetch, shared by every caller waiting on it.
pub(crate) type SharedResult<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;

type Notice<T> = (Vec<Listener<T>>, EntryEvent<T>);

/// Staleness and eviction timings.
#[derive(Debug, Clone)]
pub struct StorePolicy {
  /// Used when neither the call nor a family rule gives a stale time
  pub default_stale_time: Duration,
  /// How long an unsubscribed entry survives before GC may evict it
  pub gc_time: Duration,
  /// Per key family stale times; the longest matching prefix wins
  pub family_stale_times: Vec<(QueryKey, Duration)>,
}

impl Default for StorePolicy {
  fn default() -> Self {
    Self {
      default_stale_time: Duration::minutes(5),
      gc_time: Duration::minutes(5),
      family_stale_times: Vec::new(),
    }
  }
}

impl StorePolicy {
  pub fn with_default_stale_time(mut self, stale_time: Duration) -> Self {
    self.default_stale_time = stale_time;
    self
  }

  pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
    self.gc_time = gc_time;
    self
  }

  /// Give every key under `prefix` its own stale time (e.g. aggregate
  /// statistics that change slowly).
  pub fn with_family_stale_time(mut self, prefix: QueryKey, stale_time: Duration) -> Self {
    self.family_stale_times.retain(|(p, _)| p != &prefix);
    self.family_stale_times.push((prefix, stale_time));
    self
  }

  pub fn stale_time_for(&self, key: &QueryKey) -> Duration {
    self
      .family_stale_times
      .iter()
      .filter(|(prefix, _)| key.starts_with(prefix))
      .max_by_key(|(prefix, _)| prefix.len())
      .map(|(_, stale_time)| *stale_time)
      .unwrap_or(self.default_stale_time)
  }
}

/// Options for [`CacheStore::set_data`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetDataOptions {
  /// When the data was produced; defaults to now.
  pub updated_at: Option<DateTime<Utc>>,
  pub stale_time: Option<Duration>,
}

struct InFlight<T> {
  generation: u64,
  result: SharedResult<T>,
  abort: AbortHandle,
  /// Status to go back to if this fetch is cancelled
  status_before: EntryStatus,
}

struct Slot<T> {
  entry: CacheEntry<T>,
  fetcher: Option<Fetcher<T>>,
  retry: RetryPolicy,
  in_flight: Option<InFlight<T>>,
  idle_since: Option<DateTime<Utc>>,
  invalidated: bool,
}

impl<T> Slot<T> {
  fn new(key: QueryKey, now: DateTime<Utc>, stale_time: Duration, subscribers: usize) -> Self {
    let mut entry = CacheEntry::new(key, now, stale_time);
    entry.subscriber_count = subscribers;
    Self {
      entry,
      fetcher: None,
      retry: RetryPolicy::default(),
      in_flight: None,
      idle_since: if subscribers == 0 { Some(now) } else { None },
      invalidated: false,
    }
  }

  fn apply_stale_time(&mut self, stale_time: Duration) {
    if self.entry.stale_time == stale_time {
      return;
    }
    self.entry.stale_time = stale_time;
    if !self.invalidated {
      if let Some(updated_at) = self.entry.data_updated_at {
        self.entry.stale_at = Some(updated_at + stale_time);
      }
    }
  }
}

struct StoreState<T> {
  slots: HashMap<QueryKey, Slot<T>>,
  listeners: HashMap<QueryKey, Vec<(u64, Listener<T>)>>,
  families: Vec<(QueryKey, Fetcher<T>)>,
  /// Keys owned by open mutations, with the number of owners. No fetch
  /// starts for a held key.
  held: HashMap<QueryKey, usize>,
  next_listener_id: u64,
  next_generation: u64,
  closed: bool,
}

impl<T: CacheData> StoreState<T> {
  fn listener_count(&self, key: &QueryKey) -> usize {
    self.listeners.get(key).map_or(0, Vec::len)
  }

  fn slot_or_insert(
    &mut self,
    key: &QueryKey,
    now: DateTime<Utc>,
    policy: &StorePolicy,
  ) -> &mut Slot<T> {
    let subscribers = self.listener_count(key);
    self
      .slots
      .entry(key.clone())
      .or_insert_with(|| Slot::new(key.clone(), now, policy.stale_time_for(key), subscribers))
  }

  fn family_fetcher(&self, key: &QueryKey) -> Option<Fetcher<T>> {
    self
      .families
      .iter()
      .filter(|(prefix, _)| key.starts_with(prefix))
      .max_by_key(|(prefix, _)| prefix.len())
      .map(|(_, fetcher)| Arc::clone(fetcher))
  }

  fn listeners_of(&self, key: &QueryKey) -> Option<Vec<Listener<T>>> {
    let listeners = self.listeners.get(key)?;
    if listeners.is_empty() {
      return None;
    }
    Some(listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
  }

  fn updated(&self, key: &QueryKey) -> Option<Notice<T>> {
    let listeners = self.listeners_of(key)?;
    let slot = self.slots.get(key)?;
    Some((listeners, EntryEvent::Updated(slot.entry.clone())))
  }

  fn removed(&self, key: &QueryKey) -> Option<Notice<T>> {
    let listeners = self.listeners_of(key)?;
    Some((listeners, EntryEvent::Removed(key.clone())))
  }
}

struct Inner<T> {
  state: Mutex<StoreState<T>>,
  clock: SharedClock,
  policy: StorePolicy,
  /// Bumped on every data change.
  changes: watch::Sender<u64>,
}

/// The in-memory cache table.
///
/// Cheap to clone; clones share the same entries. Every operation is a short
/// critical section that never spans an `.await`, and subscriber callbacks
/// run after the lock is released.
///
/// Methods that may start a fetch spawn a Tokio task and must be called from
/// within a Tokio runtime; outside one, no fetch is started.
pub struct CacheStore<T: CacheData> {
  inner: Arc<Inner<T>>,
}

impl<T: CacheData> Clone for CacheStore<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: CacheData> fmt::Debug for CacheStore<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheStore")
      .field("entries", &self.len())
      .field("policy", &self.inner.policy)
      .finish_non_exhaustive()
  }
}

impl<T: CacheData> CacheStore<T> {
  pub fn new(policy: StorePolicy) -> Self {
    Self::with_clock(policy, Arc::new(SystemClock))
  }

  pub fn with_clock(policy: StorePolicy, clock: SharedClock) -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(StoreState {
          slots: HashMap::new(),
          listeners: HashMap::new(),
          families: Vec::new(),
          held: HashMap::new(),
          next_listener_id: 0,
          next_generation: 0,
          closed: false,
        }),
        clock,
        policy,
        changes: watch::channel(0).0,
      }),
    }
  }

  pub fn clock(&self) -> &SharedClock {
    &self.inner.clock
  }

  pub fn policy(&self) -> &StorePolicy {
    &self.inner.policy
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.inner.clock.now()
  }

  fn lock(&self, op: &'static str) -> MutexGuard<'_, StoreState<T>> {
    mutex_lock(&self.inner.state, SOURCE, op)
  }

  fn dispatch(notices: impl IntoIterator<Item = Notice<T>>) {
    for (listeners, event) in notices {
      for listener in listeners {
        listener(&event);
      }
    }
  }

  fn touch(&self) {
    self.inner.changes.send_modify(|version| *version = version.wrapping_add(1));
  }

  /// A receiver that sees every later data change (set, fetched, removed).
  /// Each receiver tracks what it has seen, so any number of consumers can
  /// wait independently.
  pub fn changes(&self) -> watch::Receiver<u64> {
    self.inner.changes.subscribe()
  }

  // --------------------------------------------------------------------------
  // Reads
  // --------------------------------------------------------------------------

  pub fn get(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
    self.lock("get").slots.get(key).map(|slot| slot.entry.clone())
  }

  pub fn contains(&self, key: &QueryKey) -> bool {
    self.lock("contains").slots.contains_key(key)
  }

  /// All keys, sorted.
  pub fn keys(&self) -> Vec<QueryKey> {
    let mut keys: Vec<QueryKey> = self.lock("keys").slots.keys().cloned().collect();
    keys.sort();
    keys
  }

  /// Clones of all entries, sorted by key.
  pub fn entries(&self) -> Vec<CacheEntry<T>> {
    let mut entries: Vec<CacheEntry<T>> = self
      .lock("entries")
      .slots
      .values()
      .map(|slot| slot.entry.clone())
      .collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    entries
  }

  pub fn len(&self) -> usize {
    self.lock("len").slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_closed(&self) -> bool {
    self.lock("is_closed").closed
  }

  // --------------------------------------------------------------------------
  // Fetching
  // --------------------------------------------------------------------------

  /// Register the fetcher used for every key under `prefix` that has no
  /// fetcher of its own. The longest matching prefix wins.
  pub fn register_family(&self, prefix: QueryKey, fetcher: Fetcher<T>) {
    let mut state = self.lock("register_family");
    state.families.retain(|(p, _)| p != &prefix);
    state.families.push((prefix, fetcher));
  }

  /// Return the current entry immediately, starting a background fetch if it
  /// is missing or stale.
  ///
  /// A key that already has a fetch in flight never gets a second one. The
  /// returned entry may be `Pending` and still carry the previous data.
  pub fn ensure(&self, key: &QueryKey, fetcher: Fetcher<T>, options: FetchOptions) -> CacheEntry<T> {
    self.ensure_inner(key, fetcher, options).0
  }

  /// Like [`ensure`](Self::ensure), then wait for the data.
  ///
  /// Fresh data is returned without fetching. If the awaited fetch gets
  /// superseded by a newer one, the newer one is awaited instead.
  pub async fn fetch(
    &self,
    key: &QueryKey,
    fetcher: Fetcher<T>,
    options: FetchOptions,
  ) -> Result<T, CacheError> {
    let (entry, pending) = self.ensure_inner(key, fetcher, options);
    match pending {
      Some(result) => self.follow(key, result).await,
      None => Self::settled(entry, self.is_closed()),
    }
  }

  /// Wait for the fetch currently in flight for `key`, if any.
  pub async fn wait(&self, key: &QueryKey) -> Option<Result<T, CacheError>> {
    let pending = self.in_flight(key)?;
    Some(self.follow(key, pending).await)
  }

  async fn follow(&self, key: &QueryKey, mut pending: SharedResult<T>) -> Result<T, CacheError> {
    loop {
      match pending.await {
        Err(CacheError::Cancelled { key: cancelled }) => match self.in_flight(key) {
          Some(next) => pending = next,
          None => return Err(CacheError::Cancelled { key: cancelled }),
        },
        outcome => return outcome,
      }
    }
  }

  fn settled(entry: CacheEntry<T>, closed: bool) -> Result<T, CacheError> {
    if let Some(data) = entry.data {
      return Ok(data);
    }
    if let Some(error) = entry.error {
      return Err(CacheError::Fetch {
        key: entry.key,
        message: error.message,
      });
    }
    if closed {
      Err(CacheError::Closed)
    } else {
      Err(CacheError::Cancelled { key: entry.key })
    }
  }

  pub(crate) fn in_flight(&self, key: &QueryKey) -> Option<SharedResult<T>> {
    let state = self.lock("in_flight");
    let flight = state.slots.get(key)?.in_flight.as_ref()?;
    Some(flight.result.clone())
  }

  fn ensure_inner(
    &self,
    key: &QueryKey,
    fetcher: Fetcher<T>,
    options: FetchOptions,
  ) -> (CacheEntry<T>, Option<SharedResult<T>>) {
    let (entry, pending, notice) = {
      let mut state = self.lock("ensure");
      let now = self.now();
      let closed = state.closed;
      let held = state.held.contains_key(key);

      let slot = state.slot_or_insert(key, now, &self.inner.policy);
      slot.fetcher = Some(Arc::clone(&fetcher));
      slot.retry = options.retry;
      if let Some(stale_time) = options.stale_time {
        slot.apply_stale_time(stale_time);
      }
      let needs_fetch = !closed && !held && slot.in_flight.is_none() && slot.entry.is_stale(now);

      let notice = if needs_fetch {
        self.start_fetch(&mut state, key, fetcher)
      } else {
        None
      };

      let slot = state.slot_or_insert(key, now, &self.inner.policy);
      let pending = slot.in_flight.as_ref().map(|f| f.result.clone());
      (slot.entry.clone(), pending, notice)
    };
    Self::dispatch(notice);
    (entry, pending)
  }

  /// Ask for a new fetch of an existing entry, using its own fetcher or the
  /// family fetcher registered for it.
  pub fn refetch(&self, key: &QueryKey, mode: RefetchMode) -> RefetchOutcome {
    let (outcome, notice) = {
      let mut state = self.lock("refetch");
      self.refetch_locked(&mut state, key, mode)
    };
    Self::dispatch(notice);
    outcome
  }

  /// Refetch every entry accepted by `predicate`, joining fetches already in
  /// flight. Returns the keys for which a new fetch was started.
  pub fn refetch_matching<P>(&self, predicate: P) -> Vec<QueryKey>
  where
    P: Fn(&CacheEntry<T>, DateTime<Utc>) -> bool,
  {
    let mut started = Vec::new();
    let mut notices = Vec::new();
    {
      let mut state = self.lock("refetch_matching");
      let now = self.now();
      let mut keys: Vec<QueryKey> = state
        .slots
        .values()
        .filter(|slot| predicate(&slot.entry, now))
        .map(|slot| slot.entry.key.clone())
        .collect();
      keys.sort();

      for key in keys {
        let (outcome, notice) = self.refetch_locked(&mut state, &key, RefetchMode::Dedupe);
        if outcome == RefetchOutcome::Started {
          started.push(key);
        }
        notices.extend(notice);
      }
    }
    Self::dispatch(notices);
    started
  }

  fn refetch_locked(
    &self,
    state: &mut StoreState<T>,
    key: &QueryKey,
    mode: RefetchMode,
  ) -> (RefetchOutcome, Option<Notice<T>>) {
    if state.closed {
      return (RefetchOutcome::Closed, None);
    }
    if state.held.contains_key(key) {
      debug!(key = %key, "refetch skipped: held by a mutation");
      return (RefetchOutcome::Held, None);
    }
    let family = state.family_fetcher(key);
    let Some(slot) = state.slots.get(key) else {
      return (RefetchOutcome::Missing, None);
    };
    if slot.in_flight.is_some() && mode == RefetchMode::Dedupe {
      return (RefetchOutcome::Deduplicated, None);
    }
    let Some(fetcher) = slot.fetcher.clone().or(family) else {
      debug!(key = %key, "refetch skipped: no fetcher");
      return (RefetchOutcome::NoFetcher, None);
    };
    let notice = self.start_fetch(state, key, fetcher);
    (RefetchOutcome::Started, notice)
  }

  /// Spawn the fetch task for an existing slot. Any fetch already in flight
  /// for the key is aborted and superseded.
  fn start_fetch(
    &self,
    state: &mut StoreState<T>,
    key: &QueryKey,
    fetcher: Fetcher<T>,
  ) -> Option<Notice<T>> {
    let Ok(runtime) = Handle::try_current() else {
      warn!(key = %key, "fetch not started: no Tokio runtime");
      return None;
    };

    state.next_generation += 1;
    let generation = state.next_generation;
    let slot = state.slots.get_mut(key)?;

    let mut status_before = slot.entry.status;
    if let Some(previous) = slot.in_flight.take() {
      previous.abort.abort();
      status_before = previous.status_before;
      debug!(key = %key, superseded = previous.generation, generation, "fetch superseded");
    }

    let (tx, rx) = oneshot::channel();
    let store = self.clone();
    let task_key = key.clone();
    let retry = slot.retry;
    let task = runtime.spawn(async move {
      let outcome = run_with_retry(&task_key, fetcher, retry).await;
      let result = store.complete_fetch(&task_key, generation, outcome);
      let _ = tx.send(result);
    });

    let cancelled_key = key.clone();
    let result = rx
      .map(move |received| {
        received.unwrap_or_else(|_| Err(CacheError::Cancelled { key: cancelled_key }))
      })
      .boxed()
      .shared();

    slot.in_flight = Some(InFlight {
      generation,
      result,
      abort: task.abort_handle(),
      status_before,
    });
    slot.entry.status = EntryStatus::Pending;
    debug!(key = %key, generation, "fetch started");

    state.updated(key)
  }

  /// Apply a finished fetch, unless it was abandoned in the meantime.
  fn complete_fetch(
    &self,
    key: &QueryKey,
    generation: u64,
    outcome: color_eyre::Result<T>,
  ) -> Result<T, CacheError> {
    let (result, notice) = {
      let mut state = self.lock("complete_fetch");
      let now = self.now();

      let Some(slot) = state.slots.get_mut(key) else {
        debug!(key = %key, generation, "fetch result dropped: entry removed");
        return Err(CacheError::Cancelled { key: key.clone() });
      };
      if slot.in_flight.as_ref().map(|f| f.generation) != Some(generation) {
        debug!(key = %key, generation, "fetch result dropped: superseded");
        return Err(CacheError::Cancelled { key: key.clone() });
      }
      slot.in_flight = None;

      let result = match outcome {
        Ok(data) => {
          slot.entry.record_success(data.clone(), now);
          slot.invalidated = false;
          debug!(key = %key, generation, "fetch succeeded");
          Ok(data)
        }
        Err(report) => {
          let message = format!("{:#}", report);
          slot.entry.record_error(message.clone(), now);
          warn!(key = %key, generation, error = %message, "fetch failed");
          Err(CacheError::Fetch {
            key: key.clone(),
            message,
          })
        }
      };
      (result, state.updated(key))
    };

    if result.is_ok() {
      self.touch();
    }
    Self::dispatch(notice);
    result
  }

  /// Abandon the fetch in flight for `key`, restoring the status the entry
  /// had before it started. Returns false if nothing was in flight.
  pub fn cancel(&self, key: &QueryKey) -> bool {
    let notice = {
      let mut state = self.lock("cancel");
      let Some(slot) = state.slots.get_mut(key) else {
        return false;
      };
      let Some(flight) = slot.in_flight.take() else {
        return false;
      };
      flight.abort.abort();
      slot.entry.status = flight.status_before;
      debug!(key = %key, generation = flight.generation, "fetch cancelled");
      state.updated(key)
    };
    Self::dispatch(notice);
    true
  }

  // --------------------------------------------------------------------------
  // Writes
  // --------------------------------------------------------------------------

  /// Write data directly, e.g. from a mutation response.
  ///
  /// `stale_at` becomes `updated_at + stale_time`.
  pub fn set_data(&self, key: &QueryKey, data: T, options: SetDataOptions) -> CacheEntry<T> {
    let (entry, notice) = {
      let mut state = self.lock("set_data");
      let now = self.now();
      Self::write_data(&mut state, &self.inner.policy, key, data, options, now);
      let entry = state.slot_or_insert(key, now, &self.inner.policy).entry.clone();
      (entry, state.updated(key))
    };
    self.touch();
    Self::dispatch(notice);
    entry
  }

  /// [`set_data`](Self::set_data) that leaves an entry alone when it already
  /// holds data at least as recent as `updated_at`. Returns whether it wrote.
  pub fn set_data_if_newer(
    &self,
    key: &QueryKey,
    data: T,
    updated_at: DateTime<Utc>,
    stale_time: Option<Duration>,
  ) -> bool {
    let notice = {
      let mut state = self.lock("set_data_if_newer");
      let now = self.now();
      let current = state
        .slots
        .get(key)
        .filter(|slot| slot.entry.has_data())
        .and_then(|slot| slot.entry.data_updated_at);
      if current.is_some_and(|current| current >= updated_at) {
        return false;
      }
      let options = SetDataOptions {
        updated_at: Some(updated_at),
        stale_time,
      };
      Self::write_data(&mut state, &self.inner.policy, key, data, options, now);
      state.updated(key)
    };
    self.touch();
    Self::dispatch(notice);
    true
  }

  fn write_data(
    state: &mut StoreState<T>,
    policy: &StorePolicy,
    key: &QueryKey,
    data: T,
    options: SetDataOptions,
    now: DateTime<Utc>,
  ) {
    let slot = state.slot_or_insert(key, now, policy);
    if let Some(stale_time) = options.stale_time {
      slot.entry.stale_time = stale_time;
    }
    slot.entry.record_success(data, options.updated_at.unwrap_or(now));
    slot.invalidated = false;
    // A fetch still in flight keeps the entry pending; cancelling it should
    // land on the data just written.
    if let Some(flight) = slot.in_flight.as_mut() {
      flight.status_before = EntryStatus::Success;
      slot.entry.status = EntryStatus::Pending;
    }
  }

  /// Mark the entry as failed, keeping its last good data for display.
  pub fn set_error(&self, key: &QueryKey, message: impl Into<String>) -> CacheEntry<T> {
    let (entry, notice) = {
      let mut state = self.lock("set_error");
      let now = self.now();
      let slot = state.slot_or_insert(key, now, &self.inner.policy);
      slot.entry.record_error(message.into(), now);
      let entry = slot.entry.clone();
      (entry, state.updated(key))
    };
    Self::dispatch(notice);
    entry
  }

  /// Delete matching entries outright, abandoning their fetches.
  pub fn remove(&self, filter: &KeyFilter) -> Vec<QueryKey> {
    let mut notices = Vec::new();
    let removed = {
      let mut state = self.lock("remove");
      let mut keys: Vec<QueryKey> = state
        .slots
        .keys()
        .filter(|key| filter.matches(key))
        .cloned()
        .collect();
      keys.sort();

      for key in &keys {
        if let Some(slot) = state.slots.remove(key) {
          if let Some(flight) = slot.in_flight {
            flight.abort.abort();
          }
        }
        notices.extend(state.removed(key));
      }
      keys
    };

    if !removed.is_empty() {
      debug!(count = removed.len(), filter = ?filter, "entries removed");
      self.touch();
    }
    Self::dispatch(notices);
    removed
  }

  // --------------------------------------------------------------------------
  // Invalidation primitives
  // --------------------------------------------------------------------------

  /// Mark every entry whose key satisfies `predicate` stale as of now. Data
  /// is kept, so readers keep seeing it while the next fetch runs.
  pub fn invalidate<P>(&self, predicate: P) -> Vec<QueryKey>
  where
    P: Fn(&QueryKey) -> bool,
  {
    let mut notices = Vec::new();
    let staled = {
      let mut state = self.lock("invalidate");
      let now = self.now();
      let mut keys: Vec<QueryKey> = state
        .slots
        .keys()
        .filter(|key| predicate(key))
        .cloned()
        .collect();
      keys.sort();

      for key in &keys {
        if let Some(slot) = state.slots.get_mut(key) {
          slot.entry.mark_stale(now);
          slot.invalidated = true;
        }
        notices.extend(state.updated(key));
      }
      keys
    };
    if !staled.is_empty() {
      self.touch();
    }
    Self::dispatch(notices);
    staled
  }

  /// Bring the entry's stale deadline forward to `at`, as an invalidation
  /// at that time would have.
  pub(crate) fn mark_stale_at(&self, key: &QueryKey, at: DateTime<Utc>) {
    let notice = {
      let mut state = self.lock("mark_stale_at");
      let Some(slot) = state.slots.get_mut(key) else {
        return;
      };
      slot.entry.mark_stale(at);
      slot.invalidated = true;
      state.updated(key)
    };
    Self::dispatch(notice);
  }

  pub fn invalidate_prefix(&self, prefix: &QueryKey) -> Vec<QueryKey> {
    self.invalidate(|key| key.starts_with(prefix))
  }

  pub fn invalidate_all(&self) -> Vec<QueryKey> {
    self.invalidate(|_| true)
  }

  // --------------------------------------------------------------------------
  // Subscriptions
  // --------------------------------------------------------------------------

  /// Observe every transition of `key`. Subscribing to an absent key creates
  /// an idle entry for it.
  pub fn subscribe<F>(&self, key: &QueryKey, listener: F) -> Subscription<T>
  where
    F: Fn(&EntryEvent<T>) + Send + Sync + 'static,
  {
    let id = {
      let mut state = self.lock("subscribe");
      let now = self.now();
      let id = state.next_listener_id;
      state.next_listener_id += 1;
      state
        .listeners
        .entry(key.clone())
        .or_default()
        .push((id, Arc::new(listener)));

      let subscribers = state.listener_count(key);
      let slot = state.slot_or_insert(key, now, &self.inner.policy);
      slot.entry.subscriber_count = subscribers;
      slot.idle_since = None;
      id
    };
    Subscription::new(self.clone(), key.clone(), id)
  }

  pub(crate) fn unsubscribe(&self, key: &QueryKey, id: u64) {
    let mut state = self.lock("unsubscribe");
    let now = self.now();
    if let Some(listeners) = state.listeners.get_mut(key) {
      listeners.retain(|(listener_id, _)| *listener_id != id);
      if listeners.is_empty() {
        state.listeners.remove(key);
      }
    }
    let subscribers = state.listener_count(key);
    if let Some(slot) = state.slots.get_mut(key) {
      slot.entry.subscriber_count = subscribers;
      if subscribers == 0 {
        slot.idle_since = Some(now);
      }
    }
  }

  /// Evict entries nobody has subscribed to for longer than the GC window.
  /// Entries with a fetch in flight are never evicted.
  pub fn collect_garbage(&self) -> Vec<QueryKey> {
    let evicted = {
      let mut state = self.lock("collect_garbage");
      let now = self.now();
      let gc_time = self.inner.policy.gc_time;
      let mut keys: Vec<QueryKey> = state
        .slots
        .values()
        .filter(|slot| {
          slot.entry.subscriber_count == 0
            && slot.in_flight.is_none()
            && slot.idle_since.is_some_and(|since| now - since >= gc_time)
        })
        .map(|slot| slot.entry.key.clone())
        .collect();
      keys.sort();
      for key in &keys {
        state.slots.remove(key);
      }
      keys
    };

    if !evicted.is_empty() {
      debug!(count = evicted.len(), "garbage collected idle entries");
      self.touch();
    }
    evicted
  }

  // --------------------------------------------------------------------------
  // Optimistic updates
  // --------------------------------------------------------------------------

  /// Take one hold on each key, abandoning fetches in flight for them.
  /// While any hold remains, no fetch starts for the key.
  pub(crate) fn hold(&self, keys: &[QueryKey]) {
    let mut notices = Vec::new();
    {
      let mut state = self.lock("hold");
      for key in keys {
        *state.held.entry(key.clone()).or_default() += 1;
        let Some(slot) = state.slots.get_mut(key) else {
          continue;
        };
        let Some(flight) = slot.in_flight.take() else {
          continue;
        };
        flight.abort.abort();
        slot.entry.status = flight.status_before;
        debug!(key = %key, generation = flight.generation, "fetch cancelled by mutation");
        notices.extend(state.updated(key));
      }
    }
    Self::dispatch(notices);
  }

  /// Drop one hold on each key. Returns the keys nobody holds any more.
  pub(crate) fn release(&self, keys: &[QueryKey]) -> Vec<QueryKey> {
    let mut state = self.lock("release");
    let mut freed = Vec::new();
    for key in keys {
      let Some(count) = state.held.get_mut(key) else {
        continue;
      };
      *count -= 1;
      if *count == 0 {
        state.held.remove(key);
        freed.push(key.clone());
      }
    }
    freed
  }

  pub fn is_held(&self, key: &QueryKey) -> bool {
    self.lock("is_held").held.contains_key(key)
  }

  /// Replace the entry's data with `patch(current)` without changing its
  /// status; an entry that never held data becomes `Success`.
  ///
  /// `patch` runs while the store is locked and must not call back into it.
  pub(crate) fn apply_optimistic<F>(&self, key: &QueryKey, patch: F) -> CacheEntry<T>
  where
    F: FnOnce(Option<&T>) -> T,
  {
    let (entry, notice) = {
      let mut state = self.lock("apply_optimistic");
      let now = self.now();
      let slot = state.slot_or_insert(key, now, &self.inner.policy);
      let next = patch(slot.entry.data.as_ref());
      if slot.entry.status == EntryStatus::Idle && !slot.entry.has_data() {
        slot.entry.record_success(next, now);
      } else {
        slot.entry.data = Some(next);
      }
      let entry = slot.entry.clone();
      (entry, state.updated(key))
    };
    self.touch();
    Self::dispatch(notice);
    entry
  }

  /// Put back an entry exactly as it was captured; `None` means the key did
  /// not exist.
  pub(crate) fn restore_entry(&self, key: &QueryKey, prior: Option<CacheEntry<T>>) {
    let notice = {
      let mut state = self.lock("restore_entry");
      let now = self.now();
      let subscribers = state.listener_count(key);

      match prior {
        Some(mut prior) => {
          prior.subscriber_count = subscribers;
          let slot = state.slot_or_insert(key, now, &self.inner.policy);
          if let Some(flight) = slot.in_flight.take() {
            flight.abort.abort();
          }
          slot.entry = prior;
          slot.invalidated = false;
          state.updated(key)
        }
        None if subscribers > 0 => {
          let stale_time = self.inner.policy.stale_time_for(key);
          if let Some(slot) = state.slots.get_mut(key) {
            if let Some(flight) = slot.in_flight.take() {
              flight.abort.abort();
            }
            *slot = Slot::new(key.clone(), now, stale_time, subscribers);
          }
          state.updated(key)
        }
        None => {
          if let Some(slot) = state.slots.remove(key) {
            if let Some(flight) = slot.in_flight {
              flight.abort.abort();
            }
          }
          state.removed(key)
        }
      }
    };
    self.touch();
    Self::dispatch(notice);
  }

  // --------------------------------------------------------------------------
  // Lifecycle
  // --------------------------------------------------------------------------

  /// Abort every fetch in flight and refuse to start new ones.
  pub fn close(&self) {
    let mut notices = Vec::new();
    let aborted = {
      let mut state = self.lock("close");
      state.closed = true;
      let keys: Vec<QueryKey> = state
        .slots
        .iter()
        .filter(|(_, slot)| slot.in_flight.is_some())
        .map(|(key, _)| key.clone())
        .collect();
      for key in &keys {
        if let Some(slot) = state.slots.get_mut(key) {
          if let Some(flight) = slot.in_flight.take() {
            flight.abort.abort();
            slot.entry.status = flight.status_before;
          }
        }
        notices.extend(state.updated(key));
      }
      keys.len()
    };
    info!(aborted, "cache store closed");
    Self::dispatch(notices);
  }
}

/// Run the fetcher, retrying failures per `retry`.
async fn run_with_retry<T>(
  key: &QueryKey,
  fetcher: Fetcher<T>,
  retry: RetryPolicy,
) -> color_eyre::Result<T> {
  let mut attempt = 0;
  loop {
    match fetcher(key).await {
      Ok(data) => return Ok(data),
      Err(error) if attempt < retry.max_retries => {
        let delay = retry.delay_for(attempt);
        debug!(key = %key, attempt, ?delay, error = %error, "fetch failed, retrying");
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(error) => return Err(error),
    }
  }
}
