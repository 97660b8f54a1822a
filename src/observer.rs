//! Poll-based view of one cache key, for event loops.
//!
//! An `Observer<T>` subscribes to a key and buffers every transition in a
//! channel; the owning loop drains it on its own schedule.
//!
//! # Example
//!
//! ```ignore
//! let mut positions = client.observe(query_key!["position", "list", ""], fetch_positions);
//!
//! // Start fetching (no-op while fresh or already in flight)
//! positions.fetch();
//!
//! // In event loop tick
//! if positions.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! match positions.status() {
//!     Some(EntryStatus::Pending) => render_spinner(positions.data()),
//!     Some(EntryStatus::Success) => render_data(positions.data()),
//!     Some(EntryStatus::Error) => render_error(positions.error()),
//!     _ => {}
//! }
//! ```

use std::fmt;
use tokio::sync::mpsc;

use crate::cache::{
  CacheData, CacheEntry, CacheStore, EntryEvent, EntryStatus, FetchOptions, Fetcher, RefetchMode,
  RefetchOutcome, Subscription,
};
use crate::key::QueryKey;

/// Subscribed view of one key with a bound fetcher.
pub struct Observer<T: CacheData> {
  store: CacheStore<T>,
  key: QueryKey,
  fetcher: Fetcher<T>,
  options: FetchOptions,
  state: Option<CacheEntry<T>>,
  receiver: mpsc::UnboundedReceiver<EntryEvent<T>>,
  _subscription: Subscription<T>,
}

impl<T: CacheData> Observer<T> {
  pub fn new(store: CacheStore<T>, key: QueryKey, fetcher: Fetcher<T>, options: FetchOptions) -> Self {
    let (tx, receiver) = mpsc::unbounded_channel();
    let subscription = store.subscribe(&key, move |event: &EntryEvent<T>| {
      // Ignore send errors - the observer may have been dropped
      let _ = tx.send(event.clone());
    });
    let state = store.get(&key);
    Self {
      store,
      key,
      fetcher,
      options,
      state,
      receiver,
      _subscription: subscription,
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Start fetching if the entry is missing or stale.
  ///
  /// This is a no-op while the data is fresh or a fetch is in flight.
  pub fn fetch(&mut self) {
    let entry = self
      .store
      .ensure(&self.key, self.fetcher.clone(), self.options);
    self.state = Some(entry);
    self.drain();
  }

  /// Force a refetch, superseding any fetch in flight.
  pub fn refetch(&mut self) -> RefetchOutcome {
    if !self.store.contains(&self.key) {
      self.fetch();
      return RefetchOutcome::Started;
    }
    self.store.refetch(&self.key, RefetchMode::CancelInFlight)
  }

  /// Apply buffered transitions.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    self.drain()
  }

  /// Wait for the next transition. Returns `false` once the store can no
  /// longer deliver any.
  pub async fn changed(&mut self) -> bool {
    match self.receiver.recv().await {
      Some(event) => {
        self.apply(event);
        self.drain();
        true
      }
      None => false,
    }
  }

  fn drain(&mut self) -> bool {
    let mut changed = false;
    while let Ok(event) = self.receiver.try_recv() {
      self.apply(event);
      changed = true;
    }
    changed
  }

  fn apply(&mut self, event: EntryEvent<T>) {
    self.state = match event {
      EntryEvent::Updated(entry) => Some(entry),
      EntryEvent::Removed(_) => None,
    };
  }

  /// Latest known entry; `None` once removed.
  pub fn state(&self) -> Option<&CacheEntry<T>> {
    self.state.as_ref()
  }

  pub fn status(&self) -> Option<EntryStatus> {
    self.state.as_ref().map(|entry| entry.status)
  }

  /// Data, including stale data kept while refetching or after an error.
  pub fn data(&self) -> Option<&T> {
    self.state.as_ref().and_then(|entry| entry.data.as_ref())
  }

  pub fn is_loading(&self) -> bool {
    self.status() == Some(EntryStatus::Pending)
  }

  pub fn is_success(&self) -> bool {
    self.status() == Some(EntryStatus::Success)
  }

  pub fn is_error(&self) -> bool {
    self.status() == Some(EntryStatus::Error)
  }

  pub fn error(&self) -> Option<&str> {
    self
      .state
      .as_ref()
      .and_then(|entry| entry.error.as_ref())
      .map(|error| error.message.as_str())
  }

  pub fn is_stale(&self) -> bool {
    self
      .state
      .as_ref()
      .map_or(true, |entry| entry.is_stale(self.store.now()))
  }
}

impl<T: CacheData + fmt::Debug> fmt::Debug for Observer<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Observer")
      .field("key", &self.key)
      .field("state", &self.state)
      .finish_non_exhaustive()
  }
}
