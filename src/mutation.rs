//! Optimistic mutations.
//!
//! A mutation snapshots the entries it touches, patches them locally, and
//! either commits (server confirmed; dependents get invalidated) or rolls
//! back to the snapshot (server rejected).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::cache::{CacheData, CacheEntry, CacheStore, SetDataOptions};
use crate::error::CacheError;
use crate::invalidation::{ChangeEvent, InvalidationEngine, InvalidationReport};
use crate::key::QueryKey;
use crate::lock::mutex_lock;

const SOURCE: &str = "mutation";

pub type MutationId = u64;

/// `Snapshotted -> Applied -> {Committed | RolledBack}`; a snapshot that was
/// never patched may commit or roll back directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
  Snapshotted,
  Applied,
  Committed,
  RolledBack,
}

impl MutationState {
  fn is_open(self) -> bool {
    matches!(self, MutationState::Snapshotted | MutationState::Applied)
  }
}

/// Entries as they were before a mutation touched them.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
  id: MutationId,
  affected_keys: Vec<QueryKey>,
  /// `None` records a key that had no entry.
  prior_entries: HashMap<QueryKey, Option<CacheEntry<T>>>,
  state: MutationState,
}

impl<T> Snapshot<T> {
  pub fn id(&self) -> MutationId {
    self.id
  }

  pub fn affected_keys(&self) -> &[QueryKey] {
    &self.affected_keys
  }

  /// The captured entry; `Some(None)` means the key was absent.
  pub fn prior_entry(&self, key: &QueryKey) -> Option<Option<&CacheEntry<T>>> {
    self.prior_entries.get(key).map(Option::as_ref)
  }

  pub fn state(&self) -> MutationState {
    self.state
  }

  fn check(&self, to: MutationState) -> Result<(), CacheError> {
    if self.state.is_open() {
      Ok(())
    } else {
      Err(CacheError::InvalidTransition {
        mutation: self.id,
        from: self.state,
        to,
      })
    }
  }
}

/// What a rollback did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
  /// Keys put back to their snapshot.
  pub restored: Vec<QueryKey>,
  /// Keys left alone because a later mutation owns them (or a later one
  /// already committed).
  pub superseded: Vec<QueryKey>,
}

/// Bookkeeping shared by all mutations of one store.
struct Ledger<T> {
  /// Open mutations that snapshotted each key, oldest first. The last one
  /// owns the key.
  holders: HashMap<QueryKey, Vec<MutationId>>,
  /// Baselines handed over by rolled back predecessors, replacing the
  /// holder's own snapshot of that key.
  rebased: HashMap<(MutationId, QueryKey), Option<CacheEntry<T>>>,
  next_id: MutationId,
}

/// Runs optimistic mutations against a [`CacheStore`].
pub struct MutationCoordinator<T: CacheData> {
  store: CacheStore<T>,
  engine: InvalidationEngine,
  ledger: Arc<Mutex<Ledger<T>>>,
}

impl<T: CacheData> Clone for MutationCoordinator<T> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      engine: self.engine.clone(),
      ledger: Arc::clone(&self.ledger),
    }
  }
}

impl<T: CacheData> fmt::Debug for MutationCoordinator<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationCoordinator")
      .field("engine", &self.engine)
      .finish_non_exhaustive()
  }
}

impl<T: CacheData> MutationCoordinator<T> {
  pub fn new(store: CacheStore<T>, engine: InvalidationEngine) -> Self {
    Self {
      store,
      engine,
      ledger: Arc::new(Mutex::new(Ledger {
        holders: HashMap::new(),
        rebased: HashMap::new(),
        next_id: 0,
      })),
    }
  }

  pub fn store(&self) -> &CacheStore<T> {
    &self.store
  }

  pub fn engine(&self) -> &InvalidationEngine {
    &self.engine
  }

  /// Snapshot `keys` and take ownership of them.
  ///
  /// Fetches in flight for the keys are cancelled, and no new fetch starts
  /// for them until the mutation commits or rolls back, so a server response
  /// cannot land on top of the optimistic value.
  pub fn begin<I>(&self, keys: I) -> Snapshot<T>
  where
    I: IntoIterator<Item = QueryKey>,
  {
    let mut affected_keys = Vec::new();
    for key in keys {
      if !affected_keys.contains(&key) {
        affected_keys.push(key);
      }
    }

    let id = {
      let mut ledger = mutex_lock(&self.ledger, SOURCE, "begin");
      ledger.next_id += 1;
      let id = ledger.next_id;
      for key in &affected_keys {
        ledger.holders.entry(key.clone()).or_default().push(id);
      }
      id
    };

    // Store calls notify listeners, which may call back in here.
    self.store.hold(&affected_keys);
    let prior_entries = affected_keys
      .iter()
      .map(|key| (key.clone(), self.store.get(key)))
      .collect();
    debug!(mutation = id, keys = affected_keys.len(), "mutation snapshotted");

    Snapshot {
      id,
      affected_keys,
      prior_entries,
      state: MutationState::Snapshotted,
    }
  }

  /// Write the optimistic value for one snapshotted key.
  pub fn apply<F>(
    &self,
    snapshot: &mut Snapshot<T>,
    key: &QueryKey,
    patch: F,
  ) -> Result<CacheEntry<T>, CacheError>
  where
    F: FnOnce(Option<&T>) -> T,
  {
    snapshot.check(MutationState::Applied)?;
    if !snapshot.prior_entries.contains_key(key) {
      return Err(CacheError::NotSnapshotted {
        key: key.clone(),
        mutation: snapshot.id,
      });
    }
    let entry = self.store.apply_optimistic(key, patch);
    snapshot.state = MutationState::Applied;
    debug!(mutation = snapshot.id, key = %key, "optimistic update applied");
    Ok(entry)
  }

  /// The server confirmed the write: drop the snapshot, release the keys and
  /// invalidate what depends on the change.
  ///
  /// Without an event, the affected keys themselves are marked stale.
  pub fn commit(
    &self,
    snapshot: &mut Snapshot<T>,
    event: Option<&ChangeEvent>,
  ) -> Result<InvalidationReport, CacheError> {
    snapshot.check(MutationState::Committed)?;
    {
      let mut ledger = mutex_lock(&self.ledger, SOURCE, "commit");
      for key in &snapshot.affected_keys {
        let Some(holders) = ledger.holders.get_mut(key) else {
          continue;
        };
        // Older mutations can no longer roll this key back past a confirmed
        // write.
        let released: Vec<MutationId> = match holders.iter().position(|m| *m == snapshot.id) {
          Some(pos) => holders.drain(..=pos).collect(),
          None => Vec::new(),
        };
        if holders.is_empty() {
          ledger.holders.remove(key);
        }
        for id in released {
          ledger.rebased.remove(&(id, key.clone()));
        }
      }
    }
    self.store.release(&snapshot.affected_keys);
    snapshot.state = MutationState::Committed;
    snapshot.prior_entries.clear();
    info!(mutation = snapshot.id, "mutation committed");

    let report = match event {
      Some(event) => self.engine.on_change(&self.store, event),
      None => {
        let keys = &snapshot.affected_keys;
        self.engine.invalidate(&self.store, |key| keys.contains(key))
      }
    };
    Ok(report)
  }

  /// The server rejected the write: put every key this mutation still owns
  /// back exactly as it was. Calling it again is a no-op.
  pub fn rollback(&self, snapshot: &mut Snapshot<T>) -> Result<RollbackReport, CacheError> {
    if snapshot.state == MutationState::RolledBack {
      return Ok(RollbackReport::default());
    }
    snapshot.check(MutationState::RolledBack)?;

    let mut report = RollbackReport::default();
    let mut restores = Vec::new();
    {
      let mut ledger = mutex_lock(&self.ledger, SOURCE, "rollback");
      for key in &snapshot.affected_keys {
        let baseline = match ledger.rebased.remove(&(snapshot.id, key.clone())) {
          Some(rebased) => rebased,
          None => snapshot.prior_entries.get(key).cloned().flatten(),
        };

        let Some(holders) = ledger.holders.get_mut(key) else {
          report.superseded.push(key.clone());
          continue;
        };
        let Some(pos) = holders.iter().position(|m| *m == snapshot.id) else {
          report.superseded.push(key.clone());
          continue;
        };
        holders.remove(pos);
        let successor = holders.get(pos).copied();
        if holders.is_empty() {
          ledger.holders.remove(key);
        }

        match successor {
          None => {
            restores.push((key.clone(), baseline));
            report.restored.push(key.clone());
          }
          Some(next) => {
            // The successor snapshotted our optimistic value; give it the
            // real baseline instead.
            ledger.rebased.insert((next, key.clone()), baseline);
            report.superseded.push(key.clone());
          }
        }
      }
    }

    for (key, baseline) in restores {
      self.store.restore_entry(&key, baseline);
    }
    let freed = self.store.release(&snapshot.affected_keys);
    // Subscribers asked for these while they were held.
    self.store.refetch_matching(|entry, now| {
      freed.contains(&entry.key) && entry.subscriber_count > 0 && entry.is_stale(now)
    });
    snapshot.state = MutationState::RolledBack;
    info!(
      mutation = snapshot.id,
      restored = report.restored.len(),
      superseded = report.superseded.len(),
      "mutation rolled back"
    );
    Ok(report)
  }

  /// Full optimistic flow: snapshot, patch, await the write, then commit or
  /// roll back. Mutations are never retried.
  ///
  /// Dropping the returned future before it settles rolls the mutation back.
  pub async fn run<R, Fut>(&self, mutation: Mutation<T, R>, write: Fut) -> Result<R, CacheError>
  where
    Fut: Future<Output = color_eyre::Result<R>>,
  {
    let Mutation {
      event,
      keys,
      patches,
      reconcile,
    } = mutation;

    let all_keys = keys
      .into_iter()
      .chain(patches.iter().map(|(key, _)| key.clone()));
    let mut pending = Pending {
      coordinator: self,
      snapshot: self.begin(all_keys),
    };
    for (key, patch) in patches {
      self.apply(&mut pending.snapshot, &key, patch)?;
    }

    match write.await {
      Ok(response) => {
        if let Some(reconcile) = reconcile {
          for (key, data) in reconcile(&response) {
            self.store.set_data(&key, data, SetDataOptions::default());
          }
        }
        self.commit(&mut pending.snapshot, event.as_ref())?;
        Ok(response)
      }
      Err(report) => {
        let message = format!("{:#}", report);
        warn!(mutation = pending.snapshot.id, error = %message, "mutation rejected");
        self.rollback(&mut pending.snapshot)?;
        Err(CacheError::Mutation { message })
      }
    }
  }
}

/// Rolls back a mutation whose future was dropped mid-flight.
struct Pending<'a, T: CacheData> {
  coordinator: &'a MutationCoordinator<T>,
  snapshot: Snapshot<T>,
}

impl<T: CacheData> Drop for Pending<'_, T> {
  fn drop(&mut self) {
    if self.snapshot.state.is_open() {
      debug!(mutation = self.snapshot.id, "mutation abandoned");
      let _ = self.coordinator.rollback(&mut self.snapshot);
    }
  }
}

type Patch<T> = Box<dyn FnOnce(Option<&T>) -> T + Send>;
type Reconcile<T, R> = Box<dyn FnOnce(&R) -> Vec<(QueryKey, T)> + Send>;

/// Description of one optimistic write, consumed by
/// [`MutationCoordinator::run`].
pub struct Mutation<T, R> {
  event: Option<ChangeEvent>,
  keys: Vec<QueryKey>,
  patches: Vec<(QueryKey, Patch<T>)>,
  reconcile: Option<Reconcile<T, R>>,
}

impl<T, R> Default for Mutation<T, R> {
  fn default() -> Self {
    Self {
      event: None,
      keys: Vec::new(),
      patches: Vec::new(),
      reconcile: None,
    }
  }
}

impl<T, R> Mutation<T, R> {
  /// A mutation whose success invalidates the dependents of `event`.
  pub fn new(event: ChangeEvent) -> Self {
    Self {
      event: Some(event),
      ..Self::default()
    }
  }

  /// Snapshot a key without patching it.
  pub fn affects(mut self, key: QueryKey) -> Self {
    self.keys.push(key);
    self
  }

  pub fn optimistic<F>(mut self, key: QueryKey, patch: F) -> Self
  where
    F: FnOnce(Option<&T>) -> T + Send + 'static,
  {
    self.patches.push((key, Box::new(patch)));
    self
  }

  /// Write server-confirmed data from the response before committing.
  pub fn reconcile<F>(mut self, reconcile: F) -> Self
  where
    F: FnOnce(&R) -> Vec<(QueryKey, T)> + Send + 'static,
  {
    self.reconcile = Some(Box::new(reconcile));
    self
  }
}

impl<T, R> fmt::Debug for Mutation<T, R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Mutation")
      .field("event", &self.event)
      .field("keys", &self.keys)
      .field("patches", &self.patches.len())
      .field("reconcile", &self.reconcile.is_some())
      .finish()
  }
}
