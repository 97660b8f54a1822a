//! Invalidation engine.
//!
//! Maps confirmed changes onto the cache keys that depend on them:
//! - Explicit per-resource dependency edges, nothing inferred
//! - Plans merged from batches of events before execution
//! - Stale marking keeps data; deletes remove the record's detail keys
//! - Subscribed keys are refetched right away when `refetch_active` is set

mod plan;
mod rules;

pub use plan::InvalidationPlan;
pub use rules::{ChangeEvent, Dependency, InvalidationRules, MutationKind, ResourceRule};

use std::collections::HashSet;

use tracing::info;

use crate::cache::{CacheData, CacheStore};
use crate::key::{KeyFilter, QueryKey};

/// What an invalidation did to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
  pub staled: Vec<QueryKey>,
  pub removed: Vec<QueryKey>,
  /// Subscribed keys for which a new fetch was started.
  pub refetched: Vec<QueryKey>,
}

/// Applies [`InvalidationRules`] to a store.
#[derive(Debug, Clone)]
pub struct InvalidationEngine {
  rules: InvalidationRules,
  refetch_active: bool,
}

impl Default for InvalidationEngine {
  fn default() -> Self {
    Self::new(InvalidationRules::tracker_defaults())
  }
}

impl InvalidationEngine {
  pub fn new(rules: InvalidationRules) -> Self {
    Self {
      rules,
      refetch_active: true,
    }
  }

  pub fn with_refetch_active(mut self, refetch_active: bool) -> Self {
    self.refetch_active = refetch_active;
    self
  }

  pub fn rules(&self) -> &InvalidationRules {
    &self.rules
  }

  pub fn plan(&self, event: &ChangeEvent) -> InvalidationPlan {
    InvalidationPlan::for_event(&self.rules, event)
  }

  /// Plan and apply one confirmed change.
  pub fn on_change<T: CacheData>(
    &self,
    store: &CacheStore<T>,
    event: &ChangeEvent,
  ) -> InvalidationReport {
    let plan = self.plan(event);
    info!(event = %event, plan = %plan, "invalidating for change");
    self.apply(store, &plan)
  }

  /// Plan and apply a batch of changes as one merged plan.
  pub fn on_changes<T: CacheData>(
    &self,
    store: &CacheStore<T>,
    events: &[ChangeEvent],
  ) -> InvalidationReport {
    let plan = InvalidationPlan::from_events(&self.rules, events);
    info!(events = events.len(), plan = %plan, "invalidating for changes");
    self.apply(store, &plan)
  }

  /// Mark stale every key accepted by `predicate`.
  pub fn invalidate<T, P>(&self, store: &CacheStore<T>, predicate: P) -> InvalidationReport
  where
    T: CacheData,
    P: Fn(&QueryKey) -> bool,
  {
    let staled = store.invalidate(predicate);
    let refetched = self.refetch_subscribed(store, &staled);
    InvalidationReport {
      staled,
      removed: Vec::new(),
      refetched,
    }
  }

  pub fn invalidate_prefix<T: CacheData>(
    &self,
    store: &CacheStore<T>,
    prefix: &QueryKey,
  ) -> InvalidationReport {
    self.invalidate(store, |key| key.starts_with(prefix))
  }

  /// Execute a plan: stale first, then remove, then refetch subscribed keys
  /// that were staled and survived removal.
  pub fn apply<T: CacheData>(
    &self,
    store: &CacheStore<T>,
    plan: &InvalidationPlan,
  ) -> InvalidationReport {
    if plan.is_empty() {
      return InvalidationReport::default();
    }
    let staled = store.invalidate(|key| plan.stales(key));
    let mut removed = Vec::new();
    for prefix in &plan.remove {
      removed.extend(store.remove(&KeyFilter::Prefix(prefix.clone())));
    }
    let refetched = self.refetch_subscribed(store, &staled);

    info!(
      staled = staled.len(),
      removed = removed.len(),
      refetched = refetched.len(),
      "invalidation applied"
    );
    InvalidationReport {
      staled,
      removed,
      refetched,
    }
  }

  fn refetch_subscribed<T: CacheData>(
    &self,
    store: &CacheStore<T>,
    staled: &[QueryKey],
  ) -> Vec<QueryKey> {
    if !self.refetch_active || staled.is_empty() {
      return Vec::new();
    }
    let staled: HashSet<&QueryKey> = staled.iter().collect();
    store.refetch_matching(|entry, _| entry.subscriber_count > 0 && staled.contains(&entry.key))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{keyed_fetcher, SetDataOptions, StorePolicy};
  use crate::query_key;

  fn seeded() -> CacheStore<String> {
    let store = CacheStore::new(StorePolicy::default());
    for key in [
      query_key!["position", "list", ""],
      query_key!["position", "detail", "42"],
      query_key!["position", "detail", "43"],
      query_key!["interview", "list", ""],
      query_key!["statistics", "overview"],
    ] {
      store.set_data(&key, key.to_string(), SetDataOptions::default());
    }
    store
  }

  #[tokio::test]
  async fn update_stales_dependents_and_keeps_others_fresh() {
    let store = seeded();
    let engine = InvalidationEngine::default();
    let report = engine.on_change(&store, &ChangeEvent::updated("position", "42"));

    assert_eq!(
      report.staled,
      vec![
        query_key!["position", "detail", "42"],
        query_key!["position", "list", ""],
        query_key!["statistics", "overview"],
      ]
    );
    let now = store.now();
    assert!(!store.get(&query_key!["position", "detail", "43"]).unwrap().is_stale(now));
    assert!(!store.get(&query_key!["interview", "list", ""]).unwrap().is_stale(now));
    assert_eq!(
      store.get(&query_key!["position", "detail", "42"]).unwrap().data.as_deref(),
      Some("position/detail/42")
    );
  }

  #[tokio::test]
  async fn delete_removes_detail_entry() {
    let store = seeded();
    let engine = InvalidationEngine::default();
    let report = engine.on_change(&store, &ChangeEvent::deleted("position", "42"));

    assert_eq!(report.removed, vec![query_key!["position", "detail", "42"]]);
    assert!(store.get(&query_key!["position", "detail", "42"]).is_none());
    assert!(store.get(&query_key!["position", "detail", "43"]).is_some());
  }

  #[tokio::test]
  async fn subscribed_keys_are_refetched() {
    let store = seeded();
    store.register_family(
      query_key!["position"],
      keyed_fetcher(|key: QueryKey| async move { Ok(format!("fresh {}", key)) }),
    );
    let list = query_key!["position", "list", ""];
    let _subscription = store.subscribe(&list, |_| {});

    let report = InvalidationEngine::default().on_change(&store, &ChangeEvent::created("position"));
    assert_eq!(report.refetched, vec![list.clone()]);
    assert_eq!(store.wait(&list).await, Some(Ok("fresh position/list/".to_string())));

    let quiet = InvalidationEngine::default().with_refetch_active(false);
    let report = quiet.invalidate_prefix(&store, &query_key!["position"]);
    assert!(report.refetched.is_empty());
    assert_eq!(report.staled.len(), 3);
  }
}
