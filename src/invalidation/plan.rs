//! Invalidation plans.
//!
//! Turns change events into the set of key prefixes to mark stale and the
//! set to remove outright.

use std::collections::BTreeSet;
use std::fmt;

use tracing::warn;

use crate::key::QueryKey;

use super::rules::{ChangeEvent, Dependency, InvalidationRules, MutationKind, ResourceRule};

/// Prefixes to act on, kept ordered so plans are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
  /// Mark every key under these prefixes stale.
  pub stale: BTreeSet<QueryKey>,
  /// Delete every key under these prefixes.
  pub remove: BTreeSet<QueryKey>,
}

impl fmt::Display for InvalidationPlan {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let join = |keys: &BTreeSet<QueryKey>| {
      keys
        .iter()
        .map(|k| format!("[{}]", k))
        .collect::<Vec<_>>()
        .join(", ")
    };
    write!(
      f,
      "InvalidationPlan {{ stale: {{{}}}, remove: {{{}}} }}",
      join(&self.stale),
      join(&self.remove)
    )
  }
}

impl InvalidationPlan {
  /// Plan for one event.
  ///
  /// - create: list keys and dependents go stale
  /// - update: the record's detail keys, list keys and dependents go stale
  /// - delete: list keys and dependents go stale; the detail keys are removed
  ///
  /// An unknown resource falls back to the conventional prefixes.
  pub fn for_event(rules: &InvalidationRules, event: &ChangeEvent) -> Self {
    let mut plan = Self::default();
    let rule = resolve(rules, &event.resource);

    plan.stale.insert(rule.list_prefix.clone());
    let detail = match &event.id {
      Some(id) => rule.detail_key(id),
      None => rule.detail_prefix.clone(),
    };
    match (event.kind, &event.id) {
      (MutationKind::Create, _) => {}
      (MutationKind::Update, _) | (MutationKind::Delete, None) => {
        plan.stale.insert(detail);
      }
      (MutationKind::Delete, Some(_)) => {
        plan.remove.insert(detail);
      }
    }

    for dependency in &rule.dependents {
      match dependency {
        Dependency::Aggregate(prefix) => {
          plan.stale.insert(prefix.clone());
        }
        Dependency::ParentDetail(parent) => {
          let parent_rule = resolve(rules, parent);
          for id in event.parent_ids(parent) {
            plan.stale.insert(parent_rule.detail_key(id));
          }
        }
        Dependency::ParentList(parent) => {
          plan.stale.insert(resolve(rules, parent).list_prefix);
        }
      }
    }

    plan
  }

  /// Merge a batch of events into one plan; duplicate prefixes collapse.
  pub fn from_events<'a, I>(rules: &InvalidationRules, events: I) -> Self
  where
    I: IntoIterator<Item = &'a ChangeEvent>,
  {
    let mut plan = Self::default();
    for event in events {
      plan.merge(Self::for_event(rules, event));
    }
    plan
  }

  pub fn merge(&mut self, other: InvalidationPlan) {
    self.stale.extend(other.stale);
    self.remove.extend(other.remove);
  }

  /// Stale the given prefix and nothing else.
  pub fn stale_prefix(prefix: QueryKey) -> Self {
    let mut plan = Self::default();
    plan.stale.insert(prefix);
    plan
  }

  pub fn is_empty(&self) -> bool {
    self.stale.is_empty() && self.remove.is_empty()
  }

  pub fn stales(&self, key: &QueryKey) -> bool {
    self.stale.iter().any(|prefix| key.starts_with(prefix))
  }

  pub fn removes(&self, key: &QueryKey) -> bool {
    self.remove.iter().any(|prefix| key.starts_with(prefix))
  }
}

fn resolve(rules: &InvalidationRules, resource: &str) -> ResourceRule {
  match rules.get(resource) {
    Some(rule) => rule.clone(),
    None => {
      warn!(resource, "no invalidation rule for resource, using conventional keys");
      ResourceRule::new(resource)
    }
  }
}
