//! Dependency rules between resources and the change events they react to.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::key::{QueryKey, Segment};

/// Kind of write the server accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
  Create,
  Update,
  Delete,
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      MutationKind::Create => write!(f, "create"),
      MutationKind::Update => write!(f, "update"),
      MutationKind::Delete => write!(f, "delete"),
    }
  }
}

/// A confirmed change to one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
  pub kind: MutationKind,
  pub resource: String,
  pub id: Option<Segment>,
  /// Parents the changed record belongs to, as `(resource, id)`.
  pub parents: Vec<(String, Segment)>,
}

impl ChangeEvent {
  pub fn new(kind: MutationKind, resource: impl Into<String>) -> Self {
    Self {
      kind,
      resource: resource.into(),
      id: None,
      parents: Vec::new(),
    }
  }

  pub fn created(resource: impl Into<String>) -> Self {
    Self::new(MutationKind::Create, resource)
  }

  pub fn updated(resource: impl Into<String>, id: impl Into<Segment>) -> Self {
    Self::new(MutationKind::Update, resource).with_id(id)
  }

  pub fn deleted(resource: impl Into<String>, id: impl Into<Segment>) -> Self {
    Self::new(MutationKind::Delete, resource).with_id(id)
  }

  pub fn with_id(mut self, id: impl Into<Segment>) -> Self {
    self.id = Some(id.into());
    self
  }

  /// Declare the parent record, e.g. the position an interview belongs to.
  pub fn with_parent(mut self, resource: impl Into<String>, id: impl Into<Segment>) -> Self {
    self.parents.push((resource.into(), id.into()));
    self
  }

  /// Ids declared for parents of the given resource.
  pub fn parent_ids<'a>(&'a self, resource: &'a str) -> impl Iterator<Item = &'a Segment> + 'a {
    self
      .parents
      .iter()
      .filter(move |(name, _)| name == resource)
      .map(|(_, id)| id)
  }
}

impl fmt::Display for ChangeEvent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.kind, self.resource)?;
    if let Some(id) = &self.id {
      write!(f, "/{}", id)?;
    }
    Ok(())
  }
}

/// Cached data outside a resource's own keys that depends on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
  /// Every key under this prefix, e.g. `["statistics"]`.
  Aggregate(QueryKey),
  /// Detail keys of the parents declared on the event.
  ParentDetail(String),
  /// List keys of the parent resource.
  ParentList(String),
}

/// Where a resource's keys live and what depends on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRule {
  pub resource: String,
  pub list_prefix: QueryKey,
  /// Detail keys are this prefix followed by the record id.
  pub detail_prefix: QueryKey,
  pub dependents: Vec<Dependency>,
}

impl ResourceRule {
  /// Rule with the conventional `[resource, "list"]` and
  /// `[resource, "detail"]` prefixes and no dependents.
  pub fn new(resource: impl Into<String>) -> Self {
    let resource = resource.into();
    let root = QueryKey::root().child(resource.as_str());
    Self {
      list_prefix: root.child("list"),
      detail_prefix: root.child("detail"),
      dependents: Vec::new(),
      resource,
    }
  }

  pub fn list_prefix(mut self, prefix: QueryKey) -> Self {
    self.list_prefix = prefix;
    self
  }

  pub fn detail_prefix(mut self, prefix: QueryKey) -> Self {
    self.detail_prefix = prefix;
    self
  }

  pub fn aggregate(self, prefix: QueryKey) -> Self {
    self.edge(Dependency::Aggregate(prefix))
  }

  /// Changes also affect the parent's detail and list keys.
  pub fn parent(self, resource: impl Into<String>) -> Self {
    let resource = resource.into();
    self
      .edge(Dependency::ParentDetail(resource.clone()))
      .edge(Dependency::ParentList(resource))
  }

  pub fn edge(mut self, dependency: Dependency) -> Self {
    if !self.dependents.contains(&dependency) {
      self.dependents.push(dependency);
    }
    self
  }

  pub fn detail_key(&self, id: &Segment) -> QueryKey {
    self.detail_prefix.child(id.clone())
  }
}

/// The rule table, one rule per resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationRules {
  rules: BTreeMap<String, ResourceRule>,
}

impl InvalidationRules {
  pub fn new() -> Self {
    Self::default()
  }

  /// Rules for the job tracker resources: positions, their interviews, and
  /// the statistics computed from both.
  pub fn tracker_defaults() -> Self {
    let statistics = QueryKey::root().child("statistics");
    Self::new()
      .rule(ResourceRule::new("position").aggregate(statistics.clone()))
      .rule(
        ResourceRule::new("interview")
          .parent("position")
          .aggregate(statistics),
      )
      .rule(ResourceRule::new("statistics"))
  }

  /// Add or replace the rule for a resource.
  pub fn rule(mut self, rule: ResourceRule) -> Self {
    self.insert(rule);
    self
  }

  pub fn insert(&mut self, rule: ResourceRule) {
    self.rules.insert(rule.resource.clone(), rule);
  }

  pub fn get(&self, resource: &str) -> Option<&ResourceRule> {
    self.rules.get(resource)
  }

  pub fn resources(&self) -> impl Iterator<Item = &str> {
    self.rules.keys().map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.rules.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query_key;

  #[test]
  fn conventional_prefixes() {
    let rule = ResourceRule::new("position");
    assert_eq!(rule.list_prefix, query_key!["position", "list"]);
    assert_eq!(rule.detail_prefix, query_key!["position", "detail"]);
    assert_eq!(rule.detail_key(&Segment::from("42")), query_key!["position", "detail", "42"]);
  }

  #[test]
  fn parent_adds_both_edges_once() {
    let rule = ResourceRule::new("interview").parent("position").parent("position");
    assert_eq!(
      rule.dependents,
      vec![
        Dependency::ParentDetail("position".into()),
        Dependency::ParentList("position".into()),
      ]
    );
  }

  #[test]
  fn tracker_defaults_cover_resources() {
    let rules = InvalidationRules::tracker_defaults();
    let names: Vec<&str> = rules.resources().collect();
    assert_eq!(names, vec!["interview", "position", "statistics"]);
    assert!(rules
      .get("position")
      .unwrap()
      .dependents
      .contains(&Dependency::Aggregate(query_key!["statistics"])));
  }

  #[test]
  fn event_parent_ids() {
    let event = ChangeEvent::updated("interview", "9")
      .with_parent("position", "42")
      .with_parent("company", "7");
    let ids: Vec<&Segment> = event.parent_ids("position").collect();
    assert_eq!(ids, vec![&Segment::from("42")]);
    assert_eq!(event.to_string(), "update interview/9");
  }

  #[test]
  fn dependencies_deserialize_from_yaml() {
    let yaml = "- aggregate: [statistics]\n- parent_detail: position\n- parent_list: position\n";
    let deps: Vec<Dependency> = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(
      deps,
      vec![
        Dependency::Aggregate(query_key!["statistics"]),
        Dependency::ParentDetail("position".into()),
        Dependency::ParentList("position".into()),
      ]
    );
  }
}
