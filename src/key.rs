//! Query keys: typed, hierarchical identifiers for cached items and families
//! of items.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex characters kept from the filter digest.
const FINGERPRINT_LEN: usize = 16;

/// One scalar component of a [`QueryKey`].
///
/// Segments of different kinds never compare equal: `Str("42")` and
/// `Int(42)` are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segment {
  Bool(bool),
  Int(i64),
  Str(String),
}

impl fmt::Display for Segment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Segment::Bool(b) => write!(f, "{}", b),
      Segment::Int(i) => write!(f, "{}", i),
      Segment::Str(s) => f.write_str(s),
    }
  }
}

impl From<&str> for Segment {
  fn from(s: &str) -> Self {
    Segment::Str(s.to_string())
  }
}

impl From<String> for Segment {
  fn from(s: String) -> Self {
    Segment::Str(s)
  }
}

impl From<&String> for Segment {
  fn from(s: &String) -> Self {
    Segment::Str(s.clone())
  }
}

impl From<i64> for Segment {
  fn from(i: i64) -> Self {
    Segment::Int(i)
  }
}

impl From<i32> for Segment {
  fn from(i: i32) -> Self {
    Segment::Int(i64::from(i))
  }
}

impl From<u32> for Segment {
  fn from(i: u32) -> Self {
    Segment::Int(i64::from(i))
  }
}

impl From<u64> for Segment {
  fn from(i: u64) -> Self {
    // Ids beyond i64 keep their identity as text rather than wrapping.
    i64::try_from(i)
      .map(Segment::Int)
      .unwrap_or_else(|_| Segment::Str(i.to_string()))
  }
}

impl From<bool> for Segment {
  fn from(b: bool) -> Self {
    Segment::Bool(b)
  }
}

/// Ordered sequence of segments, e.g. `["position", "detail", "42"]`.
///
/// Keys are immutable; [`QueryKey::child`] builds a new, longer key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<Segment>);

impl QueryKey {
  pub fn new(segments: Vec<Segment>) -> Self {
    Self(segments)
  }

  /// The empty key, a prefix of every key.
  pub fn root() -> Self {
    Self(Vec::new())
  }

  pub fn segments(&self) -> &[Segment] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn first(&self) -> Option<&Segment> {
    self.0.first()
  }

  /// A new key with one more segment appended.
  pub fn child(&self, segment: impl Into<Segment>) -> Self {
    let mut segments = self.0.clone();
    segments.push(segment.into());
    Self(segments)
  }

  /// True if `prefix`'s segments are a leading subsequence of this key's.
  ///
  /// Comparison is per segment and exact; `["temp"]` is not a prefix of
  /// `["template"]`.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut first = true;
    for segment in &self.0 {
      if !first {
        f.write_str("/")?;
      }
      write!(f, "{}", segment)?;
      first = false;
    }
    Ok(())
  }
}

impl<S: Into<Segment>> FromIterator<S> for QueryKey {
  fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
    Self(iter.into_iter().map(Into::into).collect())
  }
}

/// Build a [`QueryKey`] from a list of segment-convertible values.
///
/// ```
/// use querycache::query_key;
/// let key = query_key!["position", "detail", "42"];
/// assert_eq!(key.len(), 3);
/// ```
#[macro_export]
macro_rules! query_key {
  () => {
    $crate::QueryKey::root()
  };
  ($($segment:expr),+ $(,)?) => {
    $crate::QueryKey::new(vec![$($crate::Segment::from($segment)),+])
  };
}

/// Selects entries for remove/invalidate style operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
  /// Exactly this key.
  Exact(QueryKey),
  /// This key and every key below it.
  Prefix(QueryKey),
  All,
}

impl KeyFilter {
  pub fn matches(&self, key: &QueryKey) -> bool {
    match self {
      KeyFilter::Exact(k) => k == key,
      KeyFilter::Prefix(prefix) => key.starts_with(prefix),
      KeyFilter::All => true,
    }
  }
}

/// Deterministic fingerprint segment for a filter object.
///
/// Object keys are sorted and null, blank-string, empty-array and
/// empty-object values are stripped (recursively) before hashing, so
/// equivalent filters built in any order produce the same segment. A filter
/// with nothing left after stripping yields the empty segment `""`.
pub fn filter_fingerprint(filter: &Value) -> Segment {
  match normalize_filter(filter) {
    None => Segment::Str(String::new()),
    Some(normalized) => {
      let mut hasher = Sha256::new();
      hasher.update(normalized.to_string().as_bytes());
      let digest = hex::encode(hasher.finalize());
      Segment::Str(digest[..FINGERPRINT_LEN].to_string())
    }
  }
}

/// [`filter_fingerprint`] for any serializable filter struct.
pub fn fingerprint<F: Serialize>(filter: &F) -> serde_json::Result<Segment> {
  Ok(filter_fingerprint(&serde_json::to_value(filter)?))
}

/// Strip empty values and rebuild objects with sorted keys.
fn normalize_filter(value: &Value) -> Option<Value> {
  match value {
    Value::Null => None,
    Value::String(s) if s.trim().is_empty() => None,
    Value::Array(items) => {
      let items: Vec<Value> = items.iter().filter_map(normalize_filter).collect();
      if items.is_empty() {
        None
      } else {
        Some(Value::Array(items))
      }
    }
    Value::Object(map) => {
      let mut names: Vec<&String> = map.keys().collect();
      names.sort();

      let mut out = Map::new();
      for name in names {
        if let Some(v) = normalize_filter(&map[name]) {
          out.insert(name.clone(), v);
        }
      }
      if out.is_empty() {
        None
      } else {
        Some(Value::Object(out))
      }
    }
    other => Some(other.clone()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn keys_compare_element_wise() {
    assert_eq!(query_key!["position", "detail", "42"], query_key!["position", "detail", "42"]);
    assert_ne!(query_key!["position", "detail", "42"], query_key!["position", "detail", 42]);
    assert_ne!(query_key!["position"], query_key!["position", "list"]);
  }

  #[test]
  fn prefix_matching_is_per_segment() {
    let key = query_key!["template", "list", ""];
    assert!(key.starts_with(&query_key!["template"]));
    assert!(!key.starts_with(&query_key!["temp"]));
    assert!(key.starts_with(&QueryKey::root()));
    assert!(!query_key!["position"].starts_with(&query_key!["position", "list"]));

    let detail = query_key!["position", "detail", "42"];
    assert!(!detail.starts_with(&query_key!["position", "detail", "4"]));
  }

  #[test]
  fn fingerprint_ignores_key_order_and_empty_values() {
    let a = json!({"status": "applied", "company": "Acme", "search": ""});
    let b = json!({"company": "Acme", "location": null, "status": "applied", "tags": []});
    assert_eq!(filter_fingerprint(&a), filter_fingerprint(&b));

    let c = json!({"company": "Acme", "status": "offer"});
    assert_ne!(filter_fingerprint(&a), filter_fingerprint(&c));
  }

  #[test]
  fn empty_filter_fingerprint_is_empty_segment() {
    assert_eq!(filter_fingerprint(&json!({})), Segment::Str(String::new()));
    assert_eq!(
      filter_fingerprint(&json!({"search": "  ", "page": null})),
      Segment::Str(String::new())
    );
  }

  #[test]
  fn fingerprint_has_fixed_length() {
    match filter_fingerprint(&json!({"company": "Acme"})) {
      Segment::Str(s) => assert_eq!(s.len(), FINGERPRINT_LEN),
      other => panic!("unexpected segment {:?}", other),
    }
  }

  #[test]
  fn keys_serialize_as_scalar_arrays() {
    let key = query_key!["position", "detail", 42, true];
    let json = serde_json::to_string(&key).unwrap();
    assert_eq!(json, r#"["position","detail",42,true]"#);
    let back: QueryKey = serde_json::from_str(&json).unwrap();
    assert_eq!(back, key);
  }

  #[test]
  fn display_joins_segments() {
    assert_eq!(query_key!["position", "list", ""].to_string(), "position/list/");
    assert_eq!(query_key!["interview", 7].to_string(), "interview/7");
  }

  #[test]
  fn key_filter_variants() {
    let key = query_key!["position", "detail", "42"];
    assert!(KeyFilter::Exact(key.clone()).matches(&key));
    assert!(!KeyFilter::Exact(query_key!["position"]).matches(&key));
    assert!(KeyFilter::Prefix(query_key!["position"]).matches(&key));
    assert!(KeyFilter::All.matches(&key));
  }
}
