//! Snapshot the cache to durable storage and bring it back on start-up.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheData, CacheEntry, CacheStore};
use crate::error::CacheError;
use crate::key::QueryKey;

use super::codec::{Codec, IdentityCodec};
use super::storage::BlobStorage;

/// Bump whenever the shape of cached data changes.
pub const DEFAULT_SCHEMA_VERSION: u32 = 1;

/// Opaque "is the caller authorized" predicate.
pub type AuthorizedFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// What to persist and for how long it stays usable.
#[derive(Debug, Clone)]
pub struct PersistConfig {
  /// Storage namespace holding the blob
  pub namespace: String,
  /// Persist only keys under one of these prefixes; empty means everything
  pub include_prefixes: Vec<QueryKey>,
  /// Never persist keys under these prefixes
  pub exclude_prefixes: Vec<QueryKey>,
  /// Blobs and records older than this are discarded on restore
  pub max_age: Duration,
  pub schema_version: u32,
  /// Autosave waits this long after a change to batch further changes
  pub throttle: StdDuration,
}

impl Default for PersistConfig {
  fn default() -> Self {
    Self {
      namespace: "querycache".to_string(),
      include_prefixes: Vec::new(),
      exclude_prefixes: Vec::new(),
      max_age: Duration::hours(24),
      schema_version: DEFAULT_SCHEMA_VERSION,
      throttle: StdDuration::from_secs(1),
    }
  }
}

impl PersistConfig {
  /// Include/exclude are prefix matches on whole segments.
  pub fn selects(&self, key: &QueryKey) -> bool {
    let included = self.include_prefixes.is_empty()
      || self.include_prefixes.iter().any(|p| key.starts_with(p));
    included && !self.exclude_prefixes.iter().any(|p| key.starts_with(p))
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord<T> {
  pub key: QueryKey,
  pub data: T,
  pub data_updated_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub stale_time_ms: Option<i64>,
  /// Set when the entry was invalidated before its stale time ran out.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub stale_at: Option<DateTime<Utc>>,
  pub schema_version: u32,
}

/// The blob envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot<T> {
  pub schema_version: u32,
  pub snapshot_timestamp: DateTime<Utc>,
  pub entries: Vec<PersistedRecord<T>>,
}

/// Why a restore did or did not load anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
  /// No blob stored
  Empty,
  Restored,
  /// Written by another schema version; the blob was deleted
  SchemaMismatch { found: u32, expected: u32 },
  /// Older than the max age; the blob was deleted
  Expired,
  /// Undecodable; the blob was deleted
  Corrupt(CacheError),
  Unauthorized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
  pub restored: usize,
  /// Records dropped for age or version, or because memory held newer data
  pub skipped: usize,
  pub outcome: RestoreOutcome,
}

impl RestoreReport {
  fn nothing(outcome: RestoreOutcome) -> Self {
    Self {
      restored: 0,
      skipped: 0,
      outcome,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistedSize {
  pub byte_count: usize,
  pub entry_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
  pub migrated: usize,
  pub dropped: usize,
}

/// Writes and reads the cache snapshot through a codec and a blob store.
///
/// All blob I/O goes through one async gate, so writes never interleave and
/// each write captures the store as of the moment it got the gate.
pub struct Persister {
  storage: Arc<dyn BlobStorage>,
  codec: Arc<dyn Codec>,
  config: PersistConfig,
  gate: AsyncMutex<()>,
  authorized: Option<AuthorizedFn>,
}

impl fmt::Debug for Persister {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Persister")
      .field("codec", &self.codec.name())
      .field("config", &self.config)
      .field("gated", &self.authorized.is_some())
      .finish_non_exhaustive()
  }
}

impl Persister {
  pub fn new(storage: Arc<dyn BlobStorage>, config: PersistConfig) -> Self {
    Self {
      storage,
      codec: Arc::new(IdentityCodec),
      config,
      gate: AsyncMutex::new(()),
      authorized: None,
    }
  }

  pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
    self.codec = codec;
    self
  }

  /// Skip persist and restore while `authorized` returns false.
  pub fn with_authorization<F>(mut self, authorized: F) -> Self
  where
    F: Fn() -> bool + Send + Sync + 'static,
  {
    self.authorized = Some(Arc::new(authorized));
    self
  }

  pub fn config(&self) -> &PersistConfig {
    &self.config
  }

  fn is_authorized(&self) -> bool {
    self.authorized.as_ref().map_or(true, |authorized| authorized())
  }

  // --------------------------------------------------------------------------
  // Blob I/O
  // --------------------------------------------------------------------------

  async fn read_blob(&self) -> Result<Option<Vec<u8>>> {
    let storage = Arc::clone(&self.storage);
    let namespace = self.config.namespace.clone();
    tokio::task::spawn_blocking(move || storage.read_blob(&namespace))
      .await
      .map_err(|e| eyre!("Blob read task failed: {}", e))?
  }

  async fn write_blob(&self, bytes: Vec<u8>) -> Result<()> {
    let storage = Arc::clone(&self.storage);
    let namespace = self.config.namespace.clone();
    tokio::task::spawn_blocking(move || storage.write_blob(&namespace, &bytes))
      .await
      .map_err(|e| eyre!("Blob write task failed: {}", e))?
  }

  async fn delete_blob(&self) -> Result<()> {
    let storage = Arc::clone(&self.storage);
    let namespace = self.config.namespace.clone();
    tokio::task::spawn_blocking(move || storage.delete_blob(&namespace))
      .await
      .map_err(|e| eyre!("Blob delete task failed: {}", e))?
  }

  /// Read and decode the blob into raw JSON.
  ///
  /// `Ok(Err(reason))` means the blob exists but is unusable.
  async fn read_json(&self) -> Result<Option<std::result::Result<Value, String>>> {
    let Some(bytes) = self.read_blob().await? else {
      return Ok(None);
    };
    let decoded = match self.codec.decode(&bytes) {
      Ok(decoded) => decoded,
      Err(e) => return Ok(Some(Err(format!("{:#}", e)))),
    };
    Ok(Some(
      serde_json::from_slice::<Value>(&decoded).map_err(|e| format!("invalid JSON: {}", e)),
    ))
  }

  async fn write_json(&self, value: &Value) -> Result<usize> {
    let json =
      serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize cache snapshot: {}", e))?;
    let bytes = self.codec.encode(&json)?;
    let len = bytes.len();
    self.write_blob(bytes).await?;
    Ok(len)
  }

  /// Discard an unusable blob.
  async fn discard(&self, reason: &str) -> Result<()> {
    warn!(namespace = %self.config.namespace, reason, "discarding persisted cache");
    self.delete_blob().await
  }

  // --------------------------------------------------------------------------
  // Operations
  // --------------------------------------------------------------------------

  /// Write every selected entry that holds data as one blob, replacing the
  /// previous one. Returns `None` when skipped as unauthorized.
  pub async fn persist<T: CacheData>(&self, store: &CacheStore<T>) -> Result<Option<PersistedSize>> {
    if !self.is_authorized() {
      debug!("persist skipped: unauthorized");
      return Ok(None);
    }
    let _gate = self.gate.lock().await;

    let snapshot = self.snapshot(store);
    let entry_count = snapshot.entries.len();
    let value = serde_json::to_value(&snapshot)
      .map_err(|e| eyre!("Failed to serialize cache snapshot: {}", e))?;
    let byte_count = self.write_json(&value).await?;

    debug!(entries = entry_count, bytes = byte_count, "cache persisted");
    Ok(Some(PersistedSize {
      byte_count,
      entry_count,
    }))
  }

  fn snapshot<T: CacheData>(&self, store: &CacheStore<T>) -> PersistedSnapshot<T> {
    let entries = store
      .entries()
      .into_iter()
      .filter(|entry| self.config.selects(&entry.key))
      .filter_map(|entry| self.record(entry))
      .collect();
    PersistedSnapshot {
      schema_version: self.config.schema_version,
      snapshot_timestamp: store.now(),
      entries,
    }
  }

  fn record<T>(&self, entry: CacheEntry<T>) -> Option<PersistedRecord<T>> {
    let data_updated_at = entry.data_updated_at?;
    let stale_at = entry
      .stale_at
      .filter(|stale_at| *stale_at < data_updated_at + entry.stale_time);
    Some(PersistedRecord {
      data_updated_at,
      data: entry.data?,
      stale_time_ms: Some(entry.stale_time.num_milliseconds()),
      stale_at,
      schema_version: self.config.schema_version,
      key: entry.key,
    })
  }

  /// Load the blob into `store`.
  ///
  /// Never starts a fetch and never overwrites an entry holding newer data.
  /// Blobs that cannot be used are deleted so the next start is clean.
  pub async fn restore<T: CacheData>(&self, store: &CacheStore<T>) -> Result<RestoreReport> {
    if !self.is_authorized() {
      debug!("restore skipped: unauthorized");
      return Ok(RestoreReport::nothing(RestoreOutcome::Unauthorized));
    }
    let _gate = self.gate.lock().await;

    let value = match self.read_json().await? {
      None => return Ok(RestoreReport::nothing(RestoreOutcome::Empty)),
      Some(Ok(value)) => value,
      Some(Err(reason)) => return self.corrupt(reason).await,
    };

    let found = value.get("schema_version").and_then(Value::as_u64);
    let expected = self.config.schema_version;
    match found {
      None => return self.corrupt("missing schema_version".to_string()).await,
      Some(found) if found != u64::from(expected) => {
        self.discard("schema version mismatch").await?;
        return Ok(RestoreReport::nothing(RestoreOutcome::SchemaMismatch {
          found: u32::try_from(found).unwrap_or(u32::MAX),
          expected,
        }));
      }
      Some(_) => {}
    }

    let snapshot: PersistedSnapshot<T> = match serde_json::from_value(value) {
      Ok(snapshot) => snapshot,
      Err(e) => return self.corrupt(format!("invalid snapshot: {}", e)).await,
    };

    let now = store.now();
    let max_age = self.config.max_age;
    if now - snapshot.snapshot_timestamp > max_age {
      self.discard("snapshot expired").await?;
      return Ok(RestoreReport::nothing(RestoreOutcome::Expired));
    }

    let mut report = RestoreReport::nothing(RestoreOutcome::Restored);
    for record in snapshot.entries {
      if record.schema_version != expected {
        report.skipped += 1;
        continue;
      }
      let stale_time = record
        .stale_time_ms
        .map(Duration::milliseconds)
        .unwrap_or_else(|| store.policy().stale_time_for(&record.key));
      if now - (record.data_updated_at + stale_time) > max_age {
        report.skipped += 1;
        continue;
      }
      if store.set_data_if_newer(&record.key, record.data, record.data_updated_at, Some(stale_time)) {
        if let Some(stale_at) = record.stale_at {
          store.mark_stale_at(&record.key, stale_at);
        }
        report.restored += 1;
      } else {
        report.skipped += 1;
      }
    }

    info!(
      restored = report.restored,
      skipped = report.skipped,
      "persisted cache restored"
    );
    Ok(report)
  }

  async fn corrupt(&self, reason: String) -> Result<RestoreReport> {
    self.discard(&reason).await?;
    Ok(RestoreReport::nothing(RestoreOutcome::Corrupt(
      CacheError::PersistenceCorruption(reason),
    )))
  }

  /// Rewrite a blob written under `from_version`: each record's `data` goes
  /// through `transform` and is stamped with the running schema version.
  /// Records whose transform fails are dropped.
  ///
  /// Returns `None` when there is no blob at `from_version`.
  pub async fn migrate<F>(&self, from_version: u32, transform: F) -> Result<Option<MigrationReport>>
  where
    F: Fn(Value) -> Result<Value>,
  {
    let _gate = self.gate.lock().await;

    let mut value = match self.read_json().await? {
      None => return Ok(None),
      Some(Ok(value)) => value,
      Some(Err(reason)) => {
        self.discard(&reason).await?;
        return Ok(None);
      }
    };
    if value.get("schema_version").and_then(Value::as_u64) != Some(u64::from(from_version)) {
      return Ok(None);
    }

    let mut report = MigrationReport::default();
    let records = match value.get_mut("entries").map(Value::take) {
      Some(Value::Array(records)) => records,
      _ => {
        self.discard("snapshot without entries").await?;
        return Ok(None);
      }
    };

    let mut migrated = Vec::with_capacity(records.len());
    for mut record in records {
      let data = record.get_mut("data").map(Value::take).unwrap_or(Value::Null);
      match transform(data) {
        Ok(data) => {
          record["data"] = data;
          record["schema_version"] = Value::from(self.config.schema_version);
          migrated.push(record);
          report.migrated += 1;
        }
        Err(e) => {
          debug!(error = %e, "dropping record that failed migration");
          report.dropped += 1;
        }
      }
    }
    value["entries"] = Value::Array(migrated);
    value["schema_version"] = Value::from(self.config.schema_version);
    self.write_json(&value).await?;

    info!(
      from_version,
      to_version = self.config.schema_version,
      migrated = report.migrated,
      dropped = report.dropped,
      "persisted cache migrated"
    );
    Ok(Some(report))
  }

  /// Decode the stored blob without touching the store or the blob itself.
  pub async fn inspect(&self) -> Result<Option<PersistedSnapshot<Value>>> {
    let _gate = self.gate.lock().await;
    match self.read_json().await? {
      None => Ok(None),
      Some(Ok(value)) => serde_json::from_value(value)
        .map(Some)
        .map_err(|e| eyre!("Persisted cache is not a valid snapshot: {}", e)),
      Some(Err(reason)) => Err(eyre!("Persisted cache is unreadable: {}", reason)),
    }
  }

  /// Size of the stored blob; an unreadable blob counts zero entries.
  pub async fn persisted_size(&self) -> Result<PersistedSize> {
    let _gate = self.gate.lock().await;
    let Some(bytes) = self.read_blob().await? else {
      return Ok(PersistedSize::default());
    };
    let entry_count = self
      .codec
      .decode(&bytes)
      .ok()
      .and_then(|decoded| serde_json::from_slice::<Value>(&decoded).ok())
      .and_then(|value| value.get("entries").and_then(Value::as_array).map(Vec::len))
      .unwrap_or(0);
    Ok(PersistedSize {
      byte_count: bytes.len(),
      entry_count,
    })
  }

  pub async fn clear(&self) -> Result<()> {
    let _gate = self.gate.lock().await;
    self.delete_blob().await?;
    info!(namespace = %self.config.namespace, "persisted cache cleared");
    Ok(())
  }

  /// Persist after the store changes, at most once per throttle window,
  /// until `shutdown` flips to true or its sender goes away.
  pub fn spawn_autosave<T: CacheData>(
    self: Arc<Self>,
    store: CacheStore<T>,
    mut shutdown: watch::Receiver<bool>,
  ) -> JoinHandle<()> {
    let mut changes = store.changes();
    tokio::spawn(async move {
      debug!(throttle = ?self.config.throttle, "autosave started");
      loop {
        if *shutdown.borrow() {
          break;
        }
        tokio::select! {
          changed = changes.changed() => {
            if changed.is_err() {
              break;
            }
          }
          _ = shutdown.changed() => break,
        }
        tokio::select! {
          _ = tokio::time::sleep(self.config.throttle) => {}
          _ = shutdown.changed() => break,
        }
        if let Err(e) = self.persist(&store).await {
          warn!(error = %e, "autosave failed");
        }
      }
      debug!("autosave stopped");
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{SetDataOptions, StorePolicy};
  use crate::clock::ManualClock;
  use crate::persist::codec::GzipCodec;
  use crate::persist::storage::MemoryStorage;
  use crate::query_key;
  use chrono::TimeZone;
  use serde_json::json;
  use std::sync::atomic::{AtomicBool, Ordering};

  const NS: &str = "querycache";

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
  }

  fn store_at(clock: &ManualClock) -> CacheStore<Value> {
    CacheStore::with_clock(StorePolicy::default(), Arc::new(clock.clone()))
  }

  fn persister(storage: &Arc<MemoryStorage>, config: PersistConfig) -> Persister {
    Persister::new(storage.clone(), config)
  }

  fn seed(store: &CacheStore<Value>) {
    store.set_data(&query_key!["position", "list", ""], json!([{"id": 1}]), SetDataOptions::default());
    store.set_data(&query_key!["position", "detail", 1], json!({"id": 1}), SetDataOptions::default());
    store.set_data(&query_key!["auth", "me"], json!({"user": "x"}), SetDataOptions::default());
  }

  #[tokio::test]
  async fn persist_then_restore_round_trips() {
    let clock = ManualClock::new(t0());
    let storage = Arc::new(MemoryStorage::new());
    let persister = persister(&storage, PersistConfig::default());
    let source = store_at(&clock);
    seed(&source);

    let size = persister.persist(&source).await.unwrap().unwrap();
    assert_eq!(size.entry_count, 3);

    let target = store_at(&clock);
    let report = persister.restore(&target).await.unwrap();
    assert_eq!(report.outcome, RestoreOutcome::Restored);
    assert_eq!(report.restored, 3);

    for entry in source.entries() {
      let restored = target.get(&entry.key).unwrap();
      assert_eq!(restored.data, entry.data);
      assert_eq!(restored.data_updated_at, entry.data_updated_at);
      assert_eq!(restored.stale_at, entry.stale_at);
      assert!(!restored.is_fetching());
    }
  }

  #[tokio::test]
  async fn invalidated_entry_stays_stale_after_restore() {
    let clock = ManualClock::new(t0());
    let storage = Arc::new(MemoryStorage::new());
    let persister = persister(&storage, PersistConfig::default());
    let source = store_at(&clock);
    seed(&source);

    clock.advance(Duration::seconds(10));
    source.invalidate_prefix(&query_key!["position"]);
    persister.persist(&source).await.unwrap();

    let target = store_at(&clock);
    assert_eq!(persister.restore(&target).await.unwrap().restored, 3);

    let now = target.now();
    let list = target.get(&query_key!["position", "list", ""]).unwrap();
    assert!(list.is_stale(now));
    assert_eq!(list.stale_time, Duration::minutes(5));
    assert!(target.get(&query_key!["position", "detail", 1]).unwrap().is_stale(now));
    assert!(!target.get(&query_key!["auth", "me"]).unwrap().is_stale(now));
  }

  #[tokio::test]
  async fn include_and_exclude_are_prefix_filters() {
    let clock = ManualClock::new(t0());
    let storage = Arc::new(MemoryStorage::new());
    let config = PersistConfig {
      include_prefixes: vec![query_key!["position"], query_key!["auth"]],
      exclude_prefixes: vec![query_key!["auth"]],
      ..PersistConfig::default()
    };
    let store = store_at(&clock);
    seed(&store);
    store.set_data(&query_key!["positions"], json!(1), SetDataOptions::default());

    let size = persister(&storage, config).persist(&store).await.unwrap().unwrap();
    assert_eq!(size.entry_count, 2);
  }

  #[tokio::test]
  async fn schema_mismatch_discards_blob() {
    let clock = ManualClock::new(t0());
    let storage = Arc::new(MemoryStorage::new());
    let old = persister(&storage, PersistConfig::default());
    let store = store_at(&clock);
    seed(&store);
    old.persist(&store).await.unwrap();

    let current = persister(
      &storage,
      PersistConfig {
        schema_version: 2,
        ..PersistConfig::default()
      },
    );
    let target = store_at(&clock);
    let report = current.restore(&target).await.unwrap();

    assert_eq!(report.outcome, RestoreOutcome::SchemaMismatch { found: 1, expected: 2 });
    assert_eq!(report.restored, 0);
    assert!(target.is_empty());
    assert_eq!(storage.read_blob(NS).unwrap(), None);
  }

  #[tokio::test]
  async fn expired_snapshot_is_discarded() {
    let clock = ManualClock::new(t0());
    let storage = Arc::new(MemoryStorage::new());
    let persister = persister(&storage, PersistConfig::default());
    let store = store_at(&clock);
    seed(&store);
    persister.persist(&store).await.unwrap();

    clock.advance(Duration::hours(25));
    let target = store_at(&clock);
    let report = persister.restore(&target).await.unwrap();
    assert_eq!(report.outcome, RestoreOutcome::Expired);
    assert!(target.is_empty());
    assert_eq!(storage.read_blob(NS).unwrap(), None);
  }

  #[tokio::test]
  async fn old_records_are_skipped() {
    let clock = ManualClock::new(t0());
    let storage = Arc::new(MemoryStorage::new());
    let persister = persister(&storage, PersistConfig::default());
    let store = store_at(&clock);
    store.set_data(
      &query_key!["statistics", "overview"],
      json!({"total": 3}),
      SetDataOptions {
        updated_at: Some(t0() - Duration::hours(30)),
        stale_time: Some(Duration::minutes(5)),
      },
    );
    store.set_data(&query_key!["position", "list", ""], json!([]), SetDataOptions::default());
    persister.persist(&store).await.unwrap();

    let target = store_at(&clock);
    let report = persister.restore(&target).await.unwrap();
    assert_eq!((report.restored, report.skipped), (1, 1));
    assert!(target.get(&query_key!["statistics", "overview"]).is_none());
  }

  #[tokio::test]
  async fn corrupt_blob_is_cleared() {
    let clock = ManualClock::new(t0());
    let storage = Arc::new(MemoryStorage::new());
    storage.write_blob(NS, b"{not json").unwrap();

    let report = persister(&storage, PersistConfig::default())
      .restore(&store_at(&clock))
      .await
      .unwrap();
    assert!(matches!(
      report.outcome,
      RestoreOutcome::Corrupt(CacheError::PersistenceCorruption(_))
    ));
    assert_eq!(storage.read_blob(NS).unwrap(), None);
  }

  #[tokio::test]
  async fn restore_keeps_newer_memory_data() {
    let clock = ManualClock::new(t0());
    let storage = Arc::new(MemoryStorage::new());
    let persister = persister(&storage, PersistConfig::default());
    let key = query_key!["position", "detail", 1];

    let old = store_at(&clock);
    old.set_data(&key, json!({"title": "old"}), SetDataOptions::default());
    persister.persist(&old).await.unwrap();

    clock.advance(Duration::minutes(1));
    let live = store_at(&clock);
    live.set_data(&key, json!({"title": "new"}), SetDataOptions::default());
    let report = persister.restore(&live).await.unwrap();

    assert_eq!(report.restored, 0);
    assert_eq!(live.get(&key).unwrap().data, Some(json!({"title": "new"})));
  }

  #[tokio::test]
  async fn migrate_rewrites_records_and_drops_failures() {
    let clock = ManualClock::new(t0());
    let storage = Arc::new(MemoryStorage::new());
    let store = store_at(&clock);
    store.set_data(&query_key!["position", "detail", 1], json!({"name": "A"}), SetDataOptions::default());
    store.set_data(&query_key!["position", "detail", 2], json!("broken"), SetDataOptions::default());
    persister(&storage, PersistConfig::default()).persist(&store).await.unwrap();

    let v2 = persister(
      &storage,
      PersistConfig {
        schema_version: 2,
        ..PersistConfig::default()
      },
    );
    let report = v2
      .migrate(1, |mut data| {
        let name = data
          .get_mut("name")
          .map(Value::take)
          .ok_or_else(|| eyre!("no name field"))?;
        Ok(json!({"title": name}))
      })
      .await
      .unwrap()
      .unwrap();
    assert_eq!(report, MigrationReport { migrated: 1, dropped: 1 });

    let target = store_at(&clock);
    let restored = v2.restore(&target).await.unwrap();
    assert_eq!(restored.restored, 1);
    assert_eq!(
      target.get(&query_key!["position", "detail", 1]).unwrap().data,
      Some(json!({"title": "A"}))
    );
    assert!(v2.migrate(1, Ok).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn size_and_clear() {
    let clock = ManualClock::new(t0());
    let storage = Arc::new(MemoryStorage::new());
    let persister = persister(&storage, PersistConfig::default()).with_codec(Arc::new(GzipCodec::default()));
    assert_eq!(persister.persisted_size().await.unwrap(), PersistedSize::default());

    let store = store_at(&clock);
    seed(&store);
    let written = persister.persist(&store).await.unwrap().unwrap();
    let size = persister.persisted_size().await.unwrap();
    assert_eq!(size, written);
    assert_eq!(size.entry_count, 3);

    persister.clear().await.unwrap();
    assert_eq!(persister.persisted_size().await.unwrap(), PersistedSize::default());
  }

  #[tokio::test]
  async fn unauthorized_skips_io() {
    let clock = ManualClock::new(t0());
    let storage = Arc::new(MemoryStorage::new());
    let allowed = Arc::new(AtomicBool::new(false));
    let flag = allowed.clone();
    let persister =
      persister(&storage, PersistConfig::default()).with_authorization(move || flag.load(Ordering::SeqCst));
    let store = store_at(&clock);
    seed(&store);

    assert_eq!(persister.persist(&store).await.unwrap(), None);
    assert_eq!(storage.read_blob(NS).unwrap(), None);
    let report = persister.restore(&store).await.unwrap();
    assert_eq!(report.outcome, RestoreOutcome::Unauthorized);

    allowed.store(true, Ordering::SeqCst);
    assert!(persister.persist(&store).await.unwrap().is_some());
  }

  #[tokio::test]
  async fn autosave_persists_after_changes() {
    let clock = ManualClock::new(t0());
    let storage = Arc::new(MemoryStorage::new());
    let config = PersistConfig {
      throttle: StdDuration::from_millis(10),
      ..PersistConfig::default()
    };
    let persister = Arc::new(persister(&storage, config));
    let store = store_at(&clock);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = persister.clone().spawn_autosave(store.clone(), shutdown_rx);

    store.set_data(&query_key!["position", "list", ""], json!([]), SetDataOptions::default());
    store.set_data(&query_key!["position", "detail", 1], json!({}), SetDataOptions::default());
    tokio::time::sleep(StdDuration::from_millis(80)).await;

    assert_eq!(persister.persisted_size().await.unwrap().entry_count, 2);
    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
  }

  #[tokio::test]
  async fn inspect_leaves_blob_alone() {
    let clock = ManualClock::new(t0());
    let storage = Arc::new(MemoryStorage::new());
    let persister = persister(&storage, PersistConfig::default());
    assert_eq!(persister.inspect().await.unwrap(), None);

    let store = store_at(&clock);
    seed(&store);
    persister.persist(&store).await.unwrap();
    let snapshot = persister.inspect().await.unwrap().unwrap();
    assert_eq!(snapshot.entries.len(), 3);
    assert_eq!(snapshot.snapshot_timestamp, t0());

    storage.write_blob(NS, b"not json").unwrap();
    assert!(persister.inspect().await.is_err());
    assert!(storage.read_blob(NS).unwrap().is_some());
  }
}
