use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::cache::StorePolicy;
use crate::invalidation::{Dependency, InvalidationEngine, InvalidationRules, ResourceRule};
use crate::key::QueryKey;
use crate::persist::{
  BlobStorage, CodecKind, FileStorage, MemoryStorage, NoopStorage, PersistConfig, SqliteStorage,
  DEFAULT_SCHEMA_VERSION,
};
use crate::sync::SyncConfig;

/// All durations are milliseconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub store: StoreConfig,
  pub persistence: PersistenceConfig,
  pub sync: SyncSection,
  pub invalidation: InvalidationConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  pub default_stale_time_ms: i64,
  pub gc_time_ms: i64,
  /// Stale time per key family, e.g. slow-moving statistics
  pub families: Vec<FamilyConfig>,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      default_stale_time_ms: 300_000,
      gc_time_ms: 300_000,
      families: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FamilyConfig {
  pub prefix: QueryKey,
  pub stale_time_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
  /// SQLite database, one row per namespace
  #[default]
  Sqlite,
  /// One file per namespace in a directory
  File,
  /// Kept in memory; lost on exit
  Memory,
  /// Persistence disabled
  None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
  pub backend: Backend,
  /// Database file or directory; defaults under the user data directory
  pub path: Option<PathBuf>,
  pub namespace: String,
  pub codec: CodecKind,
  pub include: Vec<QueryKey>,
  pub exclude: Vec<QueryKey>,
  pub max_age_ms: i64,
  pub schema_version: u32,
  pub throttle_ms: u64,
  /// Restore the snapshot when the client starts
  pub restore_on_start: bool,
}

impl Default for PersistenceConfig {
  fn default() -> Self {
    Self {
      backend: Backend::default(),
      path: None,
      namespace: "querycache".to_string(),
      codec: CodecKind::default(),
      include: Vec::new(),
      exclude: Vec::new(),
      max_age_ms: 86_400_000,
      schema_version: DEFAULT_SCHEMA_VERSION,
      throttle_ms: 1_000,
      restore_on_start: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSection {
  /// `null` disables the periodic sweep
  pub interval_ms: Option<u64>,
  pub refetch_on_reconnect: bool,
  pub refetch_on_focus: bool,
  pub idle_threshold_ms: i64,
  pub critical: Vec<QueryKey>,
}

impl Default for SyncSection {
  fn default() -> Self {
    Self {
      interval_ms: Some(60_000),
      refetch_on_reconnect: true,
      refetch_on_focus: true,
      idle_threshold_ms: 30_000,
      critical: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RulePreset {
  /// Positions, interviews and statistics
  #[default]
  Tracker,
  /// Start from an empty table
  None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
  pub preset: RulePreset,
  pub refetch_active: bool,
  /// Added to the preset; a rule for a resource already there replaces it
  pub rules: Vec<RuleConfig>,
}

impl Default for InvalidationConfig {
  fn default() -> Self {
    Self {
      preset: RulePreset::default(),
      refetch_active: true,
      rules: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
  pub resource: String,
  pub list_prefix: Option<QueryKey>,
  pub detail_prefix: Option<QueryKey>,
  #[serde(default)]
  pub dependents: Vec<Dependency>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Used when `RUST_LOG` is not set
  pub level: String,
  /// Append logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./querycache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/querycache/config.yaml
  ///
  /// Without a file, defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("querycache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("querycache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  pub fn store_policy(&self) -> StorePolicy {
    let mut policy = StorePolicy::default()
      .with_default_stale_time(Duration::milliseconds(self.store.default_stale_time_ms))
      .with_gc_time(Duration::milliseconds(self.store.gc_time_ms));
    for family in &self.store.families {
      policy = policy.with_family_stale_time(
        family.prefix.clone(),
        Duration::milliseconds(family.stale_time_ms),
      );
    }
    policy
  }

  pub fn persist_config(&self) -> PersistConfig {
    let p = &self.persistence;
    PersistConfig {
      namespace: p.namespace.clone(),
      include_prefixes: p.include.clone(),
      exclude_prefixes: p.exclude.clone(),
      max_age: Duration::milliseconds(p.max_age_ms),
      schema_version: p.schema_version,
      throttle: StdDuration::from_millis(p.throttle_ms),
    }
  }

  pub fn sync_config(&self) -> SyncConfig {
    SyncConfig {
      interval: self.sync.interval_ms.map(StdDuration::from_millis),
      refetch_on_reconnect: self.sync.refetch_on_reconnect,
      refetch_on_focus: self.sync.refetch_on_focus,
      idle_threshold: Duration::milliseconds(self.sync.idle_threshold_ms),
      critical_keys: self.sync.critical.clone(),
    }
  }

  pub fn invalidation_rules(&self) -> InvalidationRules {
    let mut rules = match self.invalidation.preset {
      RulePreset::Tracker => InvalidationRules::tracker_defaults(),
      RulePreset::None => InvalidationRules::new(),
    };
    for rule in &self.invalidation.rules {
      let mut built = ResourceRule::new(rule.resource.as_str());
      if let Some(prefix) = &rule.list_prefix {
        built = built.list_prefix(prefix.clone());
      }
      if let Some(prefix) = &rule.detail_prefix {
        built = built.detail_prefix(prefix.clone());
      }
      for dependency in &rule.dependents {
        built = built.edge(dependency.clone());
      }
      rules.insert(built);
    }
    rules
  }

  pub fn invalidation_engine(&self) -> InvalidationEngine {
    InvalidationEngine::new(self.invalidation_rules())
      .with_refetch_active(self.invalidation.refetch_active)
  }

  /// Open the configured durable storage backend.
  pub fn open_storage(&self) -> Result<Arc<dyn BlobStorage>> {
    let path = self.persistence.path.clone();
    let storage: Arc<dyn BlobStorage> = match self.persistence.backend {
      Backend::Sqlite => match path {
        Some(path) => Arc::new(SqliteStorage::open_at(&path)?),
        None => Arc::new(SqliteStorage::open()?),
      },
      Backend::File => match path {
        Some(path) => Arc::new(FileStorage::new(path)?),
        None => Arc::new(FileStorage::open()?),
      },
      Backend::Memory => Arc::new(MemoryStorage::new()),
      Backend::None => Arc::new(NoopStorage),
    };
    Ok(storage)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::invalidation::{ChangeEvent, InvalidationPlan};
  use crate::query_key;

  const SAMPLE: &str = r#"
store:
  default_stale_time_ms: 60000
  families:
    - prefix: [statistics]
      stale_time_ms: 1800000
persistence:
  backend: memory
  codec: gzip
  include: [[position], [interview]]
  exclude: [[position, draft]]
  max_age_ms: 3600000
  schema_version: 3
sync:
  interval_ms: null
  critical: [[auth, me]]
invalidation:
  rules:
    - resource: note
      dependents:
        - parent_detail: position
        - aggregate: [statistics]
logging:
  level: debug
"#;

  #[test]
  fn empty_file_gives_defaults() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.store.default_stale_time_ms, 300_000);
    assert_eq!(config.persistence.backend, Backend::Sqlite);
    assert_eq!(config.sync.interval_ms, Some(60_000));
    assert!(config.invalidation.refetch_active);
    assert_eq!(config.logging.level, "info");
  }

  #[test]
  fn sections_convert_to_runtime_settings() {
    let config = Config::parse(SAMPLE).unwrap();

    let policy = config.store_policy();
    assert_eq!(policy.default_stale_time, Duration::minutes(1));
    assert_eq!(policy.stale_time_for(&query_key!["statistics", "overview"]), Duration::minutes(30));

    let persist = config.persist_config();
    assert_eq!(persist.schema_version, 3);
    assert_eq!(persist.max_age, Duration::hours(1));
    assert!(persist.selects(&query_key!["interview", "list", ""]));
    assert!(!persist.selects(&query_key!["position", "draft", 1]));
    assert!(!persist.selects(&query_key!["auth", "me"]));
    assert_eq!(config.persistence.codec, CodecKind::Gzip);

    let sync = config.sync_config();
    assert_eq!(sync.interval, None);
    assert_eq!(sync.critical_keys, vec![query_key!["auth", "me"]]);
  }

  #[test]
  fn configured_rules_extend_preset() {
    let config = Config::parse(SAMPLE).unwrap();
    let rules = config.invalidation_rules();
    assert!(rules.get("position").is_some());

    let event = ChangeEvent::updated("note", 5).with_parent("position", 42);
    let plan = InvalidationPlan::for_event(&rules, &event);
    assert!(plan.stales(&query_key!["note", "detail", 5]));
    assert!(plan.stales(&query_key!["position", "detail", 42]));
    assert!(plan.stales(&query_key!["statistics", "timeline"]));
  }

  #[test]
  fn missing_explicit_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/querycache.yaml"))).is_err());
  }

  #[test]
  fn loads_from_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("querycache.yaml");
    std::fs::write(&path, SAMPLE).unwrap();
    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.persistence.backend, Backend::Memory);
    assert!(config.open_storage().is_ok());
  }
}
