//! Durable blob storage backends.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Key-value storage of one opaque blob per namespace.
///
/// Calls are blocking; the persister runs them on the blocking thread pool.
pub trait BlobStorage: Send + Sync {
  fn read_blob(&self, namespace: &str) -> Result<Option<Vec<u8>>>;

  /// Replace the blob for `namespace`.
  fn write_blob(&self, namespace: &str, bytes: &[u8]) -> Result<()>;

  /// Delete the blob; deleting a missing blob is not an error.
  fn delete_blob(&self, namespace: &str) -> Result<()>;
}

/// Storage that never holds anything.
/// Used when persistence is disabled.
pub struct NoopStorage;

impl BlobStorage for NoopStorage {
  fn read_blob(&self, _namespace: &str) -> Result<Option<Vec<u8>>> {
    Ok(None) // Always miss
  }

  fn write_blob(&self, _namespace: &str, _bytes: &[u8]) -> Result<()> {
    Ok(()) // Discard
  }

  fn delete_blob(&self, _namespace: &str) -> Result<()> {
    Ok(())
  }
}

/// Process-local storage, mostly for tests.
#[derive(Default)]
pub struct MemoryStorage {
  blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl BlobStorage for MemoryStorage {
  fn read_blob(&self, namespace: &str) -> Result<Option<Vec<u8>>> {
    let blobs = self.blobs.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(blobs.get(namespace).cloned())
  }

  fn write_blob(&self, namespace: &str, bytes: &[u8]) -> Result<()> {
    let mut blobs = self.blobs.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    blobs.insert(namespace.to_string(), bytes.to_vec());
    Ok(())
  }

  fn delete_blob(&self, namespace: &str) -> Result<()> {
    let mut blobs = self.blobs.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    blobs.remove(namespace);
    Ok(())
  }
}

/// SQLite-based blob storage, one row per namespace.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the database at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&default_data_dir()?.join("cache.db"))
  }

  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// An in-memory database that disappears with the connection.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for the blob table.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(BLOB_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for the blob table.
const BLOB_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS blob_store (
    namespace TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    written_at TEXT NOT NULL
);
"#;

impl BlobStorage for SqliteStorage {
  fn read_blob(&self, namespace: &str) -> Result<Option<Vec<u8>>> {
    let conn = self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT data FROM blob_store WHERE namespace = ?",
        params![namespace],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache blob '{}': {}", namespace, e))
  }

  fn write_blob(&self, namespace: &str, bytes: &[u8]) -> Result<()> {
    let conn = self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO blob_store (namespace, data, written_at) VALUES (?, ?, ?)",
        params![namespace, bytes, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to write cache blob '{}': {}", namespace, e))?;

    Ok(())
  }

  fn delete_blob(&self, namespace: &str) -> Result<()> {
    let conn = self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM blob_store WHERE namespace = ?", params![namespace])
      .map_err(|e| eyre!("Failed to delete cache blob '{}': {}", namespace, e))?;

    Ok(())
  }
}

/// One file per namespace in a directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// crash mid-write leaves the previous blob intact.
pub struct FileStorage {
  dir: PathBuf,
}

impl FileStorage {
  pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
    let dir = dir.into();
    fs::create_dir_all(&dir)
      .map_err(|e| eyre!("Failed to create cache directory {}: {}", dir.display(), e))?;
    Ok(Self { dir })
  }

  /// Directory under the default data location.
  pub fn open() -> Result<Self> {
    Self::new(default_data_dir()?.join("blobs"))
  }

  fn path_for(&self, namespace: &str) -> PathBuf {
    let safe: String = namespace
      .chars()
      .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
      .collect();
    self.dir.join(format!("{}.blob", safe))
  }
}

impl BlobStorage for FileStorage {
  fn read_blob(&self, namespace: &str) -> Result<Option<Vec<u8>>> {
    let path = self.path_for(namespace);
    match fs::read(&path) {
      Ok(bytes) => Ok(Some(bytes)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(eyre!("Failed to read {}: {}", path.display(), e)),
    }
  }

  fn write_blob(&self, namespace: &str, bytes: &[u8]) -> Result<()> {
    let path = self.path_for(namespace);
    let tmp = path.with_extension("blob.tmp");
    fs::write(&tmp, bytes).map_err(|e| eyre!("Failed to write {}: {}", tmp.display(), e))?;
    fs::rename(&tmp, &path).map_err(|e| eyre!("Failed to replace {}: {}", path.display(), e))?;
    Ok(())
  }

  fn delete_blob(&self, namespace: &str) -> Result<()> {
    let path = self.path_for(namespace);
    match fs::remove_file(&path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(eyre!("Failed to delete {}: {}", path.display(), e)),
    }
  }
}

/// `<data dir>/querycache`.
pub fn default_data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("querycache"))
}
