//! Persistence of the cache across process restarts.
//!
//! One blob per namespace holds a versioned snapshot of selected entries:
//! - Pluggable codecs (identity, gzip, base64)
//! - SQLite, file, in-memory and no-op storage backends
//! - Fail-safe restore: anything unusable is discarded and the cache starts cold
//! - Debounced autosave driven by store changes

mod codec;
mod persister;
mod storage;

pub use codec::{Base64Codec, Codec, CodecKind, GzipCodec, IdentityCodec};
pub use persister::{
  AuthorizedFn, MigrationReport, PersistConfig, PersistedRecord, PersistedSize, PersistedSnapshot,
  Persister, RestoreOutcome, RestoreReport, DEFAULT_SCHEMA_VERSION,
};
pub use storage::{default_data_dir, BlobStorage, FileStorage, MemoryStorage, NoopStorage, SqliteStorage};
