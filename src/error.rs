use thiserror::Error;

use crate::key::QueryKey;
use crate::mutation::{MutationId, MutationState};

/// Errors surfaced by cache operations.
///
/// Cloneable so every caller de-duplicated onto one in-flight fetch receives
/// the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
  /// The fetcher failed after exhausting its retry policy. The entry keeps
  /// its last good data.
  #[error("fetch failed for {key}: {message}")]
  Fetch { key: QueryKey, message: String },

  /// The server rejected a write; the optimistic state has been rolled back.
  #[error("mutation rejected: {message}")]
  Mutation { message: String },

  /// The persisted blob could not be used and was discarded.
  #[error("persisted cache discarded: {0}")]
  PersistenceCorruption(String),

  /// The fetch was abandoned (key removed, cancelled, or superseded).
  #[error("fetch for {key} was cancelled")]
  Cancelled { key: QueryKey },

  #[error("key {key} is not part of mutation {mutation}")]
  NotSnapshotted { key: QueryKey, mutation: MutationId },

  #[error("mutation {mutation} cannot move from {from:?} to {to:?}")]
  InvalidTransition {
    mutation: MutationId,
    from: MutationState,
    to: MutationState,
  },

  #[error("cache is closed")]
  Closed,
}
