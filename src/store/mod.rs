//! Durable storage for exercise rules and set state
//!
//! The engine never keeps authoritative state in memory across calls; every
//! operation reloads from a `SessionStore` and writes back through
//! [`SessionStore::save_set`], a compare-and-swap on the set's version.

pub mod memory;
pub mod sqlite;

use chrono::{DateTime, Utc};

use crate::models::{Exercise, ExerciseId, NewSet, SetActivity, SetId, SetState};

pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;

/// Store error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The persisted version moved since the caller loaded the set
    #[error("Version conflict on set {set_id}: expected version {expected}")]
    Conflict { set_id: SetId, expected: u64 },

    #[error("Set {0} is missing from the store")]
    MissingSet(SetId),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Keyed storage for the exercise catalog and training sets.
///
/// Implementations must make `save_set` atomic: either the whole new state
/// (aggregate and appended reps) is visible afterwards or none of it is.
pub trait SessionStore: Send + Sync {
    fn load_exercise(&self, exercise_id: ExerciseId) -> Result<Option<Exercise>, StoreError>;

    /// Insert or replace a catalog record
    fn upsert_exercise(&self, exercise: &Exercise) -> Result<(), StoreError>;

    /// Case-insensitive substring match on `primary_muscle`, ordered by id
    fn list_exercises(
        &self,
        muscle: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Exercise>, StoreError>;

    /// Persist a new set and hand it back Active with its assigned id
    fn create_set(&self, new_set: NewSet) -> Result<SetState, StoreError>;

    fn load_set(&self, set_id: SetId) -> Result<Option<SetState>, StoreError>;

    /// Write `state` only if the stored version still equals `expected_version`.
    ///
    /// Fails with [`StoreError::Conflict`] when another writer got there first
    /// and [`StoreError::MissingSet`] when the set does not exist.
    fn save_set(&self, state: &SetState, expected_version: u64) -> Result<(), StoreError>;

    /// Active sets not updated since `idle_since`, oldest first
    fn stale_sets(&self, idle_since: DateTime<Utc>) -> Result<Vec<SetActivity>, StoreError>;
}
