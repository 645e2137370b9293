//! In-process `SessionStore` used by tests and dry runs

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{SessionStore, StoreError};
use crate::models::{Exercise, ExerciseId, NewSet, SetActivity, SetId, SetState, SetStatus};

pub struct MemorySessionStore {
    exercises: RwLock<HashMap<ExerciseId, Exercise>>,
    sets: RwLock<HashMap<SetId, SetState>>,
    next_set_id: AtomicI64,
    fail_writes: AtomicBool,
    exercise_reads: AtomicU64,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            exercises: RwLock::new(HashMap::new()),
            sets: RwLock::new(HashMap::new()),
            next_set_id: AtomicI64::new(1),
            fail_writes: AtomicBool::new(false),
            exercise_reads: AtomicU64::new(0),
        }
    }

    /// Make every subsequent write fail with `Unavailable`
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of catalog lookups served so far
    pub fn exercise_reads(&self) -> u64 {
        self.exercise_reads.load(Ordering::SeqCst)
    }

    pub fn set_count(&self) -> usize {
        self.sets.read().map(|sets| sets.len()).unwrap_or(0)
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }

    fn read_sets(&self) -> Result<RwLockReadGuard<'_, HashMap<SetId, SetState>>, StoreError> {
        self.sets
            .read()
            .map_err(|_| StoreError::Unavailable("set table lock poisoned".to_string()))
    }

    fn write_sets(&self) -> Result<RwLockWriteGuard<'_, HashMap<SetId, SetState>>, StoreError> {
        self.sets
            .write()
            .map_err(|_| StoreError::Unavailable("set table lock poisoned".to_string()))
    }
}

impl SessionStore for MemorySessionStore {
    fn load_exercise(&self, exercise_id: ExerciseId) -> Result<Option<Exercise>, StoreError> {
        self.exercise_reads.fetch_add(1, Ordering::SeqCst);
        let exercises = self
            .exercises
            .read()
            .map_err(|_| StoreError::Unavailable("catalog lock poisoned".to_string()))?;
        Ok(exercises.get(&exercise_id).cloned())
    }

    fn upsert_exercise(&self, exercise: &Exercise) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut exercises = self
            .exercises
            .write()
            .map_err(|_| StoreError::Unavailable("catalog lock poisoned".to_string()))?;
        exercises.insert(exercise.id, exercise.clone());
        Ok(())
    }

    fn list_exercises(
        &self,
        muscle: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Exercise>, StoreError> {
        let exercises = self
            .exercises
            .read()
            .map_err(|_| StoreError::Unavailable("catalog lock poisoned".to_string()))?;
        let needle = muscle.map(str::to_lowercase);

        let mut matches: Vec<Exercise> = exercises
            .values()
            .filter(|e| match &needle {
                None => true,
                Some(needle) => e
                    .primary_muscle
                    .as_deref()
                    .map(|m| m.to_lowercase().contains(needle.as_str()))
                    .unwrap_or(false),
            })
            .cloned()
            .collect();
        matches.sort_by_key(|e| e.id);
        matches.truncate(limit);
        Ok(matches)
    }

    fn create_set(&self, new_set: NewSet) -> Result<SetState, StoreError> {
        self.check_writable()?;
        let mut sets = self.write_sets()?;
        let set_id = self.next_set_id.fetch_add(1, Ordering::SeqCst);
        let state = SetState::activate(set_id, new_set);
        sets.insert(set_id, state.clone());
        Ok(state)
    }

    fn load_set(&self, set_id: SetId) -> Result<Option<SetState>, StoreError> {
        Ok(self.read_sets()?.get(&set_id).cloned())
    }

    fn save_set(&self, state: &SetState, expected_version: u64) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut sets = self.write_sets()?;

        let current = sets
            .get(&state.set_id)
            .ok_or(StoreError::MissingSet(state.set_id))?;
        if current.version != expected_version {
            return Err(StoreError::Conflict {
                set_id: state.set_id,
                expected: expected_version,
            });
        }
        if state.version <= expected_version {
            return Err(StoreError::Integrity(format!(
                "set {} saved without a version bump",
                state.set_id
            )));
        }

        sets.insert(state.set_id, state.clone());
        Ok(())
    }

    fn stale_sets(&self, idle_since: DateTime<Utc>) -> Result<Vec<SetActivity>, StoreError> {
        let sets = self.read_sets()?;
        let mut stale: Vec<SetActivity> = sets
            .values()
            .filter(|s| s.status == SetStatus::Active && s.updated_at < idle_since)
            .map(|s| SetActivity {
                set_id: s.set_id,
                workout_id: s.workout_id,
                exercise_id: s.exercise_id,
                rep_count: s.rep_count,
                updated_at: s.updated_at,
            })
            .collect();
        stale.sort_by_key(|a| (a.updated_at, a.set_id));
        Ok(stale)
    }
}
