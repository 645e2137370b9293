//! Training set lifecycle: start, per-rep ingestion, finalization
//!
//! Every call reloads the set from the session store, applies its change and
//! writes it back with a version check. Calls for the same set id are
//! serialized in-process by a per-set mutex; the version check covers writers
//! in other processes, and a lost race is retried from a fresh load.

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::EngineSettings;
use crate::error::{NotFoundError, RepCoachError, Result};
use crate::models::{
    ExerciseId, NewSet, RepMetrics, RepScore, RuleConfig, SetActivity, SetId, SetState,
    Suggestion, WorkoutId,
};
use crate::scoring;
use crate::store::{SessionStore, StoreError};
use crate::suggestion;

/// Result of StartSet
#[derive(Debug, Clone, PartialEq)]
pub struct StartedSet {
    pub set: SetState,
    /// Targets the client should render; `None` when the exercise has none
    pub rules: Option<RuleConfig>,
}

/// Result of EndSet
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedSet {
    pub suggestion: Suggestion,
    pub set: SetState,
}

enum Outcome<T> {
    /// Persist the mutated state, then return the value
    Save(T),
    /// Nothing changed; return without writing
    Unchanged(T),
}

/// One mutex per set id with in-flight mutations.
///
/// An entry lives only while some caller holds its handle, so sets that are
/// never ended do not accumulate here.
#[derive(Default)]
struct SetLocks {
    locks: Mutex<HashMap<SetId, Arc<Mutex<()>>>>,
}

impl SetLocks {
    fn acquire(&self, set_id: SetId) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| RepCoachError::Internal("set lock table poisoned".to_string()))?;
        Ok(locks.entry(set_id).or_default().clone())
    }

    /// Hand a handle back; the entry is dropped once nobody else holds it
    fn release(&self, set_id: SetId, handle: Arc<Mutex<()>>) {
        if let Ok(mut locks) = self.locks.lock() {
            // One reference in the map, one in `handle`
            if Arc::strong_count(&handle) <= 2 {
                locks.remove(&set_id);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

pub struct SetAggregator {
    store: Arc<dyn SessionStore>,
    settings: EngineSettings,
    rule_cache: RwLock<HashMap<ExerciseId, Option<RuleConfig>>>,
    set_locks: SetLocks,
}

impl SetAggregator {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self::with_settings(store, EngineSettings::default())
    }

    pub fn with_settings(store: Arc<dyn SessionStore>, settings: EngineSettings) -> Self {
        Self {
            store,
            settings,
            rule_cache: RwLock::new(HashMap::new()),
            set_locks: SetLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Open a new Active set for `exercise_id`.
    ///
    /// The exercise's rules are copied into the set, so later catalog edits
    /// do not change how this set is scored.
    pub fn start_set(
        &self,
        workout_id: WorkoutId,
        exercise_id: ExerciseId,
        set_no: i64,
        expected_reps: i64,
    ) -> Result<StartedSet> {
        if set_no < 0 {
            return Err(RepCoachError::Validation(format!(
                "set_no must be non-negative, got {}",
                set_no
            )));
        }
        if expected_reps < 0 {
            return Err(RepCoachError::Validation(format!(
                "expected_reps must be non-negative, got {}",
                expected_reps
            )));
        }

        let rules = self.load_rules(exercise_id)?;
        let set = self.store.create_set(NewSet {
            workout_id,
            exercise_id,
            set_no,
            expected_reps,
            rules: rules.clone(),
            created_at: Utc::now(),
        })?;

        info!(
            set_id = set.set_id,
            workout_id,
            exercise_id,
            set_no,
            rule_count = rules.as_ref().map(RuleConfig::len).unwrap_or(0),
            "Set started"
        );

        Ok(StartedSet { set, rules })
    }

    /// Score one rep and fold it into the set's aggregate.
    ///
    /// Returns this rep's score, not the running aggregate. `rep_index` is a
    /// label only; repeated or out-of-order values are recorded as new reps.
    pub fn record_rep(
        &self,
        set_id: SetId,
        rep_index: i64,
        exercise_id: Option<ExerciseId>,
        metrics: RepMetrics,
    ) -> Result<RepScore> {
        let score = self.update_set(set_id, |state| {
            if state.is_finalized() {
                return Err(NotFoundError::SetFinalized { set_id }.into());
            }
            if let Some(exercise_id) = exercise_id {
                if exercise_id != state.exercise_id {
                    return Err(RepCoachError::Validation(format!(
                        "set {} belongs to exercise {}, not {}",
                        set_id, state.exercise_id, exercise_id
                    )));
                }
            }

            let score = scoring::evaluate(&metrics, state.rules.as_ref());
            state.apply_rep(rep_index, metrics.clone(), &score, Utc::now())?;
            Ok(Outcome::Save(score))
        })?;

        debug!(
            set_id,
            rep_index,
            score = score.score,
            violations = ?score.violations,
            "Rep recorded"
        );
        Ok(score)
    }

    /// Close the set and pick its coaching cue.
    ///
    /// Ending an already Finalized set returns the stored suggestion.
    pub fn end_set(&self, set_id: SetId) -> Result<FinalizedSet> {
        let finalized = self.update_set(set_id, |state| {
            if state.is_finalized() {
                if let Some(suggestion) = state.suggestion.clone() {
                    return Ok(Outcome::Unchanged(FinalizedSet {
                        suggestion,
                        set: state.clone(),
                    }));
                }
            }

            let suggestion = suggestion::select(&state.histogram);
            state.finalize(suggestion.clone(), Utc::now());
            Ok(Outcome::Save(FinalizedSet {
                suggestion,
                set: state.clone(),
            }))
        })?;

        info!(
            set_id,
            rep_count = finalized.set.rep_count,
            mean_score = ?finalized.set.mean_score(),
            violation = ?finalized.suggestion.violation,
            "Set finalized"
        );
        Ok(finalized)
    }

    /// Current persisted state of a set, in any status
    pub fn get_set(&self, set_id: SetId) -> Result<SetState> {
        Ok(self
            .store
            .load_set(set_id)?
            .ok_or(NotFoundError::Set { set_id })?)
    }

    /// Active sets idle for longer than `idle_for`, oldest first
    pub fn stale_sets(&self, idle_for: Duration) -> Result<Vec<SetActivity>> {
        Ok(self.store.stale_sets(Utc::now() - idle_for)?)
    }

    /// Active sets idle past the configured threshold
    pub fn default_stale_sets(&self) -> Result<Vec<SetActivity>> {
        self.stale_sets(Duration::minutes(self.settings.stale_after_minutes))
    }

    /// Forget cached rules for one exercise after a catalog edit
    pub fn invalidate_rules(&self, exercise_id: ExerciseId) {
        if let Ok(mut cache) = self.rule_cache.write() {
            cache.remove(&exercise_id);
        }
    }

    pub fn clear_rule_cache(&self) {
        if let Ok(mut cache) = self.rule_cache.write() {
            cache.clear();
        }
    }

    fn load_rules(&self, exercise_id: ExerciseId) -> Result<Option<RuleConfig>> {
        if self.settings.cache_rules {
            if let Ok(cache) = self.rule_cache.read() {
                if let Some(rules) = cache.get(&exercise_id) {
                    return Ok(rules.clone());
                }
            }
        }

        let exercise = self
            .store
            .load_exercise(exercise_id)?
            .ok_or(NotFoundError::Exercise { exercise_id })?;

        if self.settings.cache_rules {
            if let Ok(mut cache) = self.rule_cache.write() {
                cache.insert(exercise_id, exercise.rules.clone());
            }
        }
        Ok(exercise.rules)
    }

    /// Load, apply, compare-and-swap, retrying on version conflicts
    fn update_set<T, F>(&self, set_id: SetId, apply: F) -> Result<T>
    where
        F: FnMut(&mut SetState) -> Result<Outcome<T>>,
    {
        let handle = self.set_locks.acquire(set_id)?;
        let result = match handle.lock() {
            Ok(_guard) => self.apply_with_retry(set_id, apply),
            Err(_) => Err(RepCoachError::Internal(format!(
                "lock for set {} poisoned",
                set_id
            ))),
        };
        self.set_locks.release(set_id, handle);
        result
    }

    fn apply_with_retry<T, F>(&self, set_id: SetId, mut apply: F) -> Result<T>
    where
        F: FnMut(&mut SetState) -> Result<Outcome<T>>,
    {
        let max_attempts = self.settings.max_save_attempts.max(1);
        let mut attempt = 1;
        loop {
            let mut state = self
                .store
                .load_set(set_id)?
                .ok_or(NotFoundError::Set { set_id })?;
            let expected_version = state.version;

            let value = match apply(&mut state)? {
                Outcome::Unchanged(value) => return Ok(value),
                Outcome::Save(value) => value,
            };

            match self.store.save_set(&state, expected_version) {
                Ok(()) => return Ok(value),
                Err(StoreError::Conflict { .. }) if attempt < max_attempts => {
                    warn!(set_id, attempt, "Set changed underneath us, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
