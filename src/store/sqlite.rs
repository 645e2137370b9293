use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{SessionStore, StoreError};
use crate::models::{
    Exercise, ExerciseId, NewSet, RecordedRep, RepMetrics, RuleConfig, SetActivity, SetId,
    SetState, SetStatus, Suggestion, ViolationHistogram, ViolationKind,
};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// SQLite-backed session store.
///
/// One connection per store guarded by a mutex. Several processes may open
/// the same file; set updates stay consistent across them through the
/// version check in `save_set`.
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Create or open a store at the specified path
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        Self::open_with_timeout(db_path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_timeout<P: AsRef<Path>>(
        db_path: P,
        busy_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(busy_timeout)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Initialize database schema with tables and indexes
    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS exercises (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                primary_muscle TEXT,
                rules TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workout_id INTEGER NOT NULL,
                exercise_id INTEGER NOT NULL,
                set_no INTEGER NOT NULL,
                expected_reps INTEGER NOT NULL,
                rules TEXT,
                status TEXT NOT NULL,
                score_sum REAL NOT NULL DEFAULT 0,
                rep_count INTEGER NOT NULL DEFAULT 0,
                histogram TEXT NOT NULL DEFAULT '{}',
                suggestion TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                finalized_at TEXT
            );

            -- Append-only rep log; seq is the arrival position within the set
            CREATE TABLE IF NOT EXISTS set_reps (
                set_id INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                rep_index INTEGER NOT NULL,
                metrics TEXT NOT NULL,
                score REAL NOT NULL,
                violations TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (set_id, seq),
                FOREIGN KEY (set_id) REFERENCES sets (id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_sets_status_updated ON sets (status, updated_at);
            CREATE INDEX IF NOT EXISTS idx_exercises_muscle ON exercises (primary_muscle);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }
}

// Lowercased LIKE operand matching `needle` literally under `ESCAPE '\'`
fn like_literal(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len());
    for c in needle.to_lowercase().chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// Fixed-width UTC timestamps so TEXT comparison matches time order
fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp '{}': {}", raw, e)))
}

struct ExerciseRow {
    id: ExerciseId,
    name: String,
    primary_muscle: Option<String>,
    rules: Option<String>,
}

impl ExerciseRow {
    fn into_exercise(self) -> Result<Exercise, StoreError> {
        Ok(Exercise {
            id: self.id,
            name: self.name,
            primary_muscle: self.primary_muscle,
            rules: self
                .rules
                .as_deref()
                .map(serde_json::from_str::<RuleConfig>)
                .transpose()?,
        })
    }
}

struct SetRow {
    id: SetId,
    workout_id: i64,
    exercise_id: ExerciseId,
    set_no: i64,
    expected_reps: i64,
    rules: Option<String>,
    status: String,
    score_sum: f64,
    rep_count: i64,
    histogram: String,
    suggestion: Option<String>,
    version: i64,
    created_at: String,
    updated_at: String,
    finalized_at: Option<String>,
}

struct RepRow {
    rep_index: i64,
    metrics: String,
    score: f64,
    violations: String,
    recorded_at: String,
}

impl RepRow {
    fn into_rep(self) -> Result<RecordedRep, StoreError> {
        Ok(RecordedRep {
            rep_index: self.rep_index,
            metrics: serde_json::from_str::<RepMetrics>(&self.metrics)?,
            score: self.score,
            violations: serde_json::from_str::<Vec<ViolationKind>>(&self.violations)?,
            recorded_at: parse_ts(&self.recorded_at)?,
        })
    }
}

impl SetRow {
    fn into_state(self, reps: Vec<RepRow>) -> Result<SetState, StoreError> {
        let status = SetStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Serialization(format!("unknown set status '{}'", self.status))
        })?;
        let reps = reps
            .into_iter()
            .map(RepRow::into_rep)
            .collect::<Result<Vec<_>, _>>()?;

        if reps.len() as i64 != self.rep_count {
            return Err(StoreError::Integrity(format!(
                "set {} has {} rep rows but rep_count {}",
                self.id,
                reps.len(),
                self.rep_count
            )));
        }

        Ok(SetState {
            set_id: self.id,
            workout_id: self.workout_id,
            exercise_id: self.exercise_id,
            set_no: self.set_no,
            expected_reps: self.expected_reps,
            rules: self
                .rules
                .as_deref()
                .map(serde_json::from_str::<RuleConfig>)
                .transpose()?,
            status,
            reps,
            score_sum: self.score_sum,
            rep_count: self.rep_count as u32,
            histogram: serde_json::from_str::<ViolationHistogram>(&self.histogram)?,
            suggestion: self
                .suggestion
                .as_deref()
                .map(serde_json::from_str::<Suggestion>)
                .transpose()?,
            version: self.version as u64,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            finalized_at: self.finalized_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

impl SessionStore for SqliteSessionStore {
    fn load_exercise(&self, exercise_id: ExerciseId) -> Result<Option<Exercise>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, name, primary_muscle, rules FROM exercises WHERE id = ?1",
                params![exercise_id],
                |row| {
                    Ok(ExerciseRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        primary_muscle: row.get(2)?,
                        rules: row.get(3)?,
                    })
                },
            )
            .optional()?;

        row.map(ExerciseRow::into_exercise).transpose()
    }

    fn upsert_exercise(&self, exercise: &Exercise) -> Result<(), StoreError> {
        let rules = exercise.rules.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO exercises (id, name, primary_muscle, rules, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                primary_muscle = excluded.primary_muscle,
                rules = excluded.rules,
                updated_at = excluded.updated_at
            "#,
            params![
                exercise.id,
                exercise.name,
                exercise.primary_muscle,
                rules,
                format_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn list_exercises(
        &self,
        muscle: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Exercise>, StoreError> {
        let pattern = muscle.map(like_literal);

        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, primary_muscle, rules FROM exercises
            WHERE ?1 IS NULL OR LOWER(primary_muscle) LIKE '%' || ?1 || '%' ESCAPE '\'
            ORDER BY id
            LIMIT ?2
            "#,
        )?;

        let rows = stmt
            .query_map(params![pattern, limit as i64], |row| {
                Ok(ExerciseRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    primary_muscle: row.get(2)?,
                    rules: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(ExerciseRow::into_exercise).collect()
    }

    fn create_set(&self, new_set: NewSet) -> Result<SetState, StoreError> {
        let rules = new_set.rules.as_ref().map(serde_json::to_string).transpose()?;
        let created_at = format_ts(new_set.created_at);

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO sets (
                workout_id, exercise_id, set_no, expected_reps, rules, status,
                score_sum, rep_count, histogram, version, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, '{}', 0, ?7, ?7)
            "#,
            params![
                new_set.workout_id,
                new_set.exercise_id,
                new_set.set_no,
                new_set.expected_reps,
                rules,
                SetStatus::Active.as_str(),
                created_at,
            ],
        )?;
        let set_id = conn.last_insert_rowid();

        Ok(SetState::activate(set_id, new_set))
    }

    fn load_set(&self, set_id: SetId) -> Result<Option<SetState>, StoreError> {
        let mut conn = self.lock()?;
        // Read the aggregate and its reps from one snapshot
        let tx = conn.transaction()?;

        let row = tx
            .query_row(
                r#"
                SELECT id, workout_id, exercise_id, set_no, expected_reps, rules, status,
                       score_sum, rep_count, histogram, suggestion, version,
                       created_at, updated_at, finalized_at
                FROM sets WHERE id = ?1
                "#,
                params![set_id],
                |row| {
                    Ok(SetRow {
                        id: row.get(0)?,
                        workout_id: row.get(1)?,
                        exercise_id: row.get(2)?,
                        set_no: row.get(3)?,
                        expected_reps: row.get(4)?,
                        rules: row.get(5)?,
                        status: row.get(6)?,
                        score_sum: row.get(7)?,
                        rep_count: row.get(8)?,
                        histogram: row.get(9)?,
                        suggestion: row.get(10)?,
                        version: row.get(11)?,
                        created_at: row.get(12)?,
                        updated_at: row.get(13)?,
                        finalized_at: row.get(14)?,
                    })
                },
            )
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };

        let reps = {
            let mut stmt = tx.prepare(
                r#"
                SELECT rep_index, metrics, score, violations, recorded_at
                FROM set_reps WHERE set_id = ?1 ORDER BY seq
                "#,
            )?;
            let reps = stmt
                .query_map(params![set_id], |r| {
                    Ok(RepRow {
                        rep_index: r.get(0)?,
                        metrics: r.get(1)?,
                        score: r.get(2)?,
                        violations: r.get(3)?,
                        recorded_at: r.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            reps
        }; // Statement is dropped here

        tx.commit()?;
        row.into_state(reps).map(Some)
    }

    fn save_set(&self, state: &SetState, expected_version: u64) -> Result<(), StoreError> {
        let histogram = serde_json::to_string(&state.histogram)?;
        let suggestion = state.suggestion.as_ref().map(serde_json::to_string).transpose()?;

        let mut conn = self.lock()?;
        // Take the write lock up front so the busy timeout applies
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let updated = tx.execute(
            r#"
            UPDATE sets SET
                status = ?1, score_sum = ?2, rep_count = ?3, histogram = ?4,
                suggestion = ?5, version = ?6, updated_at = ?7, finalized_at = ?8
            WHERE id = ?9 AND version = ?10
            "#,
            params![
                state.status.as_str(),
                state.score_sum,
                state.rep_count as i64,
                histogram,
                suggestion,
                state.version as i64,
                format_ts(state.updated_at),
                state.finalized_at.map(format_ts),
                state.set_id,
                expected_version as i64,
            ],
        )?;

        if updated == 0 {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM sets WHERE id = ?1)",
                params![state.set_id],
                |row| row.get(0),
            )?;
            return Err(if exists {
                StoreError::Conflict {
                    set_id: state.set_id,
                    expected: expected_version,
                }
            } else {
                StoreError::MissingSet(state.set_id)
            });
        }

        let stored: i64 = tx.query_row(
            "SELECT COUNT(*) FROM set_reps WHERE set_id = ?1",
            params![state.set_id],
            |row| row.get(0),
        )?;

        {
            let mut insert = tx.prepare(
                r#"
                INSERT INTO set_reps (set_id, seq, rep_index, metrics, score, violations, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )?;
            for (seq, rep) in state.reps.iter().enumerate().skip(stored as usize) {
                insert.execute(params![
                    state.set_id,
                    seq as i64,
                    rep.rep_index,
                    serde_json::to_string(&rep.metrics)?,
                    rep.score,
                    serde_json::to_string(&rep.violations)?,
                    format_ts(rep.recorded_at),
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn stale_sets(&self, idle_since: DateTime<Utc>) -> Result<Vec<SetActivity>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, workout_id, exercise_id, rep_count, updated_at FROM sets
            WHERE status = ?1 AND updated_at < ?2
            ORDER BY updated_at, id
            "#,
        )?;

        let rows = stmt
            .query_map(
                params![SetStatus::Active.as_str(), format_ts(idle_since)],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(set_id, workout_id, exercise_id, rep_count, updated_at)| {
                Ok(SetActivity {
                    set_id,
                    workout_id,
                    exercise_id,
                    rep_count: rep_count as u32,
                    updated_at: parse_ts(&updated_at)?,
                })
            })
            .collect()
    }
}
