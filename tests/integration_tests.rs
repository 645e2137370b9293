use repcoach::models::{Exercise, RepMetrics, Rule, RuleConfig, SetStatus, ViolationKind};
use repcoach::store::{MemorySessionStore, SessionStore, SqliteSessionStore};
use repcoach::{RepCoachError, SetAggregator};
use std::sync::Arc;
use tempfile::tempdir;

/// Integration tests that drive complete set lifecycles against both stores

fn squat() -> Exercise {
    Exercise {
        id: 1,
        name: "Back Squat".to_string(),
        primary_muscle: Some("quads".to_string()),
        rules: Some(
            RuleConfig::new()
                .with_rule(Rule::DepthLow { max_knee_angle: 95.0 })
                .with_rule(Rule::Valgus { max_valgus_deg: 5.0 })
                .with_rule(Rule::Tempo { min_eccentric_s: 1.5 }),
        ),
    }
}

fn deadlift_without_rules() -> Exercise {
    Exercise {
        id: 2,
        name: "Deadlift".to_string(),
        primary_muscle: Some("hamstrings".to_string()),
        rules: None,
    }
}

fn rep(knee: f64, valgus: f64, tempo: f64) -> RepMetrics {
    RepMetrics::new()
        .with("knee_angle_min", knee)
        .with("knee_valgus_deg", valgus)
        .with("tempo_s", tempo)
}

fn seeded<S: SessionStore + 'static>(store: S) -> SetAggregator {
    store.upsert_exercise(&squat()).unwrap();
    store.upsert_exercise(&deadlift_without_rules()).unwrap();
    SetAggregator::new(Arc::new(store))
}

/// Three valgus reps, one deep clean rep and one slow-but-shallow rep
fn run_full_set(aggregator: &SetAggregator) {
    let started = aggregator.start_set(10, 1, 1, 5).unwrap();
    let set_id = started.set.set_id;
    assert_eq!(started.rules.unwrap().len(), 3);

    let scores = [
        aggregator.record_rep(set_id, 1, None, rep(90.0, 8.0, 2.0)).unwrap(),
        aggregator.record_rep(set_id, 2, Some(1), rep(90.0, 9.0, 2.0)).unwrap(),
        aggregator.record_rep(set_id, 3, None, rep(88.0, 6.5, 2.0)).unwrap(),
        aggregator.record_rep(set_id, 4, None, rep(85.0, 1.0, 2.0)).unwrap(),
        aggregator.record_rep(set_id, 5, None, rep(100.0, 1.0, 1.0)).unwrap(),
    ];
    assert_eq!(scores[0].violations, vec![ViolationKind::Valgus]);
    assert_eq!(scores[3].score, 1.0);
    assert_eq!(
        scores[4].violations,
        vec![ViolationKind::DepthLow, ViolationKind::Tempo]
    );

    let finalized = aggregator.end_set(set_id).unwrap();
    assert_eq!(finalized.suggestion.violation, Some(ViolationKind::Valgus));
    assert_eq!(finalized.suggestion.cue, "Push knees out and track toes.");

    let set = aggregator.get_set(set_id).unwrap();
    assert_eq!(set.status, SetStatus::Finalized);
    assert_eq!(set.rep_count, 5);
    assert_eq!(set.reps.len(), 5);
    assert_eq!(set.histogram.get(&ViolationKind::Valgus), Some(&3));
    assert_eq!(set.histogram.get(&ViolationKind::DepthLow), Some(&1));
    assert_eq!(set.histogram.get(&ViolationKind::Tempo), Some(&1));

    let expected_mean = (0.9 + 0.9 + 0.9 + 1.0 + 0.85) / 5.0;
    assert!((set.mean_score().unwrap() - expected_mean).abs() < 1e-12);
    assert!(set.finalized_at.is_some());
}

#[test]
fn test_full_set_lifecycle_in_memory() {
    let aggregator = seeded(MemorySessionStore::new());
    run_full_set(&aggregator);
}

#[test]
fn test_full_set_lifecycle_sqlite() {
    let dir = tempdir().unwrap();
    let aggregator = seeded(SqliteSessionStore::open(dir.path().join("sessions.db")).unwrap());
    run_full_set(&aggregator);
}

#[test]
fn test_sqlite_state_survives_reopen() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("sessions.db");

    let set_id = {
        let aggregator = seeded(SqliteSessionStore::open(&db_path).unwrap());
        let set_id = aggregator.start_set(10, 1, 1, 3).unwrap().set.set_id;
        aggregator.record_rep(set_id, 1, None, rep(110.0, 1.0, 2.0)).unwrap();
        aggregator.record_rep(set_id, 2, None, rep(90.0, 1.0, 2.0)).unwrap();
        set_id
    };

    let reopened = SetAggregator::new(Arc::new(SqliteSessionStore::open(&db_path).unwrap()));
    let set = reopened.get_set(set_id).unwrap();
    assert_eq!(set.status, SetStatus::Active);
    assert_eq!(set.rep_count, 2);
    assert_eq!(set.reps[0].metrics.get("knee_angle_min"), Some(110.0));
    assert_eq!(set.rules.as_ref().map(RuleConfig::len), Some(3));

    reopened.record_rep(set_id, 3, None, rep(90.0, 1.0, 2.0)).unwrap();
    let finalized = reopened.end_set(set_id).unwrap();
    assert_eq!(finalized.set.rep_count, 3);
    assert_eq!(finalized.suggestion.violation, Some(ViolationKind::DepthLow));
}

#[test]
fn test_exercise_without_rules_scores_perfect() {
    let aggregator = seeded(MemorySessionStore::new());
    let started = aggregator.start_set(10, 2, 1, 5).unwrap();
    assert!(started.rules.is_none());

    let score = aggregator
        .record_rep(started.set.set_id, 1, None, rep(170.0, 30.0, 0.1))
        .unwrap();
    assert_eq!(score.score, 1.0);
    assert!(score.violations.is_empty());

    let finalized = aggregator.end_set(started.set.set_id).unwrap();
    assert_eq!(finalized.suggestion.cue, "Good job");
    assert_eq!(finalized.suggestion.violation, None);
}

#[test]
fn test_missing_metrics_are_skipped() {
    let aggregator = seeded(MemorySessionStore::new());
    let set_id = aggregator.start_set(10, 1, 1, 1).unwrap().set.set_id;

    let score = aggregator
        .record_rep(set_id, 1, None, RepMetrics::new().with("tempo_s", 0.8))
        .unwrap();
    assert_eq!(score.violations, vec![ViolationKind::Tempo]);
    assert!((score.score - 0.95).abs() < 1e-12);
}

#[test]
fn test_finalized_set_rejects_reps_on_both_stores() {
    let dir = tempdir().unwrap();
    let aggregators = [
        seeded(MemorySessionStore::new()),
        seeded(SqliteSessionStore::open(dir.path().join("sessions.db")).unwrap()),
    ];

    for aggregator in &aggregators {
        let set_id = aggregator.start_set(10, 1, 1, 1).unwrap().set.set_id;
        aggregator.end_set(set_id).unwrap();

        let err = aggregator.record_rep(set_id, 1, None, rep(90.0, 1.0, 2.0)).unwrap_err();
        assert!(matches!(err, RepCoachError::NotFound(_)));
        assert_eq!(aggregator.get_set(set_id).unwrap().rep_count, 0);
    }
}

#[test]
fn test_stale_sets_sqlite() {
    let dir = tempdir().unwrap();
    let aggregator = seeded(SqliteSessionStore::open(dir.path().join("sessions.db")).unwrap());

    let idle = aggregator.start_set(10, 1, 1, 5).unwrap().set.set_id;
    let done = aggregator.start_set(10, 1, 2, 5).unwrap().set.set_id;
    aggregator.end_set(done).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(10));
    let stale = aggregator.stale_sets(chrono::Duration::zero()).unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].set_id, idle);
    assert_eq!(stale[0].rep_count, 0);
}

#[test]
fn test_exercise_filter_agrees_across_stores() {
    let dir = tempdir().unwrap();
    let memory = MemorySessionStore::new();
    let sqlite = SqliteSessionStore::open(dir.path().join("sessions.db")).unwrap();
    let stores: [&dyn SessionStore; 2] = [&memory, &sqlite];

    let hip_thrust = Exercise {
        id: 3,
        name: "Hip Thrust".to_string(),
        primary_muscle: Some("Glute_Max".to_string()),
        rules: None,
    };
    for store in stores {
        store.upsert_exercise(&squat()).unwrap();
        store.upsert_exercise(&deadlift_without_rules()).unwrap();
        store.upsert_exercise(&hip_thrust).unwrap();
    }

    let ids = |store: &dyn SessionStore, filter: &str| -> Vec<i64> {
        store
            .list_exercises(Some(filter), 100)
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect()
    };

    for filter in ["_", "%", "ua", "QUADS", "e_m", "q_ads", "%s", "\\", ""] {
        assert_eq!(ids(&memory, filter), ids(&sqlite, filter), "filter {:?}", filter);
    }
    assert_eq!(ids(&sqlite, "_"), vec![3]);
    assert!(ids(&sqlite, "%").is_empty());
    assert_eq!(ids(&sqlite, ""), vec![1, 2, 3]);
}
