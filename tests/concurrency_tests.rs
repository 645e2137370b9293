/// Concurrency suite
///
/// Races mutating calls against one set to check that no rep is lost:
/// - many threads on a single aggregator (in-process set lock)
/// - two aggregators over one SQLite file (version compare-and-swap)
/// - independent sets progressing in parallel

use repcoach::config::EngineSettings;
use repcoach::models::{Exercise, RepMetrics, Rule, RuleConfig, ViolationKind};
use repcoach::store::{MemorySessionStore, SessionStore, SqliteSessionStore};
use repcoach::SetAggregator;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

const THREADS: usize = 8;
const REPS_PER_THREAD: usize = 25;

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

/// Even threads send shallow reps, odd threads send clean ones
fn rep_for(thread_no: usize) -> RepMetrics {
    let knee = if thread_no % 2 == 0 { 110.0 } else { 85.0 };
    RepMetrics::new()
        .with("knee_angle_min", knee)
        .with("knee_valgus_deg", 1.0)
        .with("tempo_s", 2.0)
}

fn expected_depth_reps(threads: usize) -> u32 {
    ((0..threads).filter(|t| t % 2 == 0).count() * REPS_PER_THREAD) as u32
}

#[test]
fn test_parallel_reps_on_one_aggregator_are_not_lost() {
    let store = MemorySessionStore::new();
    store.upsert_exercise(&squat()).unwrap();
    let aggregator = SetAggregator::new(Arc::new(store));
    let set_id = aggregator.start_set(1, 1, 1, 200).unwrap().set.set_id;

    thread::scope(|scope| {
        for t in 0..THREADS {
            let aggregator = &aggregator;
            scope.spawn(move || {
                for i in 0..REPS_PER_THREAD {
                    let rep_index = (t * REPS_PER_THREAD + i) as i64;
                    aggregator.record_rep(set_id, rep_index, None, rep_for(t)).unwrap();
                }
            });
        }
    });

    let set = aggregator.get_set(set_id).unwrap();
    let total = (THREADS * REPS_PER_THREAD) as u32;
    assert_eq!(set.rep_count, total);
    assert_eq!(set.reps.len(), total as usize);
    assert_eq!(
        set.histogram.get(&ViolationKind::DepthLow),
        Some(&expected_depth_reps(THREADS))
    );

    let depth = expected_depth_reps(THREADS) as f64;
    let expected_mean = (depth * 0.9 + (total as f64 - depth)) / total as f64;
    assert!((set.mean_score().unwrap() - expected_mean).abs() < 1e-9);
}

#[test]
fn test_two_processes_sharing_sqlite_converge() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("sessions.db");

    let settings = EngineSettings {
        max_save_attempts: 1000,
        ..EngineSettings::default()
    };
    let first = SqliteSessionStore::open(&db_path).unwrap();
    first.upsert_exercise(&squat()).unwrap();
    let first = SetAggregator::with_settings(Arc::new(first), settings.clone());
    let second = SetAggregator::with_settings(
        Arc::new(SqliteSessionStore::open(&db_path).unwrap()),
        settings,
    );

    let set_id = first.start_set(1, 1, 1, 40).unwrap().set.set_id;
    let workers = 4;

    thread::scope(|scope| {
        for t in 0..workers {
            let aggregator = if t % 2 == 0 { &first } else { &second };
            scope.spawn(move || {
                for i in 0..10 {
                    let rep_index = (t * 10 + i) as i64;
                    aggregator.record_rep(set_id, rep_index, None, rep_for(t)).unwrap();
                }
            });
        }
    });

    let from_first = first.get_set(set_id).unwrap();
    let from_second = second.get_set(set_id).unwrap();
    assert_eq!(from_first.rep_count, 40);
    assert_eq!(from_first.histogram, from_second.histogram);
    assert_eq!(from_first.version, from_second.version);
    assert_eq!(from_first.histogram.get(&ViolationKind::DepthLow), Some(&20));
    assert!((from_second.mean_score().unwrap() - 0.95).abs() < 1e-9);

    let finalized = second.end_set(set_id).unwrap();
    assert_eq!(finalized.suggestion.violation, Some(ViolationKind::DepthLow));
    assert!(first.record_rep(set_id, 99, None, rep_for(0)).is_err());
}

#[test]
fn test_independent_sets_progress_in_parallel() {
    let store = MemorySessionStore::new();
    store.upsert_exercise(&squat()).unwrap();
    let aggregator = SetAggregator::new(Arc::new(store));

    let set_ids: Vec<i64> = (0..THREADS)
        .map(|n| aggregator.start_set(1, 1, n as i64, 10).unwrap().set.set_id)
        .collect();

    thread::scope(|scope| {
        for (t, set_id) in set_ids.iter().copied().enumerate() {
            let aggregator = &aggregator;
            scope.spawn(move || {
                for i in 0..10 {
                    aggregator.record_rep(set_id, i, None, rep_for(t)).unwrap();
                }
                aggregator.end_set(set_id).unwrap()
            });
        }
    });

    for (t, set_id) in set_ids.iter().enumerate() {
        let set = aggregator.get_set(*set_id).unwrap();
        assert_eq!(set.rep_count, 10);
        let expected = if t % 2 == 0 {
            Some(ViolationKind::DepthLow)
        } else {
            None
        };
        assert_eq!(set.suggestion.unwrap().violation, expected);
    }
}

#[test]
fn test_concurrent_end_set_is_idempotent() {
    let store = MemorySessionStore::new();
    store.upsert_exercise(&squat()).unwrap();
    let aggregator = SetAggregator::new(Arc::new(store));
    let set_id = aggregator.start_set(1, 1, 1, 3).unwrap().set.set_id;
    aggregator.record_rep(set_id, 1, None, rep_for(0)).unwrap();

    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let aggregator = &aggregator;
                scope.spawn(move || aggregator.end_set(set_id).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for finalized in &results {
        assert_eq!(finalized.suggestion, results[0].suggestion);
        assert_eq!(finalized.set.version, results[0].set.version);
    }
}
