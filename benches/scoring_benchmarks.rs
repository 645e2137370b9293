use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use repcoach::models::{Exercise, RepMetrics, Rule, RuleConfig, ViolationHistogram, ViolationKind};
use repcoach::rescore::{self, RepRow};
use repcoach::store::{MemorySessionStore, SessionStore};
use repcoach::{scoring, suggestion, SetAggregator};
use std::sync::Arc;

/// Performance benchmarks for the scoring path
///
/// Covers per-rep evaluation, cue selection, live rep ingestion and batch
/// rescoring with growing input sizes.

fn squat_rules() -> RuleConfig {
    RuleConfig::new()
        .with_rule(Rule::DepthLow { max_knee_angle: 95.0 })
        .with_rule(Rule::Valgus { max_valgus_deg: 5.0 })
        .with_rule(Rule::Tempo { min_eccentric_s: 1.5 })
}

fn synthetic_rep(i: usize) -> RepMetrics {
    RepMetrics::new()
        .with("knee_angle_min", 80.0 + (i % 40) as f64)
        .with("knee_valgus_deg", (i % 9) as f64)
        .with("tempo_s", 0.8 + (i % 5) as f64 * 0.4)
}

fn bench_evaluate(c: &mut Criterion) {
    let rules = squat_rules();
    let mut group = c.benchmark_group("Rep Evaluation");

    for &size in &[1, 100, 10_000] {
        let reps: Vec<RepMetrics> = (0..size).map(synthetic_rep).collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("evaluate", size), &reps, |b, reps| {
            b.iter(|| {
                for metrics in reps {
                    black_box(scoring::evaluate(metrics, Some(&rules)));
                }
            });
        });
    }

    group.finish();
}

fn bench_select(c: &mut Criterion) {
    let mut histogram = ViolationHistogram::new();
    histogram.insert(ViolationKind::DepthLow, 4);
    histogram.insert(ViolationKind::Valgus, 4);
    histogram.insert(ViolationKind::Tempo, 2);
    histogram.insert(ViolationKind::Other("hip_shift".to_string()), 4);

    c.bench_function("suggestion_select", |b| {
        b.iter(|| black_box(suggestion::select(black_box(&histogram))))
    });
}

fn bench_record_rep(c: &mut Criterion) {
    let store = MemorySessionStore::new();
    store
        .upsert_exercise(&Exercise {
            id: 1,
            name: "Back Squat".to_string(),
            primary_muscle: None,
            rules: Some(squat_rules()),
        })
        .unwrap();
    let aggregator = SetAggregator::new(Arc::new(store));

    let mut group = c.benchmark_group("Set Ingestion");
    for &size in &[10, 100] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_function(BenchmarkId::new("record_rep", size), |b| {
            b.iter(|| {
                let set_id = aggregator.start_set(1, 1, 1, size as i64).unwrap().set.set_id;
                for i in 0..size {
                    aggregator
                        .record_rep(set_id, i as i64, None, synthetic_rep(i))
                        .unwrap();
                }
                black_box(aggregator.end_set(set_id).unwrap())
            });
        });
    }
    group.finish();
}

fn bench_rescore(c: &mut Criterion) {
    let rules = squat_rules();
    let mut group = c.benchmark_group("Batch Rescore");

    for &size in &[1_000, 100_000] {
        let rows: Vec<RepRow> = (0..size)
            .map(|i| RepRow {
                rep_index: i as i64,
                metrics: synthetic_rep(i),
            })
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("rescore", size), &rows, |b, rows| {
            b.iter(|| black_box(rescore::rescore(rows, Some(&rules))));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_evaluate,
    bench_select,
    bench_record_rep,
    bench_rescore
);
criterion_main!(benches);
