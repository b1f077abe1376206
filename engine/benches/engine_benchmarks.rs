use std::collections::HashMap;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use plantwatch_engine::{
    AnomalyDetector, BufferStore, ChannelRegistry, Condition, RuleDraft, RuleEngine, Sample, Severity,
};

fn filled_store(capacity: usize) -> Arc<BufferStore> {
    let store = BufferStore::new(Arc::new(ChannelRegistry::kiln_plant()), capacity, &HashMap::new(), None)
        .expect("valid capacity");
    for i in 0..capacity as i64 {
        store
            .append(Sample::new("kiln_temperature", i * 1_000, 1400.0 + (i % 100) as f64))
            .expect("in-order append");
    }
    Arc::new(store)
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_append");
    for capacity in [100usize, 1_000, 5_000] {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, &capacity| {
            let store = filled_store(capacity);
            let mut ts = capacity as i64 * 1_000;
            b.iter(|| {
                ts += 1_000;
                black_box(store.append(Sample::new("kiln_temperature", ts, 1450.0)).ok());
            });
        });
    }
    group.finish();
}

fn bench_window(c: &mut Criterion) {
    let store = filled_store(5_000);
    c.bench_function("buffer_window_last_hour", |b| {
        b.iter(|| black_box(store.window("kiln_temperature", 1_400_000, 5_000_000).ok()))
    });
}

fn bench_detection(c: &mut Criterion) {
    let store = filled_store(1_000);
    let registry = Arc::clone(store.registry());
    let rules = Arc::new(RuleEngine::new(registry));
    for threshold in [1450.0, 1480.0, 1500.0] {
        rules
            .add_rule(RuleDraft::new("kiln_temperature", Condition::Above, threshold, Severity::High))
            .expect("valid rule");
    }
    store
        .append(Sample::new("system_pressure", 2_000_000, 2.6))
        .expect("in-order append");
    let detector = AnomalyDetector::new(Arc::clone(&store), rules);
    let sample = Sample::new("system_pressure", 2_000_000, 3.4);

    c.bench_function("detector_on_sample", |b| b.iter(|| black_box(detector.on_sample(&sample))));
}

criterion_group!(benches, bench_append, bench_window, bench_detection);
criterion_main!(benches);
