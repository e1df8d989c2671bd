//! Benchmarks for the meal plan codec and the status translators.
//!
//! Run benchmarks with:
//! ```sh
//! cargo bench --bench meal_plan_bench
//! ```

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use pethub_core::{DeviceKind, DpsMap};
use pethub_protocol::meal_plan::{
    EntryStatus, MAX_MEAL_PLAN_ENTRIES, MealPlanEntry, MealTime, Weekday, decode, encode,
};
use pethub_protocol::{is_corrupted, translate};
use std::hint::black_box;

fn create_plan(len: usize) -> Vec<MealPlanEntry> {
    (0..len)
        .map(|i| {
            let day = Weekday::ALL[i % Weekday::ALL.len()];
            MealPlanEntry::new(
                [day, Weekday::Saturday],
                MealTime::new((6 + i as u8) % 24, (i as u8 * 7) % 60).unwrap(),
                1 + (i as u8 % 10),
                EntryStatus::Enabled,
            )
        })
        .collect()
}

fn feeder_dps() -> DpsMap {
    serde_json::from_value(serde_json::json!({
        "1": encode(&create_plan(4)).unwrap(),
        "4": "standby",
        "101": "full",
        "102": 92,
        "104": "R:2  C:3  T:1700000000",
        "106": false,
    }))
    .unwrap()
}

/// Benchmark encoding plans of increasing length.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("meal_plan_encode");

    for len in [1, 4, MAX_MEAL_PLAN_ENTRIES] {
        let plan = create_plan(len);
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &plan, |b, plan| {
            b.iter(|| black_box(encode(black_box(plan)).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark decoding plans of increasing length.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("meal_plan_decode");

    for len in [1, 4, MAX_MEAL_PLAN_ENTRIES] {
        let encoded = encode(&create_plan(len)).unwrap();
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &encoded, |b, encoded| {
            b.iter(|| black_box(decode(black_box(encoded)).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark the per-push work done by the device manager.
fn bench_inbound_push(c: &mut Criterion) {
    let dps = feeder_dps();

    c.bench_function("feeder_push_translate", |b| {
        b.iter(|| {
            let dps = black_box(&dps);
            if !is_corrupted(dps) {
                black_box(translate(DeviceKind::Feeder, dps));
            }
        });
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_inbound_push);
criterion_main!(benches);
