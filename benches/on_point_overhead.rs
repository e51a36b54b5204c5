//! Hot path cost of `Engine::on_point`
//!
//! Every instrumented kernel function pays this on every call, so each case
//! measures a single notification against a warm table.
//!
//! ```bash
//! cargo bench --bench on_point_overhead
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nfs4slow::clock::{FixedRandom, ManualClock};
use nfs4slow::config::EngineConfig;
use nfs4slow::engine::Engine;
use nfs4slow::layout::{Field, LayoutSet, ObjectImage};
use nfs4slow::notification::{CallContext, Notification, ProbeArgs};
use nfs4slow::probes::{ProbeFunc, ProbeSite};
use std::sync::Arc;

fn engine(config: EngineConfig) -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let engine = Engine::builder(config)
        .clock(clock.clone())
        .random(Arc::new(FixedRandom::new(1)))
        .build()
        .expect("engine attaches");
    (engine, clock)
}

fn hit(engine: &Engine, site: ProbeSite, call_id: u64, args: ProbeArgs<'_>) {
    let ctx = CallContext::new(call_id, 0, b"bench");
    black_box(engine.on_point(&Notification::new(site, ctx).with_args(args)));
}

/// Plain point on an in-flight call
fn bench_plain_point(c: &mut Criterion) {
    let (engine, clock) = engine(EngineConfig::default());
    let site = ProbeSite::enter(ProbeFunc::PrepareToWait);
    hit(&engine, ProbeSite::enter(ProbeFunc::Nfs4FileOpen), 42, ProbeArgs::default());

    c.bench_function("on_point_plain", |b| {
        b.iter(|| {
            clock.advance(1);
            hit(&engine, site, black_box(42), ProbeArgs::default());
        });
    });
}

/// Point that copies `nfs4_state` and its open stateid
fn bench_capture_point(c: &mut Criterion) {
    let (engine, clock) = engine(EngineConfig::default());
    let layouts = LayoutSet::reference();
    let state = ObjectImage::zeroed(&layouts.state).put_uint(&layouts.state, Field::Flags, 1 << 2);
    let stateid = ObjectImage::zeroed(&layouts.stateid);
    let site = ProbeSite::enter(ProbeFunc::UpdateOpenStateid);
    hit(&engine, ProbeSite::enter(ProbeFunc::Nfs4FileOpen), 42, ProbeArgs::default());

    c.bench_function("on_point_capture_update_open_stateid", |b| {
        b.iter(|| {
            clock.advance(1);
            let args = ProbeArgs {
                state: Some(state.view(&layouts)),
                stateid: Some(stateid.view(&layouts)),
                ..ProbeArgs::default()
            };
            hit(&engine, site, black_box(42), args);
        });
    });
}

/// Whole call: enter, a few points, exit; discarded or emitted
fn bench_full_call(c: &mut Criterion) {
    let mut group = c.benchmark_group("on_point_full_call");
    for threshold_ms in [u64::MAX / 1000, 0] {
        let label = if threshold_ms == 0 { "emitted" } else { "discarded" };
        let config = EngineConfig::default()
            .with_slow_threshold_ms(threshold_ms)
            .with_sample_ratio(u32::MAX);
        let (engine, clock) = engine(config);
        let enter = ProbeSite::enter(ProbeFunc::Nfs4FileOpen);
        let exit = ProbeSite::ret(ProbeFunc::Nfs4FileOpen);
        let inner = [
            ProbeSite::enter(ProbeFunc::Nfs4AtomicOpen),
            ProbeSite::enter(ProbeFunc::Nfs4OpendataAlloc),
            ProbeSite::ret(ProbeFunc::Nfs4OpendataAlloc),
            ProbeSite::ret(ProbeFunc::Nfs4AtomicOpen),
        ];

        group.bench_with_input(BenchmarkId::from_parameter(label), &inner, |b, inner| {
            let mut call_id = 0u64;
            b.iter(|| {
                call_id += 1;
                hit(&engine, enter, call_id, ProbeArgs::default());
                for &site in inner {
                    clock.advance(5);
                    hit(&engine, site, call_id, ProbeArgs::default());
                }
                hit(&engine, exit, call_id, ProbeArgs::default());
                // Keep the channel from filling up
                black_box(engine.channel().pop());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_plain_point, bench_capture_point, bench_full_call);
criterion_main!(benches);
