//! Integration tests for the emission decision and the outbound record
//!
//! Drives whole open calls through the engine with a manual clock and checks
//! which ones reach the output channel, with which reasons, and what the
//! decoded record carries.

mod utils;

use nfs4slow::config::EngineConfig;
use nfs4slow::emission::{Reason, ReasonMask};
use nfs4slow::engine::PointOutcome;
use nfs4slow::event_record::{self, EVENT_RECORD_SIZE};
use nfs4slow::layout::{Field, LayoutSet, ObjectImage};
use nfs4slow::notification::ProbeArgs;
use nfs4slow::probes::{PointId, ProbeFunc, ProbeSite};
use utils::{call_id, Harness};

fn point(id: u8) -> PointId {
    PointId::new(id).unwrap()
}

fn only_slow_and_file() -> ReasonMask {
    ReasonMask::EMPTY.with(Reason::Slow).with(Reason::File)
}

#[test]
fn test_slow_open_of_followed_file() {
    // Sampling off so the random draw cannot add a bit
    let config = EngineConfig::default()
        .with_slow_threshold_ms(200)
        .with_file_name("followed.txt")
        .with_reasons(
            [Reason::Slow, Reason::Seqid, Reason::ReclaimNograce, Reason::File]
                .into_iter()
                .collect(),
        );
    let harness = Harness::new(config);
    let layouts = LayoutSet::reference();
    let dentry = ObjectImage::zeroed(&layouts.dentry).put(
        &layouts.dentry,
        Field::DIname,
        b"followed.txt",
    );
    let id = call_id(4242);

    let args = ProbeArgs {
        dentry: Some(dentry.view(&layouts)),
        ..ProbeArgs::default()
    };
    assert_eq!(
        harness.hit_with(ProbeSite::enter(ProbeFunc::Nfs4FileOpen), id, args),
        PointOutcome::Began
    );
    harness.clock.advance(5);
    harness.enter_point(ProbeFunc::Nfs4AtomicOpen, id);
    harness.clock.advance(100);
    harness.enter_point(ProbeFunc::UpdateOpenStateid, id);
    harness.clock.advance(1_000);
    harness.return_point(ProbeFunc::Nfs4AtomicOpen, id);
    harness.clock.advance(250_000 - 1_105);

    assert_eq!(harness.finish(id), PointOutcome::Emitted(only_slow_and_file()));

    let records = harness.drain_records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.reason, only_slow_and_file());
    assert_eq!(record.elapsed_us, 250_000);
    assert_eq!(record.pid, 4242);
    assert_eq!(record.target_name_bytes(), b"followed.txt");
    assert_eq!(
        record.trace.entries().collect::<Vec<_>>(),
        vec![(0, 5), (7, 105), (17, 1_105)]
    );
    for id in 0..48u8 {
        let expected = u8::from([0, 7, 17].contains(&id));
        assert_eq!(record.visits.get(point(id)), expected, "count of point {}", id);
    }
}

#[test]
fn test_fast_open_of_other_file_is_discarded() {
    let config = EngineConfig::default()
        .with_slow_threshold_ms(200)
        .with_file_name("followed.txt")
        .with_reasons(ReasonMask::EMPTY.with(Reason::Slow).with(Reason::File));
    let harness = Harness::new(config);
    let id = call_id(1);

    harness.begin(id);
    harness.clock.advance(199_999);
    assert_eq!(harness.finish(id), PointOutcome::Discarded);
    assert!(harness.drain_records().is_empty());
    assert_eq!(harness.engine.stats().discarded, 1);
}

#[test]
fn test_slow_bit_boundary() {
    let config = EngineConfig::default()
        .with_slow_threshold_ms(100)
        .with_reasons(ReasonMask::EMPTY.with(Reason::Slow));
    let harness = Harness::new(config);

    harness.begin(call_id(1));
    harness.clock.advance(99_999);
    assert_eq!(harness.finish(call_id(1)), PointOutcome::Discarded);

    harness.begin(call_id(2));
    harness.clock.advance(100_000);
    assert_eq!(
        harness.finish(call_id(2)),
        PointOutcome::Emitted(ReasonMask::EMPTY.with(Reason::Slow))
    );
}

#[test]
fn test_sampling_rate_is_about_one_in_ratio() {
    const CALLS: u64 = 20_000;
    let harness = Harness::with_seed(EngineConfig::default(), 0x5eed);

    let mut sampled = 0;
    for n in 0..CALLS {
        let id = call_id(n as u32 + 1);
        harness.begin(id);
        // One microsecond short of the threshold
        harness.clock.advance(99_999);
        match harness.finish(id) {
            PointOutcome::Emitted(reason) => {
                assert_eq!(reason, ReasonMask::EMPTY.with(Reason::Sample));
                sampled += 1;
            }
            PointOutcome::Discarded => {}
            other => panic!("unexpected outcome {:?}", other),
        }
        harness.drain_records();
    }

    // Expect 20; a fair 1-in-1000 draw lands well inside this band
    assert!((5..=45).contains(&sampled), "sampled {} of {}", sampled, CALLS);
}

fn run_open_task_call(harness: &Harness, id: u64, seqid: [u8; 4]) -> PointOutcome {
    let layouts = LayoutSet::reference();
    let stateid = ObjectImage::zeroed(&layouts.stateid)
        .put(&layouts.stateid, Field::Seqid, &seqid)
        .put_uint(&layouts.stateid, Field::Type, 2);
    let opendata = ObjectImage::zeroed(&layouts.opendata).put(
        &layouts.opendata,
        Field::OResStateid,
        stateid.as_bytes(),
    );
    let args = ProbeArgs {
        opendata: Some(opendata.view(&layouts)),
        ..ProbeArgs::default()
    };

    harness.begin(id);
    harness.hit_with(ProbeSite::enter(ProbeFunc::Nfs4RunOpenTask), id, args);
    harness.hit_with(ProbeSite::ret(ProbeFunc::Nfs4RunOpenTask), id, args);
    harness.finish(id)
}

#[test]
fn test_seqid_anomaly() {
    let config = EngineConfig::default().with_reasons(ReasonMask::EMPTY.with(Reason::Seqid));
    let harness = Harness::new(config);

    assert_eq!(
        run_open_task_call(&harness, call_id(1), [0, 0, 0, 2]),
        PointOutcome::Emitted(ReasonMask::EMPTY.with(Reason::Seqid))
    );
    assert_eq!(
        run_open_task_call(&harness, call_id(2), [0, 0, 0, 1]),
        PointOutcome::Discarded
    );
    assert_eq!(
        run_open_task_call(&harness, call_id(3), [0, 0, 0, 0]),
        PointOutcome::Discarded
    );

    let records = harness.drain_records();
    assert_eq!(records.len(), 1);
    let stateid = &records[0].snapshots.run_open_task.return_stateid;
    assert_eq!(stateid.seqid, [0, 0, 0, 2]);
    assert_eq!(stateid.seqid_value(), 2);
    assert_eq!(stateid.kind, 2);
}

#[test]
fn test_return_stateid_needs_entry_half() {
    let config = EngineConfig::default().with_reasons(ReasonMask::EMPTY.with(Reason::Seqid));
    let harness = Harness::new(config);
    let layouts = LayoutSet::reference();
    let opendata = ObjectImage::zeroed(&layouts.opendata).put(
        &layouts.opendata,
        Field::OResStateid,
        &[0, 0, 0, 9],
    );
    let id = call_id(5);

    harness.begin(id);
    let args = ProbeArgs {
        opendata: Some(opendata.view(&layouts)),
        ..ProbeArgs::default()
    };
    assert_eq!(
        harness.hit_with(ProbeSite::ret(ProbeFunc::Nfs4RunOpenTask), id, args),
        PointOutcome::Unpaired
    );
    assert_eq!(harness.finish(id), PointOutcome::Discarded);
}

#[test]
fn test_reclaim_nograce_reason_and_state_bracketing() {
    let config =
        EngineConfig::default().with_reasons(ReasonMask::EMPTY.with(Reason::ReclaimNograce));
    let harness = Harness::new(config);
    let layouts = LayoutSet::reference();
    let before = ObjectImage::zeroed(&layouts.state)
        .put_uint(&layouts.state, Field::Flags, 1 << 2)
        .put_uint(&layouts.state, Field::NRdonly, 1);
    let after = ObjectImage::zeroed(&layouts.state)
        .put_uint(&layouts.state, Field::Flags, (1 << 2) | (1 << 7))
        .put_uint(&layouts.state, Field::NRdonly, 1);
    let id = call_id(9);

    harness.begin(id);
    harness.enter_point(ProbeFunc::UpdateOpenStateid, id);
    harness.hit_with(
        ProbeSite::enter(ProbeFunc::Nfs4StateMarkReclaimNograce),
        id,
        ProbeArgs {
            state: Some(before.view(&layouts)),
            ..ProbeArgs::default()
        },
    );
    harness.hit_with(
        ProbeSite::ret(ProbeFunc::Nfs4StateMarkReclaimNograce),
        id,
        ProbeArgs {
            state: Some(after.view(&layouts)),
            ret: Some(1),
            ..ProbeArgs::default()
        },
    );
    assert_eq!(
        harness.finish(id),
        PointOutcome::Emitted(ReasonMask::EMPTY.with(Reason::ReclaimNograce))
    );

    let record = &harness.drain_records()[0];
    let reclaim = &record.snapshots.reclaim_nograce;
    assert_eq!(reclaim.executed, 1);
    assert_eq!(reclaim.result, 1);
    assert_eq!(reclaim.enter_state.flags, 1 << 2);
    assert_eq!(reclaim.return_state.flags, (1 << 2) | (1 << 7));
    assert_eq!(reclaim.return_state.n_rdonly, 1);
    let ids: Vec<u8> = record.trace.entries().map(|(id, _)| id).collect();
    assert_eq!(ids, vec![7, 22, 23]);
}

#[test]
fn test_reclaim_reason_survives_retry() {
    let config =
        EngineConfig::default().with_reasons(ReasonMask::EMPTY.with(Reason::ReclaimNograce));
    let harness = Harness::new(config);
    let layouts = LayoutSet::reference();
    let state = ObjectImage::zeroed(&layouts.state).put_uint(&layouts.state, Field::Flags, 1 << 2);
    let id = call_id(11);

    harness.begin(id);
    for ret in [1, 0] {
        harness.hit_with(
            ProbeSite::enter(ProbeFunc::Nfs4StateMarkReclaimNograce),
            id,
            ProbeArgs {
                state: Some(state.view(&layouts)),
                ..ProbeArgs::default()
            },
        );
        harness.hit_with(
            ProbeSite::ret(ProbeFunc::Nfs4StateMarkReclaimNograce),
            id,
            ProbeArgs {
                state: Some(state.view(&layouts)),
                ret: Some(ret),
                ..ProbeArgs::default()
            },
        );
    }
    assert_eq!(
        harness.finish(id),
        PointOutcome::Emitted(ReasonMask::EMPTY.with(Reason::ReclaimNograce))
    );

    let record = &harness.drain_records()[0];
    // Last attempt's outcome is what the record carries
    assert_eq!(record.snapshots.reclaim_nograce.result, 0);
    assert_eq!(record.reason, ReasonMask::EMPTY.with(Reason::ReclaimNograce));
}

#[test]
fn test_seqid_reason_survives_retry() {
    let config = EngineConfig::default().with_reasons(ReasonMask::EMPTY.with(Reason::Seqid));
    let harness = Harness::new(config);
    let layouts = LayoutSet::reference();
    let id = call_id(12);

    harness.begin(id);
    for seqid in [[0u8, 0, 0, 3], [0, 0, 0, 1]] {
        let stateid = ObjectImage::zeroed(&layouts.stateid).put(
            &layouts.stateid,
            Field::Seqid,
            &seqid,
        );
        let opendata = ObjectImage::zeroed(&layouts.opendata).put(
            &layouts.opendata,
            Field::OResStateid,
            stateid.as_bytes(),
        );
        let args = ProbeArgs {
            opendata: Some(opendata.view(&layouts)),
            ..ProbeArgs::default()
        };
        harness.hit_with(ProbeSite::enter(ProbeFunc::Nfs4RunOpenTask), id, args);
        harness.hit_with(ProbeSite::ret(ProbeFunc::Nfs4RunOpenTask), id, args);
    }
    assert_eq!(
        harness.finish(id),
        PointOutcome::Emitted(ReasonMask::EMPTY.with(Reason::Seqid))
    );

    let record = &harness.drain_records()[0];
    assert_eq!(record.snapshots.run_open_task.return_stateid.seqid_value(), 1);
    assert_eq!(record.visits.get(point(30)), 2);
}

#[test]
fn test_latched_reason_respects_enabled_set() {
    let config = EngineConfig::default().with_reasons(ReasonMask::EMPTY.with(Reason::Slow));
    let harness = Harness::new(config);
    assert_eq!(
        run_open_task_call(&harness, call_id(13), [0, 0, 0, 7]),
        PointOutcome::Discarded
    );
}

#[test]
fn test_encoded_record_is_fixed_size() {
    let harness = Harness::new(EngineConfig::default().with_slow_threshold_ms(0));
    let id = call_id(3);
    harness.begin(id);
    for _ in 0..300 {
        harness.enter_point(ProbeFunc::PrepareToWait, id);
    }
    harness.finish(id);

    let bytes = harness.engine.channel().pop().unwrap();
    assert_eq!(bytes.len(), EVENT_RECORD_SIZE);
    let record = event_record::decode(&bytes).unwrap();
    assert!(record.trace.is_full());
    assert_eq!(record.trace.len(), 128);
    assert_eq!(record.visits.get(point(8)), 255);
    assert_eq!(event_record::encode(&record), bytes);
}
