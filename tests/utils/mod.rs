// Shared helpers for driving an engine by hand
#![allow(dead_code)]

use nfs4slow::clock::{ManualClock, RandomSource};
use nfs4slow::config::EngineConfig;
use nfs4slow::engine::{Engine, PointOutcome};
use nfs4slow::event_record;
use nfs4slow::call_record::CallRecord;
use nfs4slow::notification::{CallContext, Notification, ProbeArgs};
use nfs4slow::probes::{ProbeFunc, ProbeSite};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};

/// Seeded RNG shared by every traced thread
pub struct SeededRandom(Mutex<StdRng>);

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        SeededRandom(Mutex::new(StdRng::seed_from_u64(seed)))
    }
}

impl RandomSource for SeededRandom {
    fn next_u32(&self) -> u32 {
        self.0.lock().unwrap().gen()
    }
}

pub struct Harness {
    pub engine: Engine,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_seed(config, 7)
    }

    pub fn with_seed(config: EngineConfig, seed: u64) -> Self {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let engine = Engine::builder(config)
            .clock(clock.clone())
            .random(Arc::new(SeededRandom::new(seed)))
            .build()
            .expect("engine attaches");
        Harness { engine, clock }
    }

    pub fn hit(&self, site: ProbeSite, call_id: u64) -> PointOutcome {
        self.hit_with(site, call_id, ProbeArgs::default())
    }

    pub fn hit_with(&self, site: ProbeSite, call_id: u64, args: ProbeArgs<'_>) -> PointOutcome {
        let ctx = CallContext::new(call_id, 0, b"cat");
        self.engine
            .on_point(&Notification::new(site, ctx).with_args(args))
    }

    pub fn enter_point(&self, func: ProbeFunc, call_id: u64) -> PointOutcome {
        self.hit(ProbeSite::enter(func), call_id)
    }

    pub fn return_point(&self, func: ProbeFunc, call_id: u64) -> PointOutcome {
        self.hit(ProbeSite::ret(func), call_id)
    }

    pub fn begin(&self, call_id: u64) -> PointOutcome {
        self.enter_point(ProbeFunc::Nfs4FileOpen, call_id)
    }

    pub fn finish(&self, call_id: u64) -> PointOutcome {
        self.return_point(ProbeFunc::Nfs4FileOpen, call_id)
    }

    /// Decode everything currently in the output channel
    pub fn drain_records(&self) -> Vec<CallRecord> {
        self.engine
            .channel()
            .drain(usize::MAX)
            .iter()
            .map(|bytes| event_record::decode(bytes).expect("valid record"))
            .collect()
    }
}

/// `tgid << 32 | pid` for a single-threaded process
pub fn call_id(pid: u32) -> u64 {
    (u64::from(pid) << 32) | u64::from(pid)
}
