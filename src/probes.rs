//! Instrumented point catalogue for the NFSv4 open path
//!
//! Every instrumented kernel function has an entry and a return probe. Each
//! probe maps to a small integer point id (the index into the per-call visit
//! counters) and to the handler that runs when it fires. `nfs4_file_open` is
//! special: its entry begins a call and its return ends it.
//!
//! ```text
//! nfs4_atomic_open
//!     nfs4_client_recover_expired_lease
//!         nfs4_wait_clnt_recover
//!             prepare_to_wait / nfs_wait_bit_killable / finish_wait
//!             nfs_put_client
//!         nfs4_schedule_state_manager
//!     nfs4_opendata_alloc
//!     nfs4_run_open_task
//!     _nfs4_proc_open_confirm
//!     _nfs4_opendata_to_nfs4_state
//!         nfs4_get_open_state
//!             __nfs4_find_state_byowner
//!         update_open_stateid
//!             nfs_state_log_update_open_stateid
//!             nfs4_state_mark_reclaim_nograce
//!             update_open_stateflags
//! ```

use std::fmt;
use std::str::FromStr;

use crate::call_record::SLOW_POINT_COUNT;

/// Identifier of one instrumented step, always `< SLOW_POINT_COUNT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PointId(u8);

impl PointId {
    /// Create a point id, rejecting values outside the counter domain
    pub const fn new(id: u8) -> Option<Self> {
        if (id as usize) < SLOW_POINT_COUNT {
            Some(PointId(id))
        } else {
            None
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of a function the probe fires on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    Enter,
    Return,
}

impl Edge {
    pub fn as_str(self) -> &'static str {
        match self {
            Edge::Enter => "enter",
            Edge::Return => "return",
        }
    }
}

/// Instrumented kernel functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeFunc {
    Nfs4FileOpen,
    Nfs4AtomicOpen,
    Nfs4ClientRecoverExpiredLease,
    Nfs4WaitClntRecover,
    NfsPutClient,
    UpdateOpenStateid,
    PrepareToWait,
    FinishWait,
    NfsStateLogUpdateOpenStateid,
    UpdateOpenStateflags,
    NfsWaitBitKillable,
    Nfs4ScheduleStateManager,
    Nfs4StateMarkReclaimNograce,
    Nfs4GetOpenState,
    Nfs4FindStateByowner,
    Nfs4OpendataAlloc,
    Nfs4RunOpenTask,
    Nfs4OpendataToNfs4State,
    Nfs4ProcOpenConfirm,
}

/// Functions handed to the attachment layer, in attach order
pub const ATTACH_LIST: &[ProbeFunc] = &[
    ProbeFunc::Nfs4FileOpen,
    ProbeFunc::Nfs4AtomicOpen,
    ProbeFunc::Nfs4ClientRecoverExpiredLease,
    ProbeFunc::Nfs4WaitClntRecover,
    ProbeFunc::NfsPutClient,
    ProbeFunc::Nfs4OpendataAlloc,
    ProbeFunc::Nfs4RunOpenTask,
    ProbeFunc::Nfs4ProcOpenConfirm,
    ProbeFunc::Nfs4OpendataToNfs4State,
    ProbeFunc::Nfs4GetOpenState,
    ProbeFunc::Nfs4FindStateByowner,
    ProbeFunc::UpdateOpenStateid,
    ProbeFunc::NfsStateLogUpdateOpenStateid,
    ProbeFunc::PrepareToWait,
    ProbeFunc::FinishWait,
    ProbeFunc::Nfs4StateMarkReclaimNograce,
    ProbeFunc::Nfs4ScheduleStateManager,
    ProbeFunc::UpdateOpenStateflags,
    ProbeFunc::NfsWaitBitKillable,
];

impl ProbeFunc {
    /// Kernel symbol name
    pub fn symbol(self) -> &'static str {
        match self {
            ProbeFunc::Nfs4FileOpen => "nfs4_file_open",
            ProbeFunc::Nfs4AtomicOpen => "nfs4_atomic_open",
            ProbeFunc::Nfs4ClientRecoverExpiredLease => "nfs4_client_recover_expired_lease",
            ProbeFunc::Nfs4WaitClntRecover => "nfs4_wait_clnt_recover",
            ProbeFunc::NfsPutClient => "nfs_put_client",
            ProbeFunc::UpdateOpenStateid => "update_open_stateid",
            ProbeFunc::PrepareToWait => "prepare_to_wait",
            ProbeFunc::FinishWait => "finish_wait",
            ProbeFunc::NfsStateLogUpdateOpenStateid => "nfs_state_log_update_open_stateid",
            ProbeFunc::UpdateOpenStateflags => "update_open_stateflags",
            ProbeFunc::NfsWaitBitKillable => "nfs_wait_bit_killable",
            ProbeFunc::Nfs4ScheduleStateManager => "nfs4_schedule_state_manager",
            ProbeFunc::Nfs4StateMarkReclaimNograce => "nfs4_state_mark_reclaim_nograce",
            ProbeFunc::Nfs4GetOpenState => "nfs4_get_open_state",
            ProbeFunc::Nfs4FindStateByowner => "__nfs4_find_state_byowner",
            ProbeFunc::Nfs4OpendataAlloc => "nfs4_opendata_alloc",
            ProbeFunc::Nfs4RunOpenTask => "nfs4_run_open_task",
            ProbeFunc::Nfs4OpendataToNfs4State => "_nfs4_opendata_to_nfs4_state",
            ProbeFunc::Nfs4ProcOpenConfirm => "_nfs4_proc_open_confirm",
        }
    }

    /// Resolve a kernel symbol name
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        ATTACH_LIST.iter().copied().find(|f| f.symbol() == symbol)
    }

    /// Point ids recorded on entry and return, `None` for the call boundary
    pub fn point_ids(self) -> Option<(u8, u8)> {
        let ids = match self {
            ProbeFunc::Nfs4FileOpen => return None,
            ProbeFunc::Nfs4AtomicOpen => (0, 17),
            ProbeFunc::Nfs4ClientRecoverExpiredLease => (1, 6),
            ProbeFunc::Nfs4WaitClntRecover => (2, 5),
            ProbeFunc::NfsPutClient => (3, 4),
            ProbeFunc::UpdateOpenStateid => (7, 16),
            ProbeFunc::PrepareToWait => (8, 9),
            ProbeFunc::FinishWait => (10, 11),
            ProbeFunc::NfsStateLogUpdateOpenStateid => (12, 13),
            ProbeFunc::UpdateOpenStateflags => (14, 15),
            ProbeFunc::NfsWaitBitKillable => (18, 19),
            ProbeFunc::Nfs4ScheduleStateManager => (20, 21),
            ProbeFunc::Nfs4StateMarkReclaimNograce => (22, 23),
            ProbeFunc::Nfs4GetOpenState => (24, 27),
            ProbeFunc::Nfs4FindStateByowner => (25, 26),
            ProbeFunc::Nfs4OpendataAlloc => (28, 29),
            ProbeFunc::Nfs4RunOpenTask => (30, 31),
            ProbeFunc::Nfs4OpendataToNfs4State => (32, 33),
            ProbeFunc::Nfs4ProcOpenConfirm => (34, 35),
        };
        Some(ids)
    }
}

/// One attach point: a function plus the edge it fires on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeSite {
    pub func: ProbeFunc,
    pub edge: Edge,
}

impl ProbeSite {
    pub const fn enter(func: ProbeFunc) -> Self {
        ProbeSite {
            func,
            edge: Edge::Enter,
        }
    }

    pub const fn ret(func: ProbeFunc) -> Self {
        ProbeSite {
            func,
            edge: Edge::Return,
        }
    }

    /// Point id recorded when this site fires
    pub fn point_id(self) -> Option<PointId> {
        let (enter, ret) = self.func.point_ids()?;
        match self.edge {
            Edge::Enter => PointId::new(enter),
            Edge::Return => PointId::new(ret),
        }
    }

    /// Handler wired to this site
    pub fn handler(self) -> Handler {
        let Some(point) = self.point_id() else {
            return match self.edge {
                Edge::Enter => Handler::CallEnter,
                Edge::Return => Handler::CallExit,
            };
        };

        let capture = match (self.func, self.edge) {
            (ProbeFunc::Nfs4WaitClntRecover, Edge::Enter) => Capture::WaitClntRecover,
            (ProbeFunc::Nfs4RunOpenTask, Edge::Enter) => Capture::RunOpenTaskEnter,
            (ProbeFunc::Nfs4RunOpenTask, Edge::Return) => Capture::RunOpenTaskReturn,
            (ProbeFunc::Nfs4OpendataToNfs4State, Edge::Enter) => Capture::OpendataToState,
            (ProbeFunc::UpdateOpenStateid, Edge::Enter) => Capture::UpdateOpenStateid,
            (ProbeFunc::Nfs4StateMarkReclaimNograce, Edge::Enter) => Capture::ReclaimNograceEnter,
            (ProbeFunc::Nfs4StateMarkReclaimNograce, Edge::Return) => {
                Capture::ReclaimNograceReturn
            }
            _ => return Handler::Point(point),
        };
        Handler::Capture(point, capture)
    }

    /// Site that records `point`, if any
    pub fn for_point(point: PointId) -> Option<ProbeSite> {
        ATTACH_LIST.iter().find_map(|&func| {
            let (enter, ret) = func.point_ids()?;
            if enter == point.get() {
                Some(ProbeSite::enter(func))
            } else if ret == point.get() {
                Some(ProbeSite::ret(func))
            } else {
                None
            }
        })
    }
}

impl fmt::Display for ProbeSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.edge.as_str(), self.func.symbol())
    }
}

impl FromStr for ProbeSite {
    type Err = String;

    /// Parse `enter:<symbol>` or `return:<symbol>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (edge, symbol) = s
            .split_once(':')
            .ok_or_else(|| format!("probe site '{}' is not of the form edge:symbol", s))?;
        let edge = match edge {
            "enter" => Edge::Enter,
            "return" => Edge::Return,
            other => return Err(format!("unknown probe edge '{}'", other)),
        };
        let func = ProbeFunc::from_symbol(symbol)
            .ok_or_else(|| format!("'{}' is not an instrumented function", symbol))?;
        Ok(ProbeSite { func, edge })
    }
}

/// Structured captures, one per wired probe site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capture {
    RunOpenTaskEnter,
    RunOpenTaskReturn,
    OpendataToState,
    UpdateOpenStateid,
    ReclaimNograceEnter,
    ReclaimNograceReturn,
    WaitClntRecover,
}

impl Capture {
    pub const ALL: [Capture; 7] = [
        Capture::RunOpenTaskEnter,
        Capture::RunOpenTaskReturn,
        Capture::OpendataToState,
        Capture::UpdateOpenStateid,
        Capture::ReclaimNograceEnter,
        Capture::ReclaimNograceReturn,
        Capture::WaitClntRecover,
    ];

    pub(crate) const fn bit(self) -> u16 {
        1 << self as u16
    }
}

/// What the engine does when a site fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    CallEnter,
    CallExit,
    Point(PointId),
    Capture(PointId, Capture),
}
