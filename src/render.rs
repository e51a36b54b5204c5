//! Consumer-side rendering of emitted records
//!
//! Turns a decoded [`CallRecord`] into a document a human can read: flag
//! words become lists of names, stateid types and open claims become their
//! symbolic names, and handles become hex. Bits without a known name render
//! as `Bit N`.

use serde::Serialize;
use std::io::Write;

use crate::call_record::{until_nul, CallRecord};
use crate::cli::OutputFormat;
use crate::event_record::{self, EventBytes};
use crate::probes::{PointId, ProbeSite};
use crate::ring_buffer::RecordSink;
use crate::snapshot::{
    ClientStateSnapshot, FileHandleSnapshot, RunOpenTaskCapture, StateIdSnapshot, StateSnapshot,
};

/// `nfs4_state.flags` bits
pub const STATE_FLAGS: &[&str] = &[
    "LK_STATE_IN_USE",
    "NFS_DELEGATED_STATE",
    "NFS_OPEN_STATE",
    "NFS_O_RDONLY_STATE",
    "NFS_O_WRONLY_STATE",
    "NFS_O_RDWR_STATE",
    "NFS_STATE_RECLAIM_REBOOT",
    "NFS_STATE_RECLAIM_NOGRACE",
    "NFS_STATE_POSIX_LOCKS",
    "NFS_STATE_RECOVERY_FAILED",
    "NFS_STATE_MAY_NOTIFY_LOCK",
    "NFS_STATE_CHANGE_WAIT",
    "NFS_CLNT_DST_SSC_COPY_STATE",
];

/// `fmode_t` bits
pub const FMODE_FLAGS: &[&str] = &[
    "FMODE_READ",
    "FMODE_WRITE",
    "FMODE_LSEEK",
    "FMODE_PREAD",
    "FMODE_PWRITE",
    "FMODE_EXEC",
    "FMODE_NDELAY",
    "FMODE_EXCL",
    "FMODE_WRITE_IOCTL",
    "FMODE_32BITHASH",
    "FMODE_64BITHASH",
    "FMODE_NOCMTIME",
    "FMODE_RANDOM",
    "FMODE_UNSIGNED_OFFSET",
    "FMODE_PATH",
    "FMODE_ATOMIC_POS",
    "FMODE_WRITER",
    "FMODE_CAN_READ",
    "FMODE_CAN_WRITE",
    "FMODE_OPENED",
    "FMODE_CREATED",
    "FMODE_STREAM",
    "FMODE_NONOTIFY",
    "FMODE_NOWAIT",
    "FMODE_NEED_UNMOUNT",
    "FMODE_NOACCOUNT",
];

/// `nfs_client.cl_state` bits
pub const CLIENT_STATES: &[&str] = &[
    "NFS4CLNT_MANAGER_RUNNING",
    "NFS4CLNT_CHECK_LEASE",
    "NFS4CLNT_LEASE_EXPIRED",
    "NFS4CLNT_RECLAIM_REBOOT",
    "NFS4CLNT_RECLAIM_NOGRACE",
    "NFS4CLNT_DELEGRETURN",
    "NFS4CLNT_SESSION_RESET",
    "NFS4CLNT_LEASE_CONFIRM",
    "NFS4CLNT_SERVER_SCOPE_MISMATCH",
    "NFS4CLNT_PURGE_STATE",
    "NFS4CLNT_BIND_CONN_TO_SESSION",
    "NFS4CLNT_MOVED",
    "NFS4CLNT_LEASE_MOVED",
    "NFS4CLNT_DELEGATION_EXPIRED",
    "NFS4CLNT_RUN_MANAGER",
    "NFS4CLNT_DELEGRETURN_RUNNING",
];

const REASON_FLAGS: &[&str] = &["SAMPLE", "SLOW", "SEQID", "RECLAIM_NOGRACE", "FILE"];

const OPEN_CLAIMS: &[&str] = &[
    "NFS4_OPEN_CLAIM_NULL",
    "NFS4_OPEN_CLAIM_PREVIOUS",
    "NFS4_OPEN_CLAIM_DELEGATE_CUR",
    "NFS4_OPEN_CLAIM_DELEGATE_PREV",
    "NFS4_OPEN_CLAIM_FH",
    "NFS4_OPEN_CLAIM_DELEG_CUR_FH",
    "NFS4_OPEN_CLAIM_DELEG_PREV_FH",
];

const SHARE_ACCESS: &[&str] = &[
    "",
    "NFS4_SHARE_ACCESS_READ",
    "NFS4_SHARE_ACCESS_WRITE",
    "NFS4_SHARE_ACCESS_BOTH",
];

const SHARE_WANTS: &[&str] = &[
    "NFS4_SHARE_WANT_NO_PREFERENCE",
    "NFS4_SHARE_WANT_READ_DELEG",
    "NFS4_SHARE_WANT_WRITE_DELEG",
    "NFS4_SHARE_WANT_ANY_DELEG",
    "NFS4_SHARE_WANT_NO_DELEG",
    "NFS4_SHARE_WANT_CANCEL",
];

const STATEID_TYPES: &[&str] = &[
    "NFS4_INVALID_STATEID_TYPE",
    "NFS4_SPECIAL_STATEID_TYPE",
    "NFS4_OPEN_STATEID_TYPE",
    "NFS4_LOCK_STATEID_TYPE",
    "NFS4_DELEGATION_STATEID_TYPE",
    "NFS4_LAYOUT_STATEID_TYPE",
    "NFS4_PNFS_DS_STATEID_TYPE",
    "NFS4_REVOKED_STATEID_TYPE",
];

/// Names of the set bits of `bits`, lowest first
///
/// `width` bounds the scan (32 or 64). Bits past the name table, or with an
/// empty name, render as `Bit N`.
pub fn flag_names(bits: u64, names: &[&str], width: u32) -> Vec<String> {
    (0..width)
        .filter(|i| bits >> i & 1 == 1)
        .map(|i| match names.get(i as usize) {
            Some(name) if !name.is_empty() => (*name).to_string(),
            _ => format!("Bit {}", i),
        })
        .collect()
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(until_nul(bytes)).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateIdView {
    pub seqid: u32,
    pub other: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl From<&StateIdSnapshot> for StateIdView {
    fn from(s: &StateIdSnapshot) -> Self {
        StateIdView {
            seqid: s.seqid_value(),
            other: hex::encode(s.other),
            kind: STATEID_TYPES
                .get(s.kind as usize)
                .map(|n| (*n).to_string())
                .unwrap_or_else(|| format!("UNKNOWN_TYPE: {}", s.kind)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateView {
    pub open_stateid: StateIdView,
    pub stateid: StateIdView,
    pub flags: Vec<String>,
    pub n_rdonly: u32,
    pub n_wronly: u32,
    pub n_rdwr: u32,
    pub state: Vec<String>,
}

impl From<&StateSnapshot> for StateView {
    fn from(s: &StateSnapshot) -> Self {
        StateView {
            open_stateid: (&s.open_stateid).into(),
            stateid: (&s.stateid).into(),
            flags: flag_names(s.flags, STATE_FLAGS, 64),
            n_rdonly: s.n_rdonly,
            n_wronly: s.n_wronly,
            n_rdwr: s.n_rdwr,
            state: flag_names(u64::from(s.state), FMODE_FLAGS, 32),
        }
    }
}

fn fh_hex(fh: &FileHandleSnapshot) -> String {
    format!("0x{}", hex::encode(fh.as_bytes()))
}

/// Low nibble is the access mode, the second byte the delegation want
fn share_access_names(share_access: u32) -> Vec<String> {
    let access = (share_access & 0x0f) as usize;
    let access = match SHARE_ACCESS.get(access) {
        Some(name) if !name.is_empty() => (*name).to_string(),
        _ => format!("UNKNOWN LOWER 4 BITS: {}", access),
    };
    let want = ((share_access & 0xff00) >> 8) as usize;
    let want = match SHARE_WANTS.get(want) {
        Some(name) => (*name).to_string(),
        None => format!("UNKNOWN MIDDLE 8 BITS: {}", want),
    };
    vec![access, want]
}

fn claim_name(claim: u8) -> String {
    OPEN_CLAIMS
        .get(claim as usize)
        .map(|n| (*n).to_string())
        .unwrap_or_else(|| format!("UNKNOWN VALUE: {}", claim))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOpenTaskView {
    pub enter_fh: String,
    pub enter_share_access: Vec<String>,
    pub enter_claim: String,
    pub return_stateid: StateIdView,
}

impl From<&RunOpenTaskCapture> for RunOpenTaskView {
    fn from(c: &RunOpenTaskCapture) -> Self {
        RunOpenTaskView {
            enter_fh: fh_hex(&c.enter_fh),
            enter_share_access: share_access_names(c.enter_share_access),
            enter_claim: claim_name(c.enter_claim),
            return_stateid: (&c.return_stateid).into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimNograceView {
    pub enter_state: StateView,
    pub return_state: StateView,
    pub executed: bool,
    pub result: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientView {
    pub cl_state: Vec<String>,
}

impl From<&ClientStateSnapshot> for ClientView {
    fn from(c: &ClientStateSnapshot) -> Self {
        ClientView {
            cl_state: flag_names(c.cl_state, CLIENT_STATES, 64),
        }
    }
}

/// One entry of the ordered trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointView {
    pub id: u8,
    /// `edge:symbol`, absent for ids outside the catalogue
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    pub delta_us: u32,
    /// Total visits to this point over the whole call
    pub total: u8,
}

/// Human-readable rendition of one emitted call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedEvent {
    pub start_us: u64,
    pub elapsed_us: u64,
    pub pid: u64,
    pub task: String,
    pub file: String,
    pub reason: Vec<String>,
    pub points: Vec<PointView>,
    /// True when the trace filled up and later visits were only counted
    pub truncated: bool,
    pub counts: Vec<u8>,
    pub nfs4_run_open_task: RunOpenTaskView,
    pub nfs4_opendata_to_nfs4_state: StateIdView,
    pub update_open_stateid: UpdateOpenStateidView,
    pub nfs4_state_mark_reclaim_nograce: ReclaimNograceView,
    pub nfs4_wait_clnt_recover: ClientView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateOpenStateidView {
    pub open_stateid: StateIdView,
    pub state: StateView,
}

/// Render a decoded record
pub fn render(record: &CallRecord) -> RenderedEvent {
    let visits = record.visits.as_array();
    let points = record
        .trace
        .entries()
        .map(|(id, delta_us)| {
            let point = PointId::new(id);
            PointView {
                id,
                site: point
                    .and_then(ProbeSite::for_point)
                    .map(|site| site.to_string()),
                delta_us,
                total: visits.get(id as usize).copied().unwrap_or(0),
            }
        })
        .collect();

    let snaps = &record.snapshots;
    let reclaim = &snaps.reclaim_nograce;
    RenderedEvent {
        start_us: record.start_time_us,
        elapsed_us: record.elapsed_us,
        pid: record.pid,
        task: lossy(&record.task_name),
        file: lossy(&record.target_name),
        reason: flag_names(u64::from(record.reason.bits()), REASON_FLAGS, 32),
        points,
        truncated: record.trace.is_full(),
        counts: visits.to_vec(),
        nfs4_run_open_task: (&snaps.run_open_task).into(),
        nfs4_opendata_to_nfs4_state: (&snaps.opendata_to_state.stateid).into(),
        update_open_stateid: UpdateOpenStateidView {
            open_stateid: (&snaps.update_open_stateid.open_stateid).into(),
            state: (&snaps.update_open_stateid.state).into(),
        },
        nfs4_state_mark_reclaim_nograce: ReclaimNograceView {
            enter_state: (&reclaim.enter_state).into(),
            return_state: (&reclaim.return_state).into(),
            executed: reclaim.executed != 0,
            result: reclaim.result,
        },
        nfs4_wait_clnt_recover: (&snaps.wait_clnt_recover.client).into(),
    }
}

fn text_line(event: &RenderedEvent) -> String {
    let trace: Vec<String> = event
        .points
        .iter()
        .map(|p| format!("{}+{}", p.id, p.delta_us))
        .collect();
    format!(
        "pid={} task={} file={} elapsed_us={} reason={} trace=[{}]{}",
        event.pid,
        event.task,
        event.file,
        event.elapsed_us,
        event.reason.join("|"),
        trace.join(" "),
        if event.truncated { " (truncated)" } else { "" }
    )
}

/// Sink that decodes, renders and writes every drained record
pub struct RenderSink<W: Write + Send + 'static> {
    out: W,
    format: OutputFormat,
    written: u64,
    failed: u64,
}

impl<W: Write + Send + 'static> RenderSink<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        RenderSink {
            out,
            format,
            written: 0,
            failed: 0,
        }
    }

    fn write_one(&mut self, bytes: &EventBytes) -> anyhow::Result<()> {
        let record = event_record::decode(bytes)?;
        let event = render(&record);
        tracing::debug!(
            pid = event.pid,
            elapsed_us = event.elapsed_us,
            reason = %record.reason,
            "event"
        );
        match self.format {
            OutputFormat::Json => {
                serde_json::to_writer(&mut self.out, &event)?;
                writeln!(self.out)?;
            }
            OutputFormat::Text => writeln!(self.out, "{}", text_line(&event))?,
        }
        Ok(())
    }
}

impl<W: Write + Send + 'static> RecordSink for RenderSink<W> {
    fn consume(&mut self, batch: &[EventBytes]) {
        for bytes in batch {
            match self.write_one(bytes) {
                Ok(()) => self.written += 1,
                Err(e) => {
                    self.failed += 1;
                    tracing::error!(error = %e, "failed to render event");
                }
            }
        }
    }

    fn finish(&mut self) {
        if let Err(e) = self.out.flush() {
            tracing::error!(error = %e, "failed to flush output");
        }
        tracing::info!(
            written = self.written,
            failed = self.failed,
            "event output finished"
        );
    }
}
