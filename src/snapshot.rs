//! Structured snapshots of NFSv4 client state and the capturers that fill them
//!
//! Every capturer is wired to exactly one probe site. It records the point
//! visit and then copies specific fields from the live objects supplied with
//! the notification into fixed-width fields of the call record.
//!
//! Copies are field by field and best-effort: a field that cannot be read
//! keeps its previous value. Failures are tallied in a [`CaptureOutcome`]
//! so tests and engine statistics can see them.

use crate::call_record::{CallRecord, NFS_MAXFHSIZE, STATEID_OTHER_SIZE};
use crate::emission::Reason;
use crate::layout::{Field, LayoutSet, ObjectView, ReadError};
use crate::notification::ProbeArgs;
use crate::probes::{Capture, PointId};

/// Versioned lease identifier (`nfs4_stateid`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateIdSnapshot {
    /// Sequence number in network byte order
    pub seqid: [u8; 4],
    pub other: [u8; STATEID_OTHER_SIZE],
    pub kind: u32,
}

impl StateIdSnapshot {
    pub const ZEROED: StateIdSnapshot = StateIdSnapshot {
        seqid: [0; 4],
        other: [0; STATEID_OTHER_SIZE],
        kind: 0,
    };

    /// Sequence number with the wire byte order corrected
    pub fn seqid_value(&self) -> u32 {
        seqid_value(self.seqid)
    }

    pub fn capture(&mut self, src: Option<ObjectView<'_>>, out: &mut CaptureOutcome) {
        out.apply(read(src, |v| v.read_array(Field::Seqid)), &mut self.seqid);
        out.apply(read(src, |v| v.read_array(Field::Other)), &mut self.other);
        out.apply(
            read(src, |v| v.read_uint(Field::Type).map(|t| t as u32)),
            &mut self.kind,
        );
    }
}

/// Decode a stateid sequence number; it travels most significant byte first
pub fn seqid_value(raw: [u8; 4]) -> u32 {
    u32::from_be_bytes(raw)
}

/// File handle (`nfs_fh`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandleSnapshot {
    pub size: u8,
    pub data: [u8; NFS_MAXFHSIZE],
}

impl FileHandleSnapshot {
    pub const ZEROED: FileHandleSnapshot = FileHandleSnapshot {
        size: 0,
        data: [0; NFS_MAXFHSIZE],
    };

    /// Meaningful prefix of the handle
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..(self.size as usize).min(NFS_MAXFHSIZE)]
    }

    pub fn capture(&mut self, src: Option<ObjectView<'_>>, out: &mut CaptureOutcome) {
        out.apply(
            read(src, |v| v.read_uint(Field::FhSize).map(|s| s as u8)),
            &mut self.size,
        );
        out.apply(read(src, |v| v.read_array(Field::FhData)), &mut self.data);
    }
}

/// Open state (`nfs4_state`) at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub open_stateid: StateIdSnapshot,
    pub stateid: StateIdSnapshot,
    pub flags: u64,
    pub n_rdonly: u32,
    pub n_wronly: u32,
    pub n_rdwr: u32,
    /// fmode the server granted
    pub state: u32,
}

impl StateSnapshot {
    pub const ZEROED: StateSnapshot = StateSnapshot {
        open_stateid: StateIdSnapshot::ZEROED,
        stateid: StateIdSnapshot::ZEROED,
        flags: 0,
        n_rdonly: 0,
        n_wronly: 0,
        n_rdwr: 0,
        state: 0,
    };

    pub fn capture(
        &mut self,
        src: Option<ObjectView<'_>>,
        layouts: &LayoutSet,
        out: &mut CaptureOutcome,
    ) {
        let open_stateid = src.and_then(|v| v.nested(Field::OpenStateid, &layouts.stateid).ok());
        self.open_stateid.capture(open_stateid, out);
        let stateid = src.and_then(|v| v.nested(Field::Stateid, &layouts.stateid).ok());
        self.stateid.capture(stateid, out);

        out.apply(read(src, |v| v.read_uint(Field::Flags)), &mut self.flags);
        out.apply(read_u32(src, Field::NRdwr), &mut self.n_rdwr);
        out.apply(read_u32(src, Field::NWronly), &mut self.n_wronly);
        out.apply(read_u32(src, Field::NRdonly), &mut self.n_rdonly);
        out.apply(read_u32(src, Field::Mode), &mut self.state);
    }
}

/// Recovery status word of the owning `nfs_client`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStateSnapshot {
    pub cl_state: u64,
}

impl ClientStateSnapshot {
    pub const ZEROED: ClientStateSnapshot = ClientStateSnapshot { cl_state: 0 };

    pub fn capture(&mut self, src: Option<ObjectView<'_>>, out: &mut CaptureOutcome) {
        out.apply(read(src, |v| v.read_uint(Field::ClState)), &mut self.cl_state);
    }
}

/// `nfs4_run_open_task`: arguments at entry, result stateid at return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOpenTaskCapture {
    pub enter_fh: FileHandleSnapshot,
    pub enter_share_access: u32,
    pub enter_claim: u8,
    pub return_stateid: StateIdSnapshot,
}

/// `_nfs4_opendata_to_nfs4_state`: stateid the server returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpendataToStateCapture {
    pub stateid: StateIdSnapshot,
}

/// `update_open_stateid`: the new open stateid and the state it updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOpenStateidCapture {
    pub open_stateid: StateIdSnapshot,
    pub state: StateSnapshot,
}

/// `nfs4_state_mark_reclaim_nograce`: state before and after, and the outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimNograceCapture {
    pub enter_state: StateSnapshot,
    pub return_state: StateSnapshot,
    pub executed: u32,
    pub result: u32,
}

/// Return value meaning the state was marked for non-graceful reclaim
pub const RECLAIM_MARKED: u32 = 1;

/// `nfs4_wait_clnt_recover`: client state while waiting for recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitClntRecoverCapture {
    pub client: ClientStateSnapshot,
}

/// All structured captures carried by a call record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainSnapshots {
    pub run_open_task: RunOpenTaskCapture,
    pub opendata_to_state: OpendataToStateCapture,
    pub update_open_stateid: UpdateOpenStateidCapture,
    pub reclaim_nograce: ReclaimNograceCapture,
    pub wait_clnt_recover: WaitClntRecoverCapture,
}

impl DomainSnapshots {
    pub const ZEROED: DomainSnapshots = DomainSnapshots {
        run_open_task: RunOpenTaskCapture {
            enter_fh: FileHandleSnapshot::ZEROED,
            enter_share_access: 0,
            enter_claim: 0,
            return_stateid: StateIdSnapshot::ZEROED,
        },
        opendata_to_state: OpendataToStateCapture {
            stateid: StateIdSnapshot::ZEROED,
        },
        update_open_stateid: UpdateOpenStateidCapture {
            open_stateid: StateIdSnapshot::ZEROED,
            state: StateSnapshot::ZEROED,
        },
        reclaim_nograce: ReclaimNograceCapture {
            enter_state: StateSnapshot::ZEROED,
            return_state: StateSnapshot::ZEROED,
            executed: 0,
            result: 0,
        },
        wait_clnt_recover: WaitClntRecoverCapture {
            client: ClientStateSnapshot::ZEROED,
        },
    };
}

/// Tally of field reads performed by one capture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureOutcome {
    pub attempted: u16,
    pub failed: u16,
}

impl CaptureOutcome {
    /// Store a successful read into `dst`; count a failed one and leave `dst` alone
    pub fn apply<T>(&mut self, read: Result<T, ReadError>, dst: &mut T) {
        self.attempted += 1;
        match read {
            Ok(value) => *dst = value,
            Err(_) => self.failed += 1,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

fn read<'a, T>(
    src: Option<ObjectView<'a>>,
    f: impl FnOnce(ObjectView<'a>) -> Result<T, ReadError>,
) -> Result<T, ReadError> {
    src.ok_or(ReadError::NoObject).and_then(f)
}

fn read_u32(src: Option<ObjectView<'_>>, field: Field) -> Result<u32, ReadError> {
    read(src, |v| v.read_uint(field).map(|n| n as u32))
}

const PENDING_RUN_OPEN_TASK: u16 = Capture::RunOpenTaskEnter.bit();
const PENDING_RECLAIM_NOGRACE: u16 = Capture::ReclaimNograceEnter.bit();

/// Capture the target file's short name at call entry
pub fn capture_target_name(
    record: &mut CallRecord,
    dentry: Option<ObjectView<'_>>,
) -> CaptureOutcome {
    let mut out = CaptureOutcome::default();
    out.apply(
        read(dentry, |v| v.read_array(Field::DIname)),
        &mut record.target_name,
    );
    out
}

/// Run the capturer wired to a probe site
///
/// Return-edge captures only act when their entry half ran for this call;
/// otherwise the notification is ignored entirely, point included.
pub fn apply_capture(
    capture: Capture,
    record: &mut CallRecord,
    point: PointId,
    now_us: u64,
    args: &ProbeArgs<'_>,
    layouts: &LayoutSet,
) -> CaptureOutcome {
    let mut out = CaptureOutcome::default();
    let snaps = &mut record.snapshots;

    match capture {
        Capture::RunOpenTaskEnter => {
            record.record_point(point, now_us);
            let task = &mut record.snapshots.run_open_task;
            task.enter_fh.capture(args.fh, &mut out);
            out.apply(
                read_u32(args.opendata, Field::ShareAccess),
                &mut task.enter_share_access,
            );
            out.apply(
                read(args.opendata, |v| v.read_uint(Field::Claim).map(|c| c as u8)),
                &mut task.enter_claim,
            );
            record.pending |= PENDING_RUN_OPEN_TASK;
        }
        Capture::RunOpenTaskReturn => {
            if record.pending & PENDING_RUN_OPEN_TASK == 0 {
                return out;
            }
            record.record_point(point, now_us);
            let stateid = args
                .opendata
                .and_then(|v| v.nested(Field::OResStateid, &layouts.stateid).ok());
            let returned = &mut record.snapshots.run_open_task.return_stateid;
            returned.capture(stateid, &mut out);
            if returned.seqid_value() > 1 {
                record.latched.insert(Reason::Seqid);
            }
            record.pending &= !PENDING_RUN_OPEN_TASK;
        }
        Capture::OpendataToState => {
            let stateid = args
                .opendata
                .and_then(|v| v.nested(Field::OResStateid, &layouts.stateid).ok());
            snaps.opendata_to_state.stateid.capture(stateid, &mut out);
            record.record_point(point, now_us);
        }
        Capture::UpdateOpenStateid => {
            let update = &mut snaps.update_open_stateid;
            update.open_stateid.capture(args.stateid, &mut out);
            update.state.capture(args.state, layouts, &mut out);
            record.record_point(point, now_us);
        }
        Capture::ReclaimNograceEnter => {
            let reclaim = &mut snaps.reclaim_nograce;
            reclaim.enter_state.capture(args.state, layouts, &mut out);
            reclaim.executed = 1;
            record.record_point(point, now_us);
            record.pending |= PENDING_RECLAIM_NOGRACE;
        }
        Capture::ReclaimNograceReturn => {
            if record.pending & PENDING_RECLAIM_NOGRACE == 0 {
                return out;
            }
            let reclaim = &mut snaps.reclaim_nograce;
            out.apply(
                args.ret.map(|r| r as u32).ok_or(ReadError::NoObject),
                &mut reclaim.result,
            );
            reclaim.return_state.capture(args.state, layouts, &mut out);
            if args.ret.is_some() && reclaim.result == RECLAIM_MARKED {
                record.latched.insert(Reason::ReclaimNograce);
            }
            record.record_point(point, now_us);
            record.pending &= !PENDING_RECLAIM_NOGRACE;
        }
        Capture::WaitClntRecover => {
            snaps.wait_clnt_recover.client.capture(args.client, &mut out);
            record.record_point(point, now_us);
        }
    }
    out
}
