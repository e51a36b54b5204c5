//! Fixed-layout outbound event record
//!
//! One record per emitted call, packed, integers little-endian. The layout is
//! the consumer contract; every field has a fixed offset.
//!
//! ```text
//! offset  size  field
//!      0     8  ts (call start, µs)
//!      8   128  point_ids[128]
//!    136   512  point_deltas[128] (u32 µs since start)
//!    648    48  call_counts[48]
//!    696    16  task
//!    712    32  file
//!    744     8  pid
//!    752     8  delta (elapsed µs)
//!    760   154  nfs4_run_open_task   { fh{size u8, data[128]}, share_access u32, claim u8, stateid }
//!    914    20  _nfs4_opendata_to_nfs4_state { stateid }
//!    934    84  update_open_stateid { stateid, state }
//!   1018   136  nfs4_state_mark_reclaim_nograce { state, state, executed u32, result u32 }
//!   1154     8  nfs4_wait_clnt_recover { cl_state u64 }
//!   1162     4  order_index (trace length)
//!   1166     4  reason
//! ```
//!
//! stateid = seqid[4] + other[12] + type u32 (20 bytes);
//! state = open_stateid + stateid + flags u64 + n_rdonly + n_wronly + n_rdwr + state u32 (64 bytes).

use thiserror::Error;

use crate::call_record::{
    CallRecord, OrderTrace, VisitCounts, CALL_ORDER_COUNT, DNAME_INLINE_LEN, NFS_MAXFHSIZE,
    SLOW_POINT_COUNT, STATEID_OTHER_SIZE, TASK_COMM_LEN,
};
use crate::emission::ReasonMask;
use crate::snapshot::{ClientStateSnapshot, FileHandleSnapshot, StateIdSnapshot, StateSnapshot};

/// Encoded size of a stateid
pub const STATEID_WIRE_SIZE: usize = 4 + STATEID_OTHER_SIZE + 4;
/// Encoded size of an open state
pub const STATE_WIRE_SIZE: usize = 2 * STATEID_WIRE_SIZE + 8 + 4 * 4;
/// Encoded size of one event record
pub const EVENT_RECORD_SIZE: usize = 8
    + CALL_ORDER_COUNT
    + 4 * CALL_ORDER_COUNT
    + SLOW_POINT_COUNT
    + TASK_COMM_LEN
    + DNAME_INLINE_LEN
    + 8
    + 8
    + (1 + NFS_MAXFHSIZE + 4 + 1 + STATEID_WIRE_SIZE)
    + STATEID_WIRE_SIZE
    + (STATEID_WIRE_SIZE + STATE_WIRE_SIZE)
    + (2 * STATE_WIRE_SIZE + 4 + 4)
    + 8
    + 4
    + 4;

/// Offset of the reason word, the last field
pub const REASON_OFFSET: usize = EVENT_RECORD_SIZE - 4;

/// One encoded record
pub type EventBytes = [u8; EVENT_RECORD_SIZE];

/// Errors decoding a record received from the output channel
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("event record is {found} bytes, expected {expected}")]
    Length { expected: usize, found: usize },
}

struct WireWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> WireWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        WireWriter { buf, pos: 0 }
    }

    fn bytes(&mut self, src: &[u8]) {
        self.buf[self.pos..self.pos + src.len()].copy_from_slice(src);
        self.pos += src.len();
    }

    fn u8(&mut self, v: u8) {
        self.bytes(&[v]);
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }

    fn stateid(&mut self, s: &StateIdSnapshot) {
        self.bytes(&s.seqid);
        self.bytes(&s.other);
        self.u32(s.kind);
    }

    fn state(&mut self, s: &StateSnapshot) {
        self.stateid(&s.open_stateid);
        self.stateid(&s.stateid);
        self.u64(s.flags);
        self.u32(s.n_rdonly);
        self.u32(s.n_wronly);
        self.u32(s.n_rdwr);
        self.u32(s.state);
    }
}

struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        WireReader { buf, pos: 0 }
    }

    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.array::<1>()[0]
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.array())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.array())
    }

    fn stateid(&mut self) -> StateIdSnapshot {
        StateIdSnapshot {
            seqid: self.array(),
            other: self.array(),
            kind: self.u32(),
        }
    }

    fn state(&mut self) -> StateSnapshot {
        StateSnapshot {
            open_stateid: self.stateid(),
            stateid: self.stateid(),
            flags: self.u64(),
            n_rdonly: self.u32(),
            n_wronly: self.u32(),
            n_rdwr: self.u32(),
            state: self.u32(),
        }
    }
}

/// Encode a finished call into `out`
pub fn encode_into(record: &CallRecord, out: &mut EventBytes) {
    let mut w = WireWriter::new(out);
    w.u64(record.start_time_us);
    w.bytes(record.trace.ids());
    for delta in record.trace.deltas() {
        w.u32(*delta);
    }
    w.bytes(record.visits.as_array());
    w.bytes(&record.task_name);
    w.bytes(&record.target_name);
    w.u64(record.pid);
    w.u64(record.elapsed_us);

    let snaps = &record.snapshots;
    let task = &snaps.run_open_task;
    w.u8(task.enter_fh.size);
    w.bytes(&task.enter_fh.data);
    w.u32(task.enter_share_access);
    w.u8(task.enter_claim);
    w.stateid(&task.return_stateid);

    w.stateid(&snaps.opendata_to_state.stateid);

    w.stateid(&snaps.update_open_stateid.open_stateid);
    w.state(&snaps.update_open_stateid.state);

    let reclaim = &snaps.reclaim_nograce;
    w.state(&reclaim.enter_state);
    w.state(&reclaim.return_state);
    w.u32(reclaim.executed);
    w.u32(reclaim.result);

    w.u64(snaps.wait_clnt_recover.client.cl_state);

    w.u32(record.trace.len() as u32);
    w.u32(record.reason.bits());
    debug_assert_eq!(w.pos, EVENT_RECORD_SIZE);
}

/// Encode a finished call into a fresh buffer
pub fn encode(record: &CallRecord) -> EventBytes {
    let mut out = [0u8; EVENT_RECORD_SIZE];
    encode_into(record, &mut out);
    out
}

/// Decode a record read from the output channel
pub fn decode(bytes: &[u8]) -> Result<CallRecord, DecodeError> {
    if bytes.len() != EVENT_RECORD_SIZE {
        return Err(DecodeError::Length {
            expected: EVENT_RECORD_SIZE,
            found: bytes.len(),
        });
    }

    let mut r = WireReader::new(bytes);
    let mut record = CallRecord::ZEROED;
    record.start_time_us = r.u64();
    let ids: [u8; CALL_ORDER_COUNT] = r.array();
    let mut deltas = [0u32; CALL_ORDER_COUNT];
    for delta in deltas.iter_mut() {
        *delta = r.u32();
    }
    record.visits = VisitCounts::from_array(r.array());
    record.task_name = r.array();
    record.target_name = r.array();
    record.pid = r.u64();
    record.elapsed_us = r.u64();

    let snaps = &mut record.snapshots;
    snaps.run_open_task.enter_fh = FileHandleSnapshot {
        size: r.u8(),
        data: r.array(),
    };
    snaps.run_open_task.enter_share_access = r.u32();
    snaps.run_open_task.enter_claim = r.u8();
    snaps.run_open_task.return_stateid = r.stateid();

    snaps.opendata_to_state.stateid = r.stateid();

    snaps.update_open_stateid.open_stateid = r.stateid();
    snaps.update_open_stateid.state = r.state();

    snaps.reclaim_nograce.enter_state = r.state();
    snaps.reclaim_nograce.return_state = r.state();
    snaps.reclaim_nograce.executed = r.u32();
    snaps.reclaim_nograce.result = r.u32();

    snaps.wait_clnt_recover.client = ClientStateSnapshot { cl_state: r.u64() };

    let order_index = r.u32();
    record.trace = OrderTrace::from_parts(ids, deltas, order_index);
    record.reason = ReasonMask::from_bits(r.u32());
    Ok(record)
}
