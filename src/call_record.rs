//! Per-call record and the point recorder
//!
//! A [`CallRecord`] lives in the correlation table from the moment an open
//! call enters until it returns. It is a fixed-size `Copy` value so that
//! installing, updating and emitting it never allocates.
//!
//! Two views of the visited points are kept side by side:
//!
//! - [`VisitCounts`]: how often each point fired (always complete, saturates at 255)
//! - [`OrderTrace`]: in what order and when (bounded, keeps the head once full)

use crate::emission::ReasonMask;
use crate::probes::PointId;
use crate::snapshot::DomainSnapshots;

/// Capacity of the ordered-visit trace
pub const CALL_ORDER_COUNT: usize = 128;
/// Size of the point-id domain
pub const SLOW_POINT_COUNT: usize = 48;
/// Length of the calling task's comm
pub const TASK_COMM_LEN: usize = 16;
/// Length of a dentry's inline short name
pub const DNAME_INLINE_LEN: usize = 32;
/// Largest NFS file handle
pub const NFS_MAXFHSIZE: usize = 128;
/// Opaque part of an NFSv4 stateid
pub const STATEID_OTHER_SIZE: usize = 12;

/// Append-only trace of `(point_id, elapsed_us)` entries
///
/// Never wraps: once `CALL_ORDER_COUNT` entries are stored the trace is marked
/// full and later visits are dropped, so the stored entries are always a
/// prefix of the true visit sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderTrace {
    ids: [u8; CALL_ORDER_COUNT],
    deltas: [u32; CALL_ORDER_COUNT],
    len: u32,
    full: bool,
}

impl OrderTrace {
    pub const EMPTY: OrderTrace = OrderTrace {
        ids: [0; CALL_ORDER_COUNT],
        deltas: [0; CALL_ORDER_COUNT],
        len: 0,
        full: false,
    };

    /// Append an entry; returns false when the trace is already full
    pub fn push(&mut self, point: PointId, delta_us: u32) -> bool {
        if self.full {
            return false;
        }
        let at = self.len as usize;
        self.ids[at] = point.get();
        self.deltas[at] = delta_us;
        self.len += 1;
        if self.len as usize == CALL_ORDER_COUNT {
            self.full = true;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Stored entries in visit order
    pub fn entries(&self) -> impl Iterator<Item = (u8, u32)> + '_ {
        self.ids[..self.len()]
            .iter()
            .copied()
            .zip(self.deltas[..self.len()].iter().copied())
    }

    /// Raw id column, zero padded past `len`
    pub fn ids(&self) -> &[u8; CALL_ORDER_COUNT] {
        &self.ids
    }

    /// Raw delta column, zero padded past `len`
    pub fn deltas(&self) -> &[u32; CALL_ORDER_COUNT] {
        &self.deltas
    }

    /// Rebuild a trace from wire columns; `len` is clamped to capacity
    pub fn from_parts(ids: [u8; CALL_ORDER_COUNT], deltas: [u32; CALL_ORDER_COUNT], len: u32) -> Self {
        let len = len.min(CALL_ORDER_COUNT as u32);
        OrderTrace {
            ids,
            deltas,
            len,
            full: len as usize == CALL_ORDER_COUNT,
        }
    }
}

/// Saturating per-point visit counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisitCounts([u8; SLOW_POINT_COUNT]);

impl VisitCounts {
    pub const ZERO: VisitCounts = VisitCounts([0; SLOW_POINT_COUNT]);

    pub fn bump(&mut self, point: PointId) {
        let slot = &mut self.0[point.index()];
        *slot = slot.saturating_add(1);
    }

    pub fn get(&self, point: PointId) -> u8 {
        self.0[point.index()]
    }

    pub fn as_array(&self) -> &[u8; SLOW_POINT_COUNT] {
        &self.0
    }

    pub fn from_array(counts: [u8; SLOW_POINT_COUNT]) -> Self {
        VisitCounts(counts)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&c| c == 0)
    }
}

/// State accumulated for one in-flight open call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRecord {
    /// Monotonic microseconds at call entry
    pub start_time_us: u64,
    pub trace: OrderTrace,
    pub visits: VisitCounts,
    /// Short name of the file being opened, NUL padded
    pub target_name: [u8; DNAME_INLINE_LEN],
    /// Calling task's comm, filled at exit
    pub task_name: [u8; TASK_COMM_LEN],
    pub pid: u64,
    pub elapsed_us: u64,
    pub snapshots: DomainSnapshots,
    /// Captures whose entry half ran and whose return half is outstanding
    pub pending: u16,
    /// Reasons raised by a capture, held until exit even if a later retry clears them
    pub latched: ReasonMask,
    pub reason: ReasonMask,
}

impl CallRecord {
    pub const ZEROED: CallRecord = CallRecord {
        start_time_us: 0,
        trace: OrderTrace::EMPTY,
        visits: VisitCounts::ZERO,
        target_name: [0; DNAME_INLINE_LEN],
        task_name: [0; TASK_COMM_LEN],
        pid: 0,
        elapsed_us: 0,
        snapshots: DomainSnapshots::ZEROED,
        pending: 0,
        latched: ReasonMask::EMPTY,
        reason: ReasonMask::EMPTY,
    };

    /// Reset in place to the zeroed state
    pub fn reset(&mut self) {
        *self = CallRecord::ZEROED;
    }

    /// Microseconds since call entry, saturating on a clock that went backwards
    pub fn elapsed_at(&self, now_us: u64) -> u64 {
        now_us.saturating_sub(self.start_time_us)
    }

    /// Count a visit to `point` and append it to the trace if there is room
    pub fn record_point(&mut self, point: PointId, now_us: u64) {
        self.visits.bump(point);
        if !self.trace.is_full() {
            let delta = u32::try_from(self.elapsed_at(now_us)).unwrap_or(u32::MAX);
            self.trace.push(point, delta);
        }
    }

    /// Target name up to the first NUL
    pub fn target_name_bytes(&self) -> &[u8] {
        until_nul(&self.target_name)
    }

    pub fn set_task_name(&mut self, task: &[u8]) {
        copy_truncated(&mut self.task_name, task);
    }
}

/// Bytes of a NUL-padded field up to the first NUL
pub fn until_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

/// Copy `src` into `dst`, truncating and zero-filling the tail
pub fn copy_truncated(dst: &mut [u8], src: &[u8]) {
    let len = src.len().min(dst.len());
    dst[..len].copy_from_slice(&src[..len]);
    dst[len..].fill(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: u8) -> PointId {
        PointId::new(id).unwrap()
    }

    #[test]
    fn test_zeroed_record_is_empty() {
        let record = CallRecord::ZEROED;
        assert!(record.trace.is_empty());
        assert!(record.visits.is_zero());
        assert!(record.reason.is_empty());
    }

    #[test]
    fn test_record_point_appends_delta() {
        let mut record = CallRecord::ZEROED;
        record.start_time_us = 1_000;
        record.record_point(point(0), 1_010);
        record.record_point(point(7), 1_250);

        let entries: Vec<_> = record.trace.entries().collect();
        assert_eq!(entries, vec![(0, 10), (7, 250)]);
        assert_eq!(record.visits.get(point(0)), 1);
        assert_eq!(record.visits.get(point(7)), 1);
        assert_eq!(record.visits.get(point(17)), 0);
    }

    #[test]
    fn test_trace_keeps_head_when_full() {
        let mut record = CallRecord::ZEROED;
        for i in 0..(CALL_ORDER_COUNT + 10) {
            record.record_point(point((i % 2) as u8), i as u64);
        }

        assert!(record.trace.is_full());
        assert_eq!(record.trace.len(), CALL_ORDER_COUNT);
        let last = record.trace.entries().last().unwrap();
        assert_eq!(last, (1, (CALL_ORDER_COUNT - 1) as u32));
        // Counted even after the trace filled up
        assert_eq!(record.visits.get(point(0)), 69);
        assert_eq!(record.visits.get(point(1)), 69);
    }

    #[test]
    fn test_visit_counts_saturate() {
        let mut record = CallRecord::ZEROED;
        for _ in 0..300 {
            record.record_point(point(5), 0);
        }
        assert_eq!(record.visits.get(point(5)), 255);
    }

    #[test]
    fn test_clock_going_backwards_saturates() {
        let mut record = CallRecord::ZEROED;
        record.start_time_us = 500;
        record.record_point(point(3), 100);
        assert_eq!(record.trace.entries().next(), Some((3, 0)));
    }

    #[test]
    fn test_huge_delta_clamps_to_u32() {
        let mut record = CallRecord::ZEROED;
        record.record_point(point(3), u64::MAX);
        assert_eq!(record.trace.entries().next(), Some((3, u32::MAX)));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut record = CallRecord::ZEROED;
        record.start_time_us = 9;
        record.record_point(point(1), 10);
        record.set_task_name(b"cat");
        record.reset();
        assert_eq!(record, CallRecord::ZEROED);
    }

    #[test]
    fn test_task_name_truncates() {
        let mut record = CallRecord::ZEROED;
        record.set_task_name(b"a-very-long-task-name");
        assert_eq!(&record.task_name, b"a-very-long-task");
        record.set_task_name(b"ls");
        assert_eq!(until_nul(&record.task_name), b"ls");
    }

    #[test]
    fn test_from_parts_clamps_len() {
        let trace = OrderTrace::from_parts([0; CALL_ORDER_COUNT], [0; CALL_ORDER_COUNT], 500);
        assert_eq!(trace.len(), CALL_ORDER_COUNT);
        assert!(trace.is_full());
    }
}
