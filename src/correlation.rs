//! Call correlation table
//!
//! Maps an in-flight call id to its [`CallRecord`]. The table is a fixed array
//! of slots allocated up front; a call id hashes (FNV) to a home slot and may
//! live anywhere in the probe window that follows it.
//!
//! # Concurrency
//!
//! - A slot is claimed by compare-and-swap on its key, so distinct call ids
//!   never contend on anything but the slot they race to claim.
//! - Records are single-writer: every notification for a call id runs on the
//!   thread that owns it, in program order.
//! - Nothing waits. Slot locks are taken with `try_lock`; a busy slot, a full
//!   window or an unknown key turns the operation into a no-op.
//!
//! Removal leaves no tombstone: lookups scan the whole bounded window rather
//! than stopping at the first empty slot.

use fnv::FnvHasher;
use parking_lot::Mutex;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::call_record::CallRecord;

/// Slots scanned from a key's home slot
pub const PROBE_WINDOW: usize = 16;

const EMPTY: u64 = u64::MAX;

struct Slot {
    key: AtomicU64,
    record: Mutex<CallRecord>,
}

/// Fixed-capacity concurrent map from call id to call record
pub struct CorrelationTable {
    slots: Box<[Slot]>,
    mask: usize,
    inserted: AtomicU64,
    overwritten: AtomicU64,
    install_failures: AtomicU64,
}

impl CorrelationTable {
    /// Create a table with at least `capacity` slots (rounded up to a power of two)
    ///
    /// # Panics
    ///
    /// Panics if capacity is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Correlation table capacity must be > 0");
        let size = capacity.next_power_of_two().max(PROBE_WINDOW);
        let slots = (0..size)
            .map(|_| Slot {
                key: AtomicU64::new(EMPTY),
                record: Mutex::new(CallRecord::ZEROED),
            })
            .collect();

        CorrelationTable {
            slots,
            mask: size - 1,
            inserted: AtomicU64::new(0),
            overwritten: AtomicU64::new(0),
            install_failures: AtomicU64::new(0),
        }
    }

    fn home(&self, call_id: u64) -> usize {
        let mut hasher = FnvHasher::default();
        hasher.write_u64(call_id);
        hasher.finish() as usize & self.mask
    }

    fn window(&self, call_id: u64) -> impl Iterator<Item = &Slot> {
        let home = self.home(call_id);
        (0..PROBE_WINDOW).map(move |i| &self.slots[(home + i) & self.mask])
    }

    fn find(&self, call_id: u64) -> Option<&Slot> {
        if call_id == EMPTY {
            return None;
        }
        self.window(call_id)
            .find(|slot| slot.key.load(Ordering::Acquire) == call_id)
    }

    /// Install `template` as the record for `call_id`
    ///
    /// A stale record left by a call whose exit was missed is overwritten.
    /// Returns false when the record could not be installed; later operations
    /// for this call id are then no-ops.
    pub fn begin(&self, call_id: u64, template: &CallRecord) -> bool {
        self.begin_with(call_id, |record| *record = *template)
    }

    /// Like [`begin`](Self::begin), but initialises the slot in place
    pub fn begin_with(&self, call_id: u64, init: impl FnOnce(&mut CallRecord)) -> bool {
        if call_id == EMPTY {
            self.install_failures.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let slot = match self.find(call_id) {
            Some(slot) => {
                self.overwritten.fetch_add(1, Ordering::Relaxed);
                Some(slot)
            }
            None => self.window(call_id).find(|slot| {
                slot.key
                    .compare_exchange(EMPTY, call_id, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            }),
        };

        let Some(slot) = slot else {
            self.install_failures.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        match slot.record.try_lock() {
            Some(mut record) => {
                init(&mut record);
                self.inserted.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                // Someone is still copying the previous occupant out
                slot.key.store(EMPTY, Ordering::Release);
                self.install_failures.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Mutate the record for `call_id` in place
    pub fn update<R>(&self, call_id: u64, f: impl FnOnce(&mut CallRecord) -> R) -> Option<R> {
        let slot = self.find(call_id)?;
        let mut record = slot.record.try_lock()?;
        // The key may have been released between find and lock
        if slot.key.load(Ordering::Acquire) != call_id {
            return None;
        }
        Some(f(&mut record))
    }

    /// Copy of the record for `call_id`
    pub fn lookup(&self, call_id: u64) -> Option<CallRecord> {
        self.update(call_id, |record| *record)
    }

    /// Remove and return the record for `call_id`
    pub fn end(&self, call_id: u64) -> Option<CallRecord> {
        let slot = self.find(call_id)?;
        let record = slot.record.try_lock()?;
        if slot.key.load(Ordering::Acquire) != call_id {
            return None;
        }
        let taken = *record;
        slot.key.store(EMPTY, Ordering::Release);
        drop(record);
        Some(taken)
    }

    pub fn contains(&self, call_id: u64) -> bool {
        self.find(call_id).is_some()
    }

    /// Number of live records (linear scan; diagnostics only)
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.key.load(Ordering::Relaxed) != EMPTY)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            inserted: self.inserted.load(Ordering::Relaxed),
            overwritten: self.overwritten.load(Ordering::Relaxed),
            install_failures: self.install_failures.load(Ordering::Relaxed),
            capacity: self.capacity(),
        }
    }
}

/// Correlation table counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    pub inserted: u64,
    /// Installs that replaced a stale record for the same call id
    pub overwritten: u64,
    /// Installs dropped because the window was full or busy
    pub install_failures: u64,
    pub capacity: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::PointId;

    fn point(id: u8) -> PointId {
        PointId::new(id).unwrap()
    }

    #[test]
    fn test_begin_then_lookup_is_zeroed() {
        let table = CorrelationTable::new(64);
        assert!(table.begin(7, &CallRecord::ZEROED));
        let record = table.lookup(7).unwrap();
        assert!(record.trace.is_empty());
        assert!(record.visits.is_zero());
    }

    #[test]
    fn test_end_twice_is_absent() {
        let table = CorrelationTable::new(64);
        table.begin(7, &CallRecord::ZEROED);
        assert!(table.end(7).is_some());
        assert!(table.end(7).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_begin_overwrites_stale_record() {
        let table = CorrelationTable::new(64);
        table.begin(7, &CallRecord::ZEROED);
        table.update(7, |r| r.record_point(point(3), 10));

        assert!(table.begin(7, &CallRecord::ZEROED));
        assert!(table.lookup(7).unwrap().visits.is_zero());
        assert_eq!(table.len(), 1);
        assert_eq!(table.stats().overwritten, 1);
    }

    #[test]
    fn test_unknown_key_is_noop() {
        let table = CorrelationTable::new(64);
        table.begin(1, &CallRecord::ZEROED);
        assert!(table.update(2, |r| r.record_point(point(0), 0)).is_none());
        assert!(table.lookup(2).is_none());
        assert!(table.end(2).is_none());
        assert!(table.lookup(1).unwrap().visits.is_zero());
    }

    #[test]
    fn test_capacity_rounds_up() {
        assert_eq!(CorrelationTable::new(10240).capacity(), 16384);
        assert_eq!(CorrelationTable::new(1).capacity(), PROBE_WINDOW);
    }

    #[test]
    fn test_full_table_drops_install() {
        let table = CorrelationTable::new(PROBE_WINDOW);
        for id in 0..PROBE_WINDOW as u64 {
            assert!(table.begin(id, &CallRecord::ZEROED));
        }
        assert!(!table.begin(1_000, &CallRecord::ZEROED));
        assert!(table.update(1_000, |_| ()).is_none());
        assert_eq!(table.stats().install_failures, 1);

        // Freeing one slot makes room again, and no other key was lost
        table.end(3);
        assert!(table.begin(1_000, &CallRecord::ZEROED));
        for id in (0..PROBE_WINDOW as u64).filter(|&id| id != 3) {
            assert!(table.contains(id), "lost key {}", id);
        }
    }

    #[test]
    fn test_reserved_key_is_rejected() {
        let table = CorrelationTable::new(64);
        assert!(!table.begin(u64::MAX, &CallRecord::ZEROED));
        assert!(table.lookup(u64::MAX).is_none());
    }

    #[test]
    #[should_panic(expected = "Correlation table capacity must be > 0")]
    fn test_zero_capacity_panics() {
        let _ = CorrelationTable::new(0);
    }
}
