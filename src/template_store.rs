//! Per-context scratch records
//!
//! A call record is about a kilobyte and a half. Rather than building one on
//! the traced thread's stack at every call entry, each execution context owns a
//! pre-allocated template that is reset in place, filled, and copied into the
//! correlation table.
//!
//! Slots are indexed by context id. Two contexts never share a slot unless
//! there are more contexts than slots; in that case the second one finds the
//! slot busy and gets `None` rather than waiting.

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::call_record::CallRecord;

pub struct TemplateStore {
    slots: Box<[Mutex<CallRecord>]>,
    contended: AtomicU64,
}

impl TemplateStore {
    /// Create a store with one slot per execution context
    ///
    /// # Panics
    ///
    /// Panics if `slots` is 0.
    pub fn new(slots: usize) -> Self {
        assert!(slots > 0, "Template store needs at least one slot");
        TemplateStore {
            slots: (0..slots).map(|_| Mutex::new(CallRecord::ZEROED)).collect(),
            contended: AtomicU64::new(0),
        }
    }

    /// Reset and hand out the template for `context_id`
    ///
    /// Returns `None` if the slot is in use; the caller then builds the record
    /// directly.
    pub fn acquire(&self, context_id: u32) -> Option<MutexGuard<'_, CallRecord>> {
        let slot = &self.slots[context_id as usize % self.slots.len()];
        match slot.try_lock() {
            Some(mut template) => {
                template.reset();
                Some(template)
            }
            None => {
                self.contended.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// How often `acquire` found its slot busy
    pub fn contended(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }
}
