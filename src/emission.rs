//! Emission decision at call exit
//!
//! When an open call returns, each reason below is evaluated independently
//! and contributes one bit to the record's reason mask. The record is emitted
//! iff the mask is non-zero. Reasons are additive: a call that is both slow
//! and matches the followed file carries both bits.
//!
//! | bit | reason | condition |
//! |-----|--------|-----------|
//! | 0 | `SAMPLE` | `random % sample_ratio == 0` |
//! | 1 | `SLOW` | `elapsed_us >= slow_threshold_us` |
//! | 2 | `SEQID` | return stateid of `nfs4_run_open_task` has seqid > 1 |
//! | 3 | `RECLAIM_NOGRACE` | `nfs4_state_mark_reclaim_nograce` returned 1 |
//! | 4 | `FILE` | target name equals the followed file name |

use std::fmt;

use crate::call_record::{until_nul, CallRecord, DNAME_INLINE_LEN};
use crate::snapshot::RECLAIM_MARKED;

/// One emission reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    Sample = 0,
    Slow = 1,
    Seqid = 2,
    ReclaimNograce = 3,
    File = 4,
}

impl Reason {
    pub const ALL: [Reason; 5] = [
        Reason::Sample,
        Reason::Slow,
        Reason::Seqid,
        Reason::ReclaimNograce,
        Reason::File,
    ];

    pub const fn bit(self) -> u32 {
        1 << self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Reason::Sample => "SAMPLE",
            Reason::Slow => "SLOW",
            Reason::Seqid => "SEQID",
            Reason::ReclaimNograce => "RECLAIM_NOGRACE",
            Reason::File => "FILE",
        }
    }

    pub fn from_name(name: &str) -> Option<Reason> {
        Reason::ALL
            .iter()
            .copied()
            .find(|r| r.name().eq_ignore_ascii_case(name))
    }
}

/// Set of reasons, as carried on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ReasonMask(u32);

impl ReasonMask {
    pub const EMPTY: ReasonMask = ReasonMask(0);

    pub const fn all() -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < Reason::ALL.len() {
            bits |= Reason::ALL[i].bit();
            i += 1;
        }
        ReasonMask(bits)
    }

    pub const fn from_bits(bits: u32) -> Self {
        ReasonMask(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn with(self, reason: Reason) -> Self {
        ReasonMask(self.0 | reason.bit())
    }

    pub fn insert(&mut self, reason: Reason) {
        self.0 |= reason.bit();
    }

    pub const fn contains(self, reason: Reason) -> bool {
        self.0 & reason.bit() != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Known reasons in bit order
    pub fn iter(self) -> impl Iterator<Item = Reason> {
        Reason::ALL.into_iter().filter(move |r| self.contains(*r))
    }
}

impl FromIterator<Reason> for ReasonMask {
    fn from_iter<I: IntoIterator<Item = Reason>>(iter: I) -> Self {
        iter.into_iter().fold(ReasonMask::EMPTY, ReasonMask::with)
    }
}

impl fmt::Display for ReasonMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for reason in self.iter() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(reason.name())?;
            first = false;
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

/// Exact-match filter on the target's short name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileNameFilter {
    name: [u8; DNAME_INLINE_LEN],
    len: usize,
}

impl FileNameFilter {
    /// Build a filter; names that cannot fit inline with a terminator never match
    pub fn new(name: &[u8]) -> Option<Self> {
        if name.is_empty() || name.len() >= DNAME_INLINE_LEN || name.contains(&0) {
            return None;
        }
        let mut buf = [0u8; DNAME_INLINE_LEN];
        buf[..name.len()].copy_from_slice(name);
        Some(FileNameFilter {
            name: buf,
            len: name.len(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.name[..self.len]
    }

    pub fn matches(&self, target: &[u8; DNAME_INLINE_LEN]) -> bool {
        until_nul(target) == self.as_bytes()
    }
}

/// Reason evaluation, fixed at attach time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmissionFilter {
    pub slow_threshold_us: u64,
    /// Sample one call in `sample_ratio`; never zero
    pub sample_ratio: u32,
    pub file_name: Option<FileNameFilter>,
    /// Reasons evaluated at all; the rest are never set
    pub enabled: ReasonMask,
}

impl EmissionFilter {
    /// Evaluate every enabled reason for a finished call
    ///
    /// Reasons latched during the call count alongside the exit-time checks.
    pub fn decide(&self, record: &CallRecord, elapsed_us: u64, random: u32) -> ReasonMask {
        let enabled = self.enabled;
        let mut mask = ReasonMask::from_bits(record.latched.bits() & enabled.bits());

        if enabled.contains(Reason::Sample) && random % self.sample_ratio.max(1) == 0 {
            mask.insert(Reason::Sample);
        }

        if enabled.contains(Reason::Slow) && elapsed_us >= self.slow_threshold_us {
            mask.insert(Reason::Slow);
        }

        let snaps = &record.snapshots;
        if enabled.contains(Reason::Seqid) && snaps.run_open_task.return_stateid.seqid_value() > 1 {
            mask.insert(Reason::Seqid);
        }

        if enabled.contains(Reason::ReclaimNograce)
            && snaps.reclaim_nograce.result == RECLAIM_MARKED
        {
            mask.insert(Reason::ReclaimNograce);
        }

        if enabled.contains(Reason::File)
            && self
                .file_name
                .is_some_and(|filter| filter.matches(&record.target_name))
        {
            mask.insert(Reason::File);
        }

        mask
    }
}
