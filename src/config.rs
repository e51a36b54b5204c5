//! Engine configuration, fixed at attach time
//!
//! Built once from the CLI (or directly by embedders), validated, and then
//! shared read-only with every handler. Nothing here can change while probes
//! are attached.

use thiserror::Error;

use crate::call_record::DNAME_INLINE_LEN;
use crate::emission::{EmissionFilter, FileNameFilter, ReasonMask};
use crate::probes::Capture;

/// Default number of correlation-table slots
pub const DEFAULT_TABLE_CAPACITY: usize = 10240;
/// Default depth of the output channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Errors in a configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sample ratio must be at least 1")]
    ZeroSampleRatio,

    #[error("file name '{name}' is {len} bytes, the inline name holds at most {max}")]
    FileNameTooLong { name: String, len: usize, max: usize },

    #[error("file name must not contain NUL bytes")]
    FileNameHasNul,

    #[error("{what} capacity must be > 0")]
    ZeroCapacity { what: &'static str },

    #[error("unknown emission reason '{0}'")]
    UnknownReason(String),

    #[error("at least one emission reason must be enabled")]
    NoReasons,
}

/// Which structured captures are active
///
/// A disabled capture degrades its probe site to a plain point visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSet(u16);

impl CaptureSet {
    pub const NONE: CaptureSet = CaptureSet(0);

    pub fn all() -> Self {
        Capture::ALL.into_iter().collect()
    }

    pub fn contains(self, capture: Capture) -> bool {
        self.0 & capture.bit() != 0
    }

    pub fn with(self, capture: Capture) -> Self {
        CaptureSet(self.0 | capture.bit())
    }

    pub fn without(self, capture: Capture) -> Self {
        CaptureSet(self.0 & !capture.bit())
    }
}

impl FromIterator<Capture> for CaptureSet {
    fn from_iter<I: IntoIterator<Item = Capture>>(iter: I) -> Self {
        iter.into_iter().fold(CaptureSet::NONE, CaptureSet::with)
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub slow_threshold_us: u64,
    pub sample_ratio: u32,
    /// Followed file; calls opening it are always emitted
    pub file_name: Option<String>,
    pub reasons: ReasonMask,
    pub captures: CaptureSet,
    pub table_capacity: usize,
    pub channel_capacity: usize,
    /// Template slots; defaults to the number of CPUs
    pub template_slots: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            slow_threshold_us: 100_000,
            sample_ratio: 1000,
            file_name: None,
            reasons: ReasonMask::all(),
            captures: CaptureSet::all(),
            table_capacity: DEFAULT_TABLE_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            template_slots: std::thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }
}

impl EngineConfig {
    /// Set the slow threshold in milliseconds, as the CLI takes it
    pub fn with_slow_threshold_ms(mut self, ms: u64) -> Self {
        self.slow_threshold_us = ms.saturating_mul(1000);
        self
    }

    pub fn with_sample_ratio(mut self, ratio: u32) -> Self {
        self.sample_ratio = ratio;
        self
    }

    /// Follow a file; an empty name disables the filter
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.file_name = if name.is_empty() { None } else { Some(name) };
        self
    }

    pub fn with_reasons(mut self, reasons: ReasonMask) -> Self {
        self.reasons = reasons;
        self
    }

    pub fn with_captures(mut self, captures: CaptureSet) -> Self {
        self.captures = captures;
        self
    }

    pub fn with_table_capacity(mut self, capacity: usize) -> Self {
        self.table_capacity = capacity;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_template_slots(mut self, slots: usize) -> Self {
        self.template_slots = slots;
        self
    }

    /// Check every constraint and build the emission filter
    pub fn validate(&self) -> Result<EmissionFilter, ConfigError> {
        if self.sample_ratio == 0 {
            return Err(ConfigError::ZeroSampleRatio);
        }
        if self.reasons.is_empty() {
            return Err(ConfigError::NoReasons);
        }
        for (what, capacity) in [
            ("table", self.table_capacity),
            ("channel", self.channel_capacity),
            ("template", self.template_slots),
        ] {
            if capacity == 0 {
                return Err(ConfigError::ZeroCapacity { what });
            }
        }

        let file_name = match &self.file_name {
            None => None,
            Some(name) => {
                if name.as_bytes().contains(&0) {
                    return Err(ConfigError::FileNameHasNul);
                }
                if name.len() >= DNAME_INLINE_LEN {
                    return Err(ConfigError::FileNameTooLong {
                        name: name.clone(),
                        len: name.len(),
                        max: DNAME_INLINE_LEN - 1,
                    });
                }
                FileNameFilter::new(name.as_bytes())
            }
        };

        Ok(EmissionFilter {
            slow_threshold_us: self.slow_threshold_us,
            sample_ratio: self.sample_ratio,
            file_name,
            enabled: self.reasons,
        })
    }
}

/// Parse a comma-separated reason list such as `slow,file`
pub fn parse_reasons(spec: &str) -> Result<ReasonMask, ConfigError> {
    let mut mask = ReasonMask::EMPTY;
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if part.eq_ignore_ascii_case("all") {
            return Ok(ReasonMask::all());
        }
        let reason = crate::emission::Reason::from_name(part)
            .ok_or_else(|| ConfigError::UnknownReason(part.to_string()))?;
        mask.insert(reason);
    }
    Ok(mask)
}
