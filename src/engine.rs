//! Call-correlation and trace-assembly engine
//!
//! The engine owns every piece of state the handlers touch: the correlation
//! table, the template store, the output channel, and the clock and random
//! sources. Nothing is global; embedders and tests build as many engines as
//! they like and inject their own collaborators through [`EngineBuilder`].
//!
//! [`Engine::on_point`] is the single inbound entry point. It runs
//! synchronously on the traced thread, never blocks and never allocates:
//!
//! ```text
//! enter:nfs4_file_open   → template → table.begin(call_id)
//! enter/return:<point>   → table.update(call_id) → record_point / capture
//! return:nfs4_file_open  → table.end(call_id) → decide → encode → channel.push
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::call_record::CallRecord;
use crate::clock::{Clock, MonotonicClock, RandomSource, ThreadRandom};
use crate::config::{CaptureSet, ConfigError, EngineConfig};
use crate::correlation::{CorrelationTable, TableStats};
use crate::emission::{EmissionFilter, ReasonMask};
use crate::event_record;
use crate::layout::{LayoutError, LayoutSet};
use crate::notification::Notification;
use crate::probes::{Handler, PointId, ATTACH_LIST};
use crate::ring_buffer::{ChannelStats, OutputChannel};
use crate::snapshot::{self, CaptureOutcome};
use crate::template_store::TemplateStore;

/// Errors that prevent the engine from attaching
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("kernel layout {version} rejected: {source}")]
    Layout {
        version: String,
        #[source]
        source: LayoutError,
    },
}

/// What a single notification did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointOutcome {
    /// A new call record was installed
    Began,
    /// The table had no room; the call will go untraced
    BeginFailed,
    /// The visit was recorded on the call's record
    Recorded,
    /// No record exists for this call id
    NoRecord,
    /// A return-edge capture fired without its entry half
    Unpaired,
    /// The call finished and its record was pushed to the channel
    Emitted(ReasonMask),
    /// The call finished and matched reasons, but the channel was full
    Dropped(ReasonMask),
    /// The call finished without any reason to emit it
    Discarded,
}

/// Builder for [`Engine`], for injecting collaborators
pub struct EngineBuilder {
    config: EngineConfig,
    layouts: LayoutSet,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    channel: Option<Arc<OutputChannel>>,
}

impl EngineBuilder {
    pub fn layouts(mut self, layouts: LayoutSet) -> Self {
        self.layouts = layouts;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// Share an existing output channel instead of creating one
    pub fn channel(mut self, channel: Arc<OutputChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Validate the configuration and layouts, then build the engine
    pub fn build(self) -> Result<Engine, AttachError> {
        let filter = self.config.validate()?;
        self.layouts
            .validate()
            .map_err(|source| AttachError::Layout {
                version: self.layouts.version.clone(),
                source,
            })?;

        let channel = self
            .channel
            .unwrap_or_else(|| Arc::new(OutputChannel::new(self.config.channel_capacity)));

        tracing::info!(
            layout = %self.layouts.version,
            probes = ATTACH_LIST.len() * 2,
            slow_threshold_us = filter.slow_threshold_us,
            sample_ratio = filter.sample_ratio,
            reasons = %filter.enabled,
            "engine attached"
        );
        for func in ATTACH_LIST {
            tracing::debug!(symbol = func.symbol(), "instrumenting entry and return");
        }

        Ok(Engine {
            filter,
            captures: self.config.captures,
            table: CorrelationTable::new(self.config.table_capacity),
            templates: TemplateStore::new(self.config.template_slots),
            layouts: self.layouts,
            channel,
            clock: self.clock,
            random: self.random,
            counters: Counters::default(),
        })
    }
}

#[derive(Debug, Default)]
struct Counters {
    notifications: AtomicU64,
    no_record: AtomicU64,
    emitted: AtomicU64,
    discarded: AtomicU64,
    capture_failures: AtomicU64,
}

/// The tracing engine
pub struct Engine {
    filter: EmissionFilter,
    captures: CaptureSet,
    layouts: LayoutSet,
    table: CorrelationTable,
    templates: TemplateStore,
    channel: Arc<OutputChannel>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    counters: Counters,
}

impl Engine {
    /// Start building an engine with the default clock, RNG and reference layouts
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            layouts: LayoutSet::reference(),
            clock: Arc::new(MonotonicClock::new()),
            random: Arc::new(ThreadRandom),
            channel: None,
        }
    }

    /// Build with defaults for everything but the configuration
    pub fn attach(config: EngineConfig) -> Result<Engine, AttachError> {
        Self::builder(config).build()
    }

    /// Handle one point hit (hot path)
    pub fn on_point(&self, n: &Notification<'_>) -> PointOutcome {
        self.counters.notifications.fetch_add(1, Ordering::Relaxed);

        let outcome = match n.site.handler() {
            Handler::CallEnter => self.call_enter(n),
            Handler::CallExit => self.call_exit(n),
            Handler::Point(point) => self.visit(n.ctx.call_id, point),
            Handler::Capture(point, capture) if self.captures.contains(capture) => {
                let now = self.clock.now_us();
                let layouts = &self.layouts;
                let result = self.table.update(n.ctx.call_id, |record| {
                    let pending = record.pending;
                    let out =
                        snapshot::apply_capture(capture, record, point, now, &n.args, layouts);
                    (out, record.pending != pending || out.attempted > 0)
                });
                match result {
                    Some((out, acted)) => {
                        self.count_failures(out);
                        if acted {
                            PointOutcome::Recorded
                        } else {
                            PointOutcome::Unpaired
                        }
                    }
                    None => PointOutcome::NoRecord,
                }
            }
            Handler::Capture(point, _) => self.visit(n.ctx.call_id, point),
        };

        if outcome == PointOutcome::NoRecord {
            self.counters.no_record.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    fn visit(&self, call_id: u64, point: PointId) -> PointOutcome {
        let now = self.clock.now_us();
        match self.table.update(call_id, |record| record.record_point(point, now)) {
            Some(()) => PointOutcome::Recorded,
            None => PointOutcome::NoRecord,
        }
    }

    fn call_enter(&self, n: &Notification<'_>) -> PointOutcome {
        let now = self.clock.now_us();
        let fill = |record: &mut CallRecord| {
            record.start_time_us = now;
            snapshot::capture_target_name(record, n.args.dentry)
        };

        let mut out = CaptureOutcome::default();
        let installed = match self.templates.acquire(n.ctx.cpu) {
            Some(mut template) => {
                out = fill(&mut *template);
                self.table.begin(n.ctx.call_id, &*template)
            }
            None => self.table.begin_with(n.ctx.call_id, |record| {
                record.reset();
                out = fill(record);
            }),
        };
        self.count_failures(out);

        if installed {
            PointOutcome::Began
        } else {
            PointOutcome::BeginFailed
        }
    }

    fn call_exit(&self, n: &Notification<'_>) -> PointOutcome {
        let Some(mut record) = self.table.end(n.ctx.call_id) else {
            return PointOutcome::NoRecord;
        };

        let elapsed = record.elapsed_at(self.clock.now_us());
        record.pid = n.ctx.pid();
        record.elapsed_us = elapsed;

        let reason = self.filter.decide(&record, elapsed, self.random.next_u32());
        if reason.is_empty() {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return PointOutcome::Discarded;
        }

        record.reason = reason;
        record.set_task_name(&n.ctx.task);
        if self.channel.push(event_record::encode(&record)) {
            self.counters.emitted.fetch_add(1, Ordering::Relaxed);
            PointOutcome::Emitted(reason)
        } else {
            PointOutcome::Dropped(reason)
        }
    }

    fn count_failures(&self, out: CaptureOutcome) {
        if out.failed > 0 {
            self.counters
                .capture_failures
                .fetch_add(u64::from(out.failed), Ordering::Relaxed);
        }
    }

    /// Copy of the in-flight record for `call_id`
    pub fn lookup(&self, call_id: u64) -> Option<CallRecord> {
        self.table.lookup(call_id)
    }

    pub fn layouts(&self) -> &LayoutSet {
        &self.layouts
    }

    pub fn filter(&self) -> &EmissionFilter {
        &self.filter
    }

    pub fn channel(&self) -> &Arc<OutputChannel> {
        &self.channel
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            notifications: c.notifications.load(Ordering::Relaxed),
            no_record: c.no_record.load(Ordering::Relaxed),
            in_flight: self.table.len(),
            emitted: c.emitted.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            capture_failures: c.capture_failures.load(Ordering::Relaxed),
            template_contention: self.templates.contended(),
            table: self.table.stats(),
            channel: self.channel.stats(),
        }
    }
}

/// Engine counters, for the shutdown summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub notifications: u64,
    /// Notifications for call ids with no record
    pub no_record: u64,
    /// Calls still in the table (entered, not yet returned)
    pub in_flight: usize,
    pub emitted: u64,
    pub discarded: u64,
    /// Field reads that failed during captures
    pub capture_failures: u64,
    pub template_contention: u64,
    pub table: TableStats,
    pub channel: ChannelStats,
}
