//! Replay of recorded point-hit notifications
//!
//! Stands in for the attachment layer. Each input line is one JSON document
//! describing a notification:
//!
//! ```json
//! {"t_us": 1000, "call_id": 180388626475, "cpu": 0, "task": "cat",
//!  "site": "enter:nfs4_file_open", "objects": {"dentry": {"d_iname": "db.lock"}}}
//! {"t_us": 1200, "call_id": 180388626475, "site": "return:nfs4_state_mark_reclaim_nograce",
//!  "objects": {"state": {"flags": 128}}, "ret": 1}
//! ```
//!
//! Objects are keyed by role (`dentry`, `opendata`, `fh`, `state`, `stateid`,
//! `client`) and given either as a hex image of the whole structure or as a
//! map from field name to value. Field values are integers, strings (raw
//! bytes, or hex when prefixed with `0x`), or nested maps for embedded
//! stateids. A `seqid` given as an integer is stored in network byte order.
//!
//! Time comes from `t_us` through a manual clock. `random`, when present,
//! is the value the sampling draw sees on that line; otherwise the draw
//! returns 1, which samples only when the ratio is 1.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::sync::Arc;
use thiserror::Error;

use crate::clock::{FixedRandom, ManualClock};
use crate::config::EngineConfig;
use crate::engine::{AttachError, Engine, PointOutcome};
use crate::layout::{Field, LayoutSet, ObjectImage, StructKind, StructLayout};
use crate::notification::{CallContext, Notification, ProbeArgs};
use crate::probes::ProbeSite;

/// Sampling draw used when a line does not carry one
pub const DEFAULT_RANDOM: u32 = 1;

/// Errors reading a replay file
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("line {line}: invalid JSON: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("line {line}: {reason}")]
    UnknownSite { line: usize, reason: String },

    #[error("line {line}: unknown object role '{role}'")]
    UnknownRole { line: usize, role: String },

    #[error("line {line}: {kind} has no field '{field}'")]
    UnknownField {
        line: usize,
        kind: &'static str,
        field: String,
    },

    #[error("line {line}: bad hex for '{what}': {source}")]
    Hex {
        line: usize,
        what: String,
        #[source]
        source: hex::FromHexError,
    },

    #[error("line {line}: bad value for '{field}': {reason}")]
    BadValue {
        line: usize,
        field: String,
        reason: String,
    },

    #[error("failed to read replay input: {0}")]
    Io(#[from] std::io::Error),
}

/// One recorded notification
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayLine {
    pub t_us: u64,
    pub call_id: u64,
    #[serde(default)]
    pub cpu: u32,
    #[serde(default)]
    pub task: String,
    pub site: String,
    #[serde(default)]
    pub objects: BTreeMap<String, ObjectSpec>,
    #[serde(default)]
    pub ret: Option<i64>,
    #[serde(default)]
    pub random: Option<u32>,
}

/// An object image, whole or field by field
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ObjectSpec {
    Hex(String),
    Fields(BTreeMap<String, FieldValue>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Uint(u64),
    Text(String),
    Nested(BTreeMap<String, FieldValue>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Dentry,
    Opendata,
    Fh,
    State,
    Stateid,
    Client,
}

impl Role {
    fn from_name(name: &str) -> Option<Role> {
        let role = match name {
            "dentry" => Role::Dentry,
            "opendata" => Role::Opendata,
            "fh" => Role::Fh,
            "state" => Role::State,
            "stateid" => Role::Stateid,
            "client" => Role::Client,
            _ => return None,
        };
        Some(role)
    }

    fn kind(self) -> StructKind {
        match self {
            Role::Dentry => StructKind::Dentry,
            Role::Opendata => StructKind::Opendata,
            Role::Fh => StructKind::FileHandle,
            Role::State => StructKind::State,
            Role::Stateid => StructKind::Stateid,
            Role::Client => StructKind::Client,
        }
    }
}

fn decode_hex(line: usize, what: &str, text: &str) -> Result<Vec<u8>, ReplayError> {
    let digits = text.strip_prefix("0x").unwrap_or(text);
    hex::decode(digits).map_err(|source| ReplayError::Hex {
        line,
        what: what.to_string(),
        source,
    })
}

fn build_fields(
    line: usize,
    layout: &StructLayout,
    layouts: &LayoutSet,
    values: &BTreeMap<String, FieldValue>,
) -> Result<ObjectImage, ReplayError> {
    let mut image = ObjectImage::zeroed(layout);
    for (name, value) in values {
        let place = layout
            .fields
            .iter()
            .find(|f| f.field.c_name() == name)
            .ok_or_else(|| ReplayError::UnknownField {
                line,
                kind: layout.kind.c_name(),
                field: name.clone(),
            })?;
        let bad = |reason: String| ReplayError::BadValue {
            line,
            field: name.clone(),
            reason,
        };

        image = match value {
            FieldValue::Uint(n) if place.field == Field::Seqid => {
                let seqid = u32::try_from(*n).map_err(|_| bad(format!("{} does not fit", n)))?;
                image.put(layout, place.field, &seqid.to_be_bytes())
            }
            FieldValue::Uint(n) => {
                if place.len > 8 {
                    return Err(bad(format!("integer given for a {}-byte field", place.len)));
                }
                if place.len < 8 && *n >> (place.len * 8) != 0 {
                    return Err(bad(format!("{} does not fit in {} bytes", n, place.len)));
                }
                image.put_uint(layout, place.field, *n)
            }
            FieldValue::Text(text) => {
                let bytes = if text.starts_with("0x") {
                    decode_hex(line, name, text)?
                } else {
                    text.as_bytes().to_vec()
                };
                if bytes.len() > place.len {
                    return Err(bad(format!(
                        "{} bytes given for a {}-byte field",
                        bytes.len(),
                        place.len
                    )));
                }
                image.put(layout, place.field, &bytes)
            }
            FieldValue::Nested(inner) => match place.field {
                Field::Stateid | Field::OpenStateid | Field::OResStateid => {
                    let nested = build_fields(line, &layouts.stateid, layouts, inner)?;
                    image.put(layout, place.field, nested.as_bytes())
                }
                _ => return Err(bad("field is not an embedded structure".to_string())),
            },
        };
    }
    Ok(image)
}

fn build_object(
    line: usize,
    role: &str,
    spec: &ObjectSpec,
    layouts: &LayoutSet,
) -> Result<(Role, ObjectImage), ReplayError> {
    let parsed = Role::from_name(role).ok_or_else(|| ReplayError::UnknownRole {
        line,
        role: role.to_string(),
    })?;
    let layout = layouts.get(parsed.kind());
    let image = match spec {
        ObjectSpec::Hex(text) => {
            ObjectImage::from_bytes(parsed.kind(), decode_hex(line, role, text)?)
        }
        ObjectSpec::Fields(values) => build_fields(line, layout, layouts, values)?,
    };
    Ok((parsed, image))
}

/// Counts of what a replay did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub lines: u64,
    pub began: u64,
    pub begin_failed: u64,
    pub recorded: u64,
    pub no_record: u64,
    pub unpaired: u64,
    pub emitted: u64,
    pub dropped: u64,
    pub discarded: u64,
}

impl ReplaySummary {
    fn count(&mut self, outcome: PointOutcome) {
        self.lines += 1;
        let slot = match outcome {
            PointOutcome::Began => &mut self.began,
            PointOutcome::BeginFailed => &mut self.begin_failed,
            PointOutcome::Recorded => &mut self.recorded,
            PointOutcome::NoRecord => &mut self.no_record,
            PointOutcome::Unpaired => &mut self.unpaired,
            PointOutcome::Emitted(_) => &mut self.emitted,
            PointOutcome::Dropped(_) => &mut self.dropped,
            PointOutcome::Discarded => &mut self.discarded,
        };
        *slot += 1;
    }
}

/// Drives an engine from recorded notifications
pub struct Replayer {
    engine: Engine,
    clock: Arc<ManualClock>,
    random: Arc<FixedRandom>,
}

impl Replayer {
    /// Attach an engine driven by a manual clock
    pub fn new(config: EngineConfig, layouts: LayoutSet) -> Result<Self, AttachError> {
        let clock = Arc::new(ManualClock::new(0));
        let random = Arc::new(FixedRandom::new(DEFAULT_RANDOM));
        let engine = Engine::builder(config)
            .layouts(layouts)
            .clock(clock.clone())
            .random(random.clone())
            .build()?;
        Ok(Replayer {
            engine,
            clock,
            random,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Parse one line and deliver it
    pub fn feed(&self, line_no: usize, text: &str) -> Result<PointOutcome, ReplayError> {
        let line: ReplayLine = serde_json::from_str(text).map_err(|source| ReplayError::Json {
            line: line_no,
            source,
        })?;
        self.deliver(line_no, &line)
    }

    /// Deliver an already parsed notification
    pub fn deliver(&self, line_no: usize, line: &ReplayLine) -> Result<PointOutcome, ReplayError> {
        let site: ProbeSite = line
            .site
            .parse()
            .map_err(|reason| ReplayError::UnknownSite {
                line: line_no,
                reason,
            })?;

        let layouts = self.engine.layouts();
        let images = line
            .objects
            .iter()
            .map(|(role, spec)| build_object(line_no, role, spec, layouts))
            .collect::<Result<Vec<_>, _>>()?;

        let mut args = ProbeArgs {
            ret: line.ret,
            ..ProbeArgs::default()
        };
        for (role, image) in &images {
            let view = Some(image.view(layouts));
            match role {
                Role::Dentry => args.dentry = view,
                Role::Opendata => args.opendata = view,
                Role::Fh => args.fh = view,
                Role::State => args.state = view,
                Role::Stateid => args.stateid = view,
                Role::Client => args.client = view,
            }
        }

        self.clock.set(line.t_us);
        self.random.set(line.random.unwrap_or(DEFAULT_RANDOM));

        let ctx = CallContext::new(line.call_id, line.cpu, line.task.as_bytes());
        let outcome = self
            .engine
            .on_point(&Notification::new(site, ctx).with_args(args));
        tracing::trace!(line = line_no, site = %site, outcome = ?outcome, "replayed");
        Ok(outcome)
    }

    /// Replay every line of `reader`; blank lines and `#` comments are skipped
    pub fn run<R: BufRead>(&self, reader: R) -> Result<ReplaySummary, ReplayError> {
        let mut summary = ReplaySummary::default();
        for (idx, text) in reader.lines().enumerate() {
            let text = text?;
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            summary.count(self.feed(idx + 1, trimmed)?);
        }
        tracing::info!(
            lines = summary.lines,
            emitted = summary.emitted,
            discarded = summary.discarded,
            dropped = summary.dropped,
            "replay finished"
        );
        Ok(summary)
    }
}
