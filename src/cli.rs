//! CLI argument parsing for nfs4slow

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::config::{
    parse_reasons, ConfigError, EngineConfig, DEFAULT_CHANNEL_CAPACITY, DEFAULT_TABLE_CAPACITY,
};

/// Output format for emitted events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// One JSON document per line (default)
    #[default]
    Json,
    /// One human-readable summary line per event
    Text,
}

#[derive(Parser, Debug)]
#[command(name = "nfs4slow")]
#[command(version)]
#[command(about = "Trace slow NFSv4 opens and record the client's path through the open", long_about = None)]
pub struct Cli {
    /// Emit calls taking at least this many milliseconds
    #[arg(short = 't', long = "slow-threshold-ms", value_name = "MS", default_value = "100")]
    pub slow_threshold_ms: u64,

    /// Emit one call in N regardless of duration
    #[arg(short = 'r', long = "sample-ratio", value_name = "N", default_value = "1000")]
    pub sample_ratio: u32,

    /// Always emit opens of this file (short name, < 32 bytes)
    #[arg(short = 'f', long = "file-name", value_name = "NAME", default_value = "")]
    pub file_name: String,

    /// Emission reasons to evaluate (comma separated, or "all")
    #[arg(long = "reasons", value_name = "LIST", default_value = "all")]
    pub reasons: String,

    /// Read recorded notifications from FILE ("-" for stdin)
    #[arg(long = "replay", value_name = "FILE")]
    pub replay: Option<PathBuf>,

    /// Output format (json or text)
    #[arg(long = "format", value_enum, default_value = "json")]
    pub format: OutputFormat,

    /// Depth of the output channel; records beyond it are dropped
    #[arg(long = "channel-capacity", value_name = "N", default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    pub channel_capacity: usize,

    /// Number of concurrently tracked calls
    #[arg(long = "table-capacity", value_name = "N", default_value_t = DEFAULT_TABLE_CAPACITY)]
    pub table_capacity: usize,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,

    /// Validate configuration and attach, then exit
    #[arg(long = "quit")]
    pub quit: bool,
}

impl Cli {
    /// Build and validate the engine configuration
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let config = EngineConfig::default()
            .with_slow_threshold_ms(self.slow_threshold_ms)
            .with_sample_ratio(self.sample_ratio)
            .with_file_name(self.file_name.as_str())
            .with_reasons(parse_reasons(&self.reasons)?)
            .with_channel_capacity(self.channel_capacity)
            .with_table_capacity(self.table_capacity);
        config.validate()?;
        Ok(config)
    }
}
