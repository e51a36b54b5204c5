use anyhow::{Context, Result};
use clap::Parser;
use nfs4slow::{cli::Cli, layout::LayoutSet, render::RenderSink, replay::Replayer};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber; events go to stdout, logs to stderr
fn init_tracing(debug: bool) {
    let level = if debug {
        tracing::Level::TRACE
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    let config = args.engine_config().context("invalid configuration")?;
    let replayer =
        Replayer::new(config, LayoutSet::reference()).context("failed to attach engine")?;

    if args.quit {
        tracing::info!("attach check passed, exiting");
        return Ok(());
    }

    let sink = RenderSink::new(BufWriter::new(io::stdout()), args.format);
    let consumer = replayer.engine().channel().spawn_consumer(sink);
    tracing::info!("tracing started");

    let result = match args.replay.as_deref() {
        Some(path) if path != Path::new("-") => {
            let file = File::open(path)
                .with_context(|| format!("failed to open replay file {}", path.display()))?;
            replayer.run(BufReader::new(file))
        }
        _ => replayer.run(io::stdin().lock()),
    };

    // Drain whatever was emitted before a bad line, then report it
    consumer.shutdown();
    let summary = result.context("replay failed")?;

    let stats = replayer.engine().stats();
    tracing::info!(
        lines = summary.lines,
        emitted = stats.emitted,
        discarded = stats.discarded,
        dropped = stats.channel.total_dropped,
        drop_rate = stats.channel.drop_rate(),
        channel_utilization = stats.channel.utilization(),
        in_flight = stats.in_flight,
        no_record = stats.no_record,
        capture_failures = stats.capture_failures,
        table_install_failures = stats.table.install_failures,
        "tracing stopped"
    );

    Ok(())
}
