//! Command-line front end: split a transport stream file into sibling
//! MPEG-PS and MP4 outputs.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use streamfork::routing::BranchTable;
use streamfork::splitter::{SplitConfig, Splitter};

#[derive(Parser, Debug)]
#[command(name = "streamfork", version, about = "Split a multiplexed stream into sibling container files")]
struct Args {
    /// Input file (MPEG transport stream)
    input: PathBuf,

    /// MPEG program stream output (default: input with .mps extension)
    #[arg(long)]
    mps: Option<PathBuf>,

    /// MP4 output (default: input with .mp4 extension)
    #[arg(long)]
    mp4: Option<PathBuf>,

    /// Stop after this many seconds even if the input is not drained
    #[arg(long)]
    timeout: Option<u64>,

    /// Read chunk size in bytes
    #[arg(long, default_value_t = 4096)]
    chunk_size: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mps = args
        .mps
        .unwrap_or_else(|| args.input.with_extension("mps"));
    let mp4 = args
        .mp4
        .unwrap_or_else(|| args.input.with_extension("mp4"));

    let table = BranchTable::dual_destination(&mps, &mp4);
    let mut config = SplitConfig::new(&args.input, table).with_read_chunk(args.chunk_size);
    if let Some(secs) = args.timeout {
        config = config.with_timeout(Duration::from_secs(secs));
    }

    let cancel = CancellationToken::new();
    config = config.with_cancel(cancel.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted, draining...");
            cancel.cancel();
        }
    });

    let report = Splitter::new(config)
        .run()
        .await
        .with_context(|| format!("failed to split {}", args.input.display()))?;

    println!(
        "done: {} streams, {} branches, {} frames dropped",
        report.streams_linked.len(),
        report.branches_linked,
        report.frames_dropped
    );
    Ok(())
}
