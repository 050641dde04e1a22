//! One-pass media splitting: read a multiplexed file, demultiplex it,
//! and fan every elementary stream out into its container branches.

use crate::element::NodeKind;
use crate::elements::demux::DemuxOutputs;
use crate::elements::file::{FileSrc, DEFAULT_CHUNK_SIZE};
use crate::error::{Error, Result};
use crate::link::LocalLink;
use crate::pipeline::controller::PipelineController;
use crate::pipeline::events::EventSender;
use crate::pipeline::executor::Executor;
use crate::pipeline::graph::Pipeline;
use crate::pipeline::PipelineState;
use crate::routing::router::{EngineCtx, StationGuard, StreamRouter};
use crate::routing::template::BranchTable;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const SOURCE_NODE: &str = "file_src";
const DEMUX_NODE: &str = "demux";

/// Configuration for one split run.
pub struct SplitConfig {
    /// Input file (MPEG transport stream).
    pub input: PathBuf,
    /// Branch templates to fan discovered streams into.
    pub table: BranchTable,
    /// Read chunk size for the file source.
    pub read_chunk: usize,
    /// Optional wall-clock limit; reaching it cancels the run cleanly.
    pub timeout: Option<Duration>,
    /// External cancellation token (e.g. wired to Ctrl-C).
    pub cancel: Option<CancellationToken>,
    /// Event bus capacity.
    pub event_capacity: usize,
}

impl SplitConfig {
    /// Configuration with defaults for everything but input and table.
    pub fn new(input: impl Into<PathBuf>, table: BranchTable) -> Self {
        Self {
            input: input.into(),
            table,
            read_chunk: DEFAULT_CHUNK_SIZE,
            timeout: None,
            cancel: None,
            event_capacity: 256,
        }
    }

    /// Set a wall-clock limit for the run.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use an external cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Set the file source chunk size.
    pub fn with_read_chunk(mut self, chunk: usize) -> Self {
        self.read_chunk = chunk.max(1);
        self
    }
}

/// Outcome of a finished split run.
#[derive(Debug, Clone)]
pub struct SplitReport {
    /// Terminal pipeline state.
    pub state: PipelineState,
    /// PIDs of the streams that were linked to at least one branch.
    pub streams_linked: Vec<u16>,
    /// Total branches linked across all streams.
    pub branches_linked: u64,
    /// Frames dropped for lack of a consumer.
    pub frames_dropped: u64,
}

/// Runs a complete split: source, demux, dynamic branches, containers.
pub struct Splitter {
    config: SplitConfig,
}

impl Splitter {
    /// Create a splitter from a configuration.
    pub fn new(config: SplitConfig) -> Self {
        Self { config }
    }

    /// Run the split to completion.
    ///
    /// Blocks (asynchronously) until end-of-stream, a fatal error, the
    /// timeout, or cancellation, then tears the pipeline down in
    /// reverse construction order.
    pub async fn run(self) -> Result<SplitReport> {
        let config = self.config;
        if config.table.is_empty() {
            return Err(Error::Setup("branch table is empty".to_string()));
        }

        // Open the input before any thread exists so a bad path fails
        // the whole run up front.
        let source = FileSrc::with_chunk_size(&config.input, config.read_chunk)?;
        info!(input = %config.input.display(), "starting split");

        let events = EventSender::new(config.event_capacity);
        // Subscribe before spawning anything: broadcast events are only
        // delivered to receivers that already exist.
        let receiver = events.subscribe();
        let cancel = config.cancel.unwrap_or_default();
        let executor = Executor::new(events.clone(), cancel.clone());

        let mut graph = Pipeline::new();
        graph.add_node(SOURCE_NODE, NodeKind::Source)?;
        graph.add_node(DEMUX_NODE, NodeKind::Demux)?;
        graph.link(SOURCE_NODE, DEMUX_NODE)?;

        let ctx = Arc::new(EngineCtx::new(
            executor.clone(),
            events.clone(),
            graph,
            DEMUX_NODE,
        ));
        let router = Arc::new(StreamRouter::new(Arc::clone(&ctx), config.table));
        let outputs = Arc::new(DemuxOutputs::new());

        let (src_tx, demux_rx) = LocalLink::bounded(16);

        // Demux before source: the consumer must be counted before its
        // producer can run to completion.
        {
            let guard = StationGuard::new(Arc::clone(&ctx));
            let router = Arc::clone(&router);
            let warn_events = events.clone();
            executor.spawn_demux(
                DEMUX_NODE,
                demux_rx,
                Arc::clone(&outputs),
                move |outputs, pad| {
                    let _stations = &guard;
                    if let Err(e) = router.on_stream_discovered(outputs, pad) {
                        warn!(pid = pad.pid, error = %e, "stream linking failed");
                        warn_events
                            .send_warning(format!("stream {} not linked: {e}", pad.pid), None);
                    }
                },
            )?;
        }
        executor.spawn_source(SOURCE_NODE, Box::new(source), src_tx)?;

        let mut controller =
            PipelineController::new(events, executor, cancel, config.timeout);
        let run_result = controller.run(receiver).await;

        // Late discovery signals must not spawn into a dead pipeline.
        router.begin_shutdown();

        let report = SplitReport {
            state: controller.state(),
            streams_linked: router.linked_streams(),
            branches_linked: router.branches_linked(),
            frames_dropped: outputs.dropped(),
        };
        info!(
            state = %report.state,
            streams = report.streams_linked.len(),
            branches = report.branches_linked,
            dropped = report.frames_dropped,
            "split finished"
        );

        run_result.map(|_| report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_table_rejected() {
        let config = SplitConfig::new("/tmp/in.ts", BranchTable::new());
        let result = Splitter::new(config).run().await;
        assert!(matches!(result, Err(Error::Setup(_))));
    }

    #[tokio::test]
    async fn test_missing_input_rejected() {
        let table = BranchTable::dual_destination("/tmp/out.mps", "/tmp/out.mp4");
        let config = SplitConfig::new("/nonexistent/in.ts", table);
        let result = Splitter::new(config).run().await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
