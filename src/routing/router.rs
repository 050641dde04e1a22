//! Dynamic stream-to-branch routing.
//!
//! The router reacts to stream discovery: it looks up the branch
//! templates for the stream's media class, builds each branch (parser
//! stages plus container destination), and registers the stream's
//! consumer with the demuxer's routing table. With more than one
//! matching branch a tee duplicates the stream; each branch keeps its
//! own buffered head channel so a slow container does not stall its
//! sibling.
//!
//! Linking is idempotent per stream, a branch that fails to set up is
//! abandoned with a warning while its siblings link normally, and once
//! shutdown has begun no new branch is created.

use crate::element::NodeKind;
use crate::elements::demux::DemuxOutputs;
use crate::elements::mux::{Mp4MuxSink, PsMuxSink};
use crate::error::{Error, Result};
use crate::format::StreamPad;
use crate::link::{LocalLink, LocalSender};
use crate::pipeline::events::{EventSender, PipelineEvent};
use crate::pipeline::executor::{ChainOutput, Executor};
use crate::pipeline::graph::Pipeline;
use crate::routing::template::{BranchTable, BranchTemplate, Destination};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Capacity of a shared mux input channel.
const STATION_CAPACITY: usize = 64;

struct Station {
    sender: LocalSender,
    node: String,
}

/// Shared engine context the router builds branches against: the
/// executor, the event bus, the topology graph, and the shared program
/// stream muxers keyed by output path.
pub struct EngineCtx {
    executor: Executor,
    events: EventSender,
    graph: Mutex<Pipeline>,
    demux_node: String,
    stations: Mutex<HashMap<PathBuf, Station>>,
}

impl EngineCtx {
    /// Create a context around an assembled source/demux pipeline.
    pub fn new(
        executor: Executor,
        events: EventSender,
        graph: Pipeline,
        demux_node: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            events,
            graph: Mutex::new(graph),
            demux_node: demux_node.into(),
            stations: Mutex::new(HashMap::new()),
        }
    }

    /// The executor.
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// The event bus.
    pub fn events(&self) -> &EventSender {
        &self.events
    }

    /// Run a closure against the topology graph.
    pub fn with_graph<R>(&self, f: impl FnOnce(&mut Pipeline) -> R) -> R {
        f(&mut self.graph.lock().expect("graph poisoned"))
    }

    /// Get (or lazily create) the shared program stream mux for a path.
    ///
    /// The mux runs on its own thread and accepts frames from any
    /// number of branches; the file is only created when the first
    /// branch asks for it.
    fn ps_station(&self, path: &Path) -> Result<(LocalSender, String)> {
        let mut stations = self.stations.lock().expect("station table poisoned");
        if let Some(station) = stations.get(path) {
            return Ok((station.sender.clone(), station.node.clone()));
        }

        let sink = PsMuxSink::create(path)?;
        let stem = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "out".to_string());
        let node = format!("ps_mux:{stem}");

        self.with_graph(|g| g.add_node(&node, NodeKind::Mux))?;
        let (tx, rx) = LocalLink::bounded(STATION_CAPACITY);
        self.executor
            .spawn_chain(&node, rx, Vec::new(), ChainOutput::Sink(Box::new(sink)))?;

        info!(path = %path.display(), "program stream mux started");
        stations.insert(
            path.to_path_buf(),
            Station {
                sender: tx.clone(),
                node: node.clone(),
            },
        );
        Ok((tx, node))
    }

    /// Drop the retained mux senders so the shared muxers see EOS once
    /// their last branch finishes.
    pub fn close_stations(&self) {
        self.stations
            .lock()
            .expect("station table poisoned")
            .clear();
    }
}

/// Drops the shared mux senders when the discovery callback dies with
/// the demux thread. Hold this in the demux callback so no station
/// outlives the last thing that could feed it a branch.
pub struct StationGuard {
    ctx: Arc<EngineCtx>,
}

impl StationGuard {
    /// Guard the context's mux stations.
    pub fn new(ctx: Arc<EngineCtx>) -> Self {
        Self { ctx }
    }
}

impl Drop for StationGuard {
    fn drop(&mut self) {
        self.ctx.close_stations();
    }
}

#[derive(Default)]
struct RouterState {
    linked: HashSet<u16>,
    branches_linked: u64,
    stopping: bool,
}

/// Links container branches for discovered streams.
pub struct StreamRouter {
    ctx: Arc<EngineCtx>,
    table: BranchTable,
    state: Mutex<RouterState>,
}

impl StreamRouter {
    /// Create a router over a branch table.
    pub fn new(ctx: Arc<EngineCtx>, table: BranchTable) -> Self {
        Self {
            ctx,
            table,
            state: Mutex::new(RouterState::default()),
        }
    }

    /// Streams currently linked.
    pub fn linked_streams(&self) -> Vec<u16> {
        let state = self.state.lock().expect("router state poisoned");
        let mut pids: Vec<u16> = state.linked.iter().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Total branches linked across all streams.
    pub fn branches_linked(&self) -> u64 {
        self.state
            .lock()
            .expect("router state poisoned")
            .branches_linked
    }

    /// Refuse any further linking. Discovery signals that race
    /// teardown become no-ops instead of spawning into a dying
    /// pipeline.
    pub fn begin_shutdown(&self) {
        let mut state = self.state.lock().expect("router state poisoned");
        if !state.stopping {
            state.stopping = true;
            debug!("router shutting down, no further branches will link");
        }
    }

    /// Whether shutdown has begun.
    pub fn is_stopping(&self) -> bool {
        self.state.lock().expect("router state poisoned").stopping
    }

    /// Handle a discovered stream.
    ///
    /// Idempotent: a second discovery of the same PID changes nothing.
    /// Returns true if the stream is (or already was) linked. All
    /// fallible branch setup happens before any link state changes, so
    /// a failed call leaves the router exactly as it was.
    pub fn on_stream_discovered(&self, outputs: &DemuxOutputs, pad: StreamPad) -> Result<bool> {
        {
            let state = self.state.lock().expect("router state poisoned");
            if state.stopping {
                debug!(pid = pad.pid, "stream discovered during shutdown, ignoring");
                return Ok(false);
            }
            if state.linked.contains(&pad.pid) {
                debug!(pid = pad.pid, "stream already linked");
                return Ok(true);
            }
        }

        let media = match pad.caps.media_class() {
            Some(media) => media,
            None => {
                debug!(pid = pad.pid, codec = ?pad.caps.codec, "unroutable stream dropped");
                return Ok(false);
            }
        };
        let templates = self.table.templates_for(media);
        if templates.is_empty() {
            debug!(pid = pad.pid, %media, "no branch template, stream dropped");
            return Ok(false);
        }

        let mut heads: Vec<(LocalSender, String)> = Vec::new();
        for template in &templates {
            match self.link_branch(template, &pad) {
                Ok(head) => {
                    self.ctx.events.send(PipelineEvent::BranchLinked {
                        stream: pad.pid,
                        branch: template.name.clone(),
                    });
                    heads.push(head);
                }
                Err(e) if e.is_branch_scoped() => {
                    warn!(pid = pad.pid, branch = %template.name, error = %e, "branch failed to link");
                    self.ctx.events.send_warning(
                        format!("branch {} for stream {} abandoned: {e}", template.name, pad.pid),
                        None,
                    );
                }
                // Graph or spawn failures indicate the engine is broken,
                // not just one branch.
                Err(e) => return Err(e),
            }
        }

        if heads.is_empty() {
            self.ctx.events.send_warning(
                format!("no branch could be linked for stream {}", pad.pid),
                None,
            );
            return Ok(false);
        }

        let linked_count = heads.len() as u64;
        if heads.len() == 1 {
            let (sender, node) = heads.remove(0);
            self.ctx
                .with_graph(|g| g.link(&self.ctx.demux_node, &node))?;
            outputs.register(pad.pid, sender);
        } else {
            // Duplicate the stream: each branch keeps its own buffered
            // head channel, so one slow container cannot stall another.
            let tee_node = format!("tee:{}", pad.pid);
            self.ctx.with_graph(|g| {
                g.add_node(&tee_node, NodeKind::Tee)?;
                g.link(&self.ctx.demux_node, &tee_node)?;
                for (_, node) in &heads {
                    g.link(&tee_node, node)?;
                }
                Ok::<(), Error>(())
            })?;

            let (tee_tx, tee_rx) = LocalLink::bounded(STATION_CAPACITY);
            let branch_senders = heads.into_iter().map(|(tx, _)| tx).collect();
            self.ctx
                .executor
                .spawn_tee(&tee_node, tee_rx, branch_senders)?;
            outputs.register(pad.pid, tee_tx);
        }

        let mut state = self.state.lock().expect("router state poisoned");
        state.linked.insert(pad.pid);
        state.branches_linked += linked_count;
        info!(pid = pad.pid, %media, branches = linked_count, "stream linked");
        Ok(true)
    }

    /// Build one branch: head channel, parser stages, container
    /// destination. Output files are opened before any thread spawns or
    /// graph mutation, so failure leaves no half-built branch behind.
    fn link_branch(
        &self,
        template: &BranchTemplate,
        pad: &StreamPad,
    ) -> Result<(LocalSender, String)> {
        let node = format!("{}:{}", template.name, pad.pid);
        let transforms = template.parser.build();
        let (tx, rx) = LocalLink::bounded(template.queue_capacity);

        let branch_err = |e: Error| Error::Routing {
            stream: pad.pid,
            message: e.to_string(),
        };
        match &template.destination {
            Destination::MpegPs { path } => {
                let (mux_tx, mux_node) = self.ctx.ps_station(path).map_err(branch_err)?;
                self.ctx.with_graph(|g| {
                    g.add_node(&node, NodeKind::Transform)?;
                    g.link(&node, &mux_node)
                })?;
                self.ctx
                    .executor
                    .spawn_chain(&node, rx, transforms, ChainOutput::Link(mux_tx))?;
            }
            Destination::Mp4 { path } => {
                let sink = Mp4MuxSink::create(path).map_err(branch_err)?;
                self.ctx
                    .with_graph(|g| g.add_node(&node, NodeKind::Sink))?;
                self.ctx.executor.spawn_chain(
                    &node,
                    rx,
                    transforms,
                    ChainOutput::Sink(Box::new(sink)),
                )?;
            }
        }

        Ok((tx, node))
    }
}
