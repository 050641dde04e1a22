//! Stream router behavior: idempotent linking, fan-out, teardown race
//! safety, and branch failure isolation.

mod common;

use streamfork::element::NodeKind;
use streamfork::elements::demux::DemuxOutputs;
use streamfork::format::{StreamCaps, StreamCodec, StreamPad};
use streamfork::pipeline::events::{EventReceiver, EventSender, PipelineEvent};
use streamfork::pipeline::executor::Executor;
use streamfork::pipeline::graph::Pipeline;
use streamfork::routing::router::{EngineCtx, StreamRouter};
use streamfork::routing::template::BranchTable;

use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Fixture {
    router: StreamRouter,
    ctx: Arc<EngineCtx>,
    outputs: DemuxOutputs,
    events: EventReceiver,
    executor: Executor,
    _dir: TempDir,
}

fn fixture_with_table(dir: TempDir, table: BranchTable) -> Fixture {
    let events = EventSender::new(256);
    let receiver = events.subscribe();
    let executor = Executor::new(events.clone(), CancellationToken::new());

    let mut graph = Pipeline::new();
    graph.add_node("demux", NodeKind::Demux).unwrap();

    let ctx = Arc::new(EngineCtx::new(
        executor.clone(),
        events,
        graph,
        "demux",
    ));
    Fixture {
        router: StreamRouter::new(Arc::clone(&ctx), table),
        ctx,
        outputs: DemuxOutputs::new(),
        events: receiver,
        executor,
        _dir: dir,
    }
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let table = BranchTable::dual_destination(dir.path().join("out.mps"), dir.path().join("out.mp4"));
    fixture_with_table(dir, table)
}

fn audio_pad() -> StreamPad {
    StreamPad {
        pid: common::AUDIO_PID,
        caps: StreamCaps::new(StreamCodec::AacAdts),
    }
}

fn video_pad() -> StreamPad {
    StreamPad {
        pid: common::VIDEO_PID,
        caps: StreamCaps::new(StreamCodec::H264),
    }
}

/// Close everything so branch threads drain and exit, then join.
fn teardown(fx: &Fixture) {
    fx.outputs.close();
    fx.ctx.close_stations();
    fx.executor.join_all();
}

fn drain_events(receiver: &mut EventReceiver) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Some(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

#[test]
fn discovery_is_idempotent() {
    let fx = fixture();

    assert!(fx.router.on_stream_discovered(&fx.outputs, audio_pad()).unwrap());
    let after_first = fx.router.branches_linked();

    // Same PID again: nothing changes.
    assert!(fx.router.on_stream_discovered(&fx.outputs, audio_pad()).unwrap());
    assert_eq!(fx.router.branches_linked(), after_first);
    assert_eq!(fx.outputs.len(), 1);
    assert_eq!(fx.router.linked_streams(), vec![common::AUDIO_PID]);

    teardown(&fx);
}

#[test]
fn audio_fans_out_to_exactly_two_branches() {
    let fx = fixture();

    fx.router.on_stream_discovered(&fx.outputs, audio_pad()).unwrap();
    assert_eq!(fx.router.branches_linked(), 2);

    // One registered consumer (the tee), two branch nodes behind it.
    assert_eq!(fx.outputs.len(), 1);
    fx.ctx.with_graph(|g| {
        assert!(g.contains(&format!("tee:{}", common::AUDIO_PID)));
        assert!(g.contains(&format!("ps_audio:{}", common::AUDIO_PID)));
        assert!(g.contains(&format!("mp4_audio:{}", common::AUDIO_PID)));
        assert_eq!(g.output_count(&format!("tee:{}", common::AUDIO_PID)), 2);
    });

    teardown(&fx);
}

#[test]
fn video_links_one_branch_without_tee() {
    let fx = fixture();

    fx.router.on_stream_discovered(&fx.outputs, video_pad()).unwrap();
    assert_eq!(fx.router.branches_linked(), 1);
    fx.ctx.with_graph(|g| {
        assert!(!g.contains(&format!("tee:{}", common::VIDEO_PID)));
        assert!(g.contains(&format!("ps_video:{}", common::VIDEO_PID)));
    });

    teardown(&fx);
}

#[test]
fn discovery_after_shutdown_is_refused() {
    let fx = fixture();

    fx.router.begin_shutdown();
    let linked = fx.router.on_stream_discovered(&fx.outputs, audio_pad()).unwrap();

    assert!(!linked);
    assert!(fx.outputs.is_empty());
    assert_eq!(fx.router.branches_linked(), 0);

    teardown(&fx);
}

#[test]
fn failed_branch_leaves_siblings_linked() {
    let dir = tempfile::tempdir().unwrap();
    // The MP4 branch cannot create its output; the PS branch can.
    let table = BranchTable::dual_destination(
        dir.path().join("out.mps"),
        Path::new("/nonexistent/dir/out.mp4"),
    );
    let mut fx = fixture_with_table(dir, table);

    let linked = fx.router.on_stream_discovered(&fx.outputs, audio_pad()).unwrap();
    assert!(linked);
    assert_eq!(fx.router.branches_linked(), 1);
    assert_eq!(fx.outputs.len(), 1);

    let events = drain_events(&mut fx.events);
    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::Warning { message, .. } if message.contains("mp4_audio")
    )));
    // The surviving branch was announced.
    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::BranchLinked { branch, .. } if branch == "ps_audio"
    )));

    teardown(&fx);
}

#[test]
fn unroutable_stream_is_dropped() {
    let fx = fixture();

    let pad = StreamPad {
        pid: 300,
        caps: StreamCaps::new(StreamCodec::Other(0x15)),
    };
    let linked = fx.router.on_stream_discovered(&fx.outputs, pad).unwrap();

    assert!(!linked);
    assert!(fx.outputs.is_empty());

    teardown(&fx);
}

#[test]
fn sibling_streams_share_the_ps_mux() {
    let fx = fixture();

    fx.router.on_stream_discovered(&fx.outputs, audio_pad()).unwrap();
    fx.router.on_stream_discovered(&fx.outputs, video_pad()).unwrap();

    // Both PS branches feed the same mux node.
    fx.ctx.with_graph(|g| {
        let mux_nodes: Vec<_> = g
            .node_names()
            .iter()
            .filter(|n| n.starts_with("ps_mux:"))
            .cloned()
            .collect();
        assert_eq!(mux_nodes.len(), 1);
    });

    teardown(&fx);
}
