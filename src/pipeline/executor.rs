//! Thread-per-node pipeline execution.
//!
//! Every node runs on its own named OS thread; buffers move between
//! threads over bounded [`LocalLink`](crate::link::LocalLink) channels.
//! End-of-stream propagates by channel close: when a producer exits it
//! drops its senders, downstream receivers drain and then see the close.
//!
//! The executor tracks the number of live node threads. When the count
//! reaches zero it emits [`PipelineEvent::Eos`] (clean run) or only
//! [`PipelineEvent::Stopped`] (after a fatal error). A fatal error in
//! any node also trips the cancellation token so the source stops
//! producing and the rest of the pipeline drains.
//!
//! Spawn consumers before their producers: the live-thread count must
//! cover the downstream node before its upstream can exit, otherwise a
//! fast producer could drive the count to zero early. Dynamic branches
//! satisfy this naturally because they are spawned from the demux
//! thread, which is itself still counted.

use crate::buffer::Buffer;
use crate::element::{Sink, Source, Transform};
use crate::elements::demux::{DemuxOutputs, TsDemux};
use crate::error::{Error, Result};
use crate::format::StreamPad;
use crate::link::{LocalReceiver, LocalSender};
use crate::pipeline::events::{EventSender, PipelineEvent};

use smallvec::{smallvec, SmallVec};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Where a chain delivers its buffers.
pub enum ChainOutput {
    /// Forward into another link (e.g. a mux input).
    Link(LocalSender),
    /// Terminate in a sink.
    Sink(Box<dyn Sink>),
}

/// Per-node context handed to node bodies.
pub struct NodeCtx {
    name: String,
    events: EventSender,
    cancel: CancellationToken,
}

impl NodeCtx {
    /// The node's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pipeline event bus.
    pub fn events(&self) -> &EventSender {
        &self.events
    }

    /// Whether an orderly stop was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct NamedHandle {
    name: String,
    handle: JoinHandle<()>,
}

struct Inner {
    events: EventSender,
    cancel: CancellationToken,
    threads: Mutex<Vec<NamedHandle>>,
    running: AtomicUsize,
    failed: AtomicBool,
}

/// Spawns and tracks node threads.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    /// Create an executor bound to an event bus and cancellation token.
    pub fn new(events: EventSender, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                events,
                cancel,
                threads: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                failed: AtomicBool::new(false),
            }),
        }
    }

    /// The event bus.
    pub fn events(&self) -> &EventSender {
        &self.inner.events
    }

    /// Request an orderly stop: the source stops producing and the
    /// pipeline drains.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Whether a stop has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Whether any node hit a fatal error.
    pub fn has_failed(&self) -> bool {
        self.inner.failed.load(Ordering::Acquire)
    }

    /// Spawn a node thread.
    ///
    /// The body returns the number of buffers it handled; an `Err` is a
    /// fatal pipeline error attributed to the node.
    pub fn spawn_node<F>(&self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce(&NodeCtx) -> Result<u64> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let ctx = NodeCtx {
            name: name.to_string(),
            events: self.inner.events.clone(),
            cancel: self.inner.cancel.clone(),
        };

        self.inner.running.fetch_add(1, Ordering::SeqCst);
        self.inner.events.send_node_started(name);

        let thread_name = name.to_string();
        let spawned = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                match body(&ctx) {
                    Ok(count) => {
                        debug!(node = %ctx.name, buffers = count, "node finished");
                        inner.events.send_node_finished(&ctx.name, count);
                    }
                    Err(e) => {
                        error!(node = %ctx.name, error = %e, "node failed");
                        inner.failed.store(true, Ordering::Release);
                        inner.events.send_error(e.to_string(), Some(ctx.name.clone()));
                        // Stop the source so the rest of the pipeline drains.
                        inner.cancel.cancel();
                    }
                }
                if inner.running.fetch_sub(1, Ordering::SeqCst) == 1 {
                    if !inner.failed.load(Ordering::Acquire) {
                        inner.events.send_eos();
                    }
                    inner.events.send(PipelineEvent::Stopped);
                }
            });

        match spawned {
            Ok(handle) => {
                self.inner.threads.lock().expect("thread list poisoned").push(NamedHandle {
                    name: thread_name,
                    handle,
                });
                Ok(())
            }
            Err(e) => {
                self.inner.running.fetch_sub(1, Ordering::SeqCst);
                Err(Error::Setup(format!("failed to spawn node {name}: {e}")))
            }
        }
    }

    /// Spawn a source node feeding one link.
    pub fn spawn_source(
        &self,
        name: &str,
        mut source: Box<dyn Source>,
        tx: LocalSender,
    ) -> Result<()> {
        self.spawn_node(name, move |ctx| {
            let mut count = 0u64;
            loop {
                if ctx.is_cancelled() {
                    debug!(node = %ctx.name(), "source cancelled");
                    break;
                }
                match source.produce()? {
                    Some(buffer) => {
                        count += 1;
                        if tx.send(buffer).is_err() {
                            // Downstream is gone; nothing left to feed.
                            break;
                        }
                    }
                    None => break,
                }
            }
            Ok(count)
        })
    }

    /// Spawn the demux node.
    ///
    /// The demuxer is constructed on its own thread (its parser state is
    /// not `Send`). After every push, newly announced streams are handed
    /// to `on_stream` before any of their frames are routed, so the
    /// callback runs on the demux thread exactly as a pad-added handler
    /// would.
    pub fn spawn_demux<F>(
        &self,
        name: &str,
        rx: LocalReceiver,
        outputs: Arc<DemuxOutputs>,
        mut on_stream: F,
    ) -> Result<()>
    where
        F: FnMut(&DemuxOutputs, StreamPad) + Send + 'static,
    {
        self.spawn_node(name, move |ctx| {
            let mut demux = TsDemux::new();
            let mut count = 0u64;
            while let Some(buffer) = rx.recv() {
                if ctx.is_cancelled() {
                    break;
                }
                count += 1;
                let frames = demux.push(buffer.as_bytes())?;
                for pad in demux.take_announced() {
                    ctx.events().send(PipelineEvent::StreamAdded {
                        pid: pad.pid,
                        media: pad.caps.media_class(),
                    });
                    on_stream(&outputs, pad);
                }
                for frame in frames {
                    outputs.route(frame);
                }
            }
            // Dropping the registered senders is EOS for every branch.
            outputs.close();
            Ok(count)
        })
    }

    /// Spawn a linear chain: receive, run transforms in order, deliver
    /// to the output.
    pub fn spawn_chain(
        &self,
        name: &str,
        rx: LocalReceiver,
        mut transforms: Vec<Box<dyn Transform>>,
        mut output: ChainOutput,
    ) -> Result<()> {
        self.spawn_node(name, move |_ctx| {
            let mut count = 0u64;
            'stream: while let Some(buffer) = rx.recv() {
                count += 1;
                let mut batch: SmallVec<[Buffer; 4]> = smallvec![buffer];
                for stage in transforms.iter_mut() {
                    let mut next: SmallVec<[Buffer; 4]> = SmallVec::new();
                    for b in batch {
                        next.extend(stage.transform(b)?.into_vec());
                    }
                    batch = next;
                    if batch.is_empty() {
                        continue 'stream;
                    }
                }
                for b in batch {
                    match &mut output {
                        ChainOutput::Link(tx) => {
                            if tx.send(b).is_err() {
                                break 'stream;
                            }
                        }
                        ChainOutput::Sink(sink) => sink.consume(b)?,
                    }
                }
            }
            if let ChainOutput::Sink(sink) = &mut output {
                sink.finish()?;
            }
            Ok(count)
        })
    }

    /// Spawn a tee node duplicating its input to every subscriber.
    ///
    /// A subscriber whose channel closes is dropped; the tee keeps
    /// serving the remaining branches.
    pub fn spawn_tee(
        &self,
        name: &str,
        rx: LocalReceiver,
        mut branches: Vec<LocalSender>,
    ) -> Result<()> {
        self.spawn_node(name, move |ctx| {
            let mut count = 0u64;
            while let Some(buffer) = rx.recv() {
                count += 1;
                branches.retain(|tx| {
                    let alive = tx.send(buffer.clone()).is_ok();
                    if !alive {
                        warn!(node = %ctx.name(), "tee subscriber went away");
                    }
                    alive
                });
                if branches.is_empty() {
                    break;
                }
            }
            Ok(count)
        })
    }

    /// Join every node thread, in reverse spawn order.
    ///
    /// Blocking; call from a blocking context. Returns the join order.
    pub fn join_all(&self) -> Vec<String> {
        let mut handles = {
            let mut guard = self.inner.threads.lock().expect("thread list poisoned");
            std::mem::take(&mut *guard)
        };
        let mut order = Vec::with_capacity(handles.len());
        while let Some(named) = handles.pop() {
            if named.handle.join().is_err() {
                error!(node = %named.name, "node thread panicked");
                self.inner.failed.store(true, Ordering::Release);
            }
            order.push(named.name);
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LocalLink;
    use crate::metadata::Metadata;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    struct VecSource {
        items: Vec<Buffer>,
    }

    impl Source for VecSource {
        fn produce(&mut self) -> Result<Option<Buffer>> {
            if self.items.is_empty() {
                Ok(None)
            } else {
                Ok(Some(self.items.remove(0)))
            }
        }
    }

    struct EndlessSource;

    impl Source for EndlessSource {
        fn produce(&mut self) -> Result<Option<Buffer>> {
            std::thread::sleep(Duration::from_millis(1));
            Ok(Some(Buffer::from_vec(vec![0u8; 8], Metadata::new())))
        }
    }

    struct FailingSource;

    impl Source for FailingSource {
        fn produce(&mut self) -> Result<Option<Buffer>> {
            Err(Error::Pipeline("read failed".into()))
        }
    }

    struct CountingSink {
        count: Arc<AtomicU64>,
    }

    impl Sink for CountingSink {
        fn consume(&mut self, _buffer: Buffer) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn make_buffers(n: u64) -> Vec<Buffer> {
        (0..n)
            .map(|i| Buffer::from_vec(vec![0u8; 16], Metadata::with_sequence(i)))
            .collect()
    }

    #[tokio::test]
    async fn test_source_to_sink_runs_to_eos() {
        let events = EventSender::new(64);
        let mut rx_events = events.subscribe();
        let exec = Executor::new(events, CancellationToken::new());

        let (tx, rx) = LocalLink::bounded(8);
        let count = Arc::new(AtomicU64::new(0));

        exec.spawn_chain(
            "sink",
            rx,
            Vec::new(),
            ChainOutput::Sink(Box::new(CountingSink {
                count: Arc::clone(&count),
            })),
        )
        .unwrap();
        exec.spawn_source("src", Box::new(VecSource { items: make_buffers(10) }), tx)
            .unwrap();

        rx_events.wait_eos().await.unwrap();
        let exec2 = exec.clone();
        tokio::task::spawn_blocking(move || exec2.join_all())
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert!(!exec.has_failed());
    }

    #[tokio::test]
    async fn test_fatal_error_suppresses_eos() {
        let events = EventSender::new(64);
        let mut rx_events = events.subscribe();
        let exec = Executor::new(events, CancellationToken::new());

        let (tx, rx) = LocalLink::bounded(8);
        let count = Arc::new(AtomicU64::new(0));
        exec.spawn_chain(
            "sink",
            rx,
            Vec::new(),
            ChainOutput::Sink(Box::new(CountingSink { count })),
        )
        .unwrap();
        exec.spawn_source("src", Box::new(FailingSource), tx).unwrap();

        let result = rx_events.wait_eos().await;
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("read failed"));

        let exec2 = exec.clone();
        tokio::task::spawn_blocking(move || exec2.join_all())
            .await
            .unwrap();
        assert!(exec.has_failed());
    }

    #[tokio::test]
    async fn test_cancellation_drains_cleanly() {
        let events = EventSender::new(64);
        let mut rx_events = events.subscribe();
        let token = CancellationToken::new();
        let exec = Executor::new(events, token.clone());

        let (tx, rx) = LocalLink::bounded(8);
        let count = Arc::new(AtomicU64::new(0));
        exec.spawn_chain(
            "sink",
            rx,
            Vec::new(),
            ChainOutput::Sink(Box::new(CountingSink {
                count: Arc::clone(&count),
            })),
        )
        .unwrap();
        exec.spawn_source("src", Box::new(EndlessSource), tx).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();

        // Cancellation is an orderly stop: the pipeline drains to EOS.
        rx_events.wait_eos().await.unwrap();
        let exec2 = exec.clone();
        tokio::task::spawn_blocking(move || exec2.join_all())
            .await
            .unwrap();

        assert!(count.load(Ordering::SeqCst) > 0);
        assert!(!exec.has_failed());
    }

    #[tokio::test]
    async fn test_tee_duplicates_to_all_branches() {
        let events = EventSender::new(64);
        let mut rx_events = events.subscribe();
        let exec = Executor::new(events, CancellationToken::new());

        let (tee_tx, tee_rx) = LocalLink::bounded(8);
        let (a_tx, a_rx) = LocalLink::bounded(8);
        let (b_tx, b_rx) = LocalLink::bounded(8);
        let a_count = Arc::new(AtomicU64::new(0));
        let b_count = Arc::new(AtomicU64::new(0));

        exec.spawn_chain(
            "a",
            a_rx,
            Vec::new(),
            ChainOutput::Sink(Box::new(CountingSink {
                count: Arc::clone(&a_count),
            })),
        )
        .unwrap();
        exec.spawn_chain(
            "b",
            b_rx,
            Vec::new(),
            ChainOutput::Sink(Box::new(CountingSink {
                count: Arc::clone(&b_count),
            })),
        )
        .unwrap();
        exec.spawn_tee("tee", tee_rx, vec![a_tx, b_tx]).unwrap();
        exec.spawn_source(
            "src",
            Box::new(VecSource { items: make_buffers(5) }),
            tee_tx,
        )
        .unwrap();

        rx_events.wait_eos().await.unwrap();
        let exec2 = exec.clone();
        tokio::task::spawn_blocking(move || exec2.join_all())
            .await
            .unwrap();

        assert_eq!(a_count.load(Ordering::SeqCst), 5);
        assert_eq!(b_count.load(Ordering::SeqCst), 5);
    }
}
