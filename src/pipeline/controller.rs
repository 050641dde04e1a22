//! Pipeline lifecycle controller.
//!
//! Drives a pipeline from `Idle` through `Playing` to a terminal state,
//! blocking on the event bus until end-of-stream or a fatal error, then
//! joining every node thread in reverse construction order.

use crate::error::{Error, Result};
use crate::pipeline::events::{EventReceiver, PipelineEvent};
use crate::pipeline::executor::Executor;
use crate::pipeline::{EventSender, PipelineState};

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs a pipeline to completion.
pub struct PipelineController {
    events: EventSender,
    executor: Executor,
    cancel: CancellationToken,
    timeout: Option<Duration>,
    state: PipelineState,
}

impl PipelineController {
    /// Create a controller for an assembled pipeline.
    pub fn new(
        events: EventSender,
        executor: Executor,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            events,
            executor,
            cancel,
            timeout,
            state: PipelineState::Idle,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn set_state(&mut self, to: PipelineState) {
        let from = self.state;
        if from != to {
            self.state = to;
            self.events.send_state_changed(from, to);
            info!(%from, %to, "pipeline state changed");
        }
    }

    /// Run until EOS or a fatal error, then tear down.
    ///
    /// The receiver must have been subscribed before the first node was
    /// spawned, otherwise early events are lost. Returns the terminal
    /// state on a clean run and the first fatal error otherwise.
    pub async fn run(&mut self, mut receiver: EventReceiver) -> Result<PipelineState> {
        if self.state != PipelineState::Idle {
            return Err(Error::InvalidState {
                expected: PipelineState::Idle.to_string(),
                actual: self.state.to_string(),
            });
        }
        self.set_state(PipelineState::Playing);
        self.events.send(PipelineEvent::Started);

        if let Some(timeout) = self.timeout {
            let token = self.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if !token.is_cancelled() {
                    warn!(?timeout, "pipeline timeout reached, cancelling");
                    token.cancel();
                }
            });
        }

        let mut first_error: Option<String> = None;
        let mut cancel_seen = false;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled(), if !cancel_seen => {
                    // Orderly stop: the source exits and the pipeline
                    // drains, ending in Eos or Stopped below.
                    cancel_seen = true;
                    debug!("cancellation observed, waiting for drain");
                }
                event = receiver.recv() => match event {
                    None => break,
                    Some(PipelineEvent::Eos) => break,
                    Some(PipelineEvent::Stopped) => break,
                    Some(PipelineEvent::Error { message, node }) => {
                        let full = match node {
                            Some(n) => format!("{n}: {message}"),
                            None => message,
                        };
                        if first_error.is_none() {
                            first_error = Some(full);
                        }
                        // Keep waiting: the executor cancels the source
                        // on fatal errors and will report Stopped once
                        // every thread has exited.
                    }
                    Some(PipelineEvent::Warning { message, node }) => {
                        warn!(?node, "{message}");
                    }
                    Some(other) => {
                        debug!(event = %other, "bus event");
                    }
                },
            }
        }

        // Teardown: join node threads in reverse construction order.
        let executor = self.executor.clone();
        let join_order = tokio::task::spawn_blocking(move || executor.join_all())
            .await
            .map_err(|e| Error::Pipeline(format!("teardown task failed: {e}")))?;
        debug!(?join_order, "node threads joined");

        if self.executor.has_failed() || first_error.is_some() {
            self.set_state(PipelineState::Failed);
            Err(Error::Pipeline(
                first_error.unwrap_or_else(|| "pipeline failed".to_string()),
            ))
        } else {
            self.set_state(PipelineState::Stopped);
            Ok(PipelineState::Stopped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::element::{Sink, Source};
    use crate::link::LocalLink;
    use crate::metadata::Metadata;
    use crate::pipeline::ChainOutput;

    struct NullSink;

    impl Sink for NullSink {
        fn consume(&mut self, _buffer: Buffer) -> Result<()> {
            Ok(())
        }
    }

    struct TickSource {
        remaining: u32,
    }

    impl Source for TickSource {
        fn produce(&mut self) -> Result<Option<Buffer>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(Buffer::from_vec(vec![0u8; 4], Metadata::new())))
        }
    }

    struct SlowEndlessSource;

    impl Source for SlowEndlessSource {
        fn produce(&mut self) -> Result<Option<Buffer>> {
            std::thread::sleep(Duration::from_millis(2));
            Ok(Some(Buffer::from_vec(vec![0u8; 4], Metadata::new())))
        }
    }

    fn build(
        source: Box<dyn Source>,
        timeout: Option<Duration>,
    ) -> (PipelineController, EventReceiver) {
        let events = EventSender::new(256);
        let receiver = events.subscribe();
        let cancel = CancellationToken::new();
        let executor = Executor::new(events.clone(), cancel.clone());

        let (tx, rx) = LocalLink::bounded(8);
        executor
            .spawn_chain("sink", rx, Vec::new(), ChainOutput::Sink(Box::new(NullSink)))
            .unwrap();
        executor.spawn_source("src", source, tx).unwrap();

        (
            PipelineController::new(events, executor, cancel, timeout),
            receiver,
        )
    }

    #[tokio::test]
    async fn test_run_to_eos() {
        let (mut controller, receiver) = build(Box::new(TickSource { remaining: 5 }), None);
        let state = controller.run(receiver).await.unwrap();
        assert_eq!(state, PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_timeout_cancels() {
        let (mut controller, receiver) = build(
            Box::new(SlowEndlessSource),
            Some(Duration::from_millis(40)),
        );
        // Timeout triggers cancellation, which drains to a clean stop.
        let state = controller.run(receiver).await.unwrap();
        assert_eq!(state, PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_run_requires_idle() {
        let (mut controller, receiver) = build(Box::new(TickSource { remaining: 1 }), None);
        controller.run(receiver).await.unwrap();
        assert!(controller.state().is_terminal());

        let events = EventSender::new(16);
        let rx = events.subscribe();
        let result = controller.run(rx).await;
        assert!(matches!(result, Err(Error::InvalidState { .. })));
    }
}
