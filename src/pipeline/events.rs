//! Pipeline event bus.
//!
//! Events are emitted by node threads and the router during execution
//! and received asynchronously by the lifecycle controller (and any
//! other subscriber). Every subscriber gets its own buffered view of
//! the event stream.

use crate::format::MediaClass;
use std::fmt;
use tokio::sync::broadcast;

use super::PipelineState;

/// Events emitted by the pipeline during execution.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Pipeline state has changed.
    StateChanged {
        /// Previous state.
        from: PipelineState,
        /// New state.
        to: PipelineState,
    },

    /// The demuxer announced a new elementary stream.
    StreamAdded {
        /// Stream PID.
        pid: u16,
        /// Coarse media class, if routable.
        media: Option<MediaClass>,
    },

    /// The router linked a branch for a stream.
    BranchLinked {
        /// Stream PID the branch consumes.
        stream: u16,
        /// Branch template name.
        branch: String,
    },

    /// End of stream reached (every node drained and finished).
    Eos,

    /// A fatal error occurred in the pipeline.
    Error {
        /// The error message.
        message: String,
        /// The node where the error occurred (if known).
        node: Option<String>,
    },

    /// Warning (non-fatal issue, e.g. an abandoned branch).
    Warning {
        /// The warning message.
        message: String,
        /// The node that emitted the warning (if known).
        node: Option<String>,
    },

    /// A node started processing.
    NodeStarted {
        /// The node that started.
        node: String,
    },

    /// A node finished processing.
    NodeFinished {
        /// The node that finished.
        node: String,
        /// Number of buffers it handled.
        buffers_processed: u64,
    },

    /// Pipeline execution started.
    Started,

    /// All node threads have exited.
    Stopped,
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineEvent::StateChanged { from, to } => {
                write!(f, "StateChanged: {from:?} -> {to:?}")
            }
            PipelineEvent::StreamAdded { pid, media } => match media {
                Some(m) => write!(f, "Stream added: pid {pid} ({m})"),
                None => write!(f, "Stream added: pid {pid} (unclassified)"),
            },
            PipelineEvent::BranchLinked { stream, branch } => {
                write!(f, "Branch {branch} linked for stream {stream}")
            }
            PipelineEvent::Eos => write!(f, "EOS"),
            PipelineEvent::Error { message, node } => match node {
                Some(n) => write!(f, "Error in {n}: {message}"),
                None => write!(f, "Error: {message}"),
            },
            PipelineEvent::Warning { message, node } => match node {
                Some(n) => write!(f, "Warning in {n}: {message}"),
                None => write!(f, "Warning: {message}"),
            },
            PipelineEvent::NodeStarted { node } => write!(f, "Node {node} started"),
            PipelineEvent::NodeFinished {
                node,
                buffers_processed,
            } => write!(f, "Node {node} finished ({buffers_processed} buffers)"),
            PipelineEvent::Started => write!(f, "Pipeline started"),
            PipelineEvent::Stopped => write!(f, "Pipeline stopped"),
        }
    }
}

/// Sender for pipeline events.
#[derive(Clone)]
pub struct EventSender {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventSender {
    /// Create a new event sender with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event.
    ///
    /// Returns the number of receivers that saw it. Zero receivers is
    /// fine.
    pub fn send(&self, event: PipelineEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Send an EOS event.
    pub fn send_eos(&self) {
        self.send(PipelineEvent::Eos);
    }

    /// Send a fatal error event.
    pub fn send_error(&self, message: impl Into<String>, node: Option<String>) {
        self.send(PipelineEvent::Error {
            message: message.into(),
            node,
        });
    }

    /// Send a warning event.
    pub fn send_warning(&self, message: impl Into<String>, node: Option<String>) {
        self.send(PipelineEvent::Warning {
            message: message.into(),
            node,
        });
    }

    /// Send a state changed event.
    pub fn send_state_changed(&self, from: PipelineState, to: PipelineState) {
        self.send(PipelineEvent::StateChanged { from, to });
    }

    /// Send a node started event.
    pub fn send_node_started(&self, node: impl Into<String>) {
        self.send(PipelineEvent::NodeStarted { node: node.into() });
    }

    /// Send a node finished event.
    pub fn send_node_finished(&self, node: impl Into<String>, buffers_processed: u64) {
        self.send(PipelineEvent::NodeFinished {
            node: node.into(),
            buffers_processed,
        });
    }

    /// Create a receiver for events.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Receiver for pipeline events.
///
/// Multiple receivers can be created from a single sender; each gets
/// every event sent after it subscribed.
pub struct EventReceiver {
    receiver: broadcast::Receiver<PipelineEvent>,
}

impl EventReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` if the sender has been dropped. A lagged receiver
    /// skips to the oldest retained event instead of failing.
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<PipelineEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Wait for EOS or a fatal error.
    ///
    /// Returns `Ok(())` on EOS, `Err(message)` on error.
    pub async fn wait_eos(&mut self) -> Result<(), String> {
        while let Some(event) = self.recv().await {
            match event {
                PipelineEvent::Eos => return Ok(()),
                PipelineEvent::Error { message, node } => {
                    return Err(match node {
                        Some(n) => format!("error in {n}: {message}"),
                        None => message,
                    });
                }
                _ => continue,
            }
        }
        Err("event channel closed unexpectedly".to_string())
    }
}
