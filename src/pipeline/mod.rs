//! Pipeline engine: topology graph, event bus, thread executor, and the
//! lifecycle controller.

pub mod controller;
pub mod events;
pub mod executor;
pub mod graph;

pub use controller::PipelineController;
pub use events::{EventReceiver, EventSender, PipelineEvent};
pub use executor::{ChainOutput, Executor};
pub use graph::Pipeline;

use std::fmt;

/// Lifecycle state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Assembled but not started.
    Idle,
    /// Node threads are running.
    Playing,
    /// Ran to completion and tore down cleanly.
    Stopped,
    /// Terminated by a fatal error.
    Failed,
}

impl PipelineState {
    /// Whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Idle => write!(f, "idle"),
            PipelineState::Playing => write!(f, "playing"),
            PipelineState::Stopped => write!(f, "stopped"),
            PipelineState::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!PipelineState::Idle.is_terminal());
        assert!(!PipelineState::Playing.is_terminal());
        assert!(PipelineState::Stopped.is_terminal());
        assert!(PipelineState::Failed.is_terminal());
    }
}
