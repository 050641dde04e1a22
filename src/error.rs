//! Error types for streamfork.

use thiserror::Error;

/// Errors that can occur while building or running a pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O failure (source read, sink write, file open).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Element or pipeline construction failed before playback.
    #[error("setup error: {0}")]
    Setup(String),

    /// Linking two nodes violated the topology rules.
    #[error("link error: {0}")]
    Link(String),

    /// A dynamically routed branch could not be built.
    ///
    /// Branch-scoped and non-fatal: the affected branch is abandoned,
    /// sibling branches and the rest of the pipeline continue.
    #[error("routing error for stream {stream}: {message}")]
    Routing {
        /// PID of the elementary stream the branch was built for.
        stream: u16,
        /// What went wrong.
        message: String,
    },

    /// Container-level parse or write failure (demux/mux).
    #[error("container error: {0}")]
    Container(String),

    /// Runtime pipeline failure (channel closed unexpectedly, node died).
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Operation attempted in the wrong lifecycle state.
    #[error("invalid state: expected {expected}, was {actual}")]
    InvalidState {
        /// State the operation requires.
        expected: String,
        /// State the pipeline was actually in.
        actual: String,
    },
}

impl Error {
    /// Returns true if this error only affects a single branch.
    pub fn is_branch_scoped(&self) -> bool {
        matches!(self, Error::Routing { .. })
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
