//! # Streamfork
//!
//! A one-pass media pipeline splitter: read a multiplexed MPEG
//! transport stream, demultiplex it into elementary streams, and fan
//! each stream out into sibling container files (MPEG program stream
//! and MP4) in a single pass over the input.
//!
//! Streams are discovered dynamically from the program tables; a
//! routing table of branch templates decides which containers each
//! media class feeds. Every pipeline node runs on its own thread,
//! connected by bounded channels, with end-of-stream propagated by
//! channel close.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use streamfork::prelude::*;
//!
//! let table = BranchTable::dual_destination("output.mps", "output.mp4");
//! let config = SplitConfig::new("input.ts", table);
//! let report = Splitter::new(config).run().await?;
//! println!("linked {} streams", report.streams_linked.len());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod clock;
pub mod element;
pub mod elements;
pub mod error;
pub mod format;
pub mod link;
pub mod metadata;
pub mod pipeline;
pub mod routing;
pub mod splitter;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::Buffer;
    pub use crate::clock::ClockTime;
    pub use crate::element::{Sink, Source, Transform};
    pub use crate::error::{Error, Result};
    pub use crate::format::{MediaClass, StreamCaps, StreamCodec, StreamPad};
    pub use crate::metadata::Metadata;
    pub use crate::pipeline::{PipelineController, PipelineEvent, PipelineState};
    pub use crate::routing::{BranchTable, BranchTemplate, StreamRouter};
    pub use crate::splitter::{SplitConfig, SplitReport, Splitter};
}

pub use error::{Error, Result};
