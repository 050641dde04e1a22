//! Processing elements: sources, parsers, the demuxer, and muxers.

pub mod demux;
pub mod file;
pub mod mux;
pub mod parse;

pub use demux::{DemuxOutputs, TsDemux};
pub use file::{FileSink, FileSrc};
pub use parse::{AdtsParser, H264Parser};
