//! Core element traits.
//!
//! Elements are the processing units of a pipeline. Three seams cover
//! every node: [`Source`] produces buffers, [`Transform`] maps buffers
//! to zero or more buffers, [`Sink`] consumes them. Demultiplexing is a
//! special node handled by the executor because its outputs appear at
//! runtime.

use crate::buffer::Buffer;
use crate::error::Result;
use smallvec::SmallVec;

/// The role a node plays in the pipeline topology.
///
/// Used by the graph to validate fan-in and fan-out: only a demuxer or
/// tee may have multiple outputs, only a muxer may have multiple inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Produces buffers from outside the pipeline.
    Source,
    /// Splits one input into per-stream outputs discovered at runtime.
    Demux,
    /// Duplicates one input to several subscriber outputs.
    Tee,
    /// One input, one output.
    Transform,
    /// Merges several inputs into one container output.
    Mux,
    /// Consumes buffers.
    Sink,
}

impl NodeKind {
    /// Whether more than one outgoing link is allowed.
    pub fn multi_output(&self) -> bool {
        matches!(self, NodeKind::Demux | NodeKind::Tee)
    }

    /// Whether more than one incoming link is allowed.
    pub fn multi_input(&self) -> bool {
        matches!(self, NodeKind::Mux)
    }
}

/// Output of a transform: zero, one, or several buffers.
///
/// Parsers commonly split one input buffer into several frames, so the
/// multi case is stack-allocated for small counts.
#[derive(Debug)]
pub enum Output {
    /// No output for this input (buffer absorbed or dropped).
    None,
    /// Exactly one output buffer.
    Single(Buffer),
    /// Several output buffers, in order.
    Multiple(SmallVec<[Buffer; 4]>),
}

impl Output {
    /// Number of buffers in this output.
    pub fn len(&self) -> usize {
        match self {
            Output::None => 0,
            Output::Single(_) => 1,
            Output::Multiple(v) => v.len(),
        }
    }

    /// Check whether this output carries no buffers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume into a small vector of buffers.
    pub fn into_vec(self) -> SmallVec<[Buffer; 4]> {
        match self {
            Output::None => SmallVec::new(),
            Output::Single(b) => {
                let mut v = SmallVec::new();
                v.push(b);
                v
            }
            Output::Multiple(v) => v,
        }
    }
}

/// An element that produces buffers.
pub trait Source: Send {
    /// Produce the next buffer.
    ///
    /// Returns `Ok(None)` at end of stream.
    fn produce(&mut self) -> Result<Option<Buffer>>;
}

/// An element that processes buffers one at a time.
pub trait Transform: Send {
    /// Process a buffer, producing zero or more output buffers.
    fn transform(&mut self, buffer: Buffer) -> Result<Output>;
}

/// An element that consumes buffers.
pub trait Sink: Send {
    /// Consume a buffer.
    fn consume(&mut self, buffer: Buffer) -> Result<()>;

    /// Called once after the last buffer, before teardown.
    ///
    /// Container sinks finalize their index structures here.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;

    struct CountingSink {
        seen: u64,
        finished: bool,
    }

    impl Sink for CountingSink {
        fn consume(&mut self, _buffer: Buffer) -> Result<()> {
            self.seen += 1;
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.finished = true;
            Ok(())
        }
    }

    #[test]
    fn test_node_kind_rules() {
        assert!(NodeKind::Demux.multi_output());
        assert!(NodeKind::Tee.multi_output());
        assert!(!NodeKind::Transform.multi_output());

        assert!(NodeKind::Mux.multi_input());
        assert!(!NodeKind::Sink.multi_input());
    }

    #[test]
    fn test_output_into_vec() {
        assert_eq!(Output::None.into_vec().len(), 0);

        let b = Buffer::from_vec(vec![1, 2, 3], Metadata::new());
        assert_eq!(Output::Single(b.clone()).into_vec().len(), 1);

        let mut many = SmallVec::new();
        many.push(b.clone());
        many.push(b);
        let out = Output::Multiple(many);
        assert_eq!(out.len(), 2);
        assert!(!out.is_empty());
    }

    #[test]
    fn test_sink_lifecycle() {
        let mut sink = CountingSink {
            seen: 0,
            finished: false,
        };
        sink.consume(Buffer::from_vec(vec![0], Metadata::new()))
            .unwrap();
        sink.finish().unwrap();
        assert_eq!(sink.seen, 1);
        assert!(sink.finished);
    }
}
