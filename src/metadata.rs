//! Buffer metadata types.

use crate::clock::ClockTime;
use crate::format::StreamCaps;

/// Flags indicating buffer properties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags {
    /// Buffer contains a sync point (keyframe equivalent).
    pub sync_point: bool,
    /// Buffer is corrupted or incomplete.
    pub corrupted: bool,
    /// Buffer follows a discontinuity in its stream.
    pub discont: bool,
}

/// Metadata associated with a buffer.
///
/// Contains timing information, the originating stream, and the stream
/// capabilities negotiated so far.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    /// Presentation timestamp.
    pub pts: Option<ClockTime>,

    /// Decode timestamp.
    pub dts: Option<ClockTime>,

    /// Duration of this buffer's content.
    pub duration: Option<ClockTime>,

    /// Monotonic sequence number within a stream.
    pub sequence: u64,

    /// Originating elementary stream PID, if demultiplexed.
    pub stream_id: Option<u16>,

    /// Stream capabilities, attached by the demuxer and refined by
    /// parser elements.
    pub caps: Option<StreamCaps>,

    /// Buffer flags.
    pub flags: BufferFlags,
}

impl Metadata {
    /// Create new metadata with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create metadata with a sequence number.
    pub fn with_sequence(sequence: u64) -> Self {
        Self {
            sequence,
            ..Default::default()
        }
    }

    /// Set the presentation timestamp.
    pub fn with_pts(mut self, pts: ClockTime) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Set the decode timestamp.
    pub fn with_dts(mut self, dts: ClockTime) -> Self {
        self.dts = Some(dts);
        self
    }

    /// Set the originating stream.
    pub fn with_stream_id(mut self, pid: u16) -> Self {
        self.stream_id = Some(pid);
        self
    }

    /// Set the stream capabilities.
    pub fn with_caps(mut self, caps: StreamCaps) -> Self {
        self.caps = Some(caps);
        self
    }

    /// Mark as a sync point.
    pub fn with_sync_point(mut self) -> Self {
        self.flags.sync_point = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::StreamCodec;

    #[test]
    fn test_metadata_builder() {
        let meta = Metadata::with_sequence(42)
            .with_pts(ClockTime::from_millis(100))
            .with_stream_id(256)
            .with_caps(StreamCaps::new(StreamCodec::H264))
            .with_sync_point();

        assert_eq!(meta.sequence, 42);
        assert_eq!(meta.pts, Some(ClockTime::from_millis(100)));
        assert_eq!(meta.stream_id, Some(256));
        assert_eq!(meta.caps.map(|c| c.codec), Some(StreamCodec::H264));
        assert!(meta.flags.sync_point);
    }

    #[test]
    fn test_metadata_defaults() {
        let meta = Metadata::new();
        assert!(meta.pts.is_none());
        assert!(meta.stream_id.is_none());
        assert!(!meta.flags.sync_point);
        assert!(!meta.flags.corrupted);
    }
}
