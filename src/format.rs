//! Media format taxonomy: codecs, coarse media classes, and per-stream
//! capability descriptions carried by buffers.

use std::fmt;

/// Coarse media classification used for branch routing.
///
/// This is the routing key: templates match on the class of a discovered
/// stream, not on its exact codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaClass {
    /// Video streams.
    Video,
    /// Audio streams.
    Audio,
}

impl fmt::Display for MediaClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaClass::Video => write!(f, "video"),
            MediaClass::Audio => write!(f, "audio"),
        }
    }
}

/// Elementary stream codec, as carried in MPEG program tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamCodec {
    /// H.264/AVC video.
    H264,
    /// H.265/HEVC video.
    H265,
    /// MPEG-2 video.
    Mpeg2Video,
    /// AAC audio with ADTS framing.
    AacAdts,
    /// MPEG-1/2 audio (layer 1/2/3).
    MpegAudio,
    /// AC-3 audio.
    Ac3,
    /// Anything we cannot classify; carries the raw stream type code.
    Other(u8),
}

impl StreamCodec {
    /// ISO/IEC 13818-1 stream type code for this codec.
    pub fn stream_type_code(&self) -> u8 {
        match self {
            StreamCodec::H264 => 0x1B,
            StreamCodec::H265 => 0x24,
            StreamCodec::Mpeg2Video => 0x02,
            StreamCodec::AacAdts => 0x0F,
            StreamCodec::MpegAudio => 0x03,
            StreamCodec::Ac3 => 0x81,
            StreamCodec::Other(code) => *code,
        }
    }

    /// Coarse media class, if this codec is routable.
    pub fn media_class(&self) -> Option<MediaClass> {
        match self {
            StreamCodec::H264 | StreamCodec::H265 | StreamCodec::Mpeg2Video => {
                Some(MediaClass::Video)
            }
            StreamCodec::AacAdts | StreamCodec::MpegAudio | StreamCodec::Ac3 => {
                Some(MediaClass::Audio)
            }
            StreamCodec::Other(_) => None,
        }
    }

    /// Returns true if this is a video codec.
    pub fn is_video(&self) -> bool {
        self.media_class() == Some(MediaClass::Video)
    }

    /// Returns true if this is an audio codec.
    pub fn is_audio(&self) -> bool {
        self.media_class() == Some(MediaClass::Audio)
    }
}

/// Decoded audio stream parameters, extracted from ADTS headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u8,
    /// MPEG-4 audio object type (2 = AAC-LC).
    pub object_type: u8,
}

/// Capabilities of one elementary stream.
///
/// Attached to buffer metadata so downstream elements can configure
/// themselves from the data path (muxers pick tracks, parsers refine the
/// audio parameters as they see headers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCaps {
    /// The stream codec.
    pub codec: StreamCodec,
    /// Audio parameters, if known yet.
    pub audio: Option<AudioParams>,
}

impl StreamCaps {
    /// Caps for a codec with no refined parameters yet.
    pub fn new(codec: StreamCodec) -> Self {
        Self { codec, audio: None }
    }

    /// Coarse media class of this stream.
    pub fn media_class(&self) -> Option<MediaClass> {
        self.codec.media_class()
    }
}

/// A discovered elementary stream: the dynamic output of the demuxer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPad {
    /// Packet identifier of the stream within the container.
    pub pid: u16,
    /// Stream capabilities as announced by the program tables.
    pub caps: StreamCaps,
}

impl fmt::Display for StreamPad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} ({:?})", self.pid, self.caps.codec)
    }
}
