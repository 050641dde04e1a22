//! Branch templates: which container branches a discovered stream of a
//! given media class fans out into.

use crate::element::Transform;
use crate::elements::parse::{AdtsParser, H264Parser};
use crate::format::MediaClass;

use std::path::{Path, PathBuf};

/// Default capacity of a branch head channel.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Parser stage a branch runs before its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    /// Pass frames through untouched.
    None,
    /// Strip ADTS framing and recover the audio parameters.
    Adts,
    /// Tag H.264 keyframes as sync points.
    H264,
}

impl ParserKind {
    /// Build the transform stages for one branch instance.
    pub fn build(&self) -> Vec<Box<dyn Transform>> {
        match self {
            ParserKind::None => Vec::new(),
            ParserKind::Adts => vec![Box::new(AdtsParser::new())],
            ParserKind::H264 => vec![Box::new(H264Parser::new())],
        }
    }
}

/// Container a branch delivers into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// MPEG program stream file. Branches for the same path share one
    /// mux.
    MpegPs {
        /// Output file path.
        path: PathBuf,
    },
    /// MP4 file. One branch per file.
    Mp4 {
        /// Output file path.
        path: PathBuf,
    },
}

impl Destination {
    /// The output file path.
    pub fn path(&self) -> &Path {
        match self {
            Destination::MpegPs { path } => path,
            Destination::Mp4 { path } => path,
        }
    }
}

/// One branch a matching stream is linked into.
#[derive(Debug, Clone)]
pub struct BranchTemplate {
    /// Branch name; instance node names get the stream PID appended.
    pub name: String,
    /// Media class this branch accepts.
    pub media: MediaClass,
    /// Parser stage ahead of the container.
    pub parser: ParserKind,
    /// Container destination.
    pub destination: Destination,
    /// Capacity of the branch head channel.
    pub queue_capacity: usize,
}

impl BranchTemplate {
    /// Create a template with the default queue capacity.
    pub fn new(
        name: impl Into<String>,
        media: MediaClass,
        parser: ParserKind,
        destination: Destination,
    ) -> Self {
        Self {
            name: name.into(),
            media,
            parser,
            destination,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Set the branch head channel capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

/// Lookup table from media class to branch templates.
#[derive(Debug, Clone, Default)]
pub struct BranchTable {
    templates: Vec<BranchTemplate>,
}

impl BranchTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a template.
    pub fn add(mut self, template: BranchTemplate) -> Self {
        self.templates.push(template);
        self
    }

    /// Templates matching a media class, in insertion order.
    pub fn templates_for(&self, media: MediaClass) -> Vec<&BranchTemplate> {
        self.templates.iter().filter(|t| t.media == media).collect()
    }

    /// Total template count.
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Whether the table has no templates.
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// The standard split: audio fans out to the program stream and the
    /// MP4 file, video goes to the program stream only.
    pub fn dual_destination(ps_path: impl AsRef<Path>, mp4_path: impl AsRef<Path>) -> Self {
        let ps_path = ps_path.as_ref().to_path_buf();
        let mp4_path = mp4_path.as_ref().to_path_buf();

        Self::new()
            .add(BranchTemplate::new(
                "ps_audio",
                MediaClass::Audio,
                ParserKind::None,
                Destination::MpegPs {
                    path: ps_path.clone(),
                },
            ))
            .add(BranchTemplate::new(
                "mp4_audio",
                MediaClass::Audio,
                ParserKind::Adts,
                Destination::Mp4 { path: mp4_path },
            ))
            .add(BranchTemplate::new(
                "ps_video",
                MediaClass::Video,
                ParserKind::H264,
                Destination::MpegPs { path: ps_path },
            ))
    }
}
