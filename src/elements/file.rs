//! File source and sink.

use crate::buffer::Buffer;
use crate::element::{Sink, Source};
use crate::error::Result;
use crate::metadata::Metadata;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default read chunk size for the file source.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Reads a file in fixed-size chunks.
pub struct FileSrc {
    path: PathBuf,
    reader: BufReader<File>,
    chunk_size: usize,
    sequence: u64,
}

impl FileSrc {
    /// Open a file for reading with the default chunk size.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_chunk_size(path, DEFAULT_CHUNK_SIZE)
    }

    /// Open a file for reading with an explicit chunk size.
    pub fn with_chunk_size(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
            chunk_size: chunk_size.max(1),
            sequence: 0,
        })
    }

    /// Path of the file being read.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Source for FileSrc {
    fn produce(&mut self) -> Result<Option<Buffer>> {
        let mut data = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < data.len() {
            let n = self.reader.read(&mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            debug!(path = %self.path.display(), "file exhausted");
            return Ok(None);
        }
        data.truncate(filled);

        let metadata = Metadata::with_sequence(self.sequence);
        self.sequence += 1;
        Ok(Some(Buffer::from_vec(data, metadata)))
    }
}

/// Writes buffer payloads to a file.
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes_written: u64,
}

impl FileSink {
    /// Create (or truncate) the output file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            bytes_written: 0,
        })
    }

    /// Path of the file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Write raw bytes, bypassing buffer wrapping.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }
}

impl Sink for FileSink {
    fn consume(&mut self, buffer: Buffer) -> Result<()> {
        self.write_bytes(buffer.as_bytes())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        debug!(path = %self.path.display(), bytes = self.bytes_written, "file sink finished");
        Ok(())
    }
}
