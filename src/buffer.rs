//! Buffer types for data passing between elements.

use crate::metadata::Metadata;
use bytes::Bytes;

/// A buffer containing data and metadata.
///
/// Buffers are the primary data container in streamfork pipelines. The
/// payload is reference counted, so cloning a buffer for fan-out never
/// copies the data.
#[derive(Clone)]
pub struct Buffer {
    data: Bytes,
    metadata: Metadata,
}

impl Buffer {
    /// Create a new buffer from payload bytes and metadata.
    pub fn new(data: Bytes, metadata: Metadata) -> Self {
        Self { data, metadata }
    }

    /// Create a buffer from an owned byte vector.
    pub fn from_vec(data: Vec<u8>, metadata: Metadata) -> Self {
        Self {
            data: Bytes::from(data),
            metadata,
        }
    }

    /// Get a reference to the buffer's metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Get a mutable reference to the buffer's metadata.
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Get the buffer data as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get the underlying payload.
    pub fn payload(&self) -> &Bytes {
        &self.data
    }

    /// Get the length of the buffer data.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Create a sub-buffer viewing a portion of this buffer.
    ///
    /// The new buffer shares the payload and clones the metadata.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn slice(&self, offset: usize, len: usize) -> Buffer {
        Buffer {
            data: self.data.slice(offset..offset + len),
            metadata: self.metadata.clone(),
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.data.len())
            .field("metadata", &self.metadata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_buffer(size: usize) -> Buffer {
        Buffer::from_vec(vec![0xAB; size], Metadata::with_sequence(42))
    }

    #[test]
    fn test_buffer_creation() {
        let buffer = make_test_buffer(1024);
        assert_eq!(buffer.len(), 1024);
        assert_eq!(buffer.metadata().sequence, 42);
    }

    #[test]
    fn test_buffer_clone_is_cheap() {
        let buffer = make_test_buffer(1024);
        let buffer2 = buffer.clone();

        // Both should point at the same payload
        assert_eq!(buffer.as_bytes().as_ptr(), buffer2.as_bytes().as_ptr());
    }

    #[test]
    fn test_buffer_slice() {
        let buffer = make_test_buffer(1024);
        let sub = buffer.slice(100, 200);

        assert_eq!(sub.len(), 200);
        assert_eq!(sub.metadata().sequence, 42);
    }

    #[test]
    #[should_panic]
    fn test_buffer_slice_out_of_bounds() {
        let buffer = make_test_buffer(64);
        let _ = buffer.slice(60, 10);
    }
}
