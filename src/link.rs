//! In-process links between pipeline nodes, backed by kanal channels.
//!
//! A link is the only way buffers move between node threads. Closing the
//! sender side is how end-of-stream propagates: a receiver that drains
//! its channel and then sees it closed knows its upstream is done.

use crate::buffer::Buffer;
use crate::error::{Error, Result};

/// Factory for local links.
pub struct LocalLink;

impl LocalLink {
    /// Create a bounded local link with the specified capacity.
    ///
    /// Bounded links are the buffering queues of the pipeline: a full
    /// channel applies backpressure to the producer.
    pub fn bounded(capacity: usize) -> (LocalSender, LocalReceiver) {
        let (tx, rx) = kanal::bounded(capacity);
        (LocalSender { inner: tx }, LocalReceiver { inner: rx })
    }

    /// Create an unbounded local link.
    ///
    /// Use with caution, producers can outrun consumers without limit.
    pub fn unbounded() -> (LocalSender, LocalReceiver) {
        let (tx, rx) = kanal::unbounded();
        (LocalSender { inner: tx }, LocalReceiver { inner: rx })
    }
}

/// Sender half of a local link.
#[derive(Clone)]
pub struct LocalSender {
    inner: kanal::Sender<Buffer>,
}

impl LocalSender {
    /// Send a buffer through the link.
    ///
    /// Blocks if the channel is full. Returns an error once the receiver
    /// is gone.
    pub fn send(&self, buffer: Buffer) -> Result<()> {
        self.inner
            .send(buffer)
            .map_err(|_| Error::Pipeline("link closed".into()))
    }

    /// Try to send without blocking.
    pub fn try_send(&self, buffer: Buffer) -> Result<()> {
        match self.inner.try_send(buffer) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::Pipeline("link full".into())),
            Err(_) => Err(Error::Pipeline("link closed".into())),
        }
    }

    /// Check if the receiving side is gone.
    pub fn is_closed(&self) -> bool {
        self.inner.is_disconnected()
    }

    /// Number of buffers waiting in the channel.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Check if the channel is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Receiver half of a local link.
pub struct LocalReceiver {
    inner: kanal::Receiver<Buffer>,
}

impl LocalReceiver {
    /// Receive a buffer from the link.
    ///
    /// Blocks until a buffer is available. Returns `None` once the
    /// channel is closed and drained, which is the end-of-stream signal.
    pub fn recv(&self) -> Option<Buffer> {
        self.inner.recv().ok()
    }

    /// Try to receive without blocking.
    pub fn try_recv(&self) -> Option<Buffer> {
        match self.inner.try_recv() {
            Ok(Some(buf)) => Some(buf),
            _ => None,
        }
    }

    /// Receive asynchronously.
    pub async fn recv_async(&self) -> Option<Buffer> {
        self.inner.as_async().recv().await.ok()
    }

    /// Check if the sending side is gone.
    pub fn is_closed(&self) -> bool {
        self.inner.is_disconnected()
    }

    /// Iterate over received buffers until end of stream.
    pub fn iter(&self) -> impl Iterator<Item = Buffer> + '_ {
        std::iter::from_fn(|| self.recv())
    }
}
