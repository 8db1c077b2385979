//! Deadline-aware byte channel over a single bidirectional stream.
//!
//! The host side wraps a `tokio::net::UnixStream`, the guest side a
//! `tokio::fs::File` opened read+write on the virtio-serial character
//! device. Both get the same contract: reads never hide short reads,
//! writes are all-or-nothing, and deadlines are absolute instants.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};

use crate::error::{ProtocolError, TransportError, WireError};

const READ_CHUNK: usize = 8 * 1024;

/// Exclusive owner of one bidirectional byte stream.
///
/// Reads go through an internal buffer so bytes pulled past a delimiter are
/// not lost between messages. A handle that returned `ConnectionLost` must
/// be discarded; reconnecting produces a new `Channel`.
pub struct Channel<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Channel<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Pre-size the read buffer; it still grows past `capacity` if a
    /// message needs it.
    pub fn with_capacity(stream: S, capacity: usize) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Bytes already read from the stream but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pull one chunk from the stream into the buffer.
    async fn fill(&mut self, deadline: Option<Instant>) -> Result<(), TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        let read = self.stream.read(&mut chunk);
        let n = match deadline {
            Some(at) => timeout_at(at, read)
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => read.await,
        }
        .map_err(TransportError::from_io)?;

        if n == 0 {
            return Err(TransportError::ConnectionLost(
                "peer closed the stream".to_string(),
            ));
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Block until at least `n` bytes are buffered.
    pub async fn read_at_least(
        &mut self,
        n: usize,
        deadline: Option<Instant>,
    ) -> Result<(), TransportError> {
        while self.buf.len() < n {
            self.fill(deadline).await?;
        }
        Ok(())
    }

    /// Consume and return exactly `n` bytes.
    pub async fn read_exact_bytes(
        &mut self,
        n: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<u8>, TransportError> {
        self.read_at_least(n, deadline).await?;
        Ok(self.buf.drain(..n).collect())
    }

    /// Read until `delim` appears, consuming and returning everything
    /// through it. The match must complete within the first `max_bytes`
    /// of the message; otherwise the read fails with `Oversize` and the
    /// buffered bytes are left in place.
    pub async fn read_until(
        &mut self,
        delim: &[u8],
        max_bytes: usize,
        what: &'static str,
        deadline: Option<Instant>,
    ) -> Result<Vec<u8>, WireError> {
        loop {
            if let Some(pos) = find(&self.buf, delim) {
                let end = pos + delim.len();
                if end > max_bytes {
                    return Err(ProtocolError::Oversize {
                        what,
                        limit: max_bytes,
                    }
                    .into());
                }
                return Ok(self.buf.drain(..end).collect());
            }
            if self.buf.len() >= max_bytes {
                return Err(ProtocolError::Oversize {
                    what,
                    limit: max_bytes,
                }
                .into());
            }
            self.fill(deadline).await?;
        }
    }

    /// Write the whole buffer or fail. A partial kernel write is resumed
    /// until the full length is out or the deadline passes.
    pub async fn write_all(
        &mut self,
        bytes: &[u8],
        deadline: Option<Instant>,
    ) -> Result<(), TransportError> {
        let write = async {
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        };
        match deadline {
            Some(at) => timeout_at(at, write)
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => write.await,
        }
        .map_err(TransportError::from_io)
    }

    /// Close the write side; errors on an already-dead handle are ignored.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
