//! Transports for the method channel.
//!
//! - [`QueuedTransport`] pushes frames into a shared outbox. The binary
//!   drains it from its writer task; tests inspect it directly.
//! - With the `net` feature, [`read_frame`] / [`write_frame`] implement
//!   `u32` little-endian length-prefixed framing over any tokio stream.

use crate::error::TransportError;
use crate::protocol::ClientCall;
use crate::channel::Transport;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Largest frame accepted from the network.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug)]
struct Outbox {
    frames: VecDeque<Bytes>,
    open: bool,
}

/// Shared view of a [`QueuedTransport`]'s outbox.
#[derive(Debug, Clone)]
pub struct OutboxHandle {
    inner: Arc<Mutex<Outbox>>,
}

impl OutboxHandle {
    pub fn drain(&self) -> Vec<Bytes> {
        self.inner.lock().frames.drain(..).collect()
    }

    /// Drain and decode every queued frame. Undecodable frames are skipped.
    pub fn take_calls(&self) -> Vec<ClientCall> {
        self.drain()
            .iter()
            .filter_map(|f| ClientCall::decode(f).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    /// Mark the connection open or closed from the I/O side.
    pub fn set_open(&self, open: bool) {
        self.inner.lock().open = open;
    }
}

#[derive(Debug)]
pub struct QueuedTransport {
    inner: Arc<Mutex<Outbox>>,
}

impl Default for QueuedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl QueuedTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Outbox {
                frames: VecDeque::new(),
                open: true,
            })),
        }
    }

    pub fn outbox(&self) -> OutboxHandle {
        OutboxHandle {
            inner: self.inner.clone(),
        }
    }
}

impl Transport for QueuedTransport {
    fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let mut outbox = self.inner.lock();
        if !outbox.open {
            return Err(TransportError::Closed);
        }
        outbox.frames.push_back(frame);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    fn close(&mut self) {
        self.inner.lock().open = false;
    }
}

// ---------------------------------------------------------------------------
// Stream framing (net feature)
// ---------------------------------------------------------------------------

/// Read one length-prefixed frame. `Ok(None)` on clean end of stream.
#[cfg(feature = "net")]
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, TransportError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TransportError::Io(e.to_string())),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Io(format!("frame of {len} bytes exceeds limit")));
    }
    let mut frame = vec![0u8; len];
    reader
        .read_exact(&mut frame)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(Some(Bytes::from(frame)))
}

#[cfg(feature = "net")]
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), TransportError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let len = u32::try_from(frame.len())
        .map_err(|_| TransportError::Io(format!("frame of {} bytes too large", frame.len())))?;
    writer
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    writer
        .write_all(frame)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(())
}
