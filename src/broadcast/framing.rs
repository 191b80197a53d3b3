//! Length-prefixed message framing for byte streams (pipes, sockets).
//!
//! Wire format:
//! ```text
//! ┌────────────┬──────────────┬──────────────────────┐
//! │ Magic (2B) │ Length (4B)  │ Payload              │
//! │ "FS"       │ u32 LE       │ bincode(Message)     │
//! └────────────┴──────────────┴──────────────────────┘
//! ```

use std::io::{ErrorKind, Read, Write};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};

use super::channel::{ChannelError, MessageSink, MessageSource};
use super::message::Message;

/// Frame header: magic (2) + length (4).
pub const HEADER_SIZE: usize = 6;

/// Magic bytes: "FS".
pub const MAGIC: [u8; 2] = [0x46, 0x53];

/// Default maximum payload: 256 MiB, enough for a full 16-bit sensor.
pub const DEFAULT_MAX_PAYLOAD: usize = 256 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// Appends the encoded `message` to `dst`.
pub fn encode_message(message: &Message, dst: &mut BytesMut) -> Result<(), ChannelError> {
    let payload = bincode::serialize(message)?;
    if payload.len() > u32::MAX as usize {
        return Err(ChannelError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(&payload);
    Ok(())
}

/// Decodes one message from the front of `src`.
///
/// Returns `Ok(None)` until a complete frame is buffered; on success the
/// frame bytes are consumed.
pub fn decode_message(src: &mut BytesMut, max_payload: usize) -> Result<Option<Message>, ChannelError> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }
    if src[0..2] != MAGIC {
        return Err(ChannelError::InvalidMagic);
    }
    let payload_len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    if payload_len > max_payload {
        return Err(ChannelError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }
    if src.len() < HEADER_SIZE + payload_len {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len);
    let message = bincode::deserialize(&payload)?;
    Ok(Some(message))
}

/// Writes framed messages to any [`Write`] stream.
pub struct FramedWriter<W> {
    inner: Option<W>,
    buf: BytesMut,
}

impl<W: Write> FramedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Some(inner),
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Encodes and writes one message, then flushes.
    pub fn write_message(&mut self, message: &Message) -> Result<(), ChannelError> {
        let inner = self.inner.as_mut().ok_or(ChannelError::Closed)?;
        self.buf.clear();
        encode_message(message, &mut self.buf)?;
        match inner.write_all(&self.buf).and_then(|()| inner.flush()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::BrokenPipe => Err(ChannelError::Closed),
            Err(err) => Err(ChannelError::Io(err)),
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> Option<&W> {
        self.inner.as_ref()
    }
}

impl<W: Write + Send> MessageSink for FramedWriter<W> {
    fn send(&mut self, message: &Message) -> Result<(), ChannelError> {
        self.write_message(message)
    }

    /// Flushes and drops the stream, signalling EOF to the reader.
    fn close(&mut self) -> Result<(), ChannelError> {
        if let Some(mut inner) = self.inner.take() {
            match inner.flush() {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::BrokenPipe => {}
                Err(err) => return Err(ChannelError::Io(err)),
            }
        }
        Ok(())
    }
}

/// Reads framed messages from a blocking [`Read`] stream.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    chunk: Vec<u8>,
    max_payload: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, max_payload: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            chunk: vec![0u8; READ_CHUNK],
            max_payload,
        }
    }

    /// Blocks until a full message is read.
    ///
    /// Returns `Ok(None)` at end of stream. A stream that ends inside a
    /// frame is logged and treated as a clean end.
    pub fn read_message(&mut self) -> Result<Option<Message>, ChannelError> {
        loop {
            if let Some(message) = decode_message(&mut self.buf, self.max_payload)? {
                return Ok(Some(message));
            }
            match self.inner.read(&mut self.chunk) {
                Ok(0) => {
                    if !self.buf.is_empty() {
                        tracing::warn!(trailing_bytes = self.buf.len(), "Stream ended inside a frame");
                        self.buf.clear();
                    }
                    return Ok(None);
                }
                Ok(n) => self.buf.extend_from_slice(&self.chunk[..n]),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(ChannelError::Io(err)),
            }
        }
    }
}

/// Reads framed messages on a background thread and hands them out with
/// timeouts.
///
/// The internal queue is bounded, so a slow consumer stops the reader
/// thread, which in turn pushes back on the writer through the pipe.
pub struct FramedSource {
    receiver: Receiver<Result<Message, ChannelError>>,
    reader: Option<JoinHandle<()>>,
}

impl FramedSource {
    /// Spawns the reader thread.
    pub fn spawn<R>(reader: R, capacity: usize, max_payload: usize) -> std::io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let (sender, receiver) = bounded(capacity.max(1));
        let handle = thread::Builder::new()
            .name("framed-reader".into())
            .spawn(move || {
                let mut reader = FrameReader::new(reader, max_payload);
                loop {
                    match reader.read_message() {
                        Ok(Some(message)) => {
                            if sender.send(Ok(message)).is_err() {
                                return;
                            }
                        }
                        Ok(None) => return,
                        Err(err) => {
                            let _ = sender.send(Err(err));
                            return;
                        }
                    }
                }
            })?;

        Ok(Self {
            receiver,
            reader: Some(handle),
        })
    }

    /// Returns true once the reader thread has exited and the queue is drained.
    pub fn is_finished(&self) -> bool {
        self.receiver.is_empty() && self.reader.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl MessageSource for FramedSource {
    fn receive(&mut self, timeout: Duration) -> Result<Option<Message>, ChannelError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(Ok(message)) => Ok(Some(message)),
            Ok(Err(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.reader.take() {
                    let _ = handle.join();
                }
                Err(ChannelError::Closed)
            }
        }
    }
}
