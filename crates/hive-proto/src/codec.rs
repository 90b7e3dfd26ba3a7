//! Envelope codec for async streams
//!
//! Every envelope travels as a 4-byte big-endian body length followed by
//! the MessagePack encoding of the envelope.

use crate::{Envelope, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Length-prefixed MessagePack codec for envelopes
///
/// Reads accumulate in an internal buffer, so a read cancelled by
/// `tokio::select!` loses no bytes and the next call resumes the frame.
pub struct EnvelopeCodec {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    /// Create a codec accepting frames up to [`MAX_FRAME_SIZE`]
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a codec with a custom frame limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            max_frame_size,
        }
    }

    /// Encode an envelope into a length-prefixed frame
    pub fn encode_envelope(&self, envelope: &Envelope) -> Result<Bytes, ProtocolError> {
        let body = envelope.to_msgpack()?;
        let len = self.check_len(body.len())?;

        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + body.len());
        frame.put_u32(len);
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    /// Encode and write one envelope, flushing the writer
    pub async fn write_envelope<W>(
        &self,
        writer: &mut W,
        envelope: &Envelope,
    ) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode_envelope(envelope)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the next envelope
    ///
    /// Returns `Ok(None)` when the stream ends between frames and
    /// [`ProtocolError::InvalidFrame`] when it ends inside one. Transport
    /// failures surface as [`ProtocolError::Io`].
    pub async fn read_envelope<R>(
        &mut self,
        reader: &mut R,
    ) -> Result<Option<Envelope>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(envelope) = self.try_decode_envelope()? {
                return Ok(Some(envelope));
            }

            if reader.read_buf(&mut self.buffer).await? == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(ProtocolError::InvalidFrame)
                };
            }
        }
    }

    /// Decode one envelope if a complete frame is buffered
    pub fn try_decode_envelope(&mut self) -> Result<Option<Envelope>, ProtocolError> {
        let Some(mut prefix) = self.buffer.get(..LENGTH_PREFIX) else {
            return Ok(None);
        };
        let body_len = self.check_len(prefix.get_u32() as usize)? as usize;

        if self.buffer.len() < LENGTH_PREFIX + body_len {
            self.buffer.reserve(LENGTH_PREFIX + body_len - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX);
        let body = self.buffer.split_to(body_len);
        Envelope::from_msgpack(&body).map(Some)
    }

    /// Number of buffered bytes not yet decoded
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    fn check_len(&self, size: usize) -> Result<u32, ProtocolError> {
        let max = self.max_frame_size;
        if size > max {
            return Err(ProtocolError::FrameTooLarge { size, max });
        }
        u32::try_from(size).map_err(|_| ProtocolError::FrameTooLarge { size, max })
    }
}
