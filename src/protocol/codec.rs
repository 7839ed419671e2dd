//! Frame stream codec.
//!
//! Frames are written as single contiguous buffers on a stream socket; the
//! receiver delimits them by the lengths declared in the fixed header.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, ProtocolError};

use super::{Frame, HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Tokio codec for tunnel frame framing.
pub struct FrameCodec {
    max_payload_size: usize,
}

impl FrameCodec {
    /// Create a new codec with default settings.
    pub fn new() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }

    /// Create a codec with a custom max payload size.
    pub fn with_max_payload(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need the fixed header to learn the variable lengths.
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let extra_len = src[20] as usize;
        let payload_len = BigEndian::read_u32(&src[25..29]) as usize;

        if payload_len > self.max_payload_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: self.max_payload_size,
            }
            .into());
        }

        let total_len = HEADER_SIZE + extra_len + 1 + payload_len;

        // Wait for the complete frame.
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let frame_data = src.split_to(total_len);
        let frame = Frame::decode(&frame_data)?;
        Ok(Some(frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            // Stream ended with a partial frame in the buffer.
            None => Err(Error::ShortRead),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > self.max_payload_size {
            return Err(ProtocolError::FrameTooLarge {
                size: item.payload.len(),
                max: self.max_payload_size,
            }
            .into());
        }

        let encoded = item.encode();
        dst.reserve(encoded.len());
        dst.put_slice(&encoded);
        Ok(())
    }
}

/// Read exactly one frame from an async stream.
///
/// Returns [`Error::ShortRead`] if the stream ends mid-frame; an EOF on a
/// frame boundary surfaces as `Ok(None)`.
pub async fn read_frame<R>(reader: &mut R) -> crate::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    let mut read = 0usize;
    while read < HEADER_SIZE {
        let n = reader.read(&mut header[read..]).await?;
        if n == 0 {
            // EOF between frames is a clean end; inside the header it is not.
            return if read == 0 { Ok(None) } else { Err(Error::ShortRead) };
        }
        read += n;
    }

    let extra_len = header[20] as usize;
    let payload_len = BigEndian::read_u32(&header[25..29]) as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload_len,
            max: MAX_PAYLOAD_SIZE,
        }
        .into());
    }

    let mut rest = vec![0u8; extra_len + 1 + payload_len];
    reader
        .read_exact(&mut rest)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::ShortRead,
            _ => Error::Io(e),
        })?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + rest.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&rest);
    Frame::decode(&buf).map(Some)
}
