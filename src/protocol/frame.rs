//! Tunnel frame structure and bit-exact wire encoding.
//!
//! Fixed header layout, network byte order, packed:
//!
//! ```text
//! session_id:u32 seq:u64 direction:i8 path_id:u8
//! window_id:u32 proto_id:u16 extra_len:u8
//! frag_id:u16 frag_total:u16 payload_len:u32
//! ```
//!
//! Wire order: `header || extra_header[extra_len] || flags:u8 ||
//! payload[payload_len]`. The flags byte follows the *variable* extra
//! header, so it sits at offset `HEADER_SIZE + extra_len`.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{ProtocolError, Result};

use super::HEADER_SIZE;

/// Frame direction on the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum Direction {
    /// Client towards the target server.
    Up = 0,
    /// Target server back towards the client.
    Down = 1,
}

impl Direction {
    pub fn from_wire(v: i8) -> std::result::Result<Self, ProtocolError> {
        match v {
            0 => Ok(Self::Up),
            1 => Ok(Self::Down),
            other => Err(ProtocolError::InvalidDirection(other)),
        }
    }

    pub fn as_wire(self) -> i8 {
        self as i8
    }
}

/// Frame flags bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);

    /// Synthetic cover traffic, consumed at the next decoding hop.
    pub const PADDING: u8 = 0x01;

    /// Cover-protocol handshake preamble frame.
    pub const HANDSHAKE: u8 = 0x02;

    /// Carries one fragment of an application chunk.
    pub const FRAGMENT: u8 = 0x04;

    /// Duplicate copy sent on an additional path.
    pub const REDUNDANT: u8 = 0x08;

    /// Acknowledges a received sequence number.
    pub const ACK: u8 = 0x10;

    /// Create flags from raw bits.
    pub fn new(bits: u8) -> Self {
        Self(bits)
    }

    /// Check if a flag is set.
    pub fn has(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    /// Set a flag.
    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    /// Return a copy with the given flag set.
    pub fn with(self, flag: u8) -> Self {
        Self(self.0 | flag)
    }

    /// Get raw bits.
    pub fn bits(self) -> u8 {
        self.0
    }
}

/// The atomic unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stable for the lifetime of one application connection.
    pub session_id: u32,
    /// Monotone per direction per session.
    pub seq: u64,
    /// Up or down the tunnel.
    pub direction: Direction,
    /// Index into the session's path table.
    pub path_id: u8,
    /// Window in which the frame was emitted.
    pub window_id: u32,
    /// Cover-protocol family identity.
    pub proto_id: u16,
    /// Flag bitmask.
    pub flags: FrameFlags,
    /// Fragment index within the sequence.
    pub frag_id: u16,
    /// Total fragments in the sequence.
    pub frag_total: u16,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Variable extra header; first byte is the variant id.
    pub extra_header: Vec<u8>,
}

impl Frame {
    /// Create a fragment-bearing application frame.
    pub fn fragment(
        session_id: u32,
        seq: u64,
        direction: Direction,
        path_id: u8,
        window_id: u32,
        frag_id: u16,
        frag_total: u16,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            session_id,
            seq,
            direction,
            path_id,
            window_id,
            proto_id: 0,
            flags: FrameFlags::new(FrameFlags::FRAGMENT),
            frag_id,
            frag_total,
            payload,
            extra_header: Vec::new(),
        }
    }

    /// Create an ACK frame echoing the routing fields of `acked`.
    ///
    /// The payload is exactly 8 bytes holding the acknowledged `seq` in
    /// big-endian order.
    pub fn ack(acked: &Frame) -> Self {
        Self {
            session_id: acked.session_id,
            seq: acked.seq,
            direction: Direction::Down,
            path_id: acked.path_id,
            window_id: acked.window_id,
            proto_id: acked.proto_id,
            flags: FrameFlags::new(FrameFlags::ACK),
            frag_id: 0,
            frag_total: 1,
            payload: acked.seq.to_be_bytes().to_vec(),
            extra_header: Vec::new(),
        }
    }

    pub fn is_padding(&self) -> bool {
        self.flags.has(FrameFlags::PADDING)
    }

    pub fn is_handshake(&self) -> bool {
        self.flags.has(FrameFlags::HANDSHAKE)
    }

    pub fn is_ack(&self) -> bool {
        self.flags.has(FrameFlags::ACK)
    }

    pub fn is_fragment(&self) -> bool {
        self.flags.has(FrameFlags::FRAGMENT)
    }

    /// Sequence number carried by an ACK payload, if well-formed.
    pub fn acked_seq(&self) -> Option<u64> {
        if !self.is_ack() || self.payload.len() != 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.payload);
        Some(u64::from_be_bytes(buf))
    }

    /// Total encoded length on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.extra_header.len() + 1 + self.payload.len()
    }

    /// Serialise to the wire representation.
    ///
    /// The extra header must fit its one-byte length field.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.extra_header.len() <= u8::MAX as usize);
        let mut buf = vec![0u8; self.wire_len()];
        BigEndian::write_u32(&mut buf[0..4], self.session_id);
        BigEndian::write_u64(&mut buf[4..12], self.seq);
        buf[12] = self.direction.as_wire() as u8;
        buf[13] = self.path_id;
        BigEndian::write_u32(&mut buf[14..18], self.window_id);
        BigEndian::write_u16(&mut buf[18..20], self.proto_id);
        buf[20] = self.extra_header.len() as u8;
        BigEndian::write_u16(&mut buf[21..23], self.frag_id);
        BigEndian::write_u16(&mut buf[23..25], self.frag_total);
        BigEndian::write_u32(&mut buf[25..29], self.payload.len() as u32);

        let extra_end = HEADER_SIZE + self.extra_header.len();
        buf[HEADER_SIZE..extra_end].copy_from_slice(&self.extra_header);
        buf[extra_end] = self.flags.bits();
        buf[extra_end + 1..].copy_from_slice(&self.payload);
        buf
    }

    /// Decode a frame from a complete buffer.
    ///
    /// Fails with [`ProtocolError::MalformedFrame`] if any declared length
    /// would overrun the buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::MalformedFrame(format!(
                "buffer shorter than header: {} < {HEADER_SIZE}",
                buf.len()
            ))
            .into());
        }

        let session_id = BigEndian::read_u32(&buf[0..4]);
        let seq = BigEndian::read_u64(&buf[4..12]);
        let direction = Direction::from_wire(buf[12] as i8)?;
        let path_id = buf[13];
        let window_id = BigEndian::read_u32(&buf[14..18]);
        let proto_id = BigEndian::read_u16(&buf[18..20]);
        let extra_len = buf[20] as usize;
        let frag_id = BigEndian::read_u16(&buf[21..23]);
        let frag_total = BigEndian::read_u16(&buf[23..25]);
        let payload_len = BigEndian::read_u32(&buf[25..29]) as usize;

        let total = HEADER_SIZE + extra_len + 1 + payload_len;
        if buf.len() < total {
            return Err(ProtocolError::MalformedFrame(format!(
                "declared lengths overrun buffer: need {total}, have {}",
                buf.len()
            ))
            .into());
        }

        let extra_end = HEADER_SIZE + extra_len;
        let extra_header = buf[HEADER_SIZE..extra_end].to_vec();
        let flags = FrameFlags::new(buf[extra_end]);
        let payload = buf[extra_end + 1..total].to_vec();

        Ok(Self {
            session_id,
            seq,
            direction,
            path_id,
            window_id,
            proto_id,
            flags,
            frag_id,
            frag_total,
            payload,
            extra_header,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        Frame {
            session_id: 0xDEAD_BEEF,
            seq: 42,
            direction: Direction::Up,
            path_id: 3,
            window_id: 7,
            proto_id: 2,
            flags: FrameFlags::new(FrameFlags::FRAGMENT),
            frag_id: 1,
            frag_total: 4,
            payload: b"hello tunnel".to_vec(),
            extra_header: vec![1, 0xAA, 0xBB],
        }
    }

    #[test]
    fn test_roundtrip() {
        let frame = sample_frame();
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_roundtrip_empty_payload_and_extra() {
        let mut frame = sample_frame();
        frame.payload.clear();
        frame.extra_header.clear();
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_flags_follow_extra_header() {
        let frame = sample_frame();
        let wire = frame.encode();
        // The flags byte must sit after the variable extra header, not at a
        // fixed offset inside the header.
        assert_eq!(wire[HEADER_SIZE + frame.extra_header.len()], frame.flags.bits());
        assert_eq!(wire.len(), frame.wire_len());
    }

    #[test]
    fn test_header_field_offsets() {
        let frame = sample_frame();
        let wire = frame.encode();
        assert_eq!(BigEndian::read_u32(&wire[0..4]), frame.session_id);
        assert_eq!(BigEndian::read_u64(&wire[4..12]), frame.seq);
        assert_eq!(wire[12], 0); // UP
        assert_eq!(wire[13], frame.path_id);
        assert_eq!(BigEndian::read_u32(&wire[14..18]), frame.window_id);
        assert_eq!(BigEndian::read_u16(&wire[18..20]), frame.proto_id);
        assert_eq!(wire[20] as usize, frame.extra_header.len());
        assert_eq!(BigEndian::read_u16(&wire[21..23]), frame.frag_id);
        assert_eq!(BigEndian::read_u16(&wire[23..25]), frame.frag_total);
        assert_eq!(BigEndian::read_u32(&wire[25..29]) as usize, frame.payload.len());
    }

    #[test]
    fn test_decode_overrun_payload() {
        let frame = sample_frame();
        let mut wire = frame.encode();
        // Inflate the declared payload length beyond the buffer.
        BigEndian::write_u32(&mut wire[25..29], 1_000_000);
        assert!(Frame::decode(&wire).is_err());
    }

    #[test]
    fn test_decode_overrun_extra() {
        let frame = sample_frame();
        let mut wire = frame.encode();
        wire[20] = 0xFF;
        assert!(Frame::decode(&wire).is_err());
    }

    #[test]
    fn test_decode_truncated_header() {
        assert!(Frame::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_invalid_direction() {
        let frame = sample_frame();
        let mut wire = frame.encode();
        wire[12] = 9;
        assert!(Frame::decode(&wire).is_err());
    }

    #[test]
    fn test_ack_payload() {
        let frame = sample_frame();
        let ack = Frame::ack(&frame);
        assert!(ack.is_ack());
        assert_eq!(ack.payload.len(), 8);
        assert_eq!(ack.acked_seq(), Some(frame.seq));
        assert_eq!(ack.direction, Direction::Down);
        assert_eq!(ack.frag_total, 1);
    }

    #[test]
    fn test_maximal_extra_header() {
        let mut frame = sample_frame();
        frame.extra_header = vec![0x5A; 255];
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }
}
