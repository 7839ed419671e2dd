//! Cover-protocol families and variants.
//!
//! A family is a stable cover identity: a fixed handshake preamble plus a
//! set of variants that control frame sizing hints, extra-header shape, and
//! payload encoding. The built-in catalog is immutable after construction.

use std::time::Duration;

use rand::Rng;

use crate::protocol::Direction;

/// One frame of a family's handshake preamble.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeSpec {
    /// Direction the handshake frame travels.
    pub direction: Direction,
    /// Random payload size in bytes.
    pub size: usize,
    /// Delay to honor before the *next* handshake frame on the same path.
    pub delay: Duration,
}

/// Payload transformation applied by a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObfuscationMode {
    /// Payload passes through unchanged.
    None,
    /// Single-byte XOR with a random per-frame key.
    Xor,
    /// XOR then byte reversal.
    XorReverse,
}

/// A concrete wire appearance within a family.
#[derive(Debug, Clone)]
pub struct ProtoVariant {
    pub variant_id: u8,
    /// Characteristic frame sizes of the mimicked protocol.
    pub frame_sizes: Vec<u16>,
    /// Inclusive range for the random extra-header tail length.
    pub extra_header_range: (u8, u8),
    pub obfuscation_mode: ObfuscationMode,
    /// Prepend a length-prefixed random pad to the extra header.
    pub padding_header: bool,
}

/// A cover identity: handshake preamble plus at least one variant.
#[derive(Debug, Clone)]
pub struct ProtoFamily {
    pub family_id: u16,
    pub handshake: Vec<HandshakeSpec>,
    pub variants: Vec<ProtoVariant>,
}

impl ProtoFamily {
    /// Variant lookup by id, modulo the variant count, so callers may hand
    /// in monotone counters without bounds-checking.
    pub fn variant(&self, variant_id: u8) -> &ProtoVariant {
        &self.variants[variant_id as usize % self.variants.len()]
    }

    /// Pick one of the variant's characteristic frame sizes.
    pub fn pick_frame_size<R: Rng>(&self, variant: &ProtoVariant, rng: &mut R) -> u16 {
        variant.frame_sizes[rng.gen_range(0..variant.frame_sizes.len())]
    }

    /// Generate an extra header for the variant.
    ///
    /// Layout: `variant_id:u8 || (pad_len:u8 || random[pad_len])? ||
    /// random[rand(low..=high)]`.
    pub fn pick_extra_header<R: Rng>(&self, variant: &ProtoVariant, rng: &mut R) -> Vec<u8> {
        let (low, high) = variant.extra_header_range;
        let tail_len = rng.gen_range(low..=high) as usize;

        let mut header = Vec::with_capacity(1 + 5 + tail_len);
        header.push(variant.variant_id);
        if variant.padding_header {
            let pad_len = rng.gen_range(1..=4u8);
            header.push(pad_len);
            for _ in 0..pad_len {
                header.push(rng.gen());
            }
        }
        for _ in 0..tail_len {
            header.push(rng.gen());
        }
        header
    }

    /// Transform a payload for the wire.
    ///
    /// Emits `key:u8 || transformed` for the XOR modes; the identity for
    /// `None` or an empty payload.
    pub fn encode_payload<R: Rng>(
        &self,
        payload: &[u8],
        variant: &ProtoVariant,
        rng: &mut R,
    ) -> Vec<u8> {
        if payload.is_empty() || variant.obfuscation_mode == ObfuscationMode::None {
            return payload.to_vec();
        }
        let key: u8 = rng.gen_range(1..=255);
        let mut transformed: Vec<u8> = payload.iter().map(|b| b ^ key).collect();
        if variant.obfuscation_mode == ObfuscationMode::XorReverse {
            transformed.reverse();
        }
        let mut out = Vec::with_capacity(1 + transformed.len());
        out.push(key);
        out.extend_from_slice(&transformed);
        out
    }

    /// Inverse of [`encode_payload`](Self::encode_payload).
    pub fn decode_payload(&self, payload: &[u8], variant: &ProtoVariant) -> Vec<u8> {
        if payload.is_empty() || variant.obfuscation_mode == ObfuscationMode::None {
            return payload.to_vec();
        }
        let key = payload[0];
        let mut data = payload[1..].to_vec();
        if variant.obfuscation_mode == ObfuscationMode::XorReverse {
            data.reverse();
        }
        for b in &mut data {
            *b ^= key;
        }
        data
    }
}

/// The built-in cover catalog: three families, two variants each.
pub fn builtin_families() -> Vec<ProtoFamily> {
    vec![
        ProtoFamily {
            family_id: 1,
            handshake: vec![
                HandshakeSpec {
                    direction: Direction::Up,
                    size: 32,
                    delay: Duration::from_millis(5),
                },
                HandshakeSpec {
                    direction: Direction::Down,
                    size: 24,
                    delay: Duration::from_millis(10),
                },
            ],
            variants: vec![
                ProtoVariant {
                    variant_id: 0,
                    frame_sizes: vec![256, 384, 512],
                    extra_header_range: (0, 4),
                    obfuscation_mode: ObfuscationMode::None,
                    padding_header: false,
                },
                ProtoVariant {
                    variant_id: 1,
                    frame_sizes: vec![200, 300, 500],
                    extra_header_range: (1, 6),
                    obfuscation_mode: ObfuscationMode::None,
                    padding_header: true,
                },
            ],
        },
        ProtoFamily {
            family_id: 2,
            handshake: vec![
                HandshakeSpec {
                    direction: Direction::Up,
                    size: 48,
                    delay: Duration::from_millis(3),
                },
                HandshakeSpec {
                    direction: Direction::Up,
                    size: 16,
                    delay: Duration::from_millis(6),
                },
            ],
            variants: vec![
                ProtoVariant {
                    variant_id: 0,
                    frame_sizes: vec![300, 450, 600, 750],
                    extra_header_range: (2, 8),
                    obfuscation_mode: ObfuscationMode::Xor,
                    padding_header: false,
                },
                ProtoVariant {
                    variant_id: 1,
                    frame_sizes: vec![280, 420, 560],
                    extra_header_range: (4, 10),
                    obfuscation_mode: ObfuscationMode::Xor,
                    padding_header: true,
                },
            ],
        },
        ProtoFamily {
            family_id: 3,
            handshake: vec![
                HandshakeSpec {
                    direction: Direction::Down,
                    size: 40,
                    delay: Duration::from_millis(8),
                },
                HandshakeSpec {
                    direction: Direction::Up,
                    size: 20,
                    delay: Duration::from_millis(5),
                },
            ],
            variants: vec![
                ProtoVariant {
                    variant_id: 0,
                    frame_sizes: vec![200, 400, 800],
                    extra_header_range: (4, 12),
                    obfuscation_mode: ObfuscationMode::XorReverse,
                    padding_header: true,
                },
                ProtoVariant {
                    variant_id: 1,
                    frame_sizes: vec![240, 480, 720],
                    extra_header_range: (2, 12),
                    obfuscation_mode: ObfuscationMode::XorReverse,
                    padding_header: false,
                },
            ],
        },
    ]
}
