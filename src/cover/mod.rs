//! Cover-protocol obfuscation.
//!
//! Stamps tunnel frames with a selectable cover identity: a protocol family
//! id, a randomised extra header whose first byte names the variant, an
//! optionally transformed payload, and a handshake preamble emitted when a
//! path opens. The registry is immutable after construction and shared by
//! every session in the process.

pub mod profiles;

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;

use crate::error::{ProtocolError, Result};
use crate::protocol::{Frame, FrameFlags};

pub use profiles::{builtin_families, HandshakeSpec, ObfuscationMode, ProtoFamily, ProtoVariant};

/// Immutable catalog of cover-protocol families, keyed by family id.
#[derive(Debug)]
pub struct ProtoRegistry {
    families: BTreeMap<u16, ProtoFamily>,
}

impl ProtoRegistry {
    /// Registry holding the built-in catalog.
    pub fn builtin() -> Self {
        Self::from_families(builtin_families())
    }

    pub fn from_families(families: Vec<ProtoFamily>) -> Self {
        Self {
            families: families.into_iter().map(|f| (f.family_id, f)).collect(),
        }
    }

    pub fn family(&self, family_id: u16) -> Option<&ProtoFamily> {
        self.families.get(&family_id)
    }

    /// All family ids, ascending.
    pub fn family_ids(&self) -> Vec<u16> {
        self.families.keys().copied().collect()
    }

    /// Stamp `frame` with the family's identity: `proto_id` and a freshly
    /// randomised extra header for the variant.
    pub fn apply<R: Rng>(
        &self,
        frame: &mut Frame,
        family_id: u16,
        variant_id: u8,
        rng: &mut R,
    ) -> Result<()> {
        let family = self
            .family(family_id)
            .ok_or(ProtocolError::UnknownFamily(family_id))?;
        let variant = family.variant(variant_id);
        frame.proto_id = family.family_id;
        frame.extra_header = family.pick_extra_header(variant, rng);
        Ok(())
    }

    /// Transform the frame payload for the wire. Unknown families pass
    /// through untouched.
    pub fn encode_payload<R: Rng>(
        &self,
        frame: &mut Frame,
        family_id: u16,
        variant_id: u8,
        rng: &mut R,
    ) {
        let Some(family) = self.family(family_id) else {
            return;
        };
        let variant = family.variant(variant_id);
        frame.payload = family.encode_payload(&frame.payload, variant, rng);
    }

    /// Invert the payload transform using the identity stamped on the frame.
    ///
    /// The variant is read from the first extra-header byte; unknown
    /// families pass through untouched.
    pub fn decode_payload(&self, frame: &mut Frame) {
        let Some(family) = self.family(frame.proto_id) else {
            return;
        };
        let variant_id = frame.extra_header.first().copied().unwrap_or(0);
        let variant = family.variant(variant_id);
        frame.payload = family.decode_payload(&frame.payload, variant);
    }

    /// Synthesise the family's handshake preamble for one path.
    ///
    /// Each returned frame carries a random payload of the catalog's size
    /// and the delay the caller must honor before sending the *next*
    /// handshake frame on that path.
    pub fn handshake_frames<R: Rng>(
        &self,
        session_id: u32,
        window_id: u32,
        family_id: u16,
        path_id: u8,
        variant_id: u8,
        rng: &mut R,
    ) -> Result<Vec<(Frame, Duration)>> {
        let family = self
            .family(family_id)
            .ok_or(ProtocolError::UnknownFamily(family_id))?;
        let variant = family.variant(variant_id);

        let mut frames = Vec::with_capacity(family.handshake.len());
        for (seq, spec) in family.handshake.iter().enumerate() {
            let mut payload = vec![0u8; spec.size];
            rng.fill(payload.as_mut_slice());
            let frame = Frame {
                session_id,
                seq: seq as u64,
                direction: spec.direction,
                path_id,
                window_id,
                proto_id: family.family_id,
                flags: FrameFlags::new(FrameFlags::HANDSHAKE),
                frag_id: 0,
                frag_total: 1,
                payload,
                extra_header: family.pick_extra_header(variant, rng),
            };
            frames.push((frame, spec.delay));
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Direction;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn data_frame(payload: &[u8]) -> Frame {
        Frame::fragment(7, 1, Direction::Up, 0, 0, 0, 1, payload.to_vec())
    }

    #[test]
    fn test_apply_stamps_identity() {
        let registry = ProtoRegistry::builtin();
        let mut rng = StdRng::seed_from_u64(1);
        let mut frame = data_frame(b"data");
        registry.apply(&mut frame, 2, 1, &mut rng).unwrap();
        assert_eq!(frame.proto_id, 2);
        assert_eq!(frame.extra_header[0], 1);
    }

    #[test]
    fn test_apply_unknown_family_errors() {
        let registry = ProtoRegistry::builtin();
        let mut rng = StdRng::seed_from_u64(1);
        let mut frame = data_frame(b"data");
        assert!(registry.apply(&mut frame, 99, 0, &mut rng).is_err());
    }

    #[test]
    fn test_encode_then_decode_via_stamped_identity() {
        let registry = ProtoRegistry::builtin();
        let mut rng = StdRng::seed_from_u64(2);
        for family_id in registry.family_ids() {
            for variant_id in 0..2u8 {
                let mut frame = data_frame(b"fingerprint me not");
                registry.apply(&mut frame, family_id, variant_id, &mut rng).unwrap();
                registry.encode_payload(&mut frame, family_id, variant_id, &mut rng);
                registry.decode_payload(&mut frame);
                assert_eq!(frame.payload, b"fingerprint me not");
            }
        }
    }

    #[test]
    fn test_decode_unknown_family_passes_through() {
        let registry = ProtoRegistry::builtin();
        let mut frame = data_frame(b"opaque");
        frame.proto_id = 42;
        registry.decode_payload(&mut frame);
        assert_eq!(frame.payload, b"opaque");
    }

    #[test]
    fn test_handshake_frames_follow_catalog() {
        let registry = ProtoRegistry::builtin();
        let mut rng = StdRng::seed_from_u64(3);
        let frames = registry.handshake_frames(9, 0, 1, 2, 0, &mut rng).unwrap();
        assert_eq!(frames.len(), 2);

        let (first, first_delay) = &frames[0];
        assert!(first.is_handshake());
        assert_eq!(first.seq, 0);
        assert_eq!(first.direction, Direction::Up);
        assert_eq!(first.payload.len(), 32);
        assert_eq!(first.frag_total, 1);
        assert_eq!(first.path_id, 2);
        assert_eq!(*first_delay, Duration::from_millis(5));

        let (second, second_delay) = &frames[1];
        assert_eq!(second.seq, 1);
        assert_eq!(second.direction, Direction::Down);
        assert_eq!(second.payload.len(), 24);
        assert_eq!(*second_delay, Duration::from_millis(10));
    }

    #[test]
    fn test_family_ids_sorted() {
        let registry = ProtoRegistry::builtin();
        assert_eq!(registry.family_ids(), vec![1, 2, 3]);
    }
}
