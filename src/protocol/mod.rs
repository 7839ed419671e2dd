//! Framed tunnel protocol.
//!
//! Defines the frame format, stream codec, and fragment reassembly.
//!
//! ## Frame Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │ session_id (4) │ seq (8) │ dir (1) │ path_id (1)    │
//! ├─────────────────────────────────────────────────────┤
//! │ window_id (4) │ proto_id (2) │ extra_len (1)        │
//! ├─────────────────────────────────────────────────────┤
//! │ frag_id (2) │ frag_total (2) │ payload_len (4)      │
//! ├─────────────────────────────────────────────────────┤
//! │ extra_header (variable) │ flags (1)                 │
//! ├─────────────────────────────────────────────────────┤
//! │ payload (variable)                                  │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are network byte order. The flags byte deliberately trails
//! the variable extra header so that header-shape randomisation moves it
//! around on the wire.

pub mod codec;
pub mod frame;
pub mod reassembly;

pub use codec::{read_frame, FrameCodec};
pub use frame::{Direction, Frame, FrameFlags};
pub use reassembly::FragmentBuffer;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 29;

/// Sanity cap on a single frame's payload; anything larger is treated as a
/// malformed frame rather than an allocation request.
pub const MAX_PAYLOAD_SIZE: usize = 1 << 20;
