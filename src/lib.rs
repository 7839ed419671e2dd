//! # Veles
//!
//! Traffic-obfuscating multipath relay.
//!
//! Veles tunnels a bidirectional TCP application stream through a chain of
//! hops — an entry node, several parallel middle relays, and an exit node —
//! while reshaping the observable traffic on every hop so a passive attacker
//! watching a single middle link cannot reliably fingerprint the underlying
//! application.
//!
//! ## Architecture
//!
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Application Stream                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │     Tunnel Endpoints (fragment / disperse / reassemble)      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Strategy Controller (per-window weights, shaping, covers)   │
//! ├───────────────┬───────────────────────┬──────────────────────┤
//! │ Shaping Engine│  Multipath Scheduler  │  Cover Protocol      │
//! │ (len, pacing, │  (weighted, batched,  │  Registry (families, │
//! │  padding)     │   RTT/loss telemetry) │  variants, handshake)│
//! ├───────────────┴───────────────────────┴──────────────────────┤
//! │              Framed Tunnel Protocol over TCP                 │
//! └──────────────────────────────────────────────────────────────┘
//!
//! Once per observation window the strategy controller reads per-path
//! RTT/loss/timeout telemetry and re-parameterises the three subsystems
//! above; an observation recorder keeps a structured per-window ledger of
//! what was decided and what was seen.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)] // Intentional narrowing in shaping math
#![allow(clippy::cast_precision_loss)] // Acceptable for telemetry averages
#![allow(clippy::cast_sign_loss)] // Rates and budgets are non-negative
#![allow(clippy::struct_excessive_bools)] // Behavior toggles are boolean knobs

pub mod config;
pub mod cover;
pub mod error;
pub mod multipath;
pub mod node;
pub mod observe;
pub mod protocol;
pub mod shaping;
pub mod strategy;

pub use config::Config;
pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::cover::ProtoRegistry;
    pub use crate::error::{Error, Result};
    pub use crate::multipath::{MultipathScheduler, PathMetrics};
    pub use crate::node::{EntryNode, ExitNode};
    pub use crate::observe::{RunContext, WindowRecord};
    pub use crate::protocol::{Direction, Frame, FrameFlags};
    pub use crate::shaping::{BehaviorParams, TrafficShaper};
    pub use crate::strategy::{StrategyEngine, StrategyOutput};
}
