//! Tunnel endpoints.
//!
//! The entry node fragments one client's byte stream across the configured
//! middle paths; the exit node reassembles, serves the upstream target, and
//! mirrors the shaping pipeline on the way back. Both share the session
//! core below: the scheduler, shaper, and strategy engine plus the window
//! clock that re-parameterises them.

pub mod entry;
pub mod exit;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::Config;
use crate::error::Result;
use crate::multipath::MultipathScheduler;
use crate::observe::WindowRecord;
use crate::protocol::Frame;
use crate::shaping::TrafficShaper;
use crate::strategy::{drift_for_level, StrategyEngine};

pub use entry::EntryNode;
pub use exit::ExitNode;

/// Padding frames emitted per burst trigger.
pub(crate) const MAX_PADDING_FRAMES: usize = 3;

/// Upstream read chunk size at the entry.
pub(crate) const CLIENT_CHUNK: usize = 2048;

/// Per-session state shared by the endpoint's tasks.
///
/// Guarded by a sync mutex that is never held across an await; sleeps are
/// computed inside the lock and slept outside it.
pub(crate) struct SessionCore {
    pub session_id: u32,
    pub window_id: u32,
    pub next_seq: u64,
    pub timeout_events: u32,
    pub scheduler: MultipathScheduler,
    pub shaper: TrafficShaper,
    pub strategy: StrategyEngine,
    pub family_by_path: Vec<u16>,
    pub variant_by_path: Vec<u8>,
    /// Cover-identity randomness (extra headers, XOR keys, handshakes).
    pub rng: StdRng,
}

impl SessionCore {
    pub fn new(config: &Config, path_count: usize, session_id: u32, seed: u64, family_ids: Vec<u16>) -> Self {
        Self {
            session_id,
            window_id: 0,
            next_seq: 0,
            timeout_events: 0,
            scheduler: MultipathScheduler::new(path_count, config.batch_size, seed),
            shaper: TrafficShaper::new(config.base_behavior(), path_count, seed.wrapping_add(1)),
            strategy: StrategyEngine::new(config.strategy_config(family_ids, seed)),
            family_by_path: vec![1; path_count],
            variant_by_path: vec![0; path_count],
            rng: StdRng::seed_from_u64(seed.wrapping_add(2)),
        }
    }

    pub fn path_count(&self) -> usize {
        self.family_by_path.len()
    }

    /// Advance the window clock one tick.
    ///
    /// Expires stale in-flight entries into the timeout counter, runs the
    /// strategy engine on the telemetry snapshot, pushes the verdict into
    /// the scheduler and shaper, and returns one observation record per
    /// path for the window that just closed. Per-path byte counters are
    /// captured before the shaping state is zeroed.
    pub fn window_tick(&mut self, ack_timeout: Duration) -> Vec<WindowRecord> {
        self.timeout_events += self.scheduler.expire_timeouts(ack_timeout);
        self.window_id += 1;

        let metrics = self.scheduler.snapshot();
        let output = self
            .strategy
            .evaluate(&metrics, self.timeout_events, self.window_id);

        self.scheduler.update_weights(&output.weights);
        self.family_by_path.clone_from(&output.family_by_path);
        self.variant_by_path.clone_from(&output.variant_by_path);

        let path_count = self.path_count();
        let counters: Vec<(u64, u64)> = (0..path_count)
            .map(|p| {
                let state = self.shaper.state(p as u8);
                (state.padding_bytes, state.real_bytes)
            })
            .collect();

        let drift = drift_for_level(output.obfuscation_level);
        for path_id in 0..path_count {
            self.shaper
                .set_params(path_id as u8, output.behavior_by_path[path_id].clone());
            if output.adaptive_flags.adaptive_behavior {
                let seed = u64::from(self.window_id) * 100 + path_id as u64;
                self.shaper.update_q_dist(path_id as u8, drift, seed);
            }
        }
        self.shaper.start_window(self.window_id);
        self.timeout_events = 0;

        (0..path_count)
            .map(|path_id| {
                let behavior = &output.behavior_by_path[path_id];
                let (padding_bytes, real_bytes) = counters[path_id];
                WindowRecord {
                    window_id: self.window_id,
                    path_id: path_id as u8,
                    obfuscation_level: output.obfuscation_level,
                    alpha_padding: behavior.padding_alpha,
                    rate_bytes_per_sec: behavior.rate_bytes_per_sec,
                    jitter_ms: behavior.jitter_ms,
                    proto_family: output.family_by_path[path_id],
                    proto_variant: output.variant_by_path[path_id],
                    padding_bytes,
                    real_bytes,
                    rtt_ms: metrics[path_id].rtt_ms,
                    loss: metrics[path_id].loss,
                    trigger: output.trigger,
                    action: output.action,
                    adaptive_flags: output.adaptive_flags,
                }
            })
            .collect()
    }
}

/// Shared handle to one path socket's write half.
pub(crate) type SharedWriter = Arc<AsyncMutex<OwnedWriteHalf>>;

/// Write one frame as a single contiguous buffer.
///
/// The per-writer lock keeps concurrent writers from interleaving frame
/// bytes on the stream.
pub(crate) async fn write_frame(writer: &SharedWriter, frame: &Frame) -> Result<()> {
    let buf = frame.encode();
    let mut guard = writer.lock().await;
    guard.write_all(&buf).await?;
    Ok(())
}

/// Exit-side table mapping `path_id` to the middle connection that first
/// presented it.
///
/// One middle connection is bound to one path id for the lifetime of the
/// session; later claims from other connections are ignored so ACKs cannot
/// race onto a hijacked writer.
#[derive(Default)]
pub(crate) struct PathWriters {
    map: RwLock<HashMap<u8, SharedWriter>>,
}

impl PathWriters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a writer to a path. Returns true when this call created the
    /// binding (first claim wins).
    pub fn bind(&self, path_id: u8, writer: &SharedWriter) -> bool {
        let mut map = self.map.write();
        if map.contains_key(&path_id) {
            return false;
        }
        map.insert(path_id, Arc::clone(writer));
        true
    }

    pub fn get(&self, path_id: u8) -> Option<SharedWriter> {
        self.map.read().get(&path_id).cloned()
    }

    /// Paths with a live writer, ascending.
    pub fn live(&self) -> Vec<u8> {
        let mut paths: Vec<u8> = self.map.read().keys().copied().collect();
        paths.sort_unstable();
        paths
    }

    /// Remove a binding, but only if it still points at `writer`.
    pub fn unbind(&self, path_id: u8, writer: &SharedWriter) {
        let mut map = self.map.write();
        if map.get(&path_id).is_some_and(|w| Arc::ptr_eq(w, writer)) {
            map.remove(&path_id);
        }
    }

    /// Drop a path regardless of who owns it.
    pub fn remove(&self, path_id: u8) {
        self.map.write().remove(&path_id);
    }
}

/// Downstream reorder buffer: delivers payloads strictly in ascending
/// sequence order, closing gaps as they arrive.
#[derive(Debug, Default)]
pub(crate) struct ReorderBuffer {
    next_seq: u64,
    pending: HashMap<u64, Vec<u8>>,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a completed payload; returns everything now deliverable, in
    /// order.
    pub fn push(&mut self, seq: u64, payload: Vec<u8>) -> Vec<Vec<u8>> {
        self.pending.insert(seq, payload);
        let mut ready = Vec::new();
        while let Some(payload) = self.pending.remove(&self.next_seq) {
            ready.push(payload);
            self.next_seq += 1;
        }
        ready
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::RotationTrigger;

    #[test]
    fn test_reorder_in_order_delivery() {
        let mut buf = ReorderBuffer::new();
        assert_eq!(buf.push(0, b"a".to_vec()), vec![b"a".to_vec()]);
        assert_eq!(buf.push(1, b"b".to_vec()), vec![b"b".to_vec()]);
    }

    #[test]
    fn test_reorder_holds_gaps() {
        let mut buf = ReorderBuffer::new();
        assert!(buf.push(2, b"c".to_vec()).is_empty());
        assert!(buf.push(1, b"b".to_vec()).is_empty());
        assert_eq!(buf.pending_len(), 2);
        let ready = buf.push(0, b"a".to_vec());
        assert_eq!(ready, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_reorder_any_arrival_order() {
        let orders: [[u64; 4]; 3] = [[3, 1, 0, 2], [0, 2, 1, 3], [3, 2, 1, 0]];
        for order in orders {
            let mut buf = ReorderBuffer::new();
            let mut delivered = Vec::new();
            for seq in order {
                delivered.extend(buf.push(seq, vec![seq as u8]));
            }
            assert_eq!(delivered, vec![vec![0], vec![1], vec![2], vec![3]]);
        }
    }

    #[test]
    fn test_window_tick_produces_records_and_resets() {
        let config = Config::default();
        let mut core = SessionCore::new(&config, 2, 7, 42, vec![1, 2, 3]);
        core.shaper.note_real_bytes(0, 4096);

        let records = core.window_tick(Duration::from_secs(2));
        assert_eq!(records.len(), 2);
        assert_eq!(core.window_id, 1);
        assert_eq!(records[0].window_id, 1);
        // The record reports the closed window's counters...
        assert_eq!(records[0].real_bytes, 4096);
        // ...while the live state starts the new window from zero.
        assert_eq!(core.shaper.state(0).real_bytes, 0);
        assert_eq!(records[0].loss, 0.0);
    }

    #[test]
    fn test_window_tick_counts_timeouts_into_trigger() {
        let config = Config::default();
        let mut core = SessionCore::new(&config, 1, 7, 42, vec![1, 2, 3]);
        for seq in 0..3 {
            core.scheduler.mark_sent(0, seq);
        }
        // All three in-flight entries are expired by a zero timeout and
        // must fire the timeout rotation.
        let records = core.window_tick(Duration::ZERO);
        assert_eq!(records[0].trigger, RotationTrigger::Timeout);
        // The counter resets for the next window.
        assert_eq!(core.timeout_events, 0);
    }

    #[test]
    fn test_session_core_deterministic_for_seed() {
        let config = Config::default();
        let mut a = SessionCore::new(&config, 2, 7, 9, vec![1, 2, 3]);
        let mut b = SessionCore::new(&config, 2, 7, 9, vec![1, 2, 3]);
        let ra = a.window_tick(Duration::from_secs(2));
        let rb = b.window_tick(Duration::from_secs(2));
        assert_eq!(ra[0].proto_family, rb[0].proto_family);
        assert_eq!(ra[0].rate_bytes_per_sec, rb[0].rate_bytes_per_sec);
        assert_eq!(a.scheduler.weight(0), b.scheduler.weight(0));
    }
}
