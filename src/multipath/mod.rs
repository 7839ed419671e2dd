//! Multipath scheduling and per-path telemetry.
//!
//! Weighted random path selection with batching: a chosen path is reused
//! for `batch_size` consecutive picks before a new weighted draw, which
//! keeps fragments of one sequence together and reduces reordering at the
//! reassembler. Each path accumulates sent/acked counters, a smoothed RTT,
//! and an in-flight table that feeds timeout events to the strategy
//! controller at every window tick.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::error::{Error, Result};

/// Smallest weight a path can be assigned.
pub const WEIGHT_FLOOR: f64 = 0.1;

/// RTT smoothing: `rtt ← OLD_WEIGHT·rtt + SAMPLE_WEIGHT·sample`.
const RTT_OLD_WEIGHT: f64 = 0.7;
const RTT_SAMPLE_WEIGHT: f64 = 0.3;

/// Cumulative telemetry of one path.
#[derive(Debug, Default)]
pub struct PathStats {
    pub sent: u64,
    pub acked: u64,
    /// Exponentially smoothed round-trip time in milliseconds.
    pub rtt_ms: f64,
    in_flight: HashMap<u64, Instant>,
}

impl PathStats {
    /// Loss estimate: `max(0, 1 − acked/sent)`, zero before anything was
    /// sent.
    pub fn loss(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            (1.0 - self.acked as f64 / self.sent as f64).max(0.0)
        }
    }

    /// Number of sequences awaiting acknowledgment.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// One path's telemetry snapshot handed to the strategy controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PathMetrics {
    pub rtt_ms: f64,
    pub loss: f64,
}

/// Weighted, batched path selector with telemetry.
pub struct MultipathScheduler {
    weights: Vec<f64>,
    stats: Vec<PathStats>,
    batch_size: u32,
    batch_remaining: u32,
    current_path: u8,
    rng: StdRng,
}

impl MultipathScheduler {
    pub fn new(path_count: usize, batch_size: u32, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let current_path = rng.gen_range(0..path_count.max(1)) as u8;
        Self {
            weights: vec![1.0; path_count],
            stats: (0..path_count).map(|_| PathStats::default()).collect(),
            batch_size: batch_size.max(1),
            batch_remaining: 0,
            current_path,
            rng,
        }
    }

    pub fn path_count(&self) -> usize {
        self.weights.len()
    }

    pub fn stats(&self, path_id: u8) -> &PathStats {
        &self.stats[path_id as usize]
    }

    pub fn weight(&self, path_id: u8) -> f64 {
        self.weights[path_id as usize]
    }

    /// Replace path weights, clamping each to the floor.
    pub fn update_weights(&mut self, weights: &[f64]) {
        for (slot, w) in self.weights.iter_mut().zip(weights) {
            *slot = w.max(WEIGHT_FLOOR);
        }
    }

    /// Pick the path for the next frame.
    ///
    /// The current path is reused until the batch is exhausted, then a new
    /// weighted draw is made.
    pub fn choose_path(&mut self) -> u8 {
        if self.batch_remaining == 0 {
            self.current_path = self.weighted_draw(None);
            self.batch_remaining = self.batch_size;
        }
        self.batch_remaining -= 1;
        self.current_path
    }

    /// Pick a path restricted to `allowed` (paths with a live writer).
    ///
    /// The batch carries over only while the current path stays allowed.
    pub fn choose_path_from(&mut self, allowed: &[u8]) -> Result<u8> {
        let allowed: Vec<u8> = allowed
            .iter()
            .copied()
            .filter(|p| (*p as usize) < self.weights.len())
            .collect();
        if allowed.is_empty() {
            return Err(Error::NoAvailablePaths);
        }
        if self.batch_remaining == 0 || !allowed.contains(&self.current_path) {
            self.current_path = self.weighted_draw(Some(&allowed));
            self.batch_remaining = self.batch_size;
        }
        self.batch_remaining -= 1;
        Ok(self.current_path)
    }

    fn weighted_draw(&mut self, allowed: Option<&[u8]>) -> u8 {
        let candidates: Vec<u8> = match allowed {
            Some(list) => list.to_vec(),
            None => (0..self.weights.len() as u8).collect(),
        };
        let total: f64 = candidates
            .iter()
            .map(|p| self.weights[*p as usize])
            .sum();
        let mut draw = self.rng.gen::<f64>() * total;
        for p in &candidates {
            draw -= self.weights[*p as usize];
            if draw <= 0.0 {
                return *p;
            }
        }
        *candidates.last().expect("candidates verified non-empty")
    }

    /// Record a data frame put on the wire.
    ///
    /// `sent` counts every frame; the in-flight timestamp is keyed by
    /// sequence, so fragments of one sequence share a single entry.
    pub fn mark_sent(&mut self, path_id: u8, seq: u64) {
        let stats = &mut self.stats[path_id as usize];
        stats.sent += 1;
        stats.in_flight.insert(seq, Instant::now());
    }

    /// Record an acknowledgment.
    ///
    /// Smoothed RTT is updated only when the sequence still had an
    /// in-flight timestamp (the first matching ACK).
    pub fn mark_ack(&mut self, path_id: u8, seq: u64) {
        let Some(stats) = self.stats.get_mut(path_id as usize) else {
            return;
        };
        stats.acked += 1;
        if let Some(sent_at) = stats.in_flight.remove(&seq) {
            let sample = sent_at.elapsed().as_secs_f64() * 1000.0;
            stats.rtt_ms = stats.rtt_ms * RTT_OLD_WEIGHT + sample * RTT_SAMPLE_WEIGHT;
        }
    }

    /// Drop in-flight entries older than `ack_timeout` and count them as
    /// timeout events for the controller.
    pub fn expire_timeouts(&mut self, ack_timeout: Duration) -> u32 {
        let now = Instant::now();
        let mut expired = 0;
        for stats in &mut self.stats {
            let before = stats.in_flight.len();
            stats
                .in_flight
                .retain(|_, sent_at| now.duration_since(*sent_at) <= ack_timeout);
            expired += (before - stats.in_flight.len()) as u32;
        }
        expired
    }

    /// Per-path `{rtt_ms, loss}` for the strategy controller.
    pub fn snapshot(&self) -> Vec<PathMetrics> {
        self.stats
            .iter()
            .map(|s| PathMetrics {
                rtt_ms: s.rtt_ms,
                loss: s.loss(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_clamped_to_floor() {
        let mut sched = MultipathScheduler::new(3, 4, 1);
        sched.update_weights(&[0.0, 0.05, 2.0]);
        assert_eq!(sched.weight(0), WEIGHT_FLOOR);
        assert_eq!(sched.weight(1), WEIGHT_FLOOR);
        assert_eq!(sched.weight(2), 2.0);
    }

    #[test]
    fn test_batching_reuses_path() {
        let mut sched = MultipathScheduler::new(4, 5, 7);
        let first = sched.choose_path();
        for _ in 0..4 {
            assert_eq!(sched.choose_path(), first);
        }
        // Sixth pick starts a new batch (possibly the same path by chance,
        // so only the batch counter is asserted).
        let _ = sched.choose_path();
        assert_eq!(sched.batch_remaining, 4);
    }

    #[test]
    fn test_choose_path_from_respects_allowed() {
        let mut sched = MultipathScheduler::new(4, 2, 3);
        for _ in 0..50 {
            let p = sched.choose_path_from(&[1, 3]).unwrap();
            assert!(p == 1 || p == 3);
        }
    }

    #[test]
    fn test_choose_path_from_abandons_dead_batch() {
        let mut sched = MultipathScheduler::new(2, 10, 3);
        let first = sched.choose_path_from(&[0, 1]).unwrap();
        let other = 1 - first;
        // Mid-batch the current path disappears from the allowed set.
        assert_eq!(sched.choose_path_from(&[other]).unwrap(), other);
    }

    #[test]
    fn test_choose_path_from_empty_errors() {
        let mut sched = MultipathScheduler::new(2, 2, 3);
        assert!(sched.choose_path_from(&[]).is_err());
    }

    #[test]
    fn test_loss_zero_when_nothing_sent() {
        let sched = MultipathScheduler::new(2, 2, 3);
        let snap = sched.snapshot();
        assert_eq!(snap[0].loss, 0.0);
        assert_eq!(snap[1].loss, 0.0);
    }

    #[test]
    fn test_loss_formula_bounds() {
        let mut sched = MultipathScheduler::new(1, 2, 3);
        for seq in 0..10 {
            sched.mark_sent(0, seq);
        }
        for seq in 0..4 {
            sched.mark_ack(0, seq);
        }
        let loss = sched.snapshot()[0].loss;
        assert!((loss - 0.6).abs() < 1e-9);
        // Over-acking clamps at zero rather than going negative.
        for seq in 0..20 {
            sched.mark_ack(0, seq);
        }
        assert_eq!(sched.snapshot()[0].loss, 0.0);
    }

    #[test]
    fn test_rtt_smoothing_only_on_matched_ack() {
        let mut sched = MultipathScheduler::new(1, 2, 3);
        sched.mark_sent(0, 1);
        sched.mark_ack(0, 1);
        let rtt_after_match = sched.stats(0).rtt_ms;
        // A duplicate ACK for the same seq has no timestamp to match.
        sched.mark_ack(0, 1);
        assert_eq!(sched.stats(0).rtt_ms, rtt_after_match);
        assert_eq!(sched.stats(0).acked, 2);
    }

    #[test]
    fn test_expire_timeouts_counts_and_clears() {
        let mut sched = MultipathScheduler::new(2, 2, 3);
        sched.mark_sent(0, 1);
        sched.mark_sent(1, 2);
        // Everything is younger than a generous timeout.
        assert_eq!(sched.expire_timeouts(Duration::from_secs(60)), 0);
        // A zero timeout expires both entries.
        assert_eq!(sched.expire_timeouts(Duration::ZERO), 2);
        assert_eq!(sched.stats(0).in_flight(), 0);
        assert_eq!(sched.stats(1).in_flight(), 0);
    }

    #[test]
    fn test_seeded_scheduler_reproducible() {
        let mut a = MultipathScheduler::new(3, 2, 99);
        let mut b = MultipathScheduler::new(3, 2, 99);
        let picks_a: Vec<u8> = (0..20).map(|_| a.choose_path()).collect();
        let picks_b: Vec<u8> = (0..20).map(|_| b.choose_path()).collect();
        assert_eq!(picks_a, picks_b);
    }

    #[test]
    fn test_heavily_weighted_path_dominates() {
        let mut sched = MultipathScheduler::new(2, 1, 5);
        sched.update_weights(&[10.0, 0.1]);
        let picks = (0..200).filter(|_| sched.choose_path() == 0).count();
        assert!(picks > 150, "path 0 picked only {picks}/200 times");
    }
}
