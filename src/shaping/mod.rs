//! Per-path traffic shaping.
//!
//! Each path carries a window-scoped shaping state: a sampled length
//! distribution over size bins, a padding budget tied to real bytes, a
//! burst counter that triggers synthetic cover bursts, and a token-bucket
//! pacer. All of it is re-parameterised by the strategy controller at every
//! window tick and zeroed by [`TrafficShaper::start_window`].

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::protocol::{Frame, FrameFlags};

/// Shaping knobs for one path, replaced each window.
#[derive(Debug, Clone)]
pub struct BehaviorParams {
    /// Candidate fragment lengths.
    pub size_bins: Vec<usize>,
    /// Sampling probabilities over `size_bins`, sum 1.
    pub q_dist: Vec<f64>,
    /// Padding budget per real byte, >= 0.
    pub padding_alpha: f64,
    /// Upper bound for the uniform per-frame jitter sleep.
    pub jitter_ms: u64,
    /// Token-bucket refill rate, > 0.
    pub rate_bytes_per_sec: u64,
    /// Real frames per padding burst, >= 1.
    pub burst_size: u32,
    /// Obfuscation level this parameterisation came from, 0..=3.
    pub obfuscation_level: u8,
    pub enable_shaping: bool,
    pub enable_padding: bool,
    pub enable_pacing: bool,
    pub enable_jitter: bool,
    /// When present, pins the base distribution that drift is applied to.
    pub fixed_q_dist: Option<Vec<f64>>,
}

impl BehaviorParams {
    /// Params with a uniform distribution over `size_bins` and all four
    /// shaping toggles on.
    pub fn uniform(
        size_bins: Vec<usize>,
        padding_alpha: f64,
        jitter_ms: u64,
        rate_bytes_per_sec: u64,
        burst_size: u32,
        obfuscation_level: u8,
    ) -> Self {
        let q = 1.0 / size_bins.len().max(1) as f64;
        Self {
            q_dist: vec![q; size_bins.len()],
            size_bins,
            padding_alpha,
            jitter_ms,
            rate_bytes_per_sec,
            burst_size,
            obfuscation_level,
            enable_shaping: true,
            enable_padding: true,
            enable_pacing: true,
            enable_jitter: true,
            fixed_q_dist: None,
        }
    }
}

/// Window-scoped shaping state of one path.
#[derive(Debug, Clone, Default)]
pub struct PathShapeState {
    pub window_id: u32,
    pub real_bytes: u64,
    pub padding_bytes: u64,
    pub padding_budget: u64,
    pub burst_count: u32,
    last_ts: Option<Instant>,
    tokens: f64,
}

impl PathShapeState {
    fn fresh(window_id: u32) -> Self {
        Self {
            window_id,
            ..Self::default()
        }
    }
}

/// The per-path shaping engine.
///
/// Path ids are dense small integers, so every table is a flat vector
/// indexed by `path_id`.
pub struct TrafficShaper {
    params: Vec<BehaviorParams>,
    states: Vec<PathShapeState>,
    q_dists: Vec<Vec<f64>>,
    rng: StdRng,
}

impl TrafficShaper {
    pub fn new(base: BehaviorParams, path_count: usize, seed: u64) -> Self {
        Self {
            states: (0..path_count).map(|_| PathShapeState::default()).collect(),
            q_dists: vec![base.q_dist.clone(); path_count],
            params: vec![base; path_count],
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn path_count(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self, path_id: u8) -> &BehaviorParams {
        &self.params[path_id as usize]
    }

    pub fn state(&self, path_id: u8) -> &PathShapeState {
        &self.states[path_id as usize]
    }

    /// Replace the shaping knobs of one path for the coming window.
    pub fn set_params(&mut self, path_id: u8, params: BehaviorParams) {
        self.params[path_id as usize] = params;
    }

    /// Replace every per-path state with a fresh zeroed instance tagged
    /// with the new window id.
    pub fn start_window(&mut self, window_id: u32) {
        for state in &mut self.states {
            *state = PathShapeState::fresh(window_id);
        }
    }

    /// Drift the path's length distribution around its base.
    ///
    /// Base is `fixed_q_dist` when pinned, otherwise the params'
    /// distribution. Each probability gets uniform noise in `±drift`,
    /// floored at 0.01, then the vector is renormalised. The drift RNG is
    /// seeded so a given `(seed, drift)` is reproducible.
    pub fn update_q_dist(&mut self, path_id: u8, drift: f64, seed: u64) {
        let params = &self.params[path_id as usize];
        let base = params.fixed_q_dist.as_ref().unwrap_or(&params.q_dist);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut jittered: Vec<f64> = base
            .iter()
            .map(|p| (p + rng.gen_range(-drift..=drift)).max(0.01))
            .collect();
        let total: f64 = jittered.iter().sum();
        if total > 0.0 {
            for p in &mut jittered {
                *p /= total;
            }
        }
        self.q_dists[path_id as usize] = jittered;
    }

    /// Draw a target fragment length from the path's distribution.
    pub fn sample_target_len(&mut self, path_id: u8) -> usize {
        let params = &self.params[path_id as usize];
        let probs = &self.q_dists[path_id as usize];
        let total: f64 = probs.iter().sum();
        let mut draw = self.rng.gen::<f64>() * total;
        for (bin, p) in params.size_bins.iter().zip(probs) {
            draw -= p;
            if draw <= 0.0 {
                return *bin;
            }
        }
        *params.size_bins.last().unwrap_or(&1)
    }

    /// Account real bytes and refresh the padding budget.
    pub fn note_real_bytes(&mut self, path_id: u8, n: usize) {
        let alpha = self.params[path_id as usize].padding_alpha;
        let state = &mut self.states[path_id as usize];
        state.real_bytes += n as u64;
        state.padding_budget = (state.real_bytes as f64 * alpha).floor() as u64;
    }

    /// Count one real frame towards the burst; true when the burst fires.
    pub fn update_burst(&mut self, path_id: u8) -> bool {
        let burst_size = self.params[path_id as usize].burst_size;
        let state = &mut self.states[path_id as usize];
        state.burst_count += 1;
        if state.burst_count >= burst_size {
            state.burst_count = 0;
            true
        } else {
            false
        }
    }

    /// Token-bucket pacing: how long the caller must sleep before putting
    /// `n` bytes on the wire, if at all.
    ///
    /// Tokens refill at `rate_bytes_per_sec` since the previous call and the
    /// bucket is uncapped upward. A shortfall resets the bucket to zero and
    /// charges the full deficit as sleep time.
    pub fn pace_delay(&mut self, path_id: u8, n: usize) -> Option<Duration> {
        let params = &self.params[path_id as usize];
        if !params.enable_pacing {
            return None;
        }
        let rate = params.rate_bytes_per_sec as f64;
        let state = &mut self.states[path_id as usize];

        let now = Instant::now();
        let elapsed = state
            .last_ts
            .map_or(0.0, |t| now.duration_since(t).as_secs_f64());
        state.last_ts = Some(now);
        state.tokens += elapsed * rate;

        let need = n as f64;
        if state.tokens < need {
            let wait = (need - state.tokens) / rate.max(1.0);
            state.tokens = 0.0;
            Some(Duration::from_secs_f64(wait))
        } else {
            state.tokens -= need;
            None
        }
    }

    /// Uniform jitter sleep in `[0, jitter_ms)`, when enabled.
    pub fn jitter_delay(&mut self, path_id: u8) -> Option<Duration> {
        let params = &self.params[path_id as usize];
        if !params.enable_jitter || params.jitter_ms == 0 {
            return None;
        }
        let ms = self.rng.gen::<f64>() * params.jitter_ms as f64;
        Some(Duration::from_secs_f64(ms / 1000.0))
    }

    /// Synthesise padding frames against the path's remaining budget.
    ///
    /// Each frame copies the template's routing fields and extra header,
    /// adds the PADDING flag, and carries random bytes of a sampled length
    /// clipped to the remaining budget. Empty when padding is disabled or
    /// the budget is spent.
    pub fn make_padding_frames(&mut self, template: &Frame, max_frames: usize) -> Vec<Frame> {
        let path_id = template.path_id;
        let idx = path_id as usize;
        if !self.params[idx].enable_padding {
            return Vec::new();
        }
        let state = &self.states[idx];
        if state.padding_bytes >= state.padding_budget {
            return Vec::new();
        }

        let mut remaining = state.padding_budget - state.padding_bytes;
        let mut frames = Vec::new();
        for _ in 0..max_frames {
            if remaining == 0 {
                break;
            }
            let size = (self.sample_target_len(path_id) as u64).min(remaining) as usize;
            let mut payload = vec![0u8; size];
            self.rng.fill(payload.as_mut_slice());

            frames.push(Frame {
                session_id: template.session_id,
                seq: template.seq,
                direction: template.direction,
                path_id,
                window_id: template.window_id,
                proto_id: template.proto_id,
                flags: template.flags.with(FrameFlags::PADDING),
                frag_id: 0,
                frag_total: 1,
                payload,
                extra_header: template.extra_header.clone(),
            });

            remaining -= size as u64;
            self.states[idx].padding_bytes += size as u64;
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Direction;

    fn base_params() -> BehaviorParams {
        BehaviorParams::uniform(vec![300, 600, 900, 1200], 0.5, 20, 50_000, 3, 2)
    }

    fn shaper() -> TrafficShaper {
        TrafficShaper::new(base_params(), 2, 42)
    }

    fn template() -> Frame {
        Frame::fragment(1, 5, Direction::Up, 0, 3, 0, 1, vec![1, 2, 3])
    }

    #[test]
    fn test_sample_draws_from_bins() {
        let mut s = shaper();
        for _ in 0..200 {
            let len = s.sample_target_len(0);
            assert!([300, 600, 900, 1200].contains(&len));
        }
    }

    #[test]
    fn test_padding_budget_tracks_real_bytes() {
        let mut s = shaper();
        s.start_window(1);
        s.note_real_bytes(0, 1000);
        assert_eq!(s.state(0).real_bytes, 1000);
        assert_eq!(s.state(0).padding_budget, 500); // floor(1000 * 0.5)
        s.note_real_bytes(0, 3);
        assert_eq!(s.state(0).padding_budget, 501); // floor(1003 * 0.5)
    }

    #[test]
    fn test_padding_never_exceeds_budget() {
        let mut s = shaper();
        s.start_window(1);
        s.note_real_bytes(0, 2000);
        let budget = s.state(0).padding_budget;
        for _ in 0..10 {
            let frames = s.make_padding_frames(&template(), 3);
            for frame in &frames {
                assert!(frame.is_padding());
                assert_eq!(frame.frag_total, 1);
            }
        }
        assert!(s.state(0).padding_bytes <= budget);
        // Budget spent: further calls return nothing.
        assert!(s.make_padding_frames(&template(), 3).is_empty() || s.state(0).padding_bytes < budget);
    }

    #[test]
    fn test_padding_disabled_returns_empty() {
        let mut s = shaper();
        let mut params = base_params();
        params.enable_padding = false;
        s.set_params(0, params);
        s.note_real_bytes(0, 10_000);
        assert!(s.make_padding_frames(&template(), 3).is_empty());
    }

    #[test]
    fn test_burst_fires_at_burst_size() {
        let mut s = shaper();
        assert!(!s.update_burst(0));
        assert!(!s.update_burst(0));
        assert!(s.update_burst(0)); // burst_size = 3
        assert_eq!(s.state(0).burst_count, 0);
        assert!(!s.update_burst(0));
    }

    #[test]
    fn test_pace_first_call_charges_full_size() {
        let mut s = shaper();
        // First call: empty bucket, must wait n / rate.
        let wait = s.pace_delay(0, 5000).expect("empty bucket forces a wait");
        let expect = 5000.0 / 50_000.0;
        assert!((wait.as_secs_f64() - expect).abs() < 0.01);
    }

    #[test]
    fn test_pace_disabled_returns_immediately() {
        let mut s = shaper();
        let mut params = base_params();
        params.enable_pacing = false;
        s.set_params(0, params);
        assert!(s.pace_delay(0, 1_000_000).is_none());
    }

    #[test]
    fn test_pace_consumes_accumulated_tokens() {
        let mut s = shaper();
        // Charge the bucket by sleeping through the first deficit.
        let _ = s.pace_delay(0, 100);
        std::thread::sleep(Duration::from_millis(50));
        // ~2500 tokens accrued at 50 kB/s; 100 bytes fit without a wait.
        assert!(s.pace_delay(0, 100).is_none());
    }

    #[test]
    fn test_jitter_bounded_and_gated() {
        let mut s = shaper();
        for _ in 0..100 {
            let d = s.jitter_delay(0).unwrap();
            assert!(d < Duration::from_millis(20));
        }
        let mut params = base_params();
        params.enable_jitter = false;
        s.set_params(0, params);
        assert!(s.jitter_delay(0).is_none());
    }

    #[test]
    fn test_update_q_dist_normalised_and_floored() {
        let mut s = shaper();
        s.update_q_dist(0, 0.3, 77);
        let dist = &s.q_dists[0];
        let sum: f64 = dist.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(dist.iter().all(|p| *p > 0.0));
    }

    #[test]
    fn test_update_q_dist_seeded_reproducible() {
        let mut a = shaper();
        let mut b = shaper();
        a.update_q_dist(1, 0.05, 1234);
        b.update_q_dist(1, 0.05, 1234);
        assert_eq!(a.q_dists[1], b.q_dists[1]);
    }

    #[test]
    fn test_fixed_q_dist_pins_base() {
        let mut s = shaper();
        let mut params = base_params();
        params.fixed_q_dist = Some(vec![1.0, 0.0, 0.0, 0.0]);
        s.set_params(0, params);
        // Zero drift: the drifted distribution equals the pinned base after
        // flooring and renormalisation.
        s.update_q_dist(0, 0.0, 9);
        let dist = &s.q_dists[0];
        assert!(dist[0] > 0.9);
    }

    #[test]
    fn test_start_window_resets_state() {
        let mut s = shaper();
        s.note_real_bytes(0, 500);
        s.update_burst(0);
        s.start_window(7);
        let state = s.state(0);
        assert_eq!(state.window_id, 7);
        assert_eq!(state.real_bytes, 0);
        assert_eq!(state.padding_bytes, 0);
        assert_eq!(state.padding_budget, 0);
        assert_eq!(state.burst_count, 0);
    }
}
