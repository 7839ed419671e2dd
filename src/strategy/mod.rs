//! Windowed strategy control.
//!
//! Once per observation window the engine reads the scheduler's per-path
//! `{rtt_ms, loss}` snapshot plus the accumulated timeout events and
//! produces the next window's parameterisation: path weights, shaping
//! knobs, and the cover family/variant assignment per path. The engine is
//! deterministic — with its two internal rotation counters fixed,
//! `evaluate` is a pure function of `(metrics, timeout_events, window_id)`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::multipath::PathMetrics;
use crate::shaping::BehaviorParams;

/// Experiment mode of the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Full adaptive operation.
    #[default]
    Normal,
    /// Delay-only baseline: pacing and jitter without shaping or padding.
    BaselineDelay,
    /// Padding-only baseline: shaping and padding without pacing or jitter.
    BaselinePadding,
}

impl Mode {
    pub fn is_baseline(self) -> bool {
        !matches!(self, Self::Normal)
    }
}

impl std::str::FromStr for Mode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "baseline_delay" => Ok(Self::BaselineDelay),
            "baseline_padding" => Ok(Self::BaselinePadding),
            other => Err(crate::Error::Config(format!("unknown mode: {other}"))),
        }
    }
}

/// Cause of a rotation in a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationTrigger {
    None,
    Periodic,
    Timeout,
}

/// Dominant controller action of a window, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyAction {
    Static,
    SwitchProto,
    UpdateWeights,
    UpdateBehavior,
}

/// The three independent adaptivity toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptiveFlags {
    pub adaptive_paths: bool,
    pub adaptive_behavior: bool,
    pub adaptive_proto: bool,
}

/// Static configuration of the strategy engine.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub size_bins: Vec<usize>,
    pub base_padding: f64,
    pub base_jitter: u64,
    pub base_rate: u64,
    pub family_ids: Vec<u16>,
    pub obfuscation_level: u8,
    pub mode: Mode,
    pub proto_switch_period: u32,
    pub adaptive_paths: bool,
    pub adaptive_behavior: bool,
    pub adaptive_proto: bool,
    /// Seed for the deterministic size-bin jitter.
    pub seed: u64,
}

/// The controller's verdict for one window.
#[derive(Debug, Clone)]
pub struct StrategyOutput {
    /// New path weights, indexed by path id.
    pub weights: Vec<f64>,
    /// New shaping knobs, indexed by path id.
    pub behavior_by_path: Vec<BehaviorParams>,
    /// Cover family per path.
    pub family_by_path: Vec<u16>,
    /// Cover variant per path.
    pub variant_by_path: Vec<u8>,
    pub obfuscation_level: u8,
    pub trigger: RotationTrigger,
    pub action: StrategyAction,
    pub adaptive_flags: AdaptiveFlags,
}

/// Shaping-knob preset derived from an obfuscation level.
struct LevelPreset {
    padding: f64,
    jitter: u64,
    rate: u64,
    drift: f64,
    burst: u32,
    enabled: bool,
}

/// Distribution drift applied at a given obfuscation level.
pub fn drift_for_level(level: u8) -> f64 {
    match level {
        0 => 0.0,
        1 => 0.02,
        2 => 0.05,
        _ => 0.08,
    }
}

/// The per-window rule engine.
pub struct StrategyEngine {
    config: StrategyConfig,
    family_index: usize,
    variant_seed: u64,
}

impl StrategyEngine {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            family_index: 0,
            variant_seed: 0,
        }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Internal rotation counters `(family_index, variant_seed)`; advance
    /// only when a rotation fires.
    pub fn counters(&self) -> (usize, u64) {
        (self.family_index, self.variant_seed)
    }

    fn level_preset(&self) -> LevelPreset {
        let base = self.config.base_rate;
        match self.config.obfuscation_level {
            0 => LevelPreset {
                padding: 0.0,
                jitter: 0,
                rate: base * 2,
                drift: 0.0,
                burst: 1,
                enabled: false,
            },
            1 => LevelPreset {
                padding: self.config.base_padding,
                jitter: self.config.base_jitter,
                rate: (base as f64 * 1.2) as u64,
                drift: 0.02,
                burst: 4,
                enabled: true,
            },
            2 => LevelPreset {
                padding: self.config.base_padding,
                jitter: self.config.base_jitter,
                rate: base,
                drift: 0.05,
                burst: 6,
                enabled: true,
            },
            _ => LevelPreset {
                padding: self.config.base_padding,
                jitter: self.config.base_jitter,
                rate: (base as f64 * 0.8) as u64,
                drift: 0.08,
                burst: 8,
                enabled: true,
            },
        }
    }

    /// Evaluate one window.
    pub fn evaluate(
        &mut self,
        metrics: &[PathMetrics],
        timeout_events: u32,
        window_id: u32,
    ) -> StrategyOutput {
        let path_count = metrics.len();
        let level = self.config.obfuscation_level.min(3);

        // Path weights: degraded paths are halved when path adaptation is on.
        let weights: Vec<f64> = metrics
            .iter()
            .map(|m| {
                let mut w = 1.0;
                if self.config.adaptive_paths && (m.loss > 0.1 || m.rtt_ms > 200.0) {
                    w *= 0.5;
                }
                w
            })
            .collect();

        // Level preset, then overload damping on the window means.
        let preset = self.level_preset();
        let mut padding = preset.padding;
        let mut jitter = preset.jitter;
        let mut rate = preset.rate;
        let burst = preset.burst;

        let denom = path_count.max(1) as f64;
        let mean_loss: f64 = metrics.iter().map(|m| m.loss).sum::<f64>() / denom;
        let mean_rtt: f64 = metrics.iter().map(|m| m.rtt_ms).sum::<f64>() / denom;
        if mean_loss > 0.2 || mean_rtt > 250.0 {
            padding = (padding * 0.5).max(0.01);
            jitter = ((jitter as f64 * 0.5) as u64).max(5);
            rate = (rate as f64 * 0.8) as u64;
        }

        // Deterministic size-bin jitter; distribution resets to uniform.
        let mut bin_rng =
            StdRng::seed_from_u64(self.config.seed.wrapping_add(u64::from(window_id)));
        let size_bins: Vec<usize> = self
            .config
            .size_bins
            .iter()
            .map(|b| (*b as f64 * bin_rng.gen_range(0.9..1.1)) as usize)
            .collect();
        let q_dist = vec![1.0 / size_bins.len().max(1) as f64; size_bins.len()];

        // Protocol rotation.
        let trigger = if self.config.adaptive_proto {
            if timeout_events > 2 {
                RotationTrigger::Timeout
            } else if window_id % self.config.proto_switch_period.max(1) == 0 {
                RotationTrigger::Periodic
            } else {
                RotationTrigger::None
            }
        } else {
            RotationTrigger::None
        };

        // Per-path assignment with mode overrides. Assignments read the
        // counters as they stand; a rotation advances them afterwards and
        // takes effect from the next window.
        let mut behavior_by_path = Vec::with_capacity(path_count);
        let mut family_by_path = Vec::with_capacity(path_count);
        let mut variant_by_path = Vec::with_capacity(path_count);
        let family_count = self.config.family_ids.len().max(1);

        for path_id in 0..path_count {
            let mut enable_shaping = preset.enabled;
            let mut enable_padding = preset.enabled;
            let mut enable_pacing = preset.enabled;
            let mut enable_jitter = preset.enabled;

            let (family_id, variant_id) = match self.config.mode {
                Mode::BaselineDelay => {
                    enable_shaping = false;
                    enable_padding = false;
                    enable_pacing = true;
                    enable_jitter = true;
                    (1, 0)
                }
                Mode::BaselinePadding => {
                    enable_shaping = true;
                    enable_padding = true;
                    enable_pacing = false;
                    enable_jitter = false;
                    (1, 0)
                }
                Mode::Normal => {
                    if !self.config.adaptive_behavior {
                        enable_shaping = false;
                        enable_padding = false;
                        enable_pacing = false;
                        enable_jitter = false;
                    }
                    if self.config.adaptive_proto {
                        let family = self.config.family_ids
                            [(self.family_index + path_id) % family_count];
                        let variant = ((self.variant_seed + path_id as u64) % 2) as u8;
                        (family, variant)
                    } else {
                        (1, 0)
                    }
                }
            };

            family_by_path.push(family_id);
            variant_by_path.push(variant_id);
            behavior_by_path.push(BehaviorParams {
                size_bins: size_bins.clone(),
                q_dist: q_dist.clone(),
                padding_alpha: padding,
                jitter_ms: jitter,
                rate_bytes_per_sec: rate,
                burst_size: burst,
                obfuscation_level: level,
                enable_shaping,
                enable_padding,
                enable_pacing,
                enable_jitter,
                fixed_q_dist: None,
            });
        }

        if trigger != RotationTrigger::None {
            self.family_index = (self.family_index + 1) % self.config.family_ids.len().max(1);
            self.variant_seed += 1;
        }

        // Action label; later conditions dominate earlier ones.
        let mut action = StrategyAction::Static;
        if trigger != RotationTrigger::None {
            action = StrategyAction::SwitchProto;
        }
        if weights.iter().any(|w| *w < 1.0) {
            action = StrategyAction::UpdateWeights;
        }
        if self.config.adaptive_behavior {
            action = StrategyAction::UpdateBehavior;
        }

        StrategyOutput {
            weights,
            behavior_by_path,
            family_by_path,
            variant_by_path,
            obfuscation_level: level,
            trigger,
            action,
            adaptive_flags: AdaptiveFlags {
                adaptive_paths: self.config.adaptive_paths,
                adaptive_behavior: self.config.adaptive_behavior,
                adaptive_proto: self.config.adaptive_proto,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StrategyConfig {
        StrategyConfig {
            size_bins: vec![300, 600, 900, 1200],
            base_padding: 0.05,
            base_jitter: 20,
            base_rate: 50_000,
            family_ids: vec![1, 2, 3],
            obfuscation_level: 2,
            mode: Mode::Normal,
            proto_switch_period: 3,
            adaptive_paths: true,
            adaptive_behavior: true,
            adaptive_proto: true,
            seed: 7,
        }
    }

    fn metrics(pairs: &[(f64, f64)]) -> Vec<PathMetrics> {
        pairs
            .iter()
            .map(|(rtt_ms, loss)| PathMetrics {
                rtt_ms: *rtt_ms,
                loss: *loss,
            })
            .collect()
    }

    #[test]
    fn test_healthy_paths_keep_full_weight() {
        let mut engine = StrategyEngine::new(config());
        let out = engine.evaluate(&metrics(&[(50.0, 0.0), (80.0, 0.05)]), 0, 1);
        assert_eq!(out.weights, vec![1.0, 1.0]);
    }

    #[test]
    fn test_degraded_paths_halved() {
        let mut engine = StrategyEngine::new(config());
        let out = engine.evaluate(&metrics(&[(250.0, 0.0), (50.0, 0.2)]), 0, 1);
        assert_eq!(out.weights, vec![0.5, 0.5]);
        assert_eq!(out.action, StrategyAction::UpdateBehavior);
    }

    #[test]
    fn test_weight_halving_requires_adaptive_paths() {
        let mut cfg = config();
        cfg.adaptive_paths = false;
        let mut engine = StrategyEngine::new(cfg);
        let out = engine.evaluate(&metrics(&[(500.0, 0.9)]), 0, 1);
        assert_eq!(out.weights, vec![1.0]);
    }

    #[test]
    fn test_level0_silences_all_shaping() {
        let mut cfg = config();
        cfg.obfuscation_level = 0;
        let mut engine = StrategyEngine::new(cfg);
        let out = engine.evaluate(&metrics(&[(10.0, 0.0), (12.0, 0.0)]), 0, 1);
        for params in &out.behavior_by_path {
            assert!(!params.enable_shaping);
            assert!(!params.enable_padding);
            assert!(!params.enable_pacing);
            assert!(!params.enable_jitter);
            assert_eq!(params.padding_alpha, 0.0);
            assert_eq!(params.jitter_ms, 0);
            assert_eq!(params.burst_size, 1);
            assert_eq!(params.rate_bytes_per_sec, 100_000);
        }
    }

    #[test]
    fn test_overload_damping_halves_knobs() {
        // Synthetic snapshot at L2 with mean RTT 300 must damp padding,
        // jitter, and rate by the documented factors.
        let mut cfg = config();
        cfg.base_padding = 0.1;
        cfg.base_jitter = 20;
        cfg.base_rate = 50_000;
        let mut engine = StrategyEngine::new(cfg);
        let out = engine.evaluate(&metrics(&[(300.0, 0.0)]), 0, 1);
        let params = &out.behavior_by_path[0];
        assert!((params.padding_alpha - 0.05).abs() < 1e-9);
        assert_eq!(params.jitter_ms, 10);
        assert_eq!(params.rate_bytes_per_sec, 40_000);
    }

    #[test]
    fn test_timeout_rotation_advances_counters_once() {
        let mut engine = StrategyEngine::new(config());
        let before = engine.counters();
        let out = engine.evaluate(&metrics(&[(10.0, 0.0)]), 3, 1);
        let after = engine.counters();
        assert_eq!(out.trigger, RotationTrigger::Timeout);
        assert_eq!(after.0, before.0 + 1);
        assert_eq!(after.1, before.1 + 1);
    }

    #[test]
    fn test_periodic_rotation_schedule() {
        let mut cfg = config();
        cfg.proto_switch_period = 2;
        let mut engine = StrategyEngine::new(cfg);
        let m = metrics(&[(10.0, 0.0)]);

        let mut families = Vec::new();
        let mut triggers = Vec::new();
        for window_id in 1..=5 {
            let out = engine.evaluate(&m, 0, window_id);
            families.push(out.family_by_path[0]);
            triggers.push(out.trigger);
        }
        assert_eq!(
            triggers,
            vec![
                RotationTrigger::None,
                RotationTrigger::Periodic,
                RotationTrigger::None,
                RotationTrigger::Periodic,
                RotationTrigger::None,
            ]
        );
        // Rotations take effect the window after they fire:
        // indices 0, 0, 1, 1, 2 → families 1, 1, 2, 2, 3 for path 0.
        assert_eq!(families, vec![1, 1, 2, 2, 3]);
        assert_eq!(engine.counters().0, 2);
    }

    #[test]
    fn test_counters_frozen_without_trigger() {
        let mut engine = StrategyEngine::new(config());
        let before = engine.counters();
        // window 1, period 3, no timeouts: no trigger.
        engine.evaluate(&metrics(&[(10.0, 0.0)]), 0, 1);
        assert_eq!(engine.counters(), before);
    }

    #[test]
    fn test_per_path_family_offset() {
        let mut engine = StrategyEngine::new(config());
        let out = engine.evaluate(&metrics(&[(1.0, 0.0), (1.0, 0.0), (1.0, 0.0)]), 0, 1);
        // family_index 0: path p gets family_ids[p % 3].
        assert_eq!(out.family_by_path, vec![1, 2, 3]);
        assert_eq!(out.variant_by_path, vec![0, 1, 0]);
    }

    #[test]
    fn test_baseline_delay_overrides() {
        let mut cfg = config();
        cfg.mode = Mode::BaselineDelay;
        let mut engine = StrategyEngine::new(cfg);
        let out = engine.evaluate(&metrics(&[(1.0, 0.0), (1.0, 0.0)]), 0, 1);
        for (path, params) in out.behavior_by_path.iter().enumerate() {
            assert!(!params.enable_shaping);
            assert!(!params.enable_padding);
            assert!(params.enable_pacing);
            assert!(params.enable_jitter);
            assert_eq!(out.family_by_path[path], 1);
            assert_eq!(out.variant_by_path[path], 0);
        }
    }

    #[test]
    fn test_baseline_padding_overrides() {
        let mut cfg = config();
        cfg.mode = Mode::BaselinePadding;
        let mut engine = StrategyEngine::new(cfg);
        let out = engine.evaluate(&metrics(&[(1.0, 0.0), (1.0, 0.0)]), 0, 1);
        for (path, params) in out.behavior_by_path.iter().enumerate() {
            assert!(params.enable_shaping);
            assert!(params.enable_padding);
            assert!(!params.enable_pacing);
            assert!(!params.enable_jitter);
            assert_eq!(out.family_by_path[path], 1);
            assert_eq!(out.variant_by_path[path], 0);
        }
    }

    #[test]
    fn test_normal_without_adaptive_proto_pins_family() {
        let mut cfg = config();
        cfg.adaptive_proto = false;
        let mut engine = StrategyEngine::new(cfg);
        let out = engine.evaluate(&metrics(&[(1.0, 0.0), (1.0, 0.0)]), 5, 1);
        assert_eq!(out.trigger, RotationTrigger::None);
        assert_eq!(out.family_by_path, vec![1, 1]);
        assert_eq!(out.variant_by_path, vec![0, 0]);
    }

    #[test]
    fn test_normal_without_adaptive_behavior_disables_toggles() {
        let mut cfg = config();
        cfg.adaptive_behavior = false;
        let mut engine = StrategyEngine::new(cfg);
        let out = engine.evaluate(&metrics(&[(1.0, 0.0)]), 0, 1);
        let params = &out.behavior_by_path[0];
        assert!(!params.enable_shaping && !params.enable_padding);
        assert!(!params.enable_pacing && !params.enable_jitter);
    }

    #[test]
    fn test_evaluate_is_deterministic() {
        let mut a = StrategyEngine::new(config());
        let mut b = StrategyEngine::new(config());
        let m = metrics(&[(120.0, 0.05), (40.0, 0.0)]);
        let out_a = a.evaluate(&m, 1, 4);
        let out_b = b.evaluate(&m, 1, 4);
        assert_eq!(out_a.weights, out_b.weights);
        assert_eq!(out_a.family_by_path, out_b.family_by_path);
        assert_eq!(out_a.variant_by_path, out_b.variant_by_path);
        assert_eq!(out_a.trigger, out_b.trigger);
        assert_eq!(
            out_a.behavior_by_path[0].size_bins,
            out_b.behavior_by_path[0].size_bins
        );
        assert_eq!(out_a.behavior_by_path[0].q_dist, out_b.behavior_by_path[0].q_dist);
    }

    #[test]
    fn test_size_bins_jittered_within_bounds() {
        let mut engine = StrategyEngine::new(config());
        let out = engine.evaluate(&metrics(&[(1.0, 0.0)]), 0, 1);
        let bins = &out.behavior_by_path[0].size_bins;
        for (jittered, base) in bins.iter().zip(&[300usize, 600, 900, 1200]) {
            let low = (*base as f64 * 0.9) as usize;
            let high = (*base as f64 * 1.1) as usize + 1;
            assert!(*jittered >= low && *jittered <= high);
        }
        let q = &out.behavior_by_path[0].q_dist;
        assert!(q.iter().all(|p| (*p - 0.25).abs() < 1e-9));
    }

    #[test]
    fn test_action_label_precedence() {
        // Rotation alone → switch_proto (behavior adaptation off so the
        // later label does not mask it).
        let mut cfg = config();
        cfg.adaptive_behavior = false;
        cfg.adaptive_paths = false;
        cfg.proto_switch_period = 1;
        let mut engine = StrategyEngine::new(cfg);
        let out = engine.evaluate(&metrics(&[(1.0, 0.0)]), 0, 1);
        assert_eq!(out.action, StrategyAction::SwitchProto);

        // Nothing at all → static.
        let mut cfg = config();
        cfg.adaptive_behavior = false;
        cfg.adaptive_paths = false;
        cfg.adaptive_proto = false;
        let mut engine = StrategyEngine::new(cfg);
        let out = engine.evaluate(&metrics(&[(1.0, 0.0)]), 0, 1);
        assert_eq!(out.action, StrategyAction::Static);
    }
}
