//! Configuration management for Veles.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::shaping::BehaviorParams;
use crate::strategy::{Mode, StrategyConfig};

/// Main configuration structure.
///
/// Every field has a default, so an empty TOML file (or none at all) yields
/// a runnable local topology. Environment variables override the file; see
/// [`Config::apply_env`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Entry node listen host.
    #[serde(default = "default_host")]
    pub entry_host: String,

    /// Entry node listen port.
    #[serde(default = "default_entry_port")]
    pub entry_port: u16,

    /// Middle relay host.
    #[serde(default = "default_host")]
    pub middle_host: String,

    /// Middle relay ports, one per path.
    #[serde(default = "default_middle_ports")]
    pub middle_ports: Vec<u16>,

    /// Exit node listen host.
    #[serde(default = "default_host")]
    pub exit_host: String,

    /// Exit node listen port.
    #[serde(default = "default_exit_port")]
    pub exit_port: u16,

    /// Target application server host.
    #[serde(default = "default_host")]
    pub server_host: String,

    /// Target application server port.
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Observation window duration.
    #[serde(default = "default_window_size", with = "humantime_serde")]
    pub window_size: Duration,

    /// Candidate fragment lengths.
    #[serde(default = "default_size_bins")]
    pub size_bins: Vec<usize>,

    /// Padding budget per real byte.
    #[serde(default = "default_padding_alpha")]
    pub padding_alpha: f64,

    /// Upper bound for per-frame jitter sleeps.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    /// Consecutive picks per scheduler batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Base pacing rate in bytes per second.
    #[serde(default = "default_base_rate")]
    pub base_rate_bytes_per_sec: u64,

    /// Obfuscation level, 0..=3.
    #[serde(default = "default_obfuscation_level")]
    pub obfuscation_level: u8,

    /// Experiment mode.
    #[serde(default)]
    pub mode: Mode,

    /// Random seed; a random one is drawn when absent.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Age at which an unacknowledged sequence counts as a timeout event.
    #[serde(default = "default_ack_timeout", with = "humantime_serde")]
    pub ack_timeout: Duration,

    /// Windows between periodic cover rotations.
    #[serde(default = "default_proto_switch_period")]
    pub proto_switch_period: u32,

    /// Halve the weight of degraded paths.
    #[serde(default = "default_true")]
    pub adaptive_paths: bool,

    /// Re-parameterise shaping each window.
    #[serde(default = "default_true")]
    pub adaptive_behavior: bool,

    /// Rotate cover families on triggers.
    #[serde(default = "default_true")]
    pub adaptive_proto: bool,

    /// Sessions the external orchestrator will run (recorded, not enforced).
    #[serde(default = "default_session_count")]
    pub session_count: u32,

    /// Per-session duration for the external orchestrator.
    #[serde(default = "default_session_duration", with = "humantime_serde")]
    pub session_duration: Duration,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_entry_port() -> u16 {
    9001
}
fn default_middle_ports() -> Vec<u16> {
    vec![9101, 9102]
}
fn default_exit_port() -> u16 {
    9201
}
fn default_server_port() -> u16 {
    9301
}
fn default_window_size() -> Duration {
    Duration::from_secs(10)
}
fn default_size_bins() -> Vec<usize> {
    vec![300, 600, 900, 1200]
}
fn default_padding_alpha() -> f64 {
    0.05
}
fn default_jitter_ms() -> u64 {
    20
}
fn default_batch_size() -> u32 {
    4
}
fn default_base_rate() -> u64 {
    50_000
}
fn default_obfuscation_level() -> u8 {
    2
}
fn default_ack_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_proto_switch_period() -> u32 {
    3
}
fn default_true() -> bool {
    true
}
fn default_session_count() -> u32 {
    1
}
fn default_session_duration() -> Duration {
    Duration::from_secs(30)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            entry_host: default_host(),
            entry_port: default_entry_port(),
            middle_host: default_host(),
            middle_ports: default_middle_ports(),
            exit_host: default_host(),
            exit_port: default_exit_port(),
            server_host: default_host(),
            server_port: default_server_port(),
            window_size: default_window_size(),
            size_bins: default_size_bins(),
            padding_alpha: default_padding_alpha(),
            jitter_ms: default_jitter_ms(),
            batch_size: default_batch_size(),
            base_rate_bytes_per_sec: default_base_rate(),
            obfuscation_level: default_obfuscation_level(),
            mode: Mode::default(),
            seed: None,
            ack_timeout: default_ack_timeout(),
            proto_switch_period: default_proto_switch_period(),
            adaptive_paths: true,
            adaptive_behavior: true,
            adaptive_proto: true,
            session_count: default_session_count(),
            session_duration: default_session_duration(),
        }
    }
}

/// The truthy spellings accepted for boolean environment variables.
fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y"
    )
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the recognised environment variables on top of the current
    /// values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("PATH_COUNT") {
            let count: usize = v
                .parse()
                .map_err(|_| Error::Config(format!("invalid PATH_COUNT: {v}")))?;
            let base = self.middle_ports.first().copied().unwrap_or(9101);
            self.middle_ports = (0..count).map(|i| base + i as u16).collect();
        }
        if let Ok(v) = std::env::var("ALPHA_PADDING") {
            self.padding_alpha = v
                .parse()
                .map_err(|_| Error::Config(format!("invalid ALPHA_PADDING: {v}")))?;
        }
        if let Ok(v) = std::env::var("OBFUSCATION_LEVEL") {
            self.obfuscation_level = v
                .parse()
                .map_err(|_| Error::Config(format!("invalid OBFUSCATION_LEVEL: {v}")))?;
        }
        if let Ok(v) = std::env::var("MODE") {
            self.mode = v.parse()?;
        }
        if let Ok(v) = std::env::var("PROTO_SWITCH_PERIOD") {
            self.proto_switch_period = v
                .parse()
                .map_err(|_| Error::Config(format!("invalid PROTO_SWITCH_PERIOD: {v}")))?;
        }
        if let Ok(v) = std::env::var("ADAPTIVE_PATHS") {
            self.adaptive_paths = truthy(&v);
        }
        if let Ok(v) = std::env::var("ADAPTIVE_BEHAVIOR") {
            self.adaptive_behavior = truthy(&v);
        }
        if let Ok(v) = std::env::var("ADAPTIVE_PROTO") {
            self.adaptive_proto = truthy(&v);
        }
        if let Ok(v) = std::env::var("SEED") {
            self.seed = Some(
                v.parse()
                    .map_err(|_| Error::Config(format!("invalid SEED: {v}")))?,
            );
        }
        if let Ok(v) = std::env::var("SESSION_COUNT") {
            self.session_count = v
                .parse()
                .map_err(|_| Error::Config(format!("invalid SESSION_COUNT: {v}")))?;
        }
        if let Ok(v) = std::env::var("SESSION_DURATION") {
            let secs: u64 = v
                .parse()
                .map_err(|_| Error::Config(format!("invalid SESSION_DURATION: {v}")))?;
            self.session_duration = Duration::from_secs(secs);
        }
        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.middle_ports.is_empty() {
            return Err(Error::Config("no middle ports configured".into()));
        }
        if self.middle_ports.len() > u8::MAX as usize {
            return Err(Error::Config(format!(
                "too many paths: {} (max {})",
                self.middle_ports.len(),
                u8::MAX
            )));
        }
        if self.size_bins.is_empty() {
            return Err(Error::Config("size_bins must not be empty".into()));
        }
        if self.size_bins.iter().any(|b| *b == 0) {
            return Err(Error::Config("size_bins must be positive".into()));
        }
        if self.base_rate_bytes_per_sec == 0 {
            return Err(Error::Config("base rate must be positive".into()));
        }
        if self.padding_alpha < 0.0 {
            return Err(Error::Config("padding_alpha must be non-negative".into()));
        }
        if self.obfuscation_level > 3 {
            return Err(Error::Config(format!(
                "obfuscation_level out of range: {}",
                self.obfuscation_level
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.proto_switch_period == 0 {
            return Err(Error::Config("proto_switch_period must be at least 1".into()));
        }
        if self.window_size.is_zero() {
            return Err(Error::Config("window_size must be positive".into()));
        }
        Ok(())
    }

    /// Number of parallel paths this configuration describes.
    pub fn path_count(&self) -> usize {
        self.middle_ports.len()
    }

    /// Strategy-engine configuration derived from this config.
    pub fn strategy_config(&self, family_ids: Vec<u16>, seed: u64) -> StrategyConfig {
        StrategyConfig {
            size_bins: self.size_bins.clone(),
            base_padding: self.padding_alpha,
            base_jitter: self.jitter_ms,
            base_rate: self.base_rate_bytes_per_sec,
            family_ids,
            obfuscation_level: self.obfuscation_level,
            mode: self.mode,
            proto_switch_period: self.proto_switch_period,
            adaptive_paths: self.adaptive_paths,
            adaptive_behavior: self.adaptive_behavior,
            adaptive_proto: self.adaptive_proto,
            seed,
        }
    }

    /// Shaping parameters used before the first window tick.
    ///
    /// Level 0 silences shaping from the very first frame, not just from
    /// the first controller evaluation.
    pub fn base_behavior(&self) -> BehaviorParams {
        let mut params = BehaviorParams::uniform(
            self.size_bins.clone(),
            self.padding_alpha,
            self.jitter_ms,
            self.base_rate_bytes_per_sec,
            6,
            self.obfuscation_level,
        );
        if self.obfuscation_level == 0 {
            params.padding_alpha = 0.0;
            params.jitter_ms = 0;
            params.burst_size = 1;
            params.rate_bytes_per_sec = self.base_rate_bytes_per_sec * 2;
            params.enable_shaping = false;
            params.enable_padding = false;
            params.enable_pacing = false;
            params.enable_jitter = false;
        }
        params
    }
}

/// Initialize logging.
pub fn init_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| Error::Config(format!("failed to init logging: {e}")))?;
    Ok(())
}
