//! Observation records and run artifacts.
//!
//! Every window tick emits one [`WindowRecord`] per path describing what
//! the controller decided and what the telemetry saw; the exit additionally
//! emits one [`LatencyRecord`] per forwarded application request. Records
//! go to append-only JSONL sinks under a per-run output directory that also
//! holds `meta.json` and `config_dump.json`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::strategy::{AdaptiveFlags, RotationTrigger, StrategyAction};

/// One per-path observation of a closed window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowRecord {
    pub window_id: u32,
    pub path_id: u8,
    pub obfuscation_level: u8,
    pub alpha_padding: f64,
    pub rate_bytes_per_sec: u64,
    pub jitter_ms: u64,
    pub proto_family: u16,
    pub proto_variant: u8,
    pub padding_bytes: u64,
    pub real_bytes: u64,
    pub rtt_ms: f64,
    pub loss: f64,
    pub trigger: RotationTrigger,
    pub action: StrategyAction,
    pub adaptive_flags: AdaptiveFlags,
}

/// Application-level round-trip observation from the exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyRecord {
    pub seq: u64,
    pub ok: bool,
    pub latency_ms: f64,
    pub payload_len: usize,
}

/// Append-only JSONL sink tolerating concurrent writers.
#[derive(Debug)]
pub struct JsonlSink {
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one record as a single line.
    pub fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| Error::Config(format!("record serialisation failed: {e}")))?;
        let mut file = self.file.lock();
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }
}

/// Per-run output context: directories, identifiers, and record sinks.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: String,
    pub out_dir: PathBuf,
    pub traces_dir: PathBuf,
    pub attacker_path_id: u8,
    pub seed: u64,
    window_log: JsonlSink,
    latency_log: JsonlSink,
}

impl RunContext {
    /// Build the run context from the environment, creating the output
    /// directory tree and writing `meta.json`/`config_dump.json` once.
    ///
    /// Honors `RUN_ID`, `OUT_DIR`, `SEED`, and `ATTACKER_PATH_ID`.
    pub fn initialise(config: &Config) -> Result<Arc<Self>> {
        let run_id = std::env::var("RUN_ID").unwrap_or_else(|_| generate_run_id());
        let out_dir = std::env::var("OUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("out").join(&run_id));

        let seed = match std::env::var("SEED") {
            Ok(v) => v
                .parse::<u64>()
                .map_err(|_| Error::Config(format!("invalid SEED: {v}")))?,
            Err(_) => config.seed.unwrap_or_else(|| rand::thread_rng().gen()),
        };

        let attacker_path_id = match std::env::var("ATTACKER_PATH_ID") {
            Ok(v) => v
                .parse::<u8>()
                .map_err(|_| Error::Config(format!("invalid ATTACKER_PATH_ID: {v}")))?,
            Err(_) => {
                let mut rng = StdRng::seed_from_u64(seed);
                rng.gen_range(0..config.path_count().max(1)) as u8
            }
        };

        Self::create(config, out_dir, run_id, seed, attacker_path_id)
    }

    /// Build a run context at an explicit location.
    pub fn create(
        config: &Config,
        out_dir: PathBuf,
        run_id: String,
        seed: u64,
        attacker_path_id: u8,
    ) -> Result<Arc<Self>> {
        let traces_dir = out_dir.join("traces");
        fs::create_dir_all(&traces_dir)?;

        // meta.json is written once per run; a restart re-reads the chosen
        // attacker path so traces stay comparable.
        let meta_path = out_dir.join("meta.json");
        let attacker_path_id = if meta_path.exists() {
            let meta: serde_json::Value = serde_json::from_str(&fs::read_to_string(&meta_path)?)
                .map_err(|e| Error::Config(format!("corrupt meta.json: {e}")))?;
            meta.get("attacker_path_id")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(u64::from(attacker_path_id)) as u8
        } else {
            let meta = json!({
                "run_id": run_id,
                "seed": seed,
                "attacker_path_id": attacker_path_id,
                "start_time": humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
            });
            fs::write(&meta_path, serde_json::to_string_pretty(&meta).unwrap_or_default())?;
            attacker_path_id
        };

        let dump_path = out_dir.join("config_dump.json");
        if !dump_path.exists() {
            let dump = serde_json::to_string_pretty(config)
                .map_err(|e| Error::Config(format!("config dump failed: {e}")))?;
            fs::write(&dump_path, dump)?;
        }

        Ok(Arc::new(Self {
            window_log: JsonlSink::open(&out_dir.join("window_logs.jsonl"))?,
            latency_log: JsonlSink::open(&out_dir.join("latency_logs.jsonl"))?,
            run_id,
            traces_dir,
            out_dir,
            attacker_path_id,
            seed,
        }))
    }

    pub fn record_window(&self, record: &WindowRecord) -> Result<()> {
        self.window_log.append(record)
    }

    pub fn record_latency(&self, record: &LatencyRecord) -> Result<()> {
        self.latency_log.append(record)
    }
}

fn generate_run_id() -> String {
    let stamp = humantime::format_rfc3339_seconds(SystemTime::now())
        .to_string()
        .replace([':', '-'], "")
        .replace('T', "_");
    let stamp = stamp.trim_end_matches('Z');
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..6];
    format!("{stamp}_{suffix}")
}
