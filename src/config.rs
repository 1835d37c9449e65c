use crate::error::{Result, TriggerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Spike detection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Trigger threshold as a multiple of the sub-window standard deviation
    pub threshold_sigma: f32,
    /// Statistics unit, in samples
    pub sub_window: usize,
    /// Minimum spacing between two reported candidates, in samples
    pub dead_time: i64,
    /// Candidate cap per scan (and per round message)
    pub max_candidates: usize,
    /// Waveform bytes kept around each accepted candidate
    pub snippet_len: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold_sigma: 6.0,
            sub_window: 1024,
            dead_time: 32,
            max_candidates: 256,
            snippet_len: 1024,
        }
    }
}

/// Which sample source feeds every worker, chosen once at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Recorded files played back at `swap_interval_ms`
    #[default]
    Replay,
    /// DMA regions written by the acquisition boards
    Mapped,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Replay => write!(f, "replay"),
            SourceKind::Mapped => write!(f, "mapped"),
        }
    }
}

impl FromStr for SourceKind {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "replay" => Ok(SourceKind::Replay),
            "mapped" => Ok(SourceKind::Mapped),
            other => Err(TriggerError::InvalidConfig(format!(
                "unknown source '{}', expected replay or mapped",
                other
            ))),
        }
    }
}

/// Buffer hand-off and sample source pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub source: SourceKind,
    /// Capacity of each of the two buffers, in bytes
    pub buffer_size: usize,
    /// Replay producer period between swaps
    pub swap_interval_ms: u64,
    pub loop_playback: bool,
    pub swap_timeout_ms: u64,
    pub stall_timeout_ms: u64,
    pub poll_interval_us: u64,
    /// How long a mapped source waits for the first DMA buffer
    pub trigger_wait_ms: u64,
    /// Consecutive stalled rounds tolerated before the worker halts
    pub max_stalled_rounds: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Replay,
            buffer_size: 256 * 1024,
            swap_interval_ms: 50,
            loop_playback: true,
            swap_timeout_ms: 2000,
            stall_timeout_ms: 2000,
            poll_interval_us: 1000,
            trigger_wait_ms: 120_000,
            max_stalled_rounds: 3,
        }
    }
}

impl AcquisitionConfig {
    pub fn swap_timeout(&self) -> Duration {
        Duration::from_millis(self.swap_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }
}

/// Round protocol parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoincidenceConfig {
    /// Minimum distinct channels per accepted cluster
    pub multiplicity: usize,
    /// Rank fixed as coordinator; verified by the ring handshake
    pub coordinator: usize,
    pub handshake_timeout_ms: u64,
    pub barrier_timeout_ms: u64,
    /// Upper bound for one worker's capture + detection + exchange
    pub round_timeout_ms: u64,
    pub max_rounds: Option<u64>,
    /// Subtracted from a node's host number to get its antenna id
    pub antenna_id_offset: u32,
    /// Coincidence window (samples) used when no detector table is supplied
    pub default_window: i64,
}

impl Default for CoincidenceConfig {
    fn default() -> Self {
        Self {
            multiplicity: 4,
            coordinator: 0,
            handshake_timeout_ms: 10_000,
            barrier_timeout_ms: 30_000,
            round_timeout_ms: 30_000,
            max_rounds: None,
            antenna_id_offset: 101,
            default_window: 64,
        }
    }
}

impl CoincidenceConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }
}

/// Where accepted events land
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub location: PathBuf,
    pub run_id: u32,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            location: default_data_location(),
            run_id: 0,
        }
    }
}

/// Periodic raw snapshots for noise monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Seconds between snapshots
    pub interval_s: f64,
    /// Bytes kept from the start of each captured buffer
    pub length: usize,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            interval_s: 300.0,
            length: 1024,
        }
    }
}

impl BackgroundConfig {
    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.interval_s).unwrap_or_default()
    }
}

fn default_data_location() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("trigger-rs")
}

/// Complete trigger configuration, loaded once before any round starts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub detector: DetectorConfig,
    pub acquisition: AcquisitionConfig,
    pub coincidence: CoincidenceConfig,
    pub recorder: RecorderConfig,
    pub background: BackgroundConfig,
}

impl TriggerConfig {
    /// Load a JSON configuration file. Missing sections fall back to defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TriggerError::InvalidConfig(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)?;
        let config: TriggerConfig = serde_json::from_str(&content)?;
        config.validate()?;

        log::info!("Loaded trigger configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.detector;
        if !(d.threshold_sigma > 0.0) {
            return Err(TriggerError::InvalidConfig(format!(
                "threshold_sigma must be positive, got {}",
                d.threshold_sigma
            )));
        }
        if d.sub_window == 0 {
            return Err(TriggerError::InvalidConfig("sub_window must be non-zero".into()));
        }
        if d.snippet_len == 0 {
            return Err(TriggerError::InvalidConfig("snippet_len must be non-zero".into()));
        }
        if d.dead_time < 0 {
            return Err(TriggerError::InvalidConfig("dead_time must not be negative".into()));
        }

        let a = &self.acquisition;
        if a.buffer_size == 0 || a.buffer_size % d.sub_window != 0 {
            return Err(TriggerError::InvalidConfig(format!(
                "buffer_size {} must be a non-zero multiple of sub_window {}",
                a.buffer_size, d.sub_window
            )));
        }
        if a.swap_timeout_ms == 0 || a.stall_timeout_ms == 0 {
            return Err(TriggerError::InvalidConfig("acquisition timeouts must be non-zero".into()));
        }

        let c = &self.coincidence;
        if c.multiplicity < 1 {
            return Err(TriggerError::InvalidConfig("multiplicity must be at least 1".into()));
        }
        if c.barrier_timeout_ms == 0 || c.round_timeout_ms == 0 || c.handshake_timeout_ms == 0 {
            return Err(TriggerError::InvalidConfig("coincidence timeouts must be non-zero".into()));
        }
        if c.default_window < 0 {
            return Err(TriggerError::InvalidConfig("default_window must not be negative".into()));
        }

        let b = &self.background;
        if !(b.interval_s > 0.0) || !b.interval_s.is_finite() {
            return Err(TriggerError::InvalidConfig(format!(
                "background interval_s must be a positive number of seconds, got {}",
                b.interval_s
            )));
        }
        if b.length == 0 {
            return Err(TriggerError::InvalidConfig("background length must be non-zero".into()));
        }

        Ok(())
    }
}
