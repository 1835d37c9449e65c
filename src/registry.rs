use crate::error::{Result, TriggerError};
use crate::types::ChannelId;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Signal propagation speed used to turn antenna distances into time
pub const SPEED_OF_LIGHT: f64 = 3.0e8;

/// ADC sample period (200 MS/s)
pub const SAMPLE_PERIOD: f64 = 5.0e-9;

/// Slack applied on top of the light-travel time between two antennas
pub const WINDOW_SAFETY_FACTOR: f64 = 1.2;

/// Round half up the way the calibration tables have always been rounded.
fn round_to_samples(value: f64) -> i64 {
    (value + 0.49999) as i64
}

/// Raw detector calibration: per-antenna delays (samples) and pairwise
/// distances (metres), indexed by antenna id.
#[derive(Debug, Clone)]
pub struct DetectorTable {
    delays: DVector<f64>,
    distances: DMatrix<f64>,
}

impl DetectorTable {
    /// Parse `N` delays followed by an `N x N` distance matrix, whitespace separated.
    ///
    /// `N` is inferred from the number of values.
    pub fn parse(content: &str) -> Result<Self> {
        let values: Vec<f64> = content
            .split_whitespace()
            .map(|token| {
                token.parse::<f64>().map_err(|_| {
                    TriggerError::InvalidConfig(format!("invalid number '{}' in detector table", token))
                })
            })
            .collect::<Result<_>>()?;

        let n = antenna_count_for(values.len()).ok_or_else(|| {
            TriggerError::InvalidConfig(format!(
                "detector table has {} values; expected N delays followed by N x N distances",
                values.len()
            ))
        })?;

        let delays = DVector::from_column_slice(&values[..n]);
        let distances = DMatrix::from_row_slice(n, n, &values[n..]);

        log::debug!("Parsed detector table for {} antennas", n);
        Ok(Self { delays, distances })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TriggerError::InvalidConfig(format!(
                "couldn't open detector configuration {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    pub fn antennas(&self) -> usize {
        self.delays.len()
    }
}

/// Solve `n + n^2 = len` for a positive integer `n`.
fn antenna_count_for(len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let estimate = ((len as f64).sqrt()) as usize;
    (estimate.saturating_sub(1)..=estimate + 1).find(|&n| n > 0 && n + n * n == len)
}

/// Read-only view of one channel's calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_id: ChannelId,
    pub antenna_id: u32,
    pub propagation_delay: i64,
    /// Coincidence window against every other channel, in samples
    pub distance_window: Vec<i64>,
}

/// Per-channel propagation delays and pairwise coincidence windows, in samples.
///
/// Built once at startup and immutable afterwards.
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    antenna_ids: Vec<u32>,
    delays: DVector<i64>,
    windows: DMatrix<i64>,
}

impl ChannelRegistry {
    /// Remap the detector table onto the antennas present in this run.
    ///
    /// # Arguments
    /// * `table` - Detector calibration indexed by antenna id
    /// * `antenna_ids` - Antenna id of each channel, in channel order
    pub fn from_table(table: &DetectorTable, antenna_ids: &[u32]) -> Result<Self> {
        let n_table = table.antennas();
        if let Some(&bad) = antenna_ids.iter().find(|&&id| id as usize >= n_table) {
            return Err(TriggerError::InvalidConfig(format!(
                "antenna id {} not present in detector table ({} antennas)",
                bad, n_table
            )));
        }

        let n = antenna_ids.len();
        let delays = DVector::from_fn(n, |i, _| {
            round_to_samples(table.delays[antenna_ids[i] as usize])
        });
        let windows = DMatrix::from_fn(n, n, |i, j| {
            let distance = table.distances[(antenna_ids[i] as usize, antenna_ids[j] as usize)];
            round_to_samples(distance / SPEED_OF_LIGHT / SAMPLE_PERIOD * WINDOW_SAFETY_FACTOR)
        });

        log::info!(
            "Channel registry built for antennas {:?} (max window {} samples)",
            antenna_ids,
            windows.iter().copied().max().unwrap_or(0)
        );

        Ok(Self {
            antenna_ids: antenna_ids.to_vec(),
            delays,
            windows,
        })
    }

    /// Zero delays and the same window between every pair of channels.
    pub fn uniform(channels: usize, window: i64) -> Self {
        Self {
            antenna_ids: (0..channels as u32).collect(),
            delays: DVector::zeros(channels),
            windows: DMatrix::from_element(channels, channels, window),
        }
    }

    pub fn from_parts(delays: Vec<i64>, windows: Vec<Vec<i64>>) -> Result<Self> {
        let n = delays.len();
        if windows.len() != n || windows.iter().any(|row| row.len() != n) {
            return Err(TriggerError::InvalidConfig(format!(
                "window matrix must be {} x {}",
                n, n
            )));
        }
        if windows.iter().flatten().any(|&w| w < 0) {
            return Err(TriggerError::InvalidConfig("coincidence windows must not be negative".into()));
        }

        Ok(Self {
            antenna_ids: (0..n as u32).collect(),
            delays: DVector::from_vec(delays),
            windows: DMatrix::from_fn(n, n, |i, j| windows[i][j]),
        })
    }

    pub fn len(&self) -> usize {
        self.delays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }

    pub fn antenna_id(&self, channel: ChannelId) -> u32 {
        self.antenna_ids[channel]
    }

    pub fn delay(&self, channel: ChannelId) -> i64 {
        self.delays[channel]
    }

    /// Calibrated window between a cluster seed and a candidate channel.
    pub fn window(&self, seed: ChannelId, candidate: ChannelId) -> i64 {
        self.windows[(seed, candidate)]
    }

    /// Largest window any channel can have against `seed`.
    pub fn horizon(&self, seed: ChannelId) -> i64 {
        self.windows.row(seed).iter().copied().max().unwrap_or(0)
    }

    /// Shift a local sample time into the common reference frame.
    pub fn correct(&self, channel: ChannelId, sample_time: i64) -> i64 {
        sample_time - self.delays[channel]
    }

    pub fn channel(&self, channel: ChannelId) -> ChannelConfig {
        ChannelConfig {
            channel_id: channel,
            antenna_id: self.antenna_ids[channel],
            propagation_delay: self.delays[channel],
            distance_window: self.windows.row(channel).iter().copied().collect(),
        }
    }
}
