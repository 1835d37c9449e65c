use crate::config::DetectorConfig;
use crate::types::{CandidateEvent, ChannelId, Epoch, Sample};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Statistics of one sub-window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubWindowStats {
    pub mean: f32,
    pub stddev: f32,
    /// Index of the sample furthest from the mean (first one on ties)
    pub peak_index: usize,
    pub peak_deviation: f32,
}

impl SubWindowStats {
    pub fn compute(samples: &[Sample]) -> Self {
        let n = samples.len().max(1) as f32;
        let mean = samples.iter().map(|&s| s as f32).sum::<f32>() / n;
        let variance = samples
            .iter()
            .map(|&s| {
                let d = s as f32 - mean;
                d * d
            })
            .sum::<f32>()
            / n;

        let mut peak_index = 0;
        let mut peak_deviation = 0.0f32;
        for (j, &s) in samples.iter().enumerate() {
            let deviation = (s as f32 - mean).abs();
            if deviation > peak_deviation {
                peak_index = j;
                peak_deviation = deviation;
            }
        }

        Self {
            mean,
            stddev: variance.max(0.0).sqrt(),
            peak_index,
            peak_deviation,
        }
    }
}

/// Result of one scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Candidate sample offsets inside the scanned window, ascending
    pub hits: Vec<i64>,
    /// RMS of the per-sub-window standard deviations that were scanned
    pub noise_estimate: f32,
    /// Scan stopped early on the candidate cap
    pub truncated: bool,
    pub sub_windows_scanned: usize,
}

/// Per-sub-window threshold trigger with dead-time suppression.
#[derive(Debug, Clone)]
pub struct SpikeDetector {
    sub_window: usize,
    dead_time: i64,
    max_candidates: usize,
    snippet_len: usize,
}

impl SpikeDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            sub_window: config.sub_window.max(1),
            dead_time: config.dead_time,
            max_candidates: config.max_candidates,
            snippet_len: config.snippet_len,
        }
    }

    pub fn sub_window(&self) -> usize {
        self.sub_window
    }

    /// Scan `window` for transients exceeding `threshold_sigma` standard deviations.
    ///
    /// A trailing partial sub-window is ignored. Identical input always gives
    /// identical output.
    pub fn detect(&self, window: &[Sample], threshold_sigma: f32) -> Detection {
        let stats: Vec<SubWindowStats> = window
            .par_chunks_exact(self.sub_window)
            .map(SubWindowStats::compute)
            .collect();

        let mut hits: Vec<i64> = Vec::new();
        let mut variance_sum = 0.0f64;
        let mut scanned = 0usize;
        let mut truncated = false;

        for (i, s) in stats.iter().enumerate() {
            if hits.len() >= self.max_candidates {
                truncated = true;
                break;
            }

            variance_sum += (s.stddev as f64) * (s.stddev as f64);
            scanned += 1;

            if s.peak_deviation > threshold_sigma * s.stddev {
                let t = (i * self.sub_window + s.peak_index) as i64;
                match hits.last() {
                    Some(&previous) if t - previous < self.dead_time => {
                        log::trace!("Candidate at {} suppressed (dead time after {})", t, previous);
                    }
                    _ => hits.push(t),
                }
            }
        }

        if truncated {
            log::warn!(
                "Candidate cap of {} reached after {} of {} sub-windows; scan truncated",
                self.max_candidates,
                scanned,
                stats.len()
            );
        }

        let noise_estimate = if scanned == 0 {
            0.0
        } else {
            (variance_sum / scanned as f64).sqrt() as f32
        };

        Detection {
            hits,
            noise_estimate,
            truncated,
            sub_windows_scanned: scanned,
        }
    }

    /// Waveform around sample `t`: `snippet_len` bytes centred on it, clamped
    /// into the window.
    pub fn snippet(&self, window: &[Sample], t: i64) -> Vec<Sample> {
        let len = self.snippet_len.min(window.len());
        let latest_start = (window.len() - len) as i64;
        let start = (t - (len / 2) as i64).clamp(0, latest_start) as usize;
        window[start..start + len].to_vec()
    }

    /// Turn a detection into candidate events carrying their waveforms.
    pub fn candidates(
        &self,
        channel_id: ChannelId,
        epoch: Epoch,
        window: &[Sample],
        detection: &Detection,
    ) -> Vec<CandidateEvent> {
        detection
            .hits
            .iter()
            .map(|&t| CandidateEvent {
                channel_id,
                local_sample_time: t,
                waveform: self.snippet(window, t),
                epoch,
                noise_estimate: detection.noise_estimate,
            })
            .collect()
    }
}
