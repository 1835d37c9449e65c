// Background noise monitor
//
// Every interval, capture one idle buffer and keep its first `length` bytes
// in BACK_data.bin, plus a [wall seconds, 10 x stddev, mean, max] record of
// four little-endian i32 in BACK_time.bin. Runs on a single antenna without
// any coincidence logic, so the noise floor can be tracked over a day.

use crate::buffer_sync::BufferSync;
use crate::config::BackgroundConfig;
use crate::detector::SubWindowStats;
use crate::error::{Result, TriggerError};
use crate::recorder::{append_paired, Recorder};
use crate::types::Epoch;
use crate::wait::{BoundedWait, HaltSignal, WaitOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const BACK_DATA_TAG: &str = "BACK_data.bin";
pub const BACK_TIME_TAG: &str = "BACK_time.bin";

const HALT_POLL: Duration = Duration::from_millis(20);

/// Noise figures of one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundSample {
    pub wall_time: DateTime<Utc>,
    pub epoch: Epoch,
    pub mean: f32,
    pub stddev: f32,
    pub max: u8,
}

impl BackgroundSample {
    pub fn measure(samples: &[u8], epoch: Epoch, wall_time: DateTime<Utc>) -> Self {
        let stats = SubWindowStats::compute(samples);
        Self {
            wall_time,
            epoch,
            mean: stats.mean,
            stddev: stats.stddev,
            max: samples.iter().copied().max().unwrap_or(0),
        }
    }

    /// `[wall seconds, 10 x stddev, mean, max]`, truncated toward zero
    pub fn record(&self) -> [i32; 4] {
        [
            self.wall_time.timestamp() as i32,
            (10.0 * self.stddev) as i32,
            self.mean as i32,
            self.max as i32,
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackgroundSummary {
    pub snapshots: u64,
    /// Snapshots skipped because no buffer swap arrived in time
    pub stalled: u64,
    pub recorder_errors: u64,
    pub last: Option<BackgroundSample>,
}

/// Periodic snapshot loop over one sample source.
pub struct BackgroundMonitor {
    sync: BufferSync,
    recorder: Box<dyn Recorder>,
    interval: Duration,
    length: usize,
    halt: HaltSignal,
}

impl BackgroundMonitor {
    pub fn new(
        sync: BufferSync,
        recorder: Box<dyn Recorder>,
        config: &BackgroundConfig,
        halt: HaltSignal,
    ) -> Result<Self> {
        let capacity = sync.capacity();
        if config.length == 0 || config.length > capacity {
            return Err(TriggerError::InvalidLength {
                length: config.length,
                capacity,
            });
        }
        Ok(Self {
            sync,
            recorder,
            interval: config.interval(),
            length: config.length,
            halt,
        })
    }

    /// Capture the next idle buffer and append its snapshot.
    pub fn snapshot(&mut self) -> Result<BackgroundSample> {
        let timeout = self.sync.swap_timeout();
        let chunk = self.sync.capture_idle(timeout)?;
        let samples = &chunk.bytes[..self.length];
        let sample = BackgroundSample::measure(samples, chunk.epoch, Utc::now());

        let record: Vec<u8> = sample.record().into_iter().flat_map(i32::to_le_bytes).collect();
        append_paired(
            self.recorder.as_mut(),
            (BACK_DATA_TAG, samples),
            (BACK_TIME_TAG, record.as_slice()),
        )?;
        Ok(sample)
    }

    /// Take snapshots until halted or `count` snapshots are stored.
    pub fn run(mut self, count: Option<u64>) -> Result<BackgroundSummary> {
        match self.sync.start() {
            Ok(()) => {}
            Err(TriggerError::Halted) => return Ok(BackgroundSummary::default()),
            Err(e) => return Err(e),
        }
        for tag in [BACK_DATA_TAG, BACK_TIME_TAG] {
            self.recorder.clear(tag)?;
        }

        let result = self.snapshot_loop(count);
        if let Err(e) = self.sync.stop() {
            log::warn!("Error stopping acquisition: {}", e);
        }
        result
    }

    fn snapshot_loop(&mut self, count: Option<u64>) -> Result<BackgroundSummary> {
        let mut summary = BackgroundSummary::default();
        let pause = BoundedWait::new(self.interval, HALT_POLL.min(self.interval));

        loop {
            if count.is_some_and(|max| summary.snapshots >= max) || self.halt.is_raised() {
                break;
            }

            match self.snapshot() {
                Ok(sample) => {
                    let [t, std10, mean, max] = sample.record();
                    log::info!(
                        "snapshot {}: t={}, 10*std={:3}, mean={:3}, max={:3}",
                        summary.snapshots,
                        t,
                        std10,
                        mean,
                        max
                    );
                    summary.snapshots += 1;
                    summary.last = Some(sample);
                }
                Err(TriggerError::Halted) => break,
                Err(e) if e.is_acquisition_stall() => {
                    log::warn!("{}; skipping this snapshot", e);
                    summary.stalled += 1;
                }
                Err(e @ TriggerError::RecorderWrite(_)) => {
                    log::warn!("{}; snapshot lost", e);
                    summary.recorder_errors += 1;
                }
                Err(e) => return Err(e),
            }

            if count.is_some_and(|max| summary.snapshots >= max) {
                break;
            }
            if matches!(pause.until(&self.halt, || Ok(None::<()>))?, WaitOutcome::Halted) {
                break;
            }
        }

        log::info!(
            "Background monitor stopped after {} snapshot(s), {} stalled",
            summary.snapshots,
            summary.stalled
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcquisitionConfig;
    use crate::recorder::{decode_time_records, MemoryRecorder};
    use crate::source::{MemorySource, PublishHandle};
    use chrono::TimeZone;

    fn monitor(length: usize) -> (BackgroundMonitor, PublishHandle, MemoryRecorder) {
        let acquisition = AcquisitionConfig {
            swap_timeout_ms: 100,
            poll_interval_us: 200,
            ..AcquisitionConfig::default()
        };
        let (source, handle) = MemorySource::new(8);
        let sync = BufferSync::new(Box::new(source), &acquisition, HaltSignal::new());
        let store = MemoryRecorder::new();
        let config = BackgroundConfig {
            interval_s: 0.01,
            length,
        };
        let monitor =
            BackgroundMonitor::new(sync, Box::new(store.clone()), &config, HaltSignal::new()).unwrap();
        (monitor, handle, store)
    }

    #[test]
    fn test_record_layout() {
        let samples = [100u8, 104, 100, 104, 100, 104, 100, 140];
        let sample = BackgroundSample::measure(&samples, 3, Utc.timestamp_opt(1_300_000_000, 0).unwrap());
        // mean 106.5, population stddev ~12.80
        assert_eq!(sample.record(), [1_300_000_000, 127, 106, 140]);
    }

    #[test]
    fn test_snapshot_keeps_buffer_prefix() {
        let (mut monitor, handle, store) = monitor(4);
        handle.publish(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let sample = monitor.snapshot().unwrap();
        assert_eq!(sample.epoch, 1);
        assert_eq!(sample.max, 4);
        assert_eq!(store.contents(BACK_DATA_TAG), vec![1, 2, 3, 4]);
        let records = decode_time_records(&store.contents(BACK_TIME_TAG));
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0][1..], &[11, 2, 4]);
    }

    #[test]
    fn test_length_above_capacity_is_rejected() {
        let (source, _handle) = MemorySource::new(8);
        let sync = BufferSync::new(Box::new(source), &AcquisitionConfig::default(), HaltSignal::new());
        let config = BackgroundConfig {
            interval_s: 1.0,
            length: 16,
        };
        assert!(matches!(
            BackgroundMonitor::new(sync, Box::new(MemoryRecorder::new()), &config, HaltSignal::new()),
            Err(TriggerError::InvalidLength { length: 16, capacity: 8 })
        ));
    }

    #[test]
    fn test_run_counts_stalls_and_stops_at_count() {
        let (monitor, handle, store) = monitor(8);
        let producer = std::thread::spawn(move || {
            handle.publish(&[9; 8]).unwrap();
            std::thread::sleep(Duration::from_millis(250));
            handle.publish(&[7; 8]).unwrap();
        });

        let summary = monitor.run(Some(2)).unwrap();
        producer.join().unwrap();
        assert_eq!(summary.snapshots, 2);
        assert!(summary.stalled >= 1);
        assert_eq!(summary.last.as_ref().map(|s| s.epoch), Some(2));
        assert_eq!(store.contents(BACK_DATA_TAG).len(), 16);
        assert_eq!(store.contents(BACK_TIME_TAG).len(), 32);
    }
}
