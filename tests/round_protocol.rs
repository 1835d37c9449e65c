use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use trigger_rs::coincidence::RegistrySource;
use trigger_rs::recorder::{decode_time_records, FileRecorder, MemoryRecorder, DATA_TAG, LOG_TAG, TIME_TAG};
use trigger_rs::source::{MemorySource, PublishHandle, SampleSource};
use trigger_rs::{ArrayReport, BufferSelector, Epoch, HaltSignal, LocalArray, TriggerConfig, WorkerSpec};

const CAPACITY: usize = 256;

/// Short timeouts, 64-sample sub-windows, pairs are enough for a coincidence.
fn test_config(rounds: u64) -> TriggerConfig {
    let mut config = TriggerConfig::default();
    config.detector.threshold_sigma = 5.0;
    config.detector.sub_window = 64;
    config.detector.dead_time = 8;
    config.detector.snippet_len = 16;
    config.acquisition.buffer_size = CAPACITY;
    config.acquisition.swap_timeout_ms = 150;
    config.acquisition.stall_timeout_ms = 150;
    config.acquisition.poll_interval_us = 500;
    config.coincidence.multiplicity = 2;
    config.coincidence.handshake_timeout_ms = 5_000;
    config.coincidence.barrier_timeout_ms = 5_000;
    config.coincidence.round_timeout_ms = 5_000;
    config.coincidence.max_rounds = Some(rounds);
    config
}

/// Alternating 100/102 baseline with a single 200 spike per entry of `spikes`.
fn buffer_with_spikes(spikes: &[usize]) -> Vec<u8> {
    let mut buffer: Vec<u8> = (0..CAPACITY).map(|i| if i % 2 == 0 { 100 } else { 102 }).collect();
    for &t in spikes {
        buffer[t] = 200;
    }
    buffer
}

struct Antenna {
    handle: PublishHandle,
    recorder: MemoryRecorder,
}

fn add_antenna(array: &mut LocalArray, antenna_id: u32) -> Antenna {
    let (source, handle) = MemorySource::new(CAPACITY);
    let recorder = MemoryRecorder::new();
    array.add_worker(WorkerSpec {
        antenna_id,
        source: Box::new(source),
        recorder: Box::new(recorder.clone()),
    });
    Antenna { handle, recorder }
}

fn saved_by(report: &ArrayReport, antenna_id: u32) -> u64 {
    report
        .workers
        .iter()
        .find(|w| w.antenna_id == antenna_id)
        .and_then(|w| w.summary.as_ref())
        .map(|s| s.saved)
        .unwrap()
}

// =============================================================================
// COINCIDENCE ROUNDS
// =============================================================================

#[test]
fn test_pair_inside_window_is_saved_outlier_is_not() {
    let mut array = LocalArray::new(test_config(1), RegistrySource::Uniform { window: 10 });
    let a = add_antenna(&mut array, 0);
    let b = add_antenna(&mut array, 1);
    let c = add_antenna(&mut array, 2);

    a.handle.publish(&buffer_with_spikes(&[70])).unwrap();
    b.handle.publish(&buffer_with_spikes(&[75])).unwrap();
    c.handle.publish(&buffer_with_spikes(&[200])).unwrap();

    let report = array.run().unwrap();
    assert!(report.is_success(), "{:?}", report);
    assert_eq!(report.saved_events(), 2);
    assert_eq!(saved_by(&report, 0), 1);
    assert_eq!(saved_by(&report, 1), 1);
    assert_eq!(saved_by(&report, 2), 0);

    let coordinator = report.coordinator.as_ref().unwrap();
    assert_eq!(coordinator.rounds, 1);
    assert_eq!(coordinator.candidates, 3);
    assert_eq!(coordinator.accepted, 2);
    assert_eq!(coordinator.clusters, 1);
    assert_eq!(coordinator.antenna_ids, vec![0, 1, 2]);

    // [wall seconds, epoch, sub-window index, offset in sub-window]
    let records = decode_time_records(&a.recorder.contents(TIME_TAG));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0][1], 1);
    assert_eq!(records[0][2], 1);
    assert_eq!(records[0][3], 6);
    assert_eq!(a.recorder.contents(DATA_TAG).len(), 16);

    assert!(c.recorder.contents(TIME_TAG).is_empty());
    let log = String::from_utf8(c.recorder.contents(LOG_TAG)).unwrap();
    assert_eq!(log.lines().count(), 1);
}

#[test]
fn test_multiplicity_above_hits_rejects_everything() {
    let mut config = test_config(1);
    config.coincidence.multiplicity = 3;
    let mut array = LocalArray::new(config, RegistrySource::Uniform { window: 10 });
    let a = add_antenna(&mut array, 0);
    let b = add_antenna(&mut array, 1);

    a.handle.publish(&buffer_with_spikes(&[70])).unwrap();
    b.handle.publish(&buffer_with_spikes(&[72])).unwrap();

    let report = array.run().unwrap();
    assert!(report.is_success());
    assert_eq!(report.saved_events(), 0);
    assert_eq!(report.coordinator.unwrap().candidates, 2);
}

#[test]
fn test_propagation_delay_brings_late_channel_into_window() {
    let registry = trigger_rs::ChannelRegistry::from_parts(
        vec![0, 100],
        vec![vec![0, 5], vec![5, 0]],
    )
    .unwrap();
    let mut array = LocalArray::new(test_config(1), RegistrySource::Fixed(registry));
    let a = add_antenna(&mut array, 0);
    let b = add_antenna(&mut array, 1);

    a.handle.publish(&buffer_with_spikes(&[40])).unwrap();
    b.handle.publish(&buffer_with_spikes(&[142])).unwrap();

    let report = array.run().unwrap();
    assert!(report.is_success());
    assert_eq!(report.saved_events(), 2);
}

#[test]
fn test_stalled_worker_contributes_nothing() {
    let mut array = LocalArray::new(test_config(1), RegistrySource::Uniform { window: 10 });
    let a = add_antenna(&mut array, 0);
    let b = add_antenna(&mut array, 1);
    let stalled = add_antenna(&mut array, 2);

    a.handle.publish(&buffer_with_spikes(&[70])).unwrap();
    b.handle.publish(&buffer_with_spikes(&[75])).unwrap();

    let report = array.run().unwrap();
    assert!(report.is_success(), "{:?}", report);
    assert_eq!(saved_by(&report, 0), 1);
    assert_eq!(saved_by(&report, 1), 1);

    let summary = report.workers[2].summary.as_ref().unwrap();
    assert_eq!(summary.saved, 0);
    assert_eq!(summary.stalled_rounds, 1);
    let last = summary.last_round.as_ref().unwrap();
    assert_eq!(last.epoch_start, None);
    assert!(!last.integrity_ok);
    assert!(stalled.recorder.contents(TIME_TAG).is_empty());
}

#[test]
fn test_repeated_stalls_halt_the_array() {
    let mut config = test_config(10);
    config.acquisition.max_stalled_rounds = 1;
    let mut array = LocalArray::new(config, RegistrySource::Uniform { window: 10 });
    let a = add_antenna(&mut array, 0);
    let _stalled = add_antenna(&mut array, 1);

    a.handle.publish(&buffer_with_spikes(&[70])).unwrap();

    let report = array.run().unwrap();
    assert!(report.is_success(), "{:?}", report);
    assert_eq!(report.coordinator.as_ref().unwrap().rounds, 1);
    for worker in &report.workers {
        assert_eq!(worker.summary.as_ref().unwrap().rounds, 1);
    }
}

#[test]
fn test_raised_halt_stops_before_first_round() {
    let mut array = LocalArray::new(test_config(5), RegistrySource::Uniform { window: 10 });
    let _a = add_antenna(&mut array, 0);
    let _b = add_antenna(&mut array, 1);
    array.halt_signal().raise();

    let report = array.run().unwrap();
    assert!(report.is_success());
    assert_eq!(report.saved_events(), 0);
    assert_eq!(report.coordinator.unwrap().rounds, 0);
}

#[test]
fn test_array_needs_workers() {
    let array = LocalArray::new(test_config(1), RegistrySource::Uniform { window: 10 });
    assert!(array.run().is_err());
}

/// Memory source whose producer swaps again right after every read, so the
/// captured buffer is already being overwritten when detection finishes.
struct OverwrittenSource {
    inner: MemorySource,
    reads: AtomicU64,
}

impl SampleSource for OverwrittenSource {
    fn start(&mut self, halt: &HaltSignal) -> trigger_rs::Result<()> {
        self.inner.start(halt)
    }

    fn current_epoch(&self) -> trigger_rs::Result<Epoch> {
        Ok(self.inner.current_epoch()? + self.reads.load(Ordering::SeqCst))
    }

    fn read_into(&self, selector: BufferSelector, offset: usize, dest: &mut [u8]) -> trigger_rs::Result<()> {
        self.inner.read_into(selector, offset, dest)?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn stop(&mut self) -> trigger_rs::Result<()> {
        self.inner.stop()
    }

    fn describe(&self) -> String {
        "overwritten memory".to_string()
    }
}

#[test]
fn test_buffer_overwritten_during_detection_drops_accepted_events() {
    let mut array = LocalArray::new(test_config(1), RegistrySource::Uniform { window: 10 });
    let a = add_antenna(&mut array, 0);

    let (inner, handle) = MemorySource::new(CAPACITY);
    let overwritten = MemoryRecorder::new();
    array.add_worker(WorkerSpec {
        antenna_id: 1,
        source: Box::new(OverwrittenSource {
            inner,
            reads: AtomicU64::new(0),
        }),
        recorder: Box::new(overwritten.clone()),
    });

    a.handle.publish(&buffer_with_spikes(&[70])).unwrap();
    handle.publish(&buffer_with_spikes(&[72])).unwrap();

    let report = array.run().unwrap();
    assert!(report.is_success(), "{:?}", report);
    // The coordinator accepted the pair, but only the intact side commits it
    assert_eq!(report.coordinator.as_ref().unwrap().accepted, 2);
    assert_eq!(saved_by(&report, 0), 1);
    assert_eq!(saved_by(&report, 1), 0);

    let summary = report.workers[1].summary.as_ref().unwrap();
    assert_eq!(summary.integrity_failures, 1);
    let last = summary.last_round.as_ref().unwrap();
    assert_eq!(last.epoch_start, Some(1));
    assert_eq!(last.epoch_stop, Some(2));
    assert!(!last.integrity_ok);
    assert!(overwritten.contents(TIME_TAG).is_empty());
    assert!(overwritten.contents(DATA_TAG).is_empty());
    assert_eq!(a.recorder.contents(TIME_TAG).len(), 16);
}

// =============================================================================
// FILE OUTPUT
// =============================================================================

#[test]
fn test_file_recorder_layout_after_a_round() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(1);
    let mut array = LocalArray::new(config, RegistrySource::Uniform { window: 10 });

    let mut handles = Vec::new();
    for (antenna_id, spike) in [(0u32, 70usize), (1, 73)] {
        let (source, handle) = MemorySource::new(CAPACITY);
        let recorder = FileRecorder::create(dir.path(), 7, antenna_id + 101).unwrap();
        array.add_worker(WorkerSpec {
            antenna_id,
            source: Box::new(source),
            recorder: Box::new(recorder),
        });
        handle.publish(&buffer_with_spikes(&[spike])).unwrap();
        handles.push(handle);
    }

    let report = array.run().unwrap();
    assert!(report.is_success());

    let run_dir = dir.path().join("R000007");
    for host in [101, 102] {
        let time = fs::read(run_dir.join(format!("R000007_A{:04}_time.bin", host))).unwrap();
        let data = fs::read(run_dir.join(format!("R000007_A{:04}_data.bin", host))).unwrap();
        let log = fs::read_to_string(run_dir.join(format!("R000007_A{:04}_log.txt", host))).unwrap();
        assert_eq!(time.len(), 16);
        assert_eq!(data.len(), 16);
        assert_eq!(log.lines().count(), 1);

        // t0, four stage durations, then round epoch_start epoch_stop candidates saved noise
        let fields: Vec<&str> = log.split_whitespace().collect();
        assert_eq!(fields.len(), 11);
        assert_eq!(&fields[5..10], &["0", "1", "1", "1", "1"]);
    }
}
