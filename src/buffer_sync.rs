use crate::config::AcquisitionConfig;
use crate::error::{Result, TriggerError};
use crate::source::SampleSource;
use crate::types::{BufferSelector, Epoch, OverrunWarning};
use crate::wait::{BoundedWait, HaltSignal, WaitOutcome};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Counters kept alongside the hand-off bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionStats {
    pub swaps: u64,
    pub overruns: u64,
    pub missed_swaps: u64,
    pub chunks: u64,
    pub bytes: u64,
}

/// Consumer-side view of the ping-pong protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionState {
    pub last_epoch: Epoch,
    /// Byte offset into the idle buffer of `last_epoch`, in `[0, capacity]`
    pub cursor: usize,
    pub capacity: usize,
    /// False until the first swap has been seen
    pub observed: bool,
    pub stats: AcquisitionStats,
}

impl AcquisitionState {
    pub fn new(capacity: usize) -> Self {
        Self {
            last_epoch: 0,
            // Nothing readable before the first swap
            cursor: capacity,
            capacity,
            observed: false,
            stats: AcquisitionStats::default(),
        }
    }

    pub fn idle_buffer(&self) -> BufferSelector {
        BufferSelector::for_epoch(self.last_epoch)
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.cursor
    }

    /// Take `epoch` as the new idle buffer and reset the cursor.
    fn advance(&mut self, epoch: Epoch) -> Option<OverrunWarning> {
        let overrun = if self.observed && epoch > self.last_epoch + 1 {
            Some(OverrunWarning {
                previous: self.last_epoch,
                current: epoch,
            })
        } else {
            None
        };

        if let Some(warning) = overrun {
            self.stats.overruns += 1;
            self.stats.missed_swaps += warning.missed_swaps();
            log::warn!(
                "Buffer overrun: epoch jumped from {} to {} ({} swap(s) lost)",
                warning.previous,
                warning.current,
                warning.missed_swaps()
            );
        }

        self.last_epoch = epoch;
        self.cursor = 0;
        self.observed = true;
        self.stats.swaps += 1;
        overrun
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwapReport {
    pub epoch: Epoch,
    pub previous: Epoch,
    pub overrun: Option<OverrunWarning>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRead {
    pub bytes: Vec<u8>,
    pub epoch: Epoch,
    pub cursor_before: usize,
    pub overrun: Option<OverrunWarning>,
}

/// Hands fixed-size chunks from a continuously swapping source to one consumer.
pub struct BufferSync {
    source: Box<dyn SampleSource>,
    state: AcquisitionState,
    wait: BoundedWait,
    stall_timeout: Duration,
    halt: HaltSignal,
}

impl BufferSync {
    pub fn new(source: Box<dyn SampleSource>, config: &AcquisitionConfig, halt: HaltSignal) -> Self {
        let capacity = source.capacity();
        Self {
            source,
            state: AcquisitionState::new(capacity),
            wait: BoundedWait::new(config.swap_timeout(), config.poll_interval()),
            stall_timeout: config.stall_timeout(),
            halt,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        log::info!("Starting acquisition from {}", self.source.describe());
        self.source.start(&self.halt)
    }

    pub fn stop(&mut self) -> Result<()> {
        self.source.stop()
    }

    pub fn state(&self) -> &AcquisitionState {
        &self.state
    }

    pub fn capacity(&self) -> usize {
        self.state.capacity
    }

    pub fn swap_timeout(&self) -> Duration {
        self.wait.timeout
    }

    pub fn current_epoch(&self) -> Result<Epoch> {
        self.source.current_epoch()
    }

    /// Poll until the epoch moves past `last_epoch`.
    fn wait_past_last(&self, timeout: Duration) -> Result<WaitOutcome<Epoch>> {
        let last = self.state.last_epoch;
        let source = &self.source;
        self.wait.with_timeout(timeout).until(&self.halt, || {
            let epoch = source.current_epoch()?;
            if epoch < last {
                return Err(TriggerError::ProtocolViolation {
                    last,
                    current: epoch,
                });
            }
            Ok((epoch > last).then_some(epoch))
        })
    }

    /// Block until the next swap, then make its idle buffer current.
    ///
    /// # Errors
    /// * `SyncTimeout` when no swap happens within `timeout`
    /// * `Device` when the source reports a hard fault
    /// * `Halted` when the halt signal is raised while waiting
    pub fn wait_for_swap(&mut self, timeout: Duration) -> Result<SwapReport> {
        let previous = self.state.last_epoch;
        match self.wait_past_last(timeout)? {
            WaitOutcome::Ready(epoch) => {
                let overrun = self.state.advance(epoch);
                log::trace!("Swap observed: epoch {} -> {}", previous, epoch);
                Ok(SwapReport {
                    epoch,
                    previous,
                    overrun,
                })
            }
            WaitOutcome::TimedOut { waited } => {
                log::warn!("No buffer swap after epoch {} within {:?}", previous, waited);
                Err(TriggerError::SyncTimeout {
                    epoch: previous,
                    waited_ms: waited.as_millis() as u64,
                })
            }
            WaitOutcome::Halted => Err(TriggerError::Halted),
        }
    }

    /// Copy the next `length` bytes of the current idle buffer.
    ///
    /// `length` must divide the buffer capacity. When the idle buffer is used
    /// up, waits (bounded by the stall timeout) for the next swap.
    pub fn read_chunk(&mut self, length: usize) -> Result<ChunkRead> {
        let capacity = self.state.capacity;
        if length == 0 || length > capacity || capacity % length != 0 {
            return Err(TriggerError::InvalidLength { length, capacity });
        }

        let epoch = self.source.current_epoch()?;
        let mut overrun = None;

        if epoch > self.state.last_epoch {
            overrun = self.state.advance(epoch);
        } else if epoch == self.state.last_epoch {
            if self.state.cursor >= capacity {
                match self.wait_past_last(self.stall_timeout)? {
                    WaitOutcome::Ready(next) => overrun = self.state.advance(next),
                    WaitOutcome::TimedOut { waited } => {
                        log::warn!(
                            "Idle buffer of epoch {} exhausted, no swap within {:?}",
                            self.state.last_epoch,
                            waited
                        );
                        return Err(TriggerError::BufferStalled {
                            epoch: self.state.last_epoch,
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    WaitOutcome::Halted => return Err(TriggerError::Halted),
                }
            }
        } else {
            log::error!(
                "Epoch went backwards: last observed {}, source reports {}",
                self.state.last_epoch,
                epoch
            );
            return Err(TriggerError::ProtocolViolation {
                last: self.state.last_epoch,
                current: epoch,
            });
        }

        let epoch = self.state.last_epoch;
        let cursor_before = self.state.cursor;
        let mut bytes = vec![0u8; length];
        self.source
            .read_into(BufferSelector::for_epoch(epoch), cursor_before, &mut bytes)?;

        self.state.cursor += length;
        self.state.stats.chunks += 1;
        self.state.stats.bytes += length as u64;

        Ok(ChunkRead {
            bytes,
            epoch,
            cursor_before,
            overrun,
        })
    }

    /// Wait for the next swap and copy the whole buffer it made idle.
    pub fn capture_idle(&mut self, timeout: Duration) -> Result<ChunkRead> {
        let swap = self.wait_for_swap(timeout)?;
        let capacity = self.state.capacity;
        let mut bytes = vec![0u8; capacity];
        self.source
            .read_into(BufferSelector::for_epoch(swap.epoch), 0, &mut bytes)?;

        self.state.cursor = capacity;
        self.state.stats.chunks += 1;
        self.state.stats.bytes += capacity as u64;

        Ok(ChunkRead {
            bytes,
            epoch: swap.epoch,
            cursor_before: 0,
            overrun: swap.overrun,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemorySource, PublishHandle};

    fn fast_config() -> AcquisitionConfig {
        AcquisitionConfig {
            swap_timeout_ms: 50,
            stall_timeout_ms: 50,
            poll_interval_us: 200,
            ..AcquisitionConfig::default()
        }
    }

    fn sync_with(capacity: usize) -> (BufferSync, PublishHandle) {
        let (source, handle) = MemorySource::new(capacity);
        let sync = BufferSync::new(Box::new(source), &fast_config(), HaltSignal::new());
        (sync, handle)
    }

    #[test]
    fn test_invalid_lengths() {
        let (mut sync, _handle) = sync_with(16);
        for length in [0, 3, 32] {
            assert!(matches!(
                sync.read_chunk(length),
                Err(TriggerError::InvalidLength { .. })
            ));
        }
    }

    #[test]
    fn test_chunks_walk_the_idle_buffer() {
        let (mut sync, handle) = sync_with(8);
        handle.publish(&[0, 1, 2, 3, 4, 5, 6, 7]).unwrap();

        let first = sync.read_chunk(4).unwrap();
        assert_eq!(first.bytes, vec![0, 1, 2, 3]);
        assert_eq!(first.epoch, 1);
        assert_eq!(first.cursor_before, 0);

        let second = sync.read_chunk(4).unwrap();
        assert_eq!(second.bytes, vec![4, 5, 6, 7]);
        assert_eq!(second.cursor_before, 4);
        assert_eq!(sync.state().remaining(), 0);
    }

    #[test]
    fn test_exhausted_buffer_stalls() {
        let (mut sync, handle) = sync_with(4);
        handle.publish(&[1; 4]).unwrap();
        sync.read_chunk(4).unwrap();
        assert!(matches!(
            sync.read_chunk(4),
            Err(TriggerError::BufferStalled { epoch: 1, .. })
        ));
    }

    #[test]
    fn test_no_data_before_first_swap_stalls() {
        let (mut sync, _handle) = sync_with(4);
        assert!(matches!(
            sync.read_chunk(4),
            Err(TriggerError::BufferStalled { epoch: 0, .. })
        ));
    }

    #[test]
    fn test_swap_resets_cursor_and_switches_buffer() {
        let (mut sync, handle) = sync_with(4);
        handle.publish(&[1; 4]).unwrap();
        sync.read_chunk(2).unwrap();
        handle.publish(&[2; 4]).unwrap();

        let chunk = sync.read_chunk(2).unwrap();
        assert_eq!(chunk.epoch, 2);
        assert_eq!(chunk.cursor_before, 0);
        assert_eq!(chunk.bytes, vec![2, 2]);
        assert!(chunk.overrun.is_none());
    }

    #[test]
    fn test_wait_for_swap_times_out() {
        let (mut sync, handle) = sync_with(4);
        handle.publish(&[1; 4]).unwrap();
        sync.wait_for_swap(Duration::from_millis(20)).unwrap();
        assert!(matches!(
            sync.wait_for_swap(Duration::from_millis(20)),
            Err(TriggerError::SyncTimeout { epoch: 1, .. })
        ));
    }

    #[test]
    fn test_wait_for_swap_reports_overrun_once() {
        let (mut sync, handle) = sync_with(4);
        handle.publish(&[1; 4]).unwrap();
        assert!(sync.wait_for_swap(Duration::from_millis(20)).unwrap().overrun.is_none());

        for _ in 0..3 {
            handle.publish(&[2; 4]).unwrap();
        }
        let report = sync.wait_for_swap(Duration::from_millis(20)).unwrap();
        assert_eq!(report.overrun, Some(OverrunWarning { previous: 1, current: 4 }));
        assert_eq!(sync.state().cursor, 0);
        assert_eq!(sync.state().stats.missed_swaps, 2);

        handle.publish(&[3; 4]).unwrap();
        assert!(sync.wait_for_swap(Duration::from_millis(20)).unwrap().overrun.is_none());
        assert_eq!(sync.state().stats.overruns, 1);
    }

    #[test]
    fn test_first_observed_epoch_is_not_an_overrun() {
        let (mut sync, handle) = sync_with(4);
        for _ in 0..5 {
            handle.publish(&[0; 4]).unwrap();
        }
        assert!(sync.read_chunk(4).unwrap().overrun.is_none());
    }

    #[test]
    fn test_device_fault_propagates() {
        let (mut sync, handle) = sync_with(4);
        handle.fault("board lost");
        assert!(matches!(sync.read_chunk(4), Err(TriggerError::Device(_))));
    }

    #[test]
    fn test_capture_idle_reads_full_buffer() {
        let (mut sync, handle) = sync_with(4);
        handle.publish(&[9, 8, 7, 6]).unwrap();
        let capture = sync.capture_idle(Duration::from_millis(20)).unwrap();
        assert_eq!(capture.bytes, vec![9, 8, 7, 6]);
        assert_eq!(capture.epoch, 1);
        assert_eq!(sync.state().remaining(), 0);
    }

    #[test]
    fn test_halt_interrupts_stall() {
        let (source, handle) = MemorySource::new(4);
        let halt = HaltSignal::new();
        let mut config = fast_config();
        config.stall_timeout_ms = 60_000;
        let mut sync = BufferSync::new(Box::new(source), &config, halt.clone());
        handle.publish(&[0; 4]).unwrap();
        sync.read_chunk(4).unwrap();

        halt.raise();
        assert!(matches!(sync.read_chunk(4), Err(TriggerError::Halted)));
    }
}
