// Pluggable sample sources
//
// A source owns two fixed-size buffers that an external producer fills
// alternately, plus the epoch counter that counts completed swaps. The
// consumer only ever reads the buffer selected by the current epoch; the
// producer only ever writes the other one. The mapped source never locks
// against the board: its epoch word is the whole protocol.
//
// Implementations:
// - Memory: in-process buffer pair driven through a PublishHandle
// - Replay: file replay on a producer thread (simulation mode)
// - Mapped: memory-mapped DMA region written by the acquisition board

mod mapped;
mod memory;
mod replay;

use crate::config::{AcquisitionConfig, SourceKind};
use crate::error::{Result, TriggerError};
use crate::types::{BufferSelector, Epoch};
use crate::wait::HaltSignal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use mapped::{create_region, MappedSource, MAPPED_HEADER_LEN, MAPPED_MAGIC};
pub use memory::{MemorySource, PublishHandle};
pub use replay::ReplaySource;

/// Configuration for the source variants, selected once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceConfig {
    /// File replay at a fixed swap pace
    #[serde(rename = "replay")]
    Replay {
        path: PathBuf,
        buffer_size: usize,
        swap_interval_ms: u64,
        #[serde(default)]
        loop_playback: bool,
    },

    /// Hardware DMA region exposed as a mappable file
    #[serde(rename = "mapped")]
    Mapped {
        path: PathBuf,
        #[serde(default = "default_trigger_wait_ms")]
        trigger_wait_ms: u64,
    },
}

fn default_trigger_wait_ms() -> u64 {
    AcquisitionConfig::default().trigger_wait_ms
}

impl SourceConfig {
    pub fn replay(path: impl Into<PathBuf>, acquisition: &AcquisitionConfig) -> Self {
        SourceConfig::Replay {
            path: path.into(),
            buffer_size: acquisition.buffer_size,
            swap_interval_ms: acquisition.swap_interval_ms,
            loop_playback: acquisition.loop_playback,
        }
    }

    pub fn mapped(path: impl Into<PathBuf>, acquisition: &AcquisitionConfig) -> Self {
        SourceConfig::Mapped {
            path: path.into(),
            trigger_wait_ms: acquisition.trigger_wait_ms,
        }
    }

    /// Source of the kind named by `acquisition.source`, reading from `path`.
    pub fn select(path: impl Into<PathBuf>, acquisition: &AcquisitionConfig) -> Self {
        match acquisition.source {
            SourceKind::Replay => Self::replay(path, acquisition),
            SourceKind::Mapped => Self::mapped(path, acquisition),
        }
    }
}

/// Continuous producer behind a ping-pong buffer pair.
///
/// `read_into` must only be called for the buffer selected by the epoch the
/// caller last observed; the source itself does not enforce ownership.
pub trait SampleSource: Send {
    /// Begin acquisition. Blocks until the producer is running or `halt`
    /// is raised, in which case it returns `TriggerError::Halted`.
    fn start(&mut self, halt: &HaltSignal) -> Result<()>;

    /// Completed swaps since start. Zero means no buffer is readable yet.
    ///
    /// A hard producer fault surfaces here as `TriggerError::Device`.
    fn current_epoch(&self) -> Result<Epoch>;

    /// Copy `dest.len()` bytes starting at `offset` out of one buffer.
    fn read_into(&self, selector: BufferSelector, offset: usize, dest: &mut [u8]) -> Result<()>;

    fn read(&self, selector: BufferSelector, offset: usize, length: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; length];
        self.read_into(selector, offset, &mut bytes)?;
        Ok(bytes)
    }

    /// Size of each of the two buffers, in bytes
    fn capacity(&self) -> usize;

    fn stop(&mut self) -> Result<()>;

    fn describe(&self) -> String;
}

/// Bounds check shared by every source's `read_into`.
pub(crate) fn check_range(offset: usize, length: usize, capacity: usize) -> Result<()> {
    match offset.checked_add(length) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(TriggerError::InvalidLength { length, capacity }),
    }
}

/// Build the configured source
pub fn create_source(config: &SourceConfig) -> Result<Box<dyn SampleSource>> {
    match config {
        SourceConfig::Replay {
            path,
            buffer_size,
            swap_interval_ms,
            loop_playback,
        } => Ok(Box::new(ReplaySource::new(
            path.clone(),
            *buffer_size,
            *swap_interval_ms,
            *loop_playback,
        )?)),

        SourceConfig::Mapped {
            path,
            trigger_wait_ms,
        } => Ok(Box::new(MappedSource::open(path, *trigger_wait_ms)?)),
    }
}
