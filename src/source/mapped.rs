//! Hardware-backed source over a memory-mapped DMA region.
//!
//! Region layout:
//! ```text
//! Header (64 bytes):
//!   [0:8]    Magic "TRIGDMA1"
//!   [8:16]   Epoch (u64 LE, incremented by the board after each swap)
//!   [16:20]  Fault word (u32, non-zero = hard fault)
//!   [20:24]  Buffer capacity in bytes (u32 LE)
//!   [24:64]  Reserved
//! Buffer A (capacity bytes), then buffer B (capacity bytes)
//! ```
//! The board writes, this side only reads. Register programming and DMA
//! bring-up happen elsewhere.

use super::{check_range, SampleSource};
use crate::error::{Result, TriggerError};
use crate::types::{BufferSelector, Epoch};
use crate::wait::{BoundedWait, HaltSignal, WaitOutcome};
use memmap2::MmapRaw;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

pub const MAPPED_MAGIC: &[u8; 8] = b"TRIGDMA1";
pub const MAPPED_HEADER_LEN: usize = 64;

const EPOCH_OFFSET: usize = 8;
const FAULT_OFFSET: usize = 16;
const CAPACITY_OFFSET: usize = 20;
const START_POLL: Duration = Duration::from_millis(10);

pub struct MappedSource {
    path: PathBuf,
    map: MmapRaw,
    capacity: usize,
    trigger_wait: Duration,
}

impl MappedSource {
    pub fn open<P: AsRef<Path>>(path: P, trigger_wait_ms: u64) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                TriggerError::Device(format!("cannot open DMA region {}: {}", path.display(), e))
            })?;
        let map = MmapRaw::map_raw(&file)?;

        if map.len() < MAPPED_HEADER_LEN {
            return Err(TriggerError::Device(format!(
                "DMA region {} is too short for its header ({} bytes)",
                path.display(),
                map.len()
            )));
        }

        let header = unsafe { std::slice::from_raw_parts(map.as_ptr(), MAPPED_HEADER_LEN) };
        if &header[..8] != MAPPED_MAGIC {
            return Err(TriggerError::Device(format!(
                "DMA region {} has bad magic {:?}",
                path.display(),
                &header[..8]
            )));
        }
        let mut capacity_bytes = [0u8; 4];
        capacity_bytes.copy_from_slice(&header[CAPACITY_OFFSET..CAPACITY_OFFSET + 4]);
        let capacity = u32::from_le_bytes(capacity_bytes) as usize;

        let required = MAPPED_HEADER_LEN + 2 * capacity;
        if capacity == 0 || map.len() < required {
            return Err(TriggerError::Device(format!(
                "DMA region {} holds {} bytes, header announces 2 x {} byte buffers",
                path.display(),
                map.len(),
                capacity
            )));
        }

        log::info!("Mapped DMA region {} ({} bytes per buffer)", path.display(), capacity);
        Ok(Self {
            path: path.to_path_buf(),
            map,
            capacity,
            trigger_wait: Duration::from_millis(trigger_wait_ms),
        })
    }

    fn epoch_word(&self) -> &AtomicU64 {
        // Page-aligned mapping, so offset 8 is 8-byte aligned.
        unsafe { &*(self.map.as_ptr().add(EPOCH_OFFSET) as *const AtomicU64) }
    }

    fn fault_word(&self) -> &AtomicU32 {
        unsafe { &*(self.map.as_ptr().add(FAULT_OFFSET) as *const AtomicU32) }
    }
}

impl SampleSource for MappedSource {
    /// Wait for the operator trigger: the first completed swap.
    fn start(&mut self, halt: &HaltSignal) -> Result<()> {
        log::info!(
            "Waiting up to {:?} for the first DMA buffer on {}",
            self.trigger_wait,
            self.path.display()
        );
        let wait = BoundedWait::new(self.trigger_wait, START_POLL);
        match wait.until(halt, || {
            let epoch = self.current_epoch()?;
            Ok((epoch > 0).then_some(epoch))
        })? {
            WaitOutcome::Ready(epoch) => {
                log::info!("DMA running, epoch {}", epoch);
                Ok(())
            }
            WaitOutcome::TimedOut { waited } => Err(TriggerError::Device(format!(
                "no DMA buffer after {} ms on {}",
                waited.as_millis(),
                self.path.display()
            ))),
            WaitOutcome::Halted => Err(TriggerError::Halted),
        }
    }

    fn current_epoch(&self) -> Result<Epoch> {
        let fault = self.fault_word().load(Ordering::Acquire);
        if fault != 0 {
            return Err(TriggerError::Device(format!(
                "DMA fault word 0x{:08x} on {}",
                fault,
                self.path.display()
            )));
        }
        Ok(u64::from_le(self.epoch_word().load(Ordering::Acquire)))
    }

    fn read_into(&self, selector: BufferSelector, offset: usize, dest: &mut [u8]) -> Result<()> {
        check_range(offset, dest.len(), self.capacity)?;
        let start = MAPPED_HEADER_LEN + selector.index() * self.capacity + offset;
        unsafe {
            std::ptr::copy_nonoverlapping(self.map.as_ptr().add(start), dest.as_mut_ptr(), dest.len());
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn stop(&mut self) -> Result<()> {
        log::debug!("Released DMA region {}", self.path.display());
        Ok(())
    }

    fn describe(&self) -> String {
        format!("mapped {}", self.path.display())
    }
}

/// Create an empty region file (epoch 0, no fault) for a board or simulator to fill.
pub fn create_region<P: AsRef<Path>>(path: P, capacity: usize) -> Result<()> {
    let capacity_word = u32::try_from(capacity).map_err(|_| {
        TriggerError::InvalidConfig(format!("buffer capacity {} does not fit the header", capacity))
    })?;

    let mut header = [0u8; MAPPED_HEADER_LEN];
    header[..8].copy_from_slice(MAPPED_MAGIC);
    header[CAPACITY_OFFSET..CAPACITY_OFFSET + 4].copy_from_slice(&capacity_word.to_le_bytes());

    let mut file = std::fs::File::create(path.as_ref())?;
    file.write_all(&header)?;
    file.set_len((MAPPED_HEADER_LEN + 2 * capacity) as u64)?;
    file.flush()?;
    Ok(())
}
