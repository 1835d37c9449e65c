// File replay source (simulation mode)
//
// The replay file is mapped once and copied buffer by buffer into the active
// half of a MemorySource, one swap every `swap_interval_ms`. At EOF the
// producer rewinds when looping, otherwise it stops swapping and the
// consumer eventually sees a stalled buffer.

use super::memory::{MemorySource, PublishHandle};
use super::SampleSource;
use crate::error::{Result, TriggerError};
use crate::types::{BufferSelector, Epoch};
use crate::wait::HaltSignal;
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Open a file and map it into memory (read-only)
fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path).map_err(|e| {
        TriggerError::Device(format!("cannot open replay file {}: {}", path.display(), e))
    })?;
    let mmap = unsafe { Mmap::map(&file).map_err(TriggerError::IoError)? };
    Ok(mmap)
}

pub struct ReplaySource {
    path: PathBuf,
    swap_interval: Duration,
    loop_playback: bool,
    memory: MemorySource,
    handle: PublishHandle,
    mmap: Option<Arc<Mmap>>,
    running: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
}

impl ReplaySource {
    pub fn new(
        path: PathBuf,
        buffer_size: usize,
        swap_interval_ms: u64,
        loop_playback: bool,
    ) -> Result<Self> {
        if buffer_size == 0 {
            return Err(TriggerError::InvalidConfig("replay buffer_size must be non-zero".into()));
        }
        if !path.exists() {
            return Err(TriggerError::Device(format!(
                "replay file not found: {}",
                path.display()
            )));
        }

        let (memory, handle) = MemorySource::new(buffer_size);
        Ok(Self {
            path,
            swap_interval: Duration::from_millis(swap_interval_ms),
            loop_playback,
            memory,
            handle,
            mmap: None,
            running: Arc::new(AtomicBool::new(false)),
            producer: None,
        })
    }
}

/// Copy the next `buffer.len()` bytes of the replay into `buffer`.
///
/// Returns the new file position, or `None` when the file is exhausted and
/// playback does not loop.
fn fill_from(data: &[u8], position: usize, buffer: &mut [u8], loop_playback: bool) -> Option<usize> {
    let mut position = position;
    let mut written = 0;

    while written < buffer.len() {
        if position >= data.len() {
            if !loop_playback {
                return None;
            }
            position = 0;
        }
        let take = (buffer.len() - written).min(data.len() - position);
        buffer[written..written + take].copy_from_slice(&data[position..position + take]);
        written += take;
        position += take;
    }

    Some(position)
}

fn produce(
    data: Arc<Mmap>,
    handle: PublishHandle,
    running: Arc<AtomicBool>,
    swap_interval: Duration,
    loop_playback: bool,
) {
    let mut position = 0usize;
    let mut scratch = vec![0u8; handle.capacity()];

    while running.load(Ordering::SeqCst) {
        match fill_from(&data, position, &mut scratch, loop_playback) {
            Some(next) => {
                position = next;
                if let Err(e) = handle.publish(&scratch) {
                    log::error!("Replay producer failed to publish: {}", e);
                    handle.fault(e.to_string());
                    return;
                }
            }
            None => {
                log::info!("Replay reached EOF after epoch {}, no further swaps", handle.epoch());
                return;
            }
        }
        std::thread::sleep(swap_interval);
    }
}

impl SampleSource for ReplaySource {
    fn start(&mut self, halt: &HaltSignal) -> Result<()> {
        if halt.is_raised() {
            return Err(TriggerError::Halted);
        }
        if self.producer.is_some() {
            return Ok(());
        }

        let mmap = match &self.mmap {
            Some(mmap) => Arc::clone(mmap),
            None => {
                let mmap = Arc::new(mmap_file(&self.path)?);
                self.mmap = Some(Arc::clone(&mmap));
                mmap
            }
        };
        if mmap.is_empty() {
            return Err(TriggerError::Device(format!(
                "replay file {} is empty",
                self.path.display()
            )));
        }

        self.running.store(true, Ordering::SeqCst);
        let handle = self.handle.clone();
        let running = Arc::clone(&self.running);
        let swap_interval = self.swap_interval;
        let loop_playback = self.loop_playback;

        let producer = std::thread::Builder::new()
            .name(format!("replay-{}", self.path.display()))
            .spawn(move || produce(mmap, handle, running, swap_interval, loop_playback))?;
        self.producer = Some(producer);

        log::info!(
            "Replaying {} ({} bytes per buffer, swap every {:?}, loop={})",
            self.path.display(),
            self.memory.capacity(),
            self.swap_interval,
            self.loop_playback
        );
        Ok(())
    }

    fn current_epoch(&self) -> Result<Epoch> {
        self.memory.current_epoch()
    }

    fn read_into(&self, selector: BufferSelector, offset: usize, dest: &mut [u8]) -> Result<()> {
        self.memory.read_into(selector, offset, dest)
    }

    fn capacity(&self) -> usize {
        self.memory.capacity()
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(producer) = self.producer.take() {
            if producer.join().is_err() {
                return Err(TriggerError::Device("replay producer panicked".into()));
            }
            log::debug!("Replay producer for {} stopped", self.path.display());
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("replay {}", self.path.display())
    }
}

impl Drop for ReplaySource {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Error stopping replay source: {}", e);
        }
    }
}
