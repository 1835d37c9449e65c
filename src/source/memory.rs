use super::{check_range, SampleSource};
use crate::error::{Result, TriggerError};
use crate::types::{BufferSelector, Epoch};
use crate::wait::HaltSignal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

struct SharedBuffers {
    buffers: [RwLock<Vec<u8>>; 2],
    epoch: AtomicU64,
    fault: Mutex<Option<String>>,
    capacity: usize,
}

impl SharedBuffers {
    fn poisoned() -> TriggerError {
        TriggerError::Device("buffer lock poisoned by a panicked producer".to_string())
    }
}

/// In-process ping-pong buffer pair. The producer side is a [`PublishHandle`].
pub struct MemorySource {
    shared: Arc<SharedBuffers>,
}

/// Producer side of a [`MemorySource`].
#[derive(Clone)]
pub struct PublishHandle {
    shared: Arc<SharedBuffers>,
}

impl MemorySource {
    pub fn new(capacity: usize) -> (Self, PublishHandle) {
        let shared = Arc::new(SharedBuffers {
            buffers: [RwLock::new(vec![0; capacity]), RwLock::new(vec![0; capacity])],
            epoch: AtomicU64::new(0),
            fault: Mutex::new(None),
            capacity,
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            PublishHandle { shared },
        )
    }
}

impl PublishHandle {
    pub fn epoch(&self) -> Epoch {
        self.shared.epoch.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Fill the active buffer with `data` and complete the swap.
    pub fn publish(&self, data: &[u8]) -> Result<Epoch> {
        if data.len() != self.shared.capacity {
            return Err(TriggerError::InvalidLength {
                length: data.len(),
                capacity: self.shared.capacity,
            });
        }
        self.publish_with(|buffer| buffer.copy_from_slice(data))
    }

    /// Let `fill` write the active buffer in place, then complete the swap.
    ///
    /// Returns the new epoch.
    pub fn publish_with<F>(&self, fill: F) -> Result<Epoch>
    where
        F: FnOnce(&mut [u8]),
    {
        let next = self.epoch() + 1;
        let selector = BufferSelector::for_epoch(next);
        {
            let mut buffer = self.shared.buffers[selector.index()]
                .write()
                .map_err(|_| SharedBuffers::poisoned())?;
            fill(&mut buffer);
        }
        self.shared.epoch.fetch_add(1, Ordering::Release);
        Ok(next)
    }

    /// Latch a hard fault; every later epoch query fails with it.
    pub fn fault(&self, message: impl Into<String>) {
        let message = message.into();
        log::error!("Sample source fault: {}", message);
        if let Ok(mut slot) = self.shared.fault.lock() {
            *slot = Some(message);
        }
    }
}

impl SampleSource for MemorySource {
    fn start(&mut self, halt: &HaltSignal) -> Result<()> {
        if halt.is_raised() {
            return Err(TriggerError::Halted);
        }
        Ok(())
    }

    fn current_epoch(&self) -> Result<Epoch> {
        let fault = self
            .shared
            .fault
            .lock()
            .map_err(|_| SharedBuffers::poisoned())?;
        if let Some(message) = fault.as_ref() {
            return Err(TriggerError::Device(message.clone()));
        }
        Ok(self.shared.epoch.load(Ordering::Acquire))
    }

    fn read_into(&self, selector: BufferSelector, offset: usize, dest: &mut [u8]) -> Result<()> {
        check_range(offset, dest.len(), self.shared.capacity)?;
        let buffer = self.shared.buffers[selector.index()]
            .read()
            .map_err(|_| SharedBuffers::poisoned())?;
        dest.copy_from_slice(&buffer[offset..offset + dest.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.shared.capacity
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        format!("memory ({} bytes x 2)", self.shared.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_alternates_buffers() {
        let (source, handle) = MemorySource::new(4);
        assert_eq!(source.current_epoch().unwrap(), 0);

        assert_eq!(handle.publish(&[1, 1, 1, 1]).unwrap(), 1);
        assert_eq!(handle.publish(&[2, 2, 2, 2]).unwrap(), 2);

        assert_eq!(source.read(BufferSelector::A, 0, 4).unwrap(), vec![1, 1, 1, 1]);
        assert_eq!(source.read(BufferSelector::B, 0, 4).unwrap(), vec![2, 2, 2, 2]);
        assert_eq!(source.current_epoch().unwrap(), 2);
    }

    #[test]
    fn test_publish_rejects_wrong_length() {
        let (_source, handle) = MemorySource::new(4);
        assert!(matches!(
            handle.publish(&[1, 2, 3]),
            Err(TriggerError::InvalidLength { length: 3, capacity: 4 })
        ));
        assert_eq!(handle.epoch(), 0);
    }

    #[test]
    fn test_read_out_of_range() {
        let (source, _handle) = MemorySource::new(4);
        assert!(source.read(BufferSelector::A, 2, 4).is_err());
    }

    #[test]
    fn test_fault_surfaces_as_device_error() {
        let (source, handle) = MemorySource::new(4);
        handle.fault("DMA descriptor error");
        assert!(matches!(source.current_epoch(), Err(TriggerError::Device(_))));
    }
}
