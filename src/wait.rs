use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative stop flag shared by every node of a run.
#[derive(Debug, Clone, Default)]
pub struct HaltSignal {
    flag: Arc<AtomicBool>,
}

impl HaltSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            log::info!("Halt requested");
        }
    }

    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut { waited: Duration },
    Halted,
}

/// Bounded polling: check until it yields a value, the timeout expires or
/// the halt signal is raised.
#[derive(Debug, Clone, Copy)]
pub struct BoundedWait {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl BoundedWait {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    /// Run `check` until it returns `Some`. Check errors end the wait immediately.
    ///
    /// The check always runs at least once, even with a zero timeout.
    pub fn until<T, F>(&self, halt: &HaltSignal, mut check: F) -> Result<WaitOutcome<T>>
    where
        F: FnMut() -> Result<Option<T>>,
    {
        let start = Instant::now();
        loop {
            if let Some(value) = check()? {
                return Ok(WaitOutcome::Ready(value));
            }
            if halt.is_raised() {
                return Ok(WaitOutcome::Halted);
            }
            let waited = start.elapsed();
            if waited >= self.timeout {
                return Ok(WaitOutcome::TimedOut { waited });
            }
            let remaining = self.timeout - waited;
            std::thread::sleep(self.poll_interval.min(remaining));
        }
    }
}
