use thiserror::Error;

use crate::types::Epoch;

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Device error: {0}")]
    Device(String),

    #[error("No buffer swap within {waited_ms} ms (last epoch {epoch})")]
    SyncTimeout { epoch: Epoch, waited_ms: u64 },

    #[error("Buffer stalled at epoch {epoch}: idle buffer exhausted and no swap within {waited_ms} ms")]
    BufferStalled { epoch: Epoch, waited_ms: u64 },

    #[error("Invalid chunk length {length} for buffer capacity {capacity}")]
    InvalidLength { length: usize, capacity: usize },

    #[error("Protocol violation: epoch went backwards from {last} to {current}")]
    ProtocolViolation { last: Epoch, current: Epoch },

    #[error("Election failure: {0}")]
    ElectionFailure(String),

    #[error("Barrier failure in round {round}: {reason}")]
    BarrierFailure { round: u64, reason: String },

    #[error("Integrity mismatch in round {round}: epoch {before} changed to {after} during processing")]
    IntegrityMismatch { round: u64, before: Epoch, after: Epoch },

    #[error("Recorder write error: {0}")]
    RecorderWrite(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Halt requested")]
    Halted,
}

impl TriggerError {
    /// Errors that break a collective guarantee or indicate a logic/hardware bug.
    /// The whole run stops after these.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            TriggerError::Device(_)
                | TriggerError::ProtocolViolation { .. }
                | TriggerError::ElectionFailure(_)
                | TriggerError::BarrierFailure { .. }
                | TriggerError::Transport(_)
                | TriggerError::InvalidLength { .. }
        )
    }

    /// The upstream sample pace stopped; the node can only contribute empty rounds.
    pub fn is_acquisition_stall(&self) -> bool {
        matches!(
            self,
            TriggerError::SyncTimeout { .. } | TriggerError::BufferStalled { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TriggerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(TriggerError::Device("dma".into()).is_fatal_for_run());
        assert!(TriggerError::ProtocolViolation { last: 4, current: 2 }.is_fatal_for_run());
        assert!(!TriggerError::RecorderWrite("disk full".into()).is_fatal_for_run());
        assert!(!TriggerError::IntegrityMismatch { round: 1, before: 3, after: 4 }.is_fatal_for_run());
        assert!(!TriggerError::Halted.is_fatal_for_run());
        assert!(!TriggerError::SyncTimeout { epoch: 1, waited_ms: 2000 }.is_fatal_for_run());
    }

    #[test]
    fn test_stall_classification() {
        assert!(TriggerError::SyncTimeout { epoch: 1, waited_ms: 2000 }.is_acquisition_stall());
        assert!(TriggerError::BufferStalled { epoch: 1, waited_ms: 2000 }.is_acquisition_stall());
        assert!(!TriggerError::Halted.is_acquisition_stall());
    }
}
