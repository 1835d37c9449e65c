use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Count of completed buffer swaps since acquisition start
pub type Epoch = u64;

/// Raw ADC sample
pub type Sample = u8;

/// Index of a sensor channel inside the ChannelRegistry (0-based, worker order)
pub type ChannelId = usize;

/// Rank of a node in the collective
pub type NodeId = usize;

/// One of the two acquisition buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferSelector {
    /// Filled on odd epochs ("ping")
    A,
    /// Filled on even epochs ("pong")
    B,
}

impl BufferSelector {
    /// Buffer that became idle when the counter reached `epoch`.
    pub fn for_epoch(epoch: Epoch) -> Self {
        if epoch % 2 == 1 {
            BufferSelector::A
        } else {
            BufferSelector::B
        }
    }

    pub fn index(self) -> usize {
        match self {
            BufferSelector::A => 0,
            BufferSelector::B => 1,
        }
    }
}

/// Reported when consecutive observed epochs differ by more than one.
///
/// The bytes of the skipped buffers are lost; processing continues on the
/// newest buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrunWarning {
    pub previous: Epoch,
    pub current: Epoch,
}

impl OverrunWarning {
    pub fn missed_swaps(&self) -> u64 {
        self.current.saturating_sub(self.previous).saturating_sub(1)
    }
}

/// A local above-threshold transient detected on one channel
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateEvent {
    pub channel_id: ChannelId,
    /// Sample offset of the peak inside the captured buffer
    pub local_sample_time: i64,
    pub waveform: Vec<Sample>,
    pub epoch: Epoch,
    pub noise_estimate: f32,
}

/// Candidate confirmed by the coordinator, ready for the Recorder
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedEvent {
    pub wall_time: DateTime<Utc>,
    pub epoch: Epoch,
    pub buffer_offset: u64,
    pub waveform: Vec<Sample>,
}

impl AcceptedEvent {
    pub fn from_candidate(candidate: CandidateEvent, wall_time: DateTime<Utc>) -> Self {
        Self {
            wall_time,
            epoch: candidate.epoch,
            buffer_offset: candidate.local_sample_time.max(0) as u64,
            waveform: candidate.waveform,
        }
    }

    /// Time tag written next to each waveform:
    /// `[wall seconds, epoch, offset / sub_window, offset % sub_window]`.
    pub fn time_record(&self, sub_window: usize) -> [i32; 4] {
        let sub_window = sub_window.max(1) as u64;
        [
            self.wall_time.timestamp() as i32,
            self.epoch as i32,
            (self.buffer_offset / sub_window) as i32,
            (self.buffer_offset % sub_window) as i32,
        ]
    }
}

/// Per-node protocol state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    #[default]
    Unassigned,
    RoleKnown,
    RoundReady,
    AwaitingLocalSpikes,
    /// Coordinator only
    AwaitingPeers,
    /// Worker only
    AwaitingDecision,
    RoundComplete,
    Halted,
}

/// Outcome of the ring handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Coordinator,
    Worker { coordinator: NodeId },
}

/// Coordinator view of one round
#[derive(Debug, Clone, Default)]
pub struct Round {
    pub index: u64,
    /// Candidate sample times per channel, in each worker's original order
    pub candidates: Vec<Vec<i64>>,
    pub decisions: Vec<Vec<bool>>,
}

impl Round {
    pub fn new(index: u64, channels: usize) -> Self {
        Self {
            index,
            candidates: vec![Vec::new(); channels],
            decisions: vec![Vec::new(); channels],
        }
    }

    pub fn total_candidates(&self) -> usize {
        self.candidates.iter().map(Vec::len).sum()
    }

    pub fn total_accepted(&self) -> usize {
        self.decisions
            .iter()
            .map(|d| d.iter().filter(|&&accepted| accepted).count())
            .sum()
    }
}

/// What a worker did in one round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRoundReport {
    pub round: u64,
    pub epoch_start: Option<Epoch>,
    pub epoch_stop: Option<Epoch>,
    pub candidates: usize,
    pub saved: usize,
    pub noise_estimate: f32,
    pub overrun: Option<OverrunWarning>,
    pub integrity_ok: bool,
    pub truncated: bool,
}

/// What the coordinator decided in one round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorRoundReport {
    pub round: u64,
    pub candidates_per_channel: Vec<usize>,
    pub accepted_per_channel: Vec<usize>,
    pub clusters_accepted: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_selector_alternates() {
        for epoch in 1..20u64 {
            assert_ne!(
                BufferSelector::for_epoch(epoch),
                BufferSelector::for_epoch(epoch + 1)
            );
        }
        assert_eq!(BufferSelector::for_epoch(1), BufferSelector::A);
        assert_eq!(BufferSelector::for_epoch(2), BufferSelector::B);
    }

    #[test]
    fn test_node_state_starts_unassigned() {
        assert_eq!(NodeState::default(), NodeState::Unassigned);
    }

    #[test]
    fn test_overrun_missed_swaps() {
        let warning = OverrunWarning { previous: 2, current: 4 };
        assert_eq!(warning.missed_swaps(), 1);
    }

    #[test]
    fn test_time_record_layout() {
        let event = AcceptedEvent {
            wall_time: Utc.timestamp_opt(1_300_000_000, 0).unwrap(),
            epoch: 7,
            buffer_offset: 2 * 1024 + 17,
            waveform: vec![0; 4],
        };
        assert_eq!(event.time_record(1024), [1_300_000_000, 7, 2, 17]);
    }

    #[test]
    fn test_round_totals() {
        let mut round = Round::new(3, 2);
        round.candidates[0] = vec![10, 20];
        round.candidates[1] = vec![15];
        round.decisions[0] = vec![true, false];
        round.decisions[1] = vec![true];
        assert_eq!(round.total_candidates(), 3);
        assert_eq!(round.total_accepted(), 2);
    }
}
