use super::election::ring_handshake;
use super::transport::{Collective, Message};
use super::StateTracker;
use crate::buffer_sync::BufferSync;
use crate::config::TriggerConfig;
use crate::detector::SpikeDetector;
use crate::error::{Result, TriggerError};
use crate::recorder::{record_events, Recorder, LOG_TAG};
use crate::timing::{RoundClock, RoundLogLine, Stage};
use crate::types::{
    AcceptedEvent, CandidateEvent, ChannelId, NodeId, NodeRole, NodeState, OverrunWarning,
    WorkerRoundReport,
};
use crate::wait::HaltSignal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub rank: NodeId,
    pub antenna_id: u32,
    pub rounds: u64,
    pub candidates: u64,
    pub saved: u64,
    pub integrity_failures: u64,
    pub stalled_rounds: u64,
    pub overruns: u64,
    pub recorder_errors: u64,
    pub last_round: Option<WorkerRoundReport>,
}

/// What local capture produced for one round
struct LocalCapture {
    candidates: Vec<CandidateEvent>,
    epoch_start: Option<u64>,
    epoch_stop: Option<u64>,
    noise_estimate: f32,
    truncated: bool,
    overrun: Option<OverrunWarning>,
}

impl LocalCapture {
    fn empty() -> Self {
        Self {
            candidates: Vec::new(),
            epoch_start: None,
            epoch_stop: None,
            noise_estimate: 0.0,
            truncated: false,
            overrun: None,
        }
    }

    fn integrity_ok(&self) -> bool {
        self.epoch_start.is_some() && self.epoch_start == self.epoch_stop
    }
}

/// Acquisition, detection and local commit for one channel.
pub struct Worker<C: Collective> {
    transport: C,
    sync: BufferSync,
    detector: SpikeDetector,
    recorder: Box<dyn Recorder>,
    antenna_id: u32,
    halt: HaltSignal,
    state: StateTracker,
    coordinator: NodeId,
    threshold_sigma: f32,
    max_candidates: usize,
    max_rounds: Option<u64>,
    max_stalled_rounds: u32,
    handshake_timeout: Duration,
    barrier_timeout: Duration,
    round_timeout: Duration,
    /// Fatal local error, acted on at the next loop top
    pending: Option<TriggerError>,
    consecutive_stalls: u32,
}

impl<C: Collective> Worker<C> {
    pub fn new(
        transport: C,
        sync: BufferSync,
        recorder: Box<dyn Recorder>,
        antenna_id: u32,
        config: &TriggerConfig,
        halt: HaltSignal,
    ) -> Self {
        let rank = transport.rank();
        Self {
            transport,
            sync,
            detector: SpikeDetector::new(&config.detector),
            recorder,
            antenna_id,
            halt,
            state: StateTracker::new(rank),
            coordinator: config.coincidence.coordinator,
            threshold_sigma: config.detector.threshold_sigma,
            max_candidates: config.detector.max_candidates,
            max_rounds: config.coincidence.max_rounds,
            max_stalled_rounds: config.acquisition.max_stalled_rounds,
            handshake_timeout: config.coincidence.handshake_timeout(),
            barrier_timeout: config.coincidence.barrier_timeout(),
            round_timeout: config.coincidence.round_timeout(),
            pending: None,
            consecutive_stalls: 0,
        }
    }

    /// Run the round loop. Returns the first fatal error after a clean exit.
    pub fn run(mut self) -> Result<WorkerSummary> {
        let rank = self.transport.rank();

        // A source that cannot start still joins the ring so the array can
        // shut down in order.
        match self.sync.start() {
            Ok(()) => {}
            Err(TriggerError::Halted) => log::info!("rank {}: halted while acquisition started", rank),
            Err(e) => {
                log::error!("rank {}: acquisition failed to start: {}", rank, e);
                self.pending = Some(e);
            }
        }

        let result = self.run_rounds();

        if let Err(e) = self.sync.stop() {
            log::warn!("rank {}: error stopping acquisition: {}", rank, e);
        }
        self.state.enter(NodeState::Halted);

        match (result, self.pending.take()) {
            (Err(TriggerError::Halted), Some(fatal)) | (Ok(_), Some(fatal)) => Err(fatal),
            (result, _) => result,
        }
    }

    fn run_rounds(&mut self) -> Result<WorkerSummary> {
        let rank = self.transport.rank();
        match ring_handshake(&self.transport, self.coordinator, self.handshake_timeout)? {
            NodeRole::Worker { coordinator } => self.coordinator = coordinator,
            NodeRole::Coordinator => {
                return Err(TriggerError::ElectionFailure(format!(
                    "worker rank {} was handed the coordinator role",
                    rank
                )))
            }
        }
        self.state.enter(NodeState::RoleKnown);
        self.transport.send(
            self.coordinator,
            Message::Register {
                antenna_id: self.antenna_id,
            },
        )?;

        let mut summary = WorkerSummary {
            rank,
            antenna_id: self.antenna_id,
            ..WorkerSummary::default()
        };

        let mut index = 0u64;
        loop {
            if self.max_rounds.is_some_and(|max| index >= max) {
                break;
            }
            if self.should_halt() {
                log::info!("rank {}: halting before round {}", rank, index);
                if let Err(e) = self.transport.send(self.coordinator, Message::Halt) {
                    log::debug!("rank {}: halt not delivered: {}", rank, e);
                }
                break;
            }

            self.state.enter(NodeState::RoundReady);
            match self.transport.barrier(index, self.coordinator, self.barrier_timeout) {
                Ok(()) => {}
                Err(TriggerError::Halted) => {
                    log::info!("rank {}: coordinator halted the array before round {}", rank, index);
                    break;
                }
                Err(e) => return Err(e),
            }

            match self.run_round(index, &mut summary)? {
                Some(report) => {
                    summary.last_round = Some(report);
                    summary.rounds += 1;
                    self.state.enter(NodeState::RoundComplete);
                }
                None => break,
            }
            index += 1;
        }

        Ok(summary)
    }

    /// Channels are the workers in rank order, skipping the coordinator.
    fn channel_id(&self) -> ChannelId {
        let rank = self.transport.rank();
        if rank > self.coordinator {
            rank - 1
        } else {
            rank
        }
    }

    fn should_halt(&self) -> bool {
        if self.halt.is_raised() || self.pending.is_some() {
            return true;
        }
        if self.max_stalled_rounds > 0 && self.consecutive_stalls >= self.max_stalled_rounds {
            log::error!(
                "rank {}: acquisition stalled for {} consecutive rounds",
                self.transport.rank(),
                self.consecutive_stalls
            );
            return true;
        }
        false
    }

    /// Stalls count toward the stalled-round limit; fatal errors halt at the next loop top.
    fn classify(&mut self, index: u64, e: TriggerError) {
        let rank = self.transport.rank();
        if e.is_acquisition_stall() {
            self.consecutive_stalls += 1;
            log::warn!("rank {} round {}: {}; contributing no candidates", rank, index, e);
        } else if e.is_fatal_for_run() {
            log::error!("rank {} round {}: {}; contributing no candidates", rank, index, e);
            self.pending = Some(e);
        } else {
            log::debug!("rank {} round {}: {}", rank, index, e);
        }
    }

    /// Capture the idle buffer and scan it. Failures give an empty contribution.
    fn capture(&mut self, index: u64, clock: &mut RoundClock) -> LocalCapture {
        let swap_timeout = self.sync.swap_timeout();

        let chunk = match self.sync.capture_idle(swap_timeout) {
            Ok(chunk) => {
                self.consecutive_stalls = 0;
                chunk
            }
            Err(e) => {
                clock.mark(Stage::Sync);
                self.classify(index, e);
                return LocalCapture::empty();
            }
        };
        clock.mark(Stage::Sync);

        let detection = self.detector.detect(&chunk.bytes, self.threshold_sigma);
        let mut candidates =
            self.detector
                .candidates(self.channel_id(), chunk.epoch, &chunk.bytes, &detection);
        candidates.truncate(self.max_candidates);

        let epoch_stop = match self.sync.current_epoch() {
            Ok(epoch) => Some(epoch),
            Err(e) => {
                self.classify(index, e);
                None
            }
        };
        clock.mark(Stage::Detect);

        LocalCapture {
            candidates,
            epoch_start: Some(chunk.epoch),
            epoch_stop,
            noise_estimate: detection.noise_estimate,
            truncated: detection.truncated,
            overrun: chunk.overrun,
        }
    }

    /// One round after the barrier. `None` means the coordinator halted the array.
    fn run_round(&mut self, index: u64, summary: &mut WorkerSummary) -> Result<Option<WorkerRoundReport>> {
        let rank = self.transport.rank();
        self.state.enter(NodeState::AwaitingLocalSpikes);
        let mut clock = RoundClock::start();

        let local = self.capture(index, &mut clock);
        let times: Vec<i64> = local.candidates.iter().map(|c| c.local_sample_time).collect();

        self.transport.send(
            self.coordinator,
            Message::Candidates {
                round: index,
                times,
            },
        )?;
        self.state.enter(NodeState::AwaitingDecision);

        let accept = match self.transport.recv(self.coordinator, self.round_timeout)? {
            Some(Message::Decision { round, accept }) if round == index => accept,
            Some(Message::Halt) => return Ok(None),
            Some(other) => {
                return Err(TriggerError::Transport(format!(
                    "round {}: coordinator sent {} instead of a decision",
                    index,
                    other.kind()
                )))
            }
            None => {
                return Err(TriggerError::Transport(format!(
                    "round {}: no decision within {:?}",
                    index, self.round_timeout
                )))
            }
        };
        clock.mark(Stage::Exchange);

        let accept = if accept.len() == local.candidates.len() {
            accept
        } else {
            log::warn!(
                "rank {} round {}: decision covers {} of {} candidates, rejecting all",
                rank,
                index,
                accept.len(),
                local.candidates.len()
            );
            vec![false; local.candidates.len()]
        };

        let integrity_ok = local.integrity_ok();
        if !integrity_ok && local.epoch_start.is_some() {
            let error = TriggerError::IntegrityMismatch {
                round: index,
                before: local.epoch_start.unwrap_or_default(),
                after: local.epoch_stop.unwrap_or_default(),
            };
            log::warn!("rank {}: {}; dropping the round's events", rank, error);
            summary.integrity_failures += 1;
        }

        let candidates_count = local.candidates.len();
        let events: Vec<AcceptedEvent> = if integrity_ok {
            local
                .candidates
                .into_iter()
                .zip(accept)
                .filter(|(_, accepted)| *accepted)
                .map(|(candidate, _)| AcceptedEvent::from_candidate(candidate, clock.wall_start()))
                .collect()
        } else {
            Vec::new()
        };

        if let Err(e) = record_events(self.recorder.as_mut(), &events, self.detector.sub_window()) {
            log::warn!("rank {} round {}: {}; {} event(s) lost", rank, index, e, events.len());
            summary.recorder_errors += 1;
        }
        clock.mark(Stage::Commit);

        let line = RoundLogLine {
            clock: &clock,
            round: index,
            epoch_start: local.epoch_start,
            epoch_stop: local.epoch_stop,
            candidates: candidates_count,
            saved: events.len(),
            noise: local.noise_estimate,
        };
        if let Err(e) = self.recorder.append(LOG_TAG, format!("{}\n", line).as_bytes()) {
            log::warn!("rank {} round {}: {}", rank, index, e);
            summary.recorder_errors += 1;
        }

        log::info!(
            "rank {} round {}: epoch {:?}/{:?}, saved {}/{}, sigma {:.1}",
            rank,
            index,
            local.epoch_start,
            local.epoch_stop,
            events.len(),
            candidates_count,
            local.noise_estimate
        );

        summary.candidates += candidates_count as u64;
        summary.saved += events.len() as u64;
        if local.overrun.is_some() {
            summary.overruns += 1;
        }
        if local.epoch_start.is_none() && self.consecutive_stalls > 0 {
            summary.stalled_rounds += 1;
        }

        Ok(Some(WorkerRoundReport {
            round: index,
            epoch_start: local.epoch_start,
            epoch_stop: local.epoch_stop,
            candidates: candidates_count,
            saved: events.len(),
            noise_estimate: local.noise_estimate,
            overrun: local.overrun,
            integrity_ok,
            truncated: local.truncated,
        }))
    }
}
