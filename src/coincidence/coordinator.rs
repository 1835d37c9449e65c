use super::cluster::find_coincidences;
use super::election::ring_handshake;
use super::transport::{Collective, Message};
use super::StateTracker;
use crate::config::TriggerConfig;
use crate::error::{Result, TriggerError};
use crate::registry::{ChannelConfig, ChannelRegistry, DetectorTable};
use crate::types::{CoordinatorRoundReport, NodeId, NodeRole, NodeState, Round};
use crate::wait::HaltSignal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the coordinator turns registered antenna ids into a ChannelRegistry
#[derive(Debug, Clone)]
pub enum RegistrySource {
    /// Calibration table, remapped onto the registered antennas
    Table(DetectorTable),
    /// Zero delays and the same window everywhere
    Uniform { window: i64 },
    /// Prebuilt registry; must have one channel per worker
    Fixed(ChannelRegistry),
}

impl RegistrySource {
    fn build(&self, antenna_ids: &[u32]) -> Result<ChannelRegistry> {
        match self {
            RegistrySource::Table(table) => ChannelRegistry::from_table(table, antenna_ids),
            RegistrySource::Uniform { window } => Ok(ChannelRegistry::uniform(antenna_ids.len(), *window)),
            RegistrySource::Fixed(registry) => {
                if registry.len() != antenna_ids.len() {
                    return Err(TriggerError::InvalidConfig(format!(
                        "registry has {} channels for {} workers",
                        registry.len(),
                        antenna_ids.len()
                    )));
                }
                Ok(registry.clone())
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorSummary {
    pub rank: NodeId,
    pub antenna_ids: Vec<u32>,
    /// Calibration in effect for the run, one entry per channel
    pub channels: Vec<ChannelConfig>,
    pub rounds: u64,
    pub candidates: u64,
    pub accepted: u64,
    pub clusters: u64,
    /// Candidate lists dropped for exceeding the per-round cap
    pub oversized_lists: u64,
    pub last_round: Option<CoordinatorRoundReport>,
}

/// Fan-in, clustering and fan-out for every round.
pub struct Coordinator<C: Collective> {
    transport: C,
    registry_source: RegistrySource,
    halt: HaltSignal,
    state: StateTracker,
    multiplicity: usize,
    max_candidates: usize,
    max_rounds: Option<u64>,
    handshake_timeout: Duration,
    barrier_timeout: Duration,
    round_timeout: Duration,
}

impl<C: Collective> Coordinator<C> {
    pub fn new(
        transport: C,
        config: &TriggerConfig,
        registry_source: RegistrySource,
        halt: HaltSignal,
    ) -> Self {
        let rank = transport.rank();
        Self {
            transport,
            registry_source,
            halt,
            state: StateTracker::new(rank),
            multiplicity: config.coincidence.multiplicity,
            max_candidates: config.detector.max_candidates,
            max_rounds: config.coincidence.max_rounds,
            handshake_timeout: config.coincidence.handshake_timeout(),
            barrier_timeout: config.coincidence.barrier_timeout(),
            round_timeout: config.coincidence.round_timeout(),
        }
    }

    fn workers(&self) -> Vec<NodeId> {
        let rank = self.transport.rank();
        (0..self.transport.size()).filter(|&p| p != rank).collect()
    }

    /// Collect one antenna id per worker, in rank order.
    fn register_workers(&self, workers: &[NodeId]) -> Result<Vec<u32>> {
        workers
            .iter()
            .map(|&peer| match self.transport.recv(peer, self.handshake_timeout)? {
                Some(Message::Register { antenna_id }) => Ok(antenna_id),
                Some(Message::Halt) => Err(TriggerError::Halted),
                Some(other) => Err(TriggerError::ElectionFailure(format!(
                    "rank {} sent {} instead of registering",
                    peer,
                    other.kind()
                ))),
                None => Err(TriggerError::ElectionFailure(format!(
                    "rank {} did not register within {:?}",
                    peer, self.handshake_timeout
                ))),
            })
            .collect()
    }

    /// Run until halted, `max_rounds` is reached, or a collective guarantee breaks.
    pub fn run(mut self) -> Result<CoordinatorSummary> {
        let rank = self.transport.rank();
        let result = self.run_rounds();
        if let Err(e) = &result {
            if !matches!(e, TriggerError::Halted) {
                log::error!("Coordinator rank {} stopping: {}", rank, e);
            }
            self.transport.broadcast_halt();
        }
        self.state.enter(NodeState::Halted);
        result
    }

    fn run_rounds(&mut self) -> Result<CoordinatorSummary> {
        let rank = self.transport.rank();
        match ring_handshake(&self.transport, rank, self.handshake_timeout)? {
            NodeRole::Coordinator => {}
            NodeRole::Worker { coordinator } => {
                return Err(TriggerError::ElectionFailure(format!(
                    "rank {} expected to coordinate but ring names {}",
                    rank, coordinator
                )))
            }
        }
        self.state.enter(NodeState::RoleKnown);

        let workers = self.workers();
        let antenna_ids = self.register_workers(&workers)?;
        let registry = self.registry_source.build(&antenna_ids)?;
        log::info!(
            "Coordinator rank {} ready: {} channel(s), multiplicity {}",
            rank,
            registry.len(),
            self.multiplicity
        );
        let channels: Vec<ChannelConfig> = (0..registry.len()).map(|c| registry.channel(c)).collect();
        for channel in &channels {
            log::debug!(
                "Channel {}: antenna {}, delay {}, windows {:?}",
                channel.channel_id,
                channel.antenna_id,
                channel.propagation_delay,
                channel.distance_window
            );
        }

        let mut summary = CoordinatorSummary {
            rank,
            antenna_ids,
            channels,
            ..CoordinatorSummary::default()
        };

        let mut index = 0u64;
        loop {
            if self.max_rounds.is_some_and(|max| index >= max) {
                log::info!("Coordinator completed {} round(s)", index);
                break;
            }
            if self.halt.is_raised() {
                log::info!("Coordinator halting before round {}", index);
                self.transport.broadcast_halt();
                break;
            }

            self.state.enter(NodeState::RoundReady);
            match self.transport.barrier(index, rank, self.barrier_timeout) {
                Ok(()) => {}
                Err(TriggerError::Halted) => {
                    log::info!("A worker halted before round {}; stopping the array", index);
                    self.transport.broadcast_halt();
                    break;
                }
                Err(e) => return Err(e),
            }

            let report = self.run_round(index, &workers, &registry, &mut summary)?;
            summary.last_round = Some(report);
            summary.rounds += 1;
            self.state.enter(NodeState::RoundComplete);
            index += 1;
        }

        Ok(summary)
    }

    fn run_round(
        &mut self,
        index: u64,
        workers: &[NodeId],
        registry: &ChannelRegistry,
        summary: &mut CoordinatorSummary,
    ) -> Result<CoordinatorRoundReport> {
        self.state.enter(NodeState::AwaitingPeers);
        let mut round = Round::new(index, workers.len());
        let mut received = vec![0usize; workers.len()];

        for (channel, &peer) in workers.iter().enumerate() {
            match self.transport.recv(peer, self.round_timeout)? {
                Some(Message::Candidates { round: r, times }) if r == index => {
                    received[channel] = times.len();
                    if times.len() > self.max_candidates {
                        log::warn!(
                            "Round {}: rank {} sent {} candidates (cap {}), ignoring its list",
                            index,
                            peer,
                            times.len(),
                            self.max_candidates
                        );
                        summary.oversized_lists += 1;
                    } else {
                        round.candidates[channel] = times;
                    }
                }
                Some(Message::Halt) => {
                    return Err(TriggerError::Transport(format!(
                        "round {}: rank {} halted without a candidate list",
                        index, peer
                    )))
                }
                Some(other) => {
                    return Err(TriggerError::Transport(format!(
                        "round {}: rank {} sent {} instead of candidates",
                        index,
                        peer,
                        other.kind()
                    )))
                }
                None => {
                    return Err(TriggerError::Transport(format!(
                        "round {}: no candidates from rank {} within {:?}",
                        index, peer, self.round_timeout
                    )))
                }
            }
        }

        let outcome = {
            crate::profile_scope!(format!("round {} clustering", index));
            find_coincidences(registry, &round.candidates, self.multiplicity)?
        };
        round.decisions = outcome.decisions;

        for (channel, &peer) in workers.iter().enumerate() {
            let mut accept = std::mem::take(&mut round.decisions[channel]);
            if accept.len() != received[channel] {
                accept = vec![false; received[channel]];
            }
            self.transport.send(peer, Message::Decision { round: index, accept: accept.clone() })?;
            round.decisions[channel] = accept;
        }

        let report = CoordinatorRoundReport {
            round: index,
            candidates_per_channel: round.candidates.iter().map(Vec::len).collect(),
            accepted_per_channel: round
                .decisions
                .iter()
                .map(|d| d.iter().filter(|&&a| a).count())
                .collect(),
            clusters_accepted: outcome.clusters.len(),
        };

        summary.candidates += round.total_candidates() as u64;
        summary.accepted += round.total_accepted() as u64;
        summary.clusters += outcome.clusters.len() as u64;

        if outcome.clusters.is_empty() {
            log::debug!("Round {}: {} candidate(s), no coincidence", index, round.total_candidates());
        } else {
            log::info!(
                "Round {}: {} coincidence(s), {} of {} candidate(s) accepted",
                index,
                outcome.clusters.len(),
                round.total_accepted(),
                round.total_candidates()
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coincidence::transport::{LocalEndpoint, LocalMesh};
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn single_round_config(max_candidates: usize) -> TriggerConfig {
        let mut config = TriggerConfig::default();
        config.detector.max_candidates = max_candidates;
        config.coincidence.multiplicity = 1;
        config.coincidence.max_rounds = Some(1);
        config
    }

    /// Drive rank 1 by hand through one round and return its decision.
    fn send_one_list(endpoint: LocalEndpoint, times: Vec<i64>) -> thread::JoinHandle<Vec<bool>> {
        thread::spawn(move || {
            assert_eq!(
                ring_handshake(&endpoint, 0, TIMEOUT).unwrap(),
                NodeRole::Worker { coordinator: 0 }
            );
            endpoint.send(0, Message::Register { antenna_id: 101 }).unwrap();
            endpoint.barrier(0, 0, TIMEOUT).unwrap();
            endpoint.send(0, Message::Candidates { round: 0, times }).unwrap();
            match endpoint.recv(0, TIMEOUT).unwrap() {
                Some(Message::Decision { round: 0, accept }) => accept,
                other => panic!("expected a decision, got {:?}", other),
            }
        })
    }

    #[test]
    fn test_oversized_list_is_rejected_whole() {
        let mut mesh = LocalMesh::build(2);
        let worker = send_one_list(mesh.pop().unwrap(), vec![10, 20, 30]);
        let coordinator = Coordinator::new(
            mesh.pop().unwrap(),
            &single_round_config(2),
            RegistrySource::Uniform { window: 8 },
            HaltSignal::new(),
        );

        let summary = coordinator.run().unwrap();
        assert_eq!(worker.join().unwrap(), vec![false, false, false]);
        assert_eq!(summary.oversized_lists, 1);
        assert_eq!(summary.candidates, 0);
        assert_eq!(summary.accepted, 0);
        assert_eq!(summary.rounds, 1);
    }

    #[test]
    fn test_list_within_cap_is_clustered() {
        let mut mesh = LocalMesh::build(2);
        let worker = send_one_list(mesh.pop().unwrap(), vec![10, 20]);
        let coordinator = Coordinator::new(
            mesh.pop().unwrap(),
            &single_round_config(2),
            RegistrySource::Uniform { window: 8 },
            HaltSignal::new(),
        );

        let summary = coordinator.run().unwrap();
        assert_eq!(worker.join().unwrap(), vec![true, true]);
        assert_eq!(summary.oversized_lists, 0);
        assert_eq!(summary.antenna_ids, vec![101]);
        assert_eq!(summary.channels.len(), 1);
        assert_eq!(summary.channels[0].distance_window, vec![8]);
    }
}
