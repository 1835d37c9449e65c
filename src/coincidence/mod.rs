// Distributed round protocol
//
// One coordinator and N workers share a rank space. After the ring handshake
// every round is: barrier, local capture and detection on the workers,
// candidate fan-in, clustering on the coordinator, decision fan-out, local
// commit. Nodes share no memory; everything crosses the Collective.

pub mod cluster;
pub mod coordinator;
pub mod election;
pub mod transport;
pub mod worker;

pub use cluster::{find_coincidences, Cluster, ClusterOutcome};
pub use coordinator::{Coordinator, CoordinatorSummary, RegistrySource};
pub use election::ring_handshake;
pub use transport::{Collective, LocalEndpoint, LocalMesh, Message};
pub use worker::{Worker, WorkerSummary};

use crate::types::{NodeId, NodeState};

/// Tracks a node's protocol state and logs every transition.
#[derive(Debug, Clone)]
pub struct StateTracker {
    rank: NodeId,
    state: NodeState,
}

impl StateTracker {
    pub fn new(rank: NodeId) -> Self {
        Self {
            rank,
            state: NodeState::Unassigned,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn allows(from: NodeState, to: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (from, to),
            (_, Halted)
                | (Unassigned, RoleKnown)
                | (RoleKnown, RoundReady)
                | (RoundComplete, RoundReady)
                | (RoundReady, AwaitingLocalSpikes)
                | (RoundReady, AwaitingPeers)
                | (AwaitingLocalSpikes, AwaitingPeers)
                | (AwaitingLocalSpikes, AwaitingDecision)
                | (AwaitingPeers, RoundComplete)
                | (AwaitingDecision, RoundComplete)
        )
    }

    /// Move to `next`. Returns false (and stays put) on an illegal transition.
    pub fn enter(&mut self, next: NodeState) -> bool {
        if !Self::allows(self.state, next) {
            log::error!(
                "rank {}: illegal state transition {:?} -> {:?}",
                self.rank,
                self.state,
                next
            );
            return false;
        }
        log::trace!("rank {}: {:?} -> {:?}", self.rank, self.state, next);
        self.state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_round_path() {
        let mut tracker = StateTracker::new(1);
        for state in [
            NodeState::RoleKnown,
            NodeState::RoundReady,
            NodeState::AwaitingLocalSpikes,
            NodeState::AwaitingDecision,
            NodeState::RoundComplete,
            NodeState::RoundReady,
        ] {
            assert!(tracker.enter(state));
        }
        assert_eq!(tracker.state(), NodeState::RoundReady);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut tracker = StateTracker::new(0);
        assert!(!tracker.enter(NodeState::AwaitingPeers));
        assert_eq!(tracker.state(), NodeState::Unassigned);
        assert!(tracker.enter(NodeState::Halted));
    }
}
