// Round collective transport
//
// Point-to-point messages between ranks plus a root-centred barrier built on
// top of them. LocalMesh wires N in-process endpoints together with one
// crossbeam channel per ordered pair, so messages from one peer are never
// reordered relative to each other.

use crate::error::{Result, TriggerError};
use crate::types::NodeId;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Everything that travels between nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// Ring handshake token naming the coordinator
    Identity { coordinator: NodeId },
    /// Worker -> coordinator, once after the handshake
    Register { antenna_id: u32 },
    Arrive { round: u64 },
    Release { round: u64 },
    Candidates { round: u64, times: Vec<i64> },
    Decision { round: u64, accept: Vec<bool> },
    Halt,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Identity { .. } => "identity",
            Message::Register { .. } => "register",
            Message::Arrive { .. } => "arrive",
            Message::Release { .. } => "release",
            Message::Candidates { .. } => "candidates",
            Message::Decision { .. } => "decision",
            Message::Halt => "halt",
        }
    }
}

/// Point-to-point exchange between the ranks of one run.
pub trait Collective: Send {
    fn rank(&self) -> NodeId;

    fn size(&self) -> usize;

    fn send(&self, to: NodeId, message: Message) -> Result<()>;

    /// Next message from `from`, or `None` once `timeout` expires.
    ///
    /// A peer that went away is a `Transport` error.
    fn recv(&self, from: NodeId, timeout: Duration) -> Result<Option<Message>>;

    /// Block until every rank has arrived at `round`.
    ///
    /// Non-root ranks send `Arrive` to `root` and wait for `Release`; the
    /// root collects one `Arrive` per rank, in rank order, then releases
    /// everyone. A `Halt` received instead ends the barrier with
    /// `TriggerError::Halted`.
    fn barrier(&self, round: u64, root: NodeId, timeout: Duration) -> Result<()> {
        let failure = |reason: String| TriggerError::BarrierFailure { round, reason };

        if self.rank() == root {
            for peer in (0..self.size()).filter(|&p| p != root) {
                match self.recv(peer, timeout)? {
                    Some(Message::Arrive { round: r }) if r == round => {}
                    Some(Message::Halt) => return Err(TriggerError::Halted),
                    Some(other) => {
                        return Err(failure(format!(
                            "rank {} sent {} instead of arriving",
                            peer,
                            describe(&other)
                        )))
                    }
                    None => {
                        return Err(failure(format!(
                            "rank {} did not arrive within {:?}",
                            peer, timeout
                        )))
                    }
                }
            }
            for peer in (0..self.size()).filter(|&p| p != root) {
                self.send(peer, Message::Release { round })?;
            }
            Ok(())
        } else {
            self.send(root, Message::Arrive { round })?;
            match self.recv(root, timeout)? {
                Some(Message::Release { round: r }) if r == round => Ok(()),
                Some(Message::Halt) => Err(TriggerError::Halted),
                Some(other) => Err(failure(format!(
                    "root sent {} instead of releasing",
                    describe(&other)
                ))),
                None => Err(failure(format!("no release within {:?}", timeout))),
            }
        }
    }

    /// Tell every other rank to stop. Peers that already left are skipped.
    fn broadcast_halt(&self) {
        for peer in (0..self.size()).filter(|&p| p != self.rank()) {
            if let Err(e) = self.send(peer, Message::Halt) {
                log::debug!("Halt not delivered to rank {}: {}", peer, e);
            }
        }
    }
}

fn describe(message: &Message) -> String {
    match message {
        Message::Arrive { round } | Message::Release { round } => {
            format!("{} for round {}", message.kind(), round)
        }
        Message::Candidates { round, .. } | Message::Decision { round, .. } => {
            format!("{} for round {}", message.kind(), round)
        }
        other => other.kind().to_string(),
    }
}

/// One rank's end of an in-process mesh
pub struct LocalEndpoint {
    rank: NodeId,
    outgoing: Vec<Option<Sender<Message>>>,
    incoming: Vec<Option<Receiver<Message>>>,
}

pub struct LocalMesh;

impl LocalMesh {
    /// Fully connected mesh of `size` endpoints, indexed by rank.
    pub fn build(size: usize) -> Vec<LocalEndpoint> {
        let mut outgoing: Vec<Vec<Option<Sender<Message>>>> =
            (0..size).map(|_| (0..size).map(|_| None).collect()).collect();
        let mut incoming: Vec<Vec<Option<Receiver<Message>>>> =
            (0..size).map(|_| (0..size).map(|_| None).collect()).collect();

        for from in 0..size {
            for to in (0..size).filter(|&to| to != from) {
                let (tx, rx) = unbounded();
                outgoing[from][to] = Some(tx);
                incoming[to][from] = Some(rx);
            }
        }

        outgoing
            .into_iter()
            .zip(incoming)
            .enumerate()
            .map(|(rank, (outgoing, incoming))| LocalEndpoint {
                rank,
                outgoing,
                incoming,
            })
            .collect()
    }
}

impl Collective for LocalEndpoint {
    fn rank(&self) -> NodeId {
        self.rank
    }

    fn size(&self) -> usize {
        self.outgoing.len()
    }

    fn send(&self, to: NodeId, message: Message) -> Result<()> {
        let sender = self
            .outgoing
            .get(to)
            .and_then(Option::as_ref)
            .ok_or_else(|| TriggerError::Transport(format!("rank {} has no route to {}", self.rank, to)))?;
        log::trace!("rank {} -> {}: {}", self.rank, to, message.kind());
        sender
            .send(message)
            .map_err(|_| TriggerError::Transport(format!("rank {} is gone", to)))
    }

    fn recv(&self, from: NodeId, timeout: Duration) -> Result<Option<Message>> {
        let receiver = self
            .incoming
            .get(from)
            .and_then(Option::as_ref)
            .ok_or_else(|| TriggerError::Transport(format!("rank {} has no route from {}", self.rank, from)))?;
        match receiver.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TriggerError::Transport(format!(
                "rank {} disconnected from {}",
                from, self.rank
            ))),
        }
    }
}
