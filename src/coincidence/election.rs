use super::transport::{Collective, Message};
use crate::error::{Result, TriggerError};
use crate::types::{NodeId, NodeRole};
use std::time::Duration;

/// Confirm the fixed coordinator with a single pass around the rank ring.
///
/// The coordinator sends its identity to its successor; every worker
/// receives the token from its predecessor, checks it names the expected
/// coordinator and forwards it. The coordinator must get its own identity
/// back from its predecessor. Any break in the cycle is an `ElectionFailure`.
pub fn ring_handshake<C: Collective + ?Sized>(
    transport: &C,
    coordinator: NodeId,
    timeout: Duration,
) -> Result<NodeRole> {
    let rank = transport.rank();
    let size = transport.size();
    if coordinator >= size {
        return Err(TriggerError::ElectionFailure(format!(
            "coordinator rank {} outside a ring of {}",
            coordinator, size
        )));
    }
    if size == 1 {
        return Ok(NodeRole::Coordinator);
    }

    let next = (rank + 1) % size;
    let prev = (rank + size - 1) % size;
    let broken = |detail: String| TriggerError::ElectionFailure(format!("broken ring at rank {}: {}", rank, detail));

    let receive = || -> Result<NodeId> {
        match transport.recv(prev, timeout) {
            Ok(Some(Message::Identity { coordinator })) => Ok(coordinator),
            Ok(Some(Message::Halt)) => Err(TriggerError::Halted),
            Ok(Some(other)) => Err(broken(format!("unexpected {} from rank {}", other.kind(), prev))),
            Ok(None) => Err(broken(format!("no token from rank {} within {:?}", prev, timeout))),
            Err(e) => Err(broken(e.to_string())),
        }
    };
    let forward = |token: NodeId| -> Result<()> {
        transport
            .send(next, Message::Identity { coordinator: token })
            .map_err(|e| broken(e.to_string()))
    };

    if rank == coordinator {
        forward(rank)?;
        let returned = receive()?;
        if returned != rank {
            return Err(broken(format!("token came back naming rank {}", returned)));
        }
        log::info!("Rank {} confirmed as coordinator of {} nodes", rank, size);
        Ok(NodeRole::Coordinator)
    } else {
        let token = receive()?;
        if token != coordinator {
            return Err(broken(format!(
                "token names rank {} but rank {} is configured",
                token, coordinator
            )));
        }
        forward(token)?;
        log::debug!("Rank {} learned coordinator {}", rank, token);
        Ok(NodeRole::Worker { coordinator: token })
    }
}
