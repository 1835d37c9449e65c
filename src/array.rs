use crate::buffer_sync::BufferSync;
use crate::coincidence::{
    Coordinator, CoordinatorSummary, LocalMesh, RegistrySource, Worker, WorkerSummary,
};
use crate::config::TriggerConfig;
use crate::error::{Result, TriggerError};
use crate::recorder::Recorder;
use crate::source::SampleSource;
use crate::types::NodeId;
use crate::wait::HaltSignal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::thread;

/// One detector channel of an in-process array
pub struct WorkerSpec {
    pub antenna_id: u32,
    pub source: Box<dyn SampleSource>,
    pub recorder: Box<dyn Recorder>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOutcome {
    pub rank: NodeId,
    pub antenna_id: u32,
    pub summary: Option<WorkerSummary>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayReport {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub coordinator: Option<CoordinatorSummary>,
    pub coordinator_error: Option<String>,
    pub workers: Vec<WorkerOutcome>,
}

impl ArrayReport {
    pub fn is_success(&self) -> bool {
        self.coordinator_error.is_none() && self.workers.iter().all(|w| w.error.is_none())
    }

    pub fn saved_events(&self) -> u64 {
        self.workers
            .iter()
            .filter_map(|w| w.summary.as_ref())
            .map(|s| s.saved)
            .sum()
    }
}

/// Runs a coordinator plus one worker per channel, each on its own thread,
/// wired together by a [`LocalMesh`].
pub struct LocalArray {
    config: TriggerConfig,
    registry: RegistrySource,
    workers: Vec<WorkerSpec>,
    halt: HaltSignal,
}

impl LocalArray {
    pub fn new(config: TriggerConfig, registry: RegistrySource) -> Self {
        Self {
            config,
            registry,
            workers: Vec::new(),
            halt: HaltSignal::new(),
        }
    }

    pub fn with_halt(mut self, halt: HaltSignal) -> Self {
        self.halt = halt;
        self
    }

    pub fn add_worker(&mut self, spec: WorkerSpec) {
        self.workers.push(spec);
    }

    pub fn halt_signal(&self) -> HaltSignal {
        self.halt.clone()
    }

    /// Run every node to completion. Node failures are reported, not returned.
    pub fn run(self) -> Result<ArrayReport> {
        let size = self.workers.len() + 1;
        let coordinator_rank = self.config.coincidence.coordinator;
        if self.workers.is_empty() {
            return Err(TriggerError::InvalidConfig("an array needs at least one worker".into()));
        }
        if coordinator_rank >= size {
            return Err(TriggerError::InvalidConfig(format!(
                "coordinator rank {} but only {} nodes",
                coordinator_rank, size
            )));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        log::info!(
            "Session {}: starting array of {} worker(s), coordinator rank {}",
            session_id,
            self.workers.len(),
            coordinator_rank
        );

        let mut endpoints = LocalMesh::build(size).into_iter();
        let mut specs = self.workers.into_iter();
        let mut coordinator_handle = None;
        let mut worker_handles = Vec::new();

        for rank in 0..size {
            let endpoint = endpoints
                .next()
                .ok_or_else(|| TriggerError::Transport("mesh is short of endpoints".into()))?;

            if rank == coordinator_rank {
                let coordinator =
                    Coordinator::new(endpoint, &self.config, self.registry.clone(), self.halt.clone());
                let handle = thread::Builder::new()
                    .name("coordinator".to_string())
                    .spawn(move || coordinator.run())?;
                coordinator_handle = Some(handle);
                continue;
            }

            let spec = specs
                .next()
                .ok_or_else(|| TriggerError::InvalidConfig("more ranks than workers".into()))?;
            let sync = BufferSync::new(spec.source, &self.config.acquisition, self.halt.clone());
            let antenna_id = spec.antenna_id;
            let worker = Worker::new(
                endpoint,
                sync,
                spec.recorder,
                antenna_id,
                &self.config,
                self.halt.clone(),
            );
            let handle = thread::Builder::new()
                .name(format!("worker-{}", rank))
                .spawn(move || worker.run())?;
            worker_handles.push((rank, antenna_id, handle));
        }

        let (coordinator, coordinator_error) = match coordinator_handle.map(|h| h.join()) {
            Some(Ok(Ok(summary))) => (Some(summary), None),
            Some(Ok(Err(e))) => (None, Some(e.to_string())),
            Some(Err(_)) => (None, Some("coordinator thread panicked".to_string())),
            None => (None, Some("coordinator never started".to_string())),
        };

        let workers = worker_handles
            .into_iter()
            .map(|(rank, antenna_id, handle)| {
                let (summary, error) = match handle.join() {
                    Ok(Ok(summary)) => (Some(summary), None),
                    Ok(Err(e)) => (None, Some(e.to_string())),
                    Err(_) => (None, Some(format!("worker rank {} panicked", rank))),
                };
                WorkerOutcome {
                    rank,
                    antenna_id,
                    summary,
                    error,
                }
            })
            .collect();

        let report = ArrayReport {
            session_id,
            started_at,
            finished_at: Utc::now(),
            coordinator,
            coordinator_error,
            workers,
        };

        if report.is_success() {
            log::info!(
                "Session {} finished: {} event(s) saved",
                report.session_id,
                report.saved_events()
            );
        } else {
            log::error!("Session {} finished with errors", report.session_id);
        }
        Ok(report)
    }
}
