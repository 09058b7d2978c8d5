use std::sync::Arc;

use crate::agent::AgentClient;
use crate::audit::AuditLog;
use crate::config::Config;
use crate::gate::{Gate, PipelineLock};
use crate::incident::IncidentStore;
use crate::pipeline::Pipeline;
use crate::queue::ActionQueue;
use crate::runner::{ControlPlane, Runner};
use crate::storage::Pool;
use crate::verify::{VerificationWorker, Verifier};

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub queue: ActionQueue,
    pub incidents: IncidentStore,
    pub audit: AuditLog,
    pub gate: Gate,
    pub lock: PipelineLock,
    pub runner: Runner,
    pub pipeline: Pipeline,
    pub worker: Arc<VerificationWorker>,
}

impl AppState {
    /// Wire every component over one pool. The worker is constructed but
    /// not started.
    pub fn build(
        config: &Config,
        pool: Pool,
        agent: Arc<dyn AgentClient>,
        control: Arc<dyn ControlPlane>,
    ) -> Self {
        let queue = ActionQueue::new(pool.clone());
        let incidents = IncidentStore::new(pool.clone());
        let audit = AuditLog::new(pool.clone());
        let gate = Gate::new(incidents.clone(), config.gate.clone());
        let lock = PipelineLock::new();

        let runner = Runner::new(queue.clone(), control, &config.runner);
        let pipeline = Pipeline::new(
            agent.clone(),
            gate.clone(),
            lock.clone(),
            incidents.clone(),
            queue.clone(),
            config.pipeline.clone(),
        );
        let verifier = Verifier::new(
            incidents.clone(),
            audit.clone(),
            agent,
            config.verification.clone(),
        );
        let worker = VerificationWorker::new(verifier, queue.clone());

        Self {
            pool,
            queue,
            incidents,
            audit,
            gate,
            lock,
            runner,
            pipeline,
            worker,
        }
    }
}
