//! Remediation runner: poll, claim, execute, fall back, finalize.
//!
//! Any number of runners (in this process or others sharing the database)
//! may poll the same queue. The claim CAS decides which one executes; the
//! losers see [`RunOutcome::Conflict`] and move on.

pub mod control;
pub mod recovery;

pub use self::control::{ControlError, ControlPlane, DockerCli, Disabled};
pub use self::recovery::RecoveryWriter;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RunnerConfig;
use crate::queue::{
    ActionKind, ActionQueue, ExecutionReport, QueueError, RemediationAction, RemediationResult,
};

/// What one runner cycle did.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Nothing pending.
    Idle,
    /// Another runner claimed the action first.
    Conflict { action_id: String },
    Finished {
        action: RemediationAction,
        result: RemediationResult,
    },
}

#[derive(Clone)]
pub struct Runner {
    queue: ActionQueue,
    control: Arc<dyn ControlPlane>,
    recovery: RecoveryWriter,
    containers: HashMap<String, String>,
    dependency_container: String,
    cache_image: String,
}

impl Runner {
    pub fn new(queue: ActionQueue, control: Arc<dyn ControlPlane>, cfg: &RunnerConfig) -> Self {
        let recovery = RecoveryWriter::new(
            queue.pool().clone(),
            cfg.regions.clone(),
            cfg.default_region.clone(),
        );
        Self {
            queue,
            control,
            recovery,
            containers: cfg.containers.clone(),
            dependency_container: cfg.dependency_container.clone(),
            cache_image: cfg.cache_image.clone(),
        }
    }

    /// One full cycle over the oldest pending action, if any.
    pub async fn run_once(&self) -> Result<RunOutcome, QueueError> {
        let Some(pending) = self.queue.poll_oldest_pending()? else {
            return Ok(RunOutcome::Idle);
        };

        let claimed = match self.queue.claim(&pending) {
            Ok(a) => a,
            Err(QueueError::Conflict { id }) => {
                debug!(action_id = %id, "action already claimed by another runner");
                return Ok(RunOutcome::Conflict { action_id: id });
            }
            Err(e) => return Err(e),
        };

        info!(
            service = %claimed.service,
            action = %claimed.action,
            exec_id = %claimed.exec_id,
            "executing remediation"
        );

        let report = self.execute(&claimed).await;
        let (action, result) = match self.queue.finalize(&claimed, &report) {
            Ok(done) => done,
            Err(e) => {
                // The side effect already happened; the action stays
                // `executing` and needs a manual close.
                error!(
                    action_id = %claimed.id,
                    exec_id = %claimed.exec_id,
                    output = %report.output,
                    primary_used = report.primary_used,
                    error = %e,
                    "executed action could not be finalized"
                );
                return Err(e);
            }
        };

        info!(
            service = %action.service,
            exec_id = %action.exec_id,
            status = %action.status,
            primary_used = report.primary_used,
            "remediation finished"
        );
        Ok(RunOutcome::Finished { action, result })
    }

    async fn execute(&self, action: &RemediationAction) -> ExecutionReport {
        let kind = match action.kind() {
            Ok(k) => k,
            Err(e) => {
                warn!(exec_id = %action.exec_id, error = %e, "refusing unknown action");
                return ExecutionReport::failure(format!("Unknown action: {}", action.action), false);
            }
        };

        match self.perform(kind, &action.service).await {
            Ok(output) => ExecutionReport::success(output, true),
            Err(control_err) => {
                warn!(
                    exec_id = %action.exec_id,
                    error = %control_err,
                    "control plane failed, falling back to synthetic recovery"
                );
                match self.recovery.write(&action.service, kind) {
                    Ok(points) => ExecutionReport::success(
                        format!(
                            "synthetic_fallback: wrote {} recovery points ({})",
                            points, control_err
                        ),
                        false,
                    ),
                    Err(e) => ExecutionReport::failure(
                        format!("{}; fallback failed: {}", control_err, e),
                        false,
                    ),
                }
            }
        }
    }

    async fn perform(&self, kind: ActionKind, service: &str) -> Result<String, ControlError> {
        let container = self
            .containers
            .get(service)
            .map(String::as_str)
            .unwrap_or(service);

        match kind {
            ActionKind::RestartService => {
                self.control.restart(container).await?;
                Ok(format!("restarted {}", container))
            }
            ActionKind::RollbackDeployment => {
                self.control.stop(container).await?;
                self.control.start(container).await?;
                Ok(format!("stop+start {}", container))
            }
            ActionKind::ScaleCache => {
                let name = format!("{}-cache-{}", container, chrono::Utc::now().timestamp());
                self.control.provision(&name, &self.cache_image).await?;
                Ok(format!("provisioned {} from {}", name, self.cache_image))
            }
            ActionKind::RestartDependency => {
                self.control.restart(&self.dependency_container).await?;
                Ok(format!("restarted {}", self.dependency_container))
            }
        }
    }
}

/// Poll loop. Every cycle runs in its own task so that neither an error nor
/// a panic ends the loop.
pub async fn run_runner_loop(runner: Runner, interval: Duration, shutdown: CancellationToken) {
    info!(interval_ms = interval.as_millis() as u64, "runner started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let cycle = runner.clone();
        match tokio::spawn(async move { cycle.run_once().await }).await {
            Ok(Ok(RunOutcome::Idle)) => {}
            Ok(Ok(RunOutcome::Conflict { action_id })) => {
                debug!(%action_id, "lost claim race");
            }
            Ok(Ok(RunOutcome::Finished { .. })) => {}
            Ok(Err(e)) => error!(error = %e, "runner cycle failed"),
            Err(e) => error!(error = %e, "runner cycle panicked"),
        }
    }

    info!("runner stopped");
}
