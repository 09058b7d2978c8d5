//! Background verification worker.
//!
//! The worker is an ordinary object: `serve` constructs it, starts it, and
//! stops it on shutdown. Which actions have been verified is recorded on the
//! action itself (`verified`), so a restarted worker, or a second one in
//! another process, never verifies the same execution twice.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{VerificationReport, Verifier, VerifyError};
use crate::events::Progress;
use crate::incident::TerminalStatus;
use crate::queue::{ActionQueue, ActionStatus, QueueError};

const RECENT_VERDICTS: usize = 10;

/// Counters and recent verdicts exposed on the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerState {
    pub running: bool,
    pub last_check_at: Option<DateTime<Utc>>,
    pub checks_run: u64,
    pub resolved_count: u64,
    pub escalated_count: u64,
    pub failed_count: u64,
    /// Newest first.
    pub recent_verdicts: Vec<VerificationReport>,
}

impl WorkerState {
    fn record(&mut self, report: &VerificationReport) {
        match report.verdict {
            TerminalStatus::Resolved => self.resolved_count += 1,
            TerminalStatus::Escalate => self.escalated_count += 1,
        }
        self.recent_verdicts.insert(0, report.clone());
        self.recent_verdicts.truncate(RECENT_VERDICTS);
    }
}

pub struct VerificationWorker {
    verifier: Verifier,
    queue: ActionQueue,
    state: Mutex<WorkerState>,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl VerificationWorker {
    pub fn new(verifier: Verifier, queue: ActionQueue) -> Arc<Self> {
        Arc::new(Self {
            verifier,
            queue,
            state: Mutex::new(WorkerState::default()),
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
        })
    }

    /// Spawn the periodic loop. Returns `false` if it is already running or
    /// the worker has been stopped.
    pub fn start(self: &Arc<Self>) -> bool {
        let Ok(mut handle) = self.handle.lock() else {
            return false;
        };
        if handle.is_some() || self.shutdown.is_cancelled() {
            return false;
        }
        let worker = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { worker.run().await }));
        true
    }

    /// Signal the loop and wait for the current scan to finish.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "verification worker ended abnormally");
            }
        }
    }

    pub fn snapshot(&self) -> WorkerState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    async fn run(self: Arc<Self>) {
        self.update(|s| s.running = true);
        info!(
            interval_secs = self.verifier.config().interval_secs,
            "verification worker started"
        );

        let mut ticker = tokio::time::interval(self.verifier.config().interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // Each scan gets its own task so a panic cannot end the loop.
            let worker = Arc::clone(&self);
            match tokio::spawn(async move { worker.scan_once(Utc::now()).await }).await {
                Ok(Ok(0)) => {}
                Ok(Ok(n)) => debug!(verified = n, "verification scan finished"),
                Ok(Err(e)) => warn!(error = %e, "verification scan failed"),
                Err(e) => error!(error = %e, "verification scan panicked"),
            }
        }

        self.update(|s| s.running = false);
        info!("verification worker stopped");
    }

    /// One scan: pick settled, unverified executions and verify each.
    /// Returns how many were verified by this call.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        self.update(|s| {
            s.last_check_at = Some(now);
            s.checks_run += 1;
        });

        let cfg = self.verifier.config();
        let candidates = self.queue.verification_candidates(
            now,
            cfg.settle(),
            cfg.staleness(),
            cfg.batch_size,
        )?;

        let mut verified = 0;
        for candidate in candidates {
            if self.shutdown.is_cancelled() {
                break;
            }
            let action = match self.queue.mark_verified(&candidate) {
                Ok(a) => a,
                Err(QueueError::Conflict { id }) => {
                    debug!(action_id = %id, "already taken by another verifier");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let result = self
                .verifier
                .verify(&action.service, Some(&action), &Progress::Silent)
                .await;
            match result {
                Ok(report) => {
                    verified += 1;
                    self.update(|s| s.record(&report));
                }
                Err(e) => {
                    warn!(exec_id = %action.exec_id, error = %e, "verification failed");
                    self.update(|s| s.failed_count += 1);
                }
            }
        }
        Ok(verified)
    }

    /// Verify `service` now, streaming progress. The latest executed action
    /// for the service is marked verified so the periodic scan skips it.
    pub async fn verify_on_demand(
        &self,
        service: &str,
        progress: &Progress,
    ) -> Result<VerificationReport, VerifyError> {
        let since = Utc::now() - self.verifier.config().on_demand_action_lookback();
        let action = self.queue.latest_for_service(service, since)?;

        if let Some(a) = &action {
            if a.status == ActionStatus::Executed && !a.verified {
                match self.queue.mark_verified(a) {
                    Ok(_) | Err(QueueError::Conflict { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        match self.verifier.verify(service, action.as_ref(), progress).await {
            Ok(report) => {
                self.update(|s| s.record(&report));
                Ok(report)
            }
            Err(e) => {
                self.update(|s| s.failed_count += 1);
                progress
                    .emit("error", json!({ "agent": "verification", "text": e.to_string() }))
                    .await;
                Err(e)
            }
        }
    }

    fn update(&self, f: impl FnOnce(&mut WorkerState)) {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
    }
}
