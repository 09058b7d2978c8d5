//! Dedup / cooldown gate in front of the pipeline's write path.
//!
//! The gate only reads incidents. A block is an ordinary outcome that the
//! caller reports, never an error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::config::GateConfig;
use crate::incident::{Incident, IncidentStore, ResolutionStatus};
use crate::storage::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// A remediation for this service is still in flight.
    InFlight,
    /// The service was resolved recently.
    Cooldown,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::InFlight => "in_flight",
            BlockReason::Cooldown => "cooldown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Allow,
    Block {
        reason: BlockReason,
        incident_id: String,
        age_secs: i64,
    },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }

    /// Operator-facing explanation, e.g. for a `pipeline_complete` event.
    pub fn describe(&self, service: &str) -> String {
        match self {
            GateDecision::Allow => format!("{} may start a new remediation cycle", service),
            GateDecision::Block { reason: BlockReason::InFlight, age_secs, .. } => format!(
                "remediation already in progress for {} (started {}s ago)",
                service, age_secs
            ),
            GateDecision::Block { reason: BlockReason::Cooldown, age_secs, .. } => format!(
                "{} was resolved {}s ago; still in cooldown",
                service, age_secs
            ),
        }
    }
}

/// Decide from the most recent pipeline incident alone.
pub fn decide(latest: Option<&Incident>, now: DateTime<Utc>, cfg: &GateConfig) -> GateDecision {
    let Some(incident) = latest else {
        return GateDecision::Allow;
    };

    let age = incident.age(now);
    let reason = match incident.resolution_status {
        ResolutionStatus::Remediating if age < cfg.in_flight() => Some(BlockReason::InFlight),
        ResolutionStatus::Resolved if age < cfg.cooldown() => Some(BlockReason::Cooldown),
        _ => None,
    };

    match reason {
        Some(reason) => GateDecision::Block {
            reason,
            incident_id: incident.id.clone(),
            age_secs: age.num_seconds(),
        },
        None => GateDecision::Allow,
    }
}

#[derive(Clone)]
pub struct Gate {
    incidents: IncidentStore,
    config: GateConfig,
}

impl Gate {
    pub fn new(incidents: IncidentStore, config: GateConfig) -> Self {
        Self { incidents, config }
    }

    pub fn check(&self, service: &str, now: DateTime<Utc>) -> Result<GateDecision, StoreError> {
        let latest = self
            .incidents
            .latest_pipeline_incident(service, now - self.config.lookback())?;
        let decision = decide(latest.as_ref(), now, &self.config);
        debug!(%service, ?decision, "gate checked");
        Ok(decision)
    }
}

/// Process-wide guard allowing one pipeline run at a time.
#[derive(Clone, Default)]
pub struct PipelineLock {
    inner: Arc<Mutex<()>>,
}

/// Held for the lifetime of one pipeline run.
pub struct PipelineGuard {
    _guard: OwnedMutexGuard<()>,
}

impl PipelineLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking; `None` means a run is already in progress.
    pub fn try_acquire(&self) -> Option<PipelineGuard> {
        self.inner
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| PipelineGuard { _guard: guard })
    }

    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}
