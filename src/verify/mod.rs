//! Post-remediation verification: ask the verification agent whether the
//! service recovered, close the incident, and record the decision.

pub mod verdict;
pub mod worker;

pub use self::verdict::{
    assess, format_mttr, mttr_seconds, Assessment, Samples, ThresholdCheck, Thresholds,
    VerdictSource,
};
pub use self::worker::{VerificationWorker, WorkerState};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::agent::{self, AgentClient, AgentError};
use crate::audit::{AuditLog, AuditRecord};
use crate::config::VerificationConfig;
use crate::events::Progress;
use crate::incident::{IncidentStore, TerminalPatch, TerminalStatus};
use crate::queue::{QueueError, RemediationAction};
use crate::storage::StoreError;

const AGENT_LABEL: &str = "verification";

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one verification, as reported to callers and kept in the
/// worker's recent-verdict list.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub service: String,
    pub exec_id: String,
    pub verdict: TerminalStatus,
    pub confidence: u8,
    pub source: VerdictSource,
    pub checks: Vec<ThresholdCheck>,
    pub summary: String,
    pub mttr_seconds: i64,
    pub mttr_display: String,
    pub incident_id: Option<String>,
    /// `false` when no open incident was found or it was already terminal.
    pub incident_updated: bool,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Verifier {
    incidents: IncidentStore,
    audit: AuditLog,
    agent: Arc<dyn AgentClient>,
    config: VerificationConfig,
}

impl Verifier {
    pub fn new(
        incidents: IncidentStore,
        audit: AuditLog,
        agent: Arc<dyn AgentClient>,
        config: VerificationConfig,
    ) -> Self {
        Self { incidents, audit, agent, config }
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    /// Verify `service`, optionally in the context of the action that was
    /// executed for it. The incident patch and the audit record are written
    /// here; store failures on either are logged rather than returned so the
    /// other still happens.
    pub async fn verify(
        &self,
        service: &str,
        action: Option<&RemediationAction>,
        progress: &Progress,
    ) -> Result<VerificationReport, VerifyError> {
        let prompt = build_prompt(service, action, &self.config.thresholds);
        let output = agent::run_agent(
            self.agent.as_ref(),
            &self.config.agent_id,
            AGENT_LABEL,
            &prompt,
            progress,
        )
        .await?;

        let assessment = assess(&output, &self.config.thresholds);
        let now = Utc::now();
        let exec_id = action.map(|a| a.exec_id.clone()).unwrap_or_default();

        let incident = match self
            .incidents
            .latest_pipeline_incident(service, now - self.config.incident_lookback())
        {
            Ok(i) => i,
            Err(e) => {
                warn!(%service, error = %e, "incident lookup failed");
                None
            }
        };

        let mttr = incident
            .as_ref()
            .map(|i| mttr_seconds(i.detected_at, now))
            .unwrap_or(0);
        let mttr_display = format_mttr(mttr);

        let mut incident_updated = false;
        if let Some(incident) = &incident {
            if !incident
                .resolution_status
                .can_transition_to(assessment.verdict.status())
            {
                info!(
                    incident_id = %incident.id,
                    status = %incident.resolution_status,
                    "incident already terminal, left untouched"
                );
            } else {
                let patch = TerminalPatch {
                    verdict: assessment.verdict,
                    mttr_seconds: mttr,
                    mttr_estimate: mttr_display.clone(),
                    output: output.clone(),
                    at: now,
                };
                match self.incidents.apply_terminal(&incident.id, &patch) {
                    Ok(true) => incident_updated = true,
                    Ok(false) => {
                        info!(incident_id = %incident.id, "incident closed concurrently, left untouched")
                    }
                    Err(e) => warn!(incident_id = %incident.id, error = %e, "incident patch failed"),
                }
            }
        }

        let record = AuditRecord {
            agent: self.config.agent_id.clone(),
            service: service.to_string(),
            exec_id: exec_id.clone(),
            decision: assessment.verdict.as_str().to_string(),
            mttr_seconds: Some(mttr),
            summary: assessment.summary.clone(),
            raw_output: output,
            recorded_at: now,
        };
        if let Err(e) = self.audit.append(&record) {
            warn!(%service, %exec_id, error = %e, "audit append failed");
        }

        info!(
            %service,
            %exec_id,
            verdict = %assessment.verdict,
            mttr = %mttr_display,
            source = ?assessment.source,
            "verification complete"
        );

        progress
            .emit(
                "guardian_verdict",
                json!({
                    "agent": AGENT_LABEL,
                    "text": format!(
                        "Verdict: {} | MTTR: {} | {}",
                        assessment.verdict, mttr_display, assessment.summary
                    ),
                    "verdict": assessment.verdict,
                    "confidence": assessment.confidence,
                    "mttr_fmt": mttr_display,
                    "mttr_seconds": mttr,
                    "summary": assessment.summary,
                    "checks": assessment.checks,
                }),
            )
            .await;

        Ok(VerificationReport {
            service: service.to_string(),
            exec_id,
            verdict: assessment.verdict,
            confidence: assessment.confidence,
            source: assessment.source,
            checks: assessment.checks,
            summary: assessment.summary,
            mttr_seconds: mttr,
            mttr_display,
            incident_id: incident.map(|i| i.id),
            incident_updated,
            checked_at: now,
        })
    }
}

pub fn build_prompt(
    service: &str,
    action: Option<&RemediationAction>,
    thresholds: &Thresholds,
) -> String {
    let (kind, anomaly, root_cause, executed_at, exec_id) = match action {
        Some(a) => (
            a.action.as_str(),
            a.anomaly_type.as_str(),
            a.root_cause.as_str(),
            a.executed_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "recently".to_string()),
            a.exec_id.as_str(),
        ),
        None => ("unknown", "unknown", "See incident record", "recently".to_string(), ""),
    };

    format!(
        "Verify that the autonomous remediation below succeeded.\n\
         \n\
         - Service: {service}\n\
         - Action: {kind}\n\
         - Anomaly: {anomaly}\n\
         - Root cause: {root_cause}\n\
         - Executed: {executed_at}\n\
         - Exec ID: {exec_id}\n\
         \n\
         Fetch the current metrics for {service} and compare them with the recovery \
         thresholds (all must pass for RESOLVED):\n\
         - memory_percent < {mem}%\n\
         - error_rate < {err} errors/min\n\
         - request_latency_ms < {lat}ms\n\
         \n\
         Reply using exactly this format, one field per line:\n\
         - service: {service}\n\
         - verdict: RESOLVED or ESCALATE\n\
         - memory_pct: <current average reading>\n\
         - error_rate: <current average reading>\n\
         - latency_ms: <current average reading>\n\
         - confidence: <0-100>\n\
         - summary: <one sentence>",
        mem = thresholds.memory_percent,
        err = thresholds.error_rate,
        lat = thresholds.latency_ms,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_carries_thresholds_and_context() {
        let p = build_prompt("auth-service", None, &Thresholds::default());
        assert!(p.contains("- Service: auth-service"));
        assert!(p.contains("memory_percent < 65%"));
        assert!(p.contains("error_rate < 2.5 errors/min"));
        assert!(p.contains("- Action: unknown"));
    }
}
