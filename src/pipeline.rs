//! Detection -> investigation -> remediation pipeline, feeding the gate and
//! the action queue.
//!
//! A run writes at most one incident and one action, and only after the
//! pipeline lock is held and the gate allowed the detected service.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::agent::{self, parse, AgentClient};
use crate::config::PipelineConfig;
use crate::events::Progress;
use crate::gate::{Gate, GateDecision, PipelineLock};
use crate::incident::{IncidentStore, NewIncident, ResolutionStatus};
use crate::queue::{ActionKind, ActionQueue, NewAction, RiskLevel};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    AlreadyRunning,
    /// Detection reported no anomaly.
    Healthy,
    /// An anomaly was reported but no known service could be identified.
    NoService,
    Blocked { service: String, decision: GateDecision },
    AgentFailed { agent: String, message: String },
    /// Incident opened as REMEDIATING and an action queued.
    Remediating {
        service: String,
        incident_id: String,
        action_id: String,
        exec_id: String,
        action: String,
    },
    /// Incident recorded without an autonomous action.
    Skipped {
        service: String,
        incident_id: String,
        reason: String,
    },
}

/// Fields read from the remediation agent's report.
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub anomaly_type: String,
    pub root_cause: String,
    pub action: String,
    pub confidence: f64,
    pub risk_level: RiskLevel,
    pub action_taken: String,
    pub pipeline_summary: String,
    pub reported_status: Option<ResolutionStatus>,
}

impl Recommendation {
    /// Every field is optional in the agent's reply; fall back to the
    /// earlier agents' output, then to fixed defaults.
    pub fn parse(remediation: &str, detection: &str, investigation: &str) -> Self {
        let anomaly_type = parse::field(remediation, "anomaly_type")
            .or_else(|| parse::field(detection, "anomaly_type"))
            .unwrap_or_else(|| "unknown".to_string());
        let root_cause = parse::field(remediation, "root_cause")
            .or_else(|| parse::field(investigation, "root_cause"))
            .unwrap_or_default();
        let action = parse::field(remediation, "recommended_action")
            .map(|a| a.trim().to_ascii_lowercase())
            .unwrap_or_else(|| ActionKind::for_anomaly(&anomaly_type).as_str().to_string());

        Self {
            action,
            confidence: parse::confidence(remediation, "confidence_score").unwrap_or(0.0),
            risk_level: parse::field(remediation, "risk_level")
                .map(|r| RiskLevel::parse_lenient(&r))
                .unwrap_or(RiskLevel::Low),
            action_taken: parse::field(remediation, "action_taken").unwrap_or_default(),
            pipeline_summary: parse::field(remediation, "pipeline_summary").unwrap_or_default(),
            reported_status: parse::field(remediation, "resolution_status")
                .and_then(|s| s.parse().ok()),
            anomaly_type,
            root_cause,
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    agent: Arc<dyn AgentClient>,
    gate: Gate,
    lock: PipelineLock,
    incidents: IncidentStore,
    queue: ActionQueue,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        agent: Arc<dyn AgentClient>,
        gate: Gate,
        lock: PipelineLock,
        incidents: IncidentStore,
        queue: ActionQueue,
        config: PipelineConfig,
    ) -> Self {
        Self { agent, gate, lock, incidents, queue, config }
    }

    pub async fn run(&self, progress: &Progress) -> Result<PipelineOutcome> {
        let Some(_guard) = self.lock.try_acquire() else {
            progress
                .emit("pipeline_complete", json!({ "text": "Pipeline already running" }))
                .await;
            return Ok(PipelineOutcome::AlreadyRunning);
        };

        let detection = match self
            .agent_step(&self.config.detection_agent, "detection", DETECTION_PROMPT, progress)
            .await
        {
            Ok(out) => out,
            Err(outcome) => return Ok(outcome),
        };

        if parse::flag(&detection, "anomaly_detected") == Some(false) {
            progress
                .emit(
                    "pipeline_complete",
                    json!({ "text": "No anomaly detected, system is healthy. Pipeline stopped." }),
                )
                .await;
            return Ok(PipelineOutcome::Healthy);
        }

        let Some(service) = self.detected_service(&detection) else {
            progress
                .emit(
                    "pipeline_complete",
                    json!({ "text": "Anomaly reported but no known service identified" }),
                )
                .await;
            return Ok(PipelineOutcome::NoService);
        };

        let decision = self
            .gate
            .check(&service, Utc::now())
            .context("gate check failed")?;
        if !decision.is_allowed() {
            info!(%service, ?decision, "pipeline blocked by gate");
            progress
                .emit(
                    "pipeline_complete",
                    json!({
                        "text": format!("Skipped: {}", decision.describe(&service)),
                        "service": service,
                        "gate": decision,
                    }),
                )
                .await;
            return Ok(PipelineOutcome::Blocked { service, decision });
        }

        let investigation_prompt = investigation_prompt(&detection);
        let investigation = match self
            .agent_step(
                &self.config.investigation_agent,
                "investigation",
                &investigation_prompt,
                progress,
            )
            .await
        {
            Ok(out) => out,
            Err(outcome) => return Ok(outcome),
        };

        let remediation_prompt = remediation_prompt(&service, &detection, &investigation);
        let remediation = match self
            .agent_step(
                &self.config.remediation_agent,
                "remediation",
                &remediation_prompt,
                progress,
            )
            .await
        {
            Ok(out) => out,
            Err(outcome) => return Ok(outcome),
        };

        let rec = Recommendation::parse(&remediation, &detection, &investigation);
        let autonomous =
            self.config.autonomous && rec.confidence >= self.config.confidence_threshold;

        if autonomous {
            self.remediate(&service, &rec, progress).await
        } else {
            let reason = if self.config.autonomous {
                format!(
                    "confidence {:.2} below threshold {:.2}",
                    rec.confidence, self.config.confidence_threshold
                )
            } else {
                "autonomous mode is off".to_string()
            };
            self.record_only(&service, &rec, reason, progress).await
        }
    }

    async fn remediate(
        &self,
        service: &str,
        rec: &Recommendation,
        progress: &Progress,
    ) -> Result<PipelineOutcome> {
        let mut new = NewIncident::pipeline(service, ResolutionStatus::Remediating, Utc::now());
        fill_incident(&mut new, rec);
        let incident = self.incidents.create(&new).context("failed to write incident")?;

        progress
            .emit(
                "remediation_triggered",
                json!({
                    "agent": "remediation",
                    "text": format!(
                        "Triggering autonomous remediation: {} on {} (confidence {:.2}, risk: {})",
                        rec.action, service, rec.confidence, rec.risk_level.as_str()
                    ),
                    "service": service,
                    "action": rec.action,
                    "confidence": rec.confidence,
                    "risk_level": rec.risk_level,
                }),
            )
            .await;

        let action = self
            .queue
            .enqueue(&NewAction {
                incident_id: incident.id.clone(),
                service: service.to_string(),
                action: rec.action.clone(),
                anomaly_type: rec.anomaly_type.clone(),
                root_cause: rec.root_cause.clone(),
                confidence_score: rec.confidence,
                risk_level: rec.risk_level,
                triggered_by: self.config.remediation_agent.clone(),
            })
            .context("failed to enqueue action")?;

        info!(
            %service,
            incident_id = %incident.id,
            exec_id = %action.exec_id,
            action = %action.action,
            "remediation queued"
        );

        progress
            .emit(
                "remediation_queued",
                json!({
                    "agent": "remediation",
                    "text": format!("Remediation queued, exec_id: {}", action.exec_id),
                    "exec_id": action.exec_id,
                    "action_id": action.id,
                    "incident_id": incident.id,
                }),
            )
            .await;
        progress
            .emit(
                "pipeline_complete",
                json!({ "text": format!("Pipeline complete, incident {} remediating", incident.id) }),
            )
            .await;

        Ok(PipelineOutcome::Remediating {
            service: service.to_string(),
            incident_id: incident.id,
            action_id: action.id,
            exec_id: action.exec_id,
            action: action.action,
        })
    }

    async fn record_only(
        &self,
        service: &str,
        rec: &Recommendation,
        reason: String,
        progress: &Progress,
    ) -> Result<PipelineOutcome> {
        let status = match rec.reported_status {
            Some(s) if s != ResolutionStatus::Remediating => s,
            _ => ResolutionStatus::Monitoring,
        };
        let mut new = NewIncident::pipeline(service, status, Utc::now());
        fill_incident(&mut new, rec);
        let incident = self.incidents.create(&new).context("failed to write incident")?;

        warn!(%service, %reason, "autonomous remediation skipped");
        progress
            .emit(
                "remediation_skipped",
                json!({
                    "agent": "remediation",
                    "text": format!("Autonomous remediation skipped: {}", reason),
                }),
            )
            .await;
        progress
            .emit(
                "pipeline_complete",
                json!({ "text": format!("Pipeline complete, incident {} recorded as {}", incident.id, status) }),
            )
            .await;

        Ok(PipelineOutcome::Skipped {
            service: service.to_string(),
            incident_id: incident.id,
            reason,
        })
    }

    async fn agent_step(
        &self,
        agent_id: &str,
        label: &str,
        prompt: &str,
        progress: &Progress,
    ) -> std::result::Result<String, PipelineOutcome> {
        match agent::run_agent(self.agent.as_ref(), agent_id, label, prompt, progress).await {
            Ok(out) => Ok(out),
            Err(e) => {
                warn!(agent = %agent_id, error = %e, "pipeline agent failed");
                progress
                    .emit("error", json!({ "agent": label, "text": e.to_string() }))
                    .await;
                progress
                    .emit(
                        "pipeline_complete",
                        json!({ "text": format!("Pipeline stopped: {} agent failed", label) }),
                    )
                    .await;
                Err(PipelineOutcome::AgentFailed {
                    agent: agent_id.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// The reported `affected_service` if it is a known one, else the first
    /// known service mentioned anywhere in the detection output.
    fn detected_service(&self, detection: &str) -> Option<String> {
        let known = &self.config.known_services;
        if let Some(reported) = parse::field(detection, "affected_service") {
            let reported = reported.trim().to_ascii_lowercase();
            if let Some(s) = known.iter().find(|s| s.eq_ignore_ascii_case(&reported)) {
                return Some(s.clone());
            }
        }
        let lower = detection.to_lowercase();
        known
            .iter()
            .filter_map(|s| lower.find(&s.to_lowercase()).map(|pos| (pos, s)))
            .min_by_key(|(pos, _)| *pos)
            .map(|(_, s)| s.clone())
    }
}

fn fill_incident(new: &mut NewIncident, rec: &Recommendation) {
    new.anomaly_type = rec.anomaly_type.clone();
    new.root_cause = rec.root_cause.clone();
    new.action_taken = rec.action_taken.clone();
    new.pipeline_summary = rec.pipeline_summary.clone();
}

const DETECTION_PROMPT: &str = "\
Scan all services for anomalies using your detection tools: peak memory above 70% \
in the last 30 minutes, error rate above 3 errors/min, and time to failure for any \
affected service.

Reply with one field per line, dash prefix:
- anomaly_detected: true or false
- anomaly_type: e.g. memory_leak_progressive, error_spike_sudden, latency_cascade
- affected_service: service name
- affected_region: e.g. us-east-1
- current_value: peak reading in the last 30 minutes
- baseline_value: 24h baseline average
- confidence: 0-100
- summary: one sentence

If nothing is anomalous, set anomaly_detected to false and stop.";

fn investigation_prompt(detection: &str) -> String {
    format!(
        "Detection reported:\n\n{}\n\n\
         Investigate the root cause: search error logs, correlate recent deployments and \
         look for similar past incidents.\n\n\
         Reply with: service, anomaly_type, root_cause, evidence, recommended_action, \
         historical_match, confidence, summary.",
        detection
    )
}

fn remediation_prompt(service: &str, detection: &str, investigation: &str) -> String {
    let kinds: Vec<&str> = ActionKind::ALL.iter().map(|k| k.as_str()).collect();
    format!(
        "Investigation findings:\n{investigation}\n\n\
         Detection:\n{detection}\n\n\
         Choose a remediation for {service}.\n\n\
         Reply with one field per line, dash prefix:\n\
         - service: {service}\n\
         - anomaly_type: <type>\n\
         - root_cause: <description>\n\
         - action_taken: <what was done>\n\
         - recommended_action: <one of: {kinds}>\n\
         - confidence_score: <decimal 0.0 to 1.0>\n\
         - risk_level: <low | medium | high>\n\
         - resolution_status: MONITORING, REMEDIATING, RESOLVED or ESCALATE\n\
         - pipeline_summary: <one sentence>",
        kinds = kinds.join(" | "),
    )
}
