//! Incident records and their resolution state machine.
//!
//! Incidents are created by the detection pipeline and leave a non-terminal
//! state only through the verification loop's terminal patch:
//!
//! ```text
//! MONITORING  ──┐          ┌──> RESOLVED
//!               ├──verify──┤
//! REMEDIATING ──┘          └──> ESCALATE
//! ```

pub mod store;

pub use self::store::IncidentStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown resolution status '{0}'")]
pub struct UnknownStatus(pub String);

/// Resolution status of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStatus {
    Monitoring,
    Remediating,
    Resolved,
    Escalate,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::Monitoring => "MONITORING",
            ResolutionStatus::Remediating => "REMEDIATING",
            ResolutionStatus::Resolved => "RESOLVED",
            ResolutionStatus::Escalate => "ESCALATE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ResolutionStatus::Resolved | ResolutionStatus::Escalate)
    }

    /// Terminal states have no outgoing edges; non-terminal states may only
    /// move to a terminal one.
    pub fn can_transition_to(&self, next: ResolutionStatus) -> bool {
        !self.is_terminal() && next.is_terminal()
    }
}

impl std::fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResolutionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MONITORING" => Ok(ResolutionStatus::Monitoring),
            "REMEDIATING" => Ok(ResolutionStatus::Remediating),
            "RESOLVED" => Ok(ResolutionStatus::Resolved),
            "ESCALATE" => Ok(ResolutionStatus::Escalate),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// The two terminal outcomes a verification can write back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalStatus {
    Resolved,
    Escalate,
}

impl TerminalStatus {
    pub fn status(&self) -> ResolutionStatus {
        match self {
            TerminalStatus::Resolved => ResolutionStatus::Resolved,
            TerminalStatus::Escalate => ResolutionStatus::Escalate,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.status().as_str()
    }
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored incident.
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub id: String,
    pub service: String,
    pub anomaly_type: String,
    pub root_cause: String,
    pub action_taken: String,
    pub pipeline_summary: String,
    pub resolution_status: ResolutionStatus,
    pub pipeline_run: bool,
    pub detected_at: DateTime<Utc>,
    pub guardian_verified: bool,
    pub mttr_seconds: Option<i64>,
    pub mttr_estimate: Option<String>,
    pub verification_output: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Incident {
    /// Age relative to `now`; never negative.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.detected_at).max(chrono::Duration::zero())
    }
}

/// Fields supplied when the pipeline opens an incident.
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub service: String,
    pub anomaly_type: String,
    pub root_cause: String,
    pub action_taken: String,
    pub pipeline_summary: String,
    pub resolution_status: ResolutionStatus,
    pub pipeline_run: bool,
    pub detected_at: DateTime<Utc>,
}

impl NewIncident {
    pub fn pipeline(service: &str, status: ResolutionStatus, detected_at: DateTime<Utc>) -> Self {
        Self {
            service: service.to_string(),
            anomaly_type: String::new(),
            root_cause: String::new(),
            action_taken: String::new(),
            pipeline_summary: String::new(),
            resolution_status: status,
            pipeline_run: true,
            detected_at,
        }
    }
}

/// The verification loop's write-back: the only way out of a non-terminal state.
#[derive(Debug, Clone)]
pub struct TerminalPatch {
    pub verdict: TerminalStatus,
    pub mttr_seconds: i64,
    pub mttr_estimate: String,
    pub output: String,
    pub at: DateTime<Utc>,
}
