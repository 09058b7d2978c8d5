//! Write-once execution results, keyed by `exec_id`.

use crate::queue::ActionStatus;
use crate::storage::{encode_ts, parsed_column, ts_column};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOutcome {
    Success,
    Failure,
}

impl ResultOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultOutcome::Success => "success",
            ResultOutcome::Failure => "failure",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown result outcome '{0}'")]
pub struct UnknownOutcome(pub String);

impl std::str::FromStr for ResultOutcome {
    type Err = UnknownOutcome;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ResultOutcome::Success),
            "failure" => Ok(ResultOutcome::Failure),
            _ => Err(UnknownOutcome(s.to_string())),
        }
    }
}

/// What a runner learned while executing one action.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub success: bool,
    pub output: String,
    /// `true` when the control plane did the work, `false` for the
    /// synthetic-recovery fallback or a failure before any call.
    pub primary_used: bool,
}

impl ExecutionReport {
    pub fn success(output: impl Into<String>, primary_used: bool) -> Self {
        Self { success: true, output: output.into(), primary_used }
    }

    pub fn failure(output: impl Into<String>, primary_used: bool) -> Self {
        Self { success: false, output: output.into(), primary_used }
    }

    pub fn final_status(&self) -> ActionStatus {
        if self.success {
            ActionStatus::Executed
        } else {
            ActionStatus::Failed
        }
    }

    pub fn outcome(&self) -> ResultOutcome {
        if self.success {
            ResultOutcome::Success
        } else {
            ResultOutcome::Failure
        }
    }
}

/// Immutable audit record of one execution.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationResult {
    pub exec_id: String,
    pub incident_id: String,
    pub service: String,
    pub action: String,
    pub outcome: ResultOutcome,
    pub output: String,
    pub primary_used: bool,
    pub recorded_at: DateTime<Utc>,
}

pub(crate) fn insert(conn: &Connection, r: &RemediationResult) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO remediation_results
            (exec_id, incident_id, service, action, outcome, output, primary_used, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            r.exec_id,
            r.incident_id,
            r.service,
            r.action,
            r.outcome.as_str(),
            r.output,
            r.primary_used,
            encode_ts(r.recorded_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn get(conn: &Connection, exec_id: &str) -> rusqlite::Result<Option<RemediationResult>> {
    conn.query_row(
        "SELECT exec_id, incident_id, service, action, outcome, output, primary_used, recorded_at
         FROM remediation_results WHERE exec_id = ?1",
        params![exec_id],
        result_from_row,
    )
    .optional()
}

pub(crate) fn list_recent(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<RemediationResult>> {
    let mut stmt = conn.prepare(
        "SELECT exec_id, incident_id, service, action, outcome, output, primary_used, recorded_at
         FROM remediation_results ORDER BY recorded_at DESC, id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], result_from_row)?;
    rows.collect()
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<RemediationResult> {
    Ok(RemediationResult {
        exec_id: row.get(0)?,
        incident_id: row.get(1)?,
        service: row.get(2)?,
        action: row.get(3)?,
        outcome: parsed_column::<ResultOutcome>(row, 4)?,
        output: row.get(5)?,
        primary_used: row.get(6)?,
        recorded_at: ts_column(row, 7)?,
    })
}
