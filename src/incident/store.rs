use crate::incident::{Incident, NewIncident, ResolutionStatus, TerminalPatch, TerminalStatus};
use crate::storage::{encode_ts, opt_ts_column, parsed_column, ts_column, Pool, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

const INCIDENT_COLUMNS: &str = "id, service, anomaly_type, root_cause, action_taken, pipeline_summary,
     resolution_status, pipeline_run, detected_at, guardian_verified, mttr_seconds,
     mttr_estimate, verification_output, resolved_at, escalated_at, version";

/// Manual-response baseline reported next to the automated MTTR (47 minutes).
pub const MANUAL_BASELINE_SECONDS: i64 = 2820;

/// Aggregate view used by the dashboard stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentStats {
    pub incidents: i64,
    pub resolved: i64,
    pub escalated: i64,
    pub avg_mttr_seconds: i64,
    pub manual_baseline_seconds: i64,
}

#[derive(Clone)]
pub struct IncidentStore {
    pool: Pool,
}

impl IncidentStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn create(&self, new: &NewIncident) -> Result<Incident, StoreError> {
        let conn = self.pool.get()?;
        let id = Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO incidents (id, service, anomaly_type, root_cause, action_taken,
                pipeline_summary, resolution_status, pipeline_run, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                new.service,
                new.anomaly_type,
                new.root_cause,
                new.action_taken,
                new.pipeline_summary,
                new.resolution_status.as_str(),
                new.pipeline_run,
                encode_ts(new.detected_at),
            ],
        )?;

        Ok(Incident {
            id,
            service: new.service.clone(),
            anomaly_type: new.anomaly_type.clone(),
            root_cause: new.root_cause.clone(),
            action_taken: new.action_taken.clone(),
            pipeline_summary: new.pipeline_summary.clone(),
            resolution_status: new.resolution_status,
            pipeline_run: new.pipeline_run,
            detected_at: new.detected_at,
            guardian_verified: false,
            mttr_seconds: None,
            mttr_estimate: None,
            verification_output: None,
            resolved_at: None,
            escalated_at: None,
            version: 1,
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<Incident>, StoreError> {
        let conn = self.pool.get()?;
        let sql = format!("SELECT {} FROM incidents WHERE id = ?1", INCIDENT_COLUMNS);
        let incident = conn
            .query_row(&sql, params![id], incident_from_row)
            .optional()?;
        Ok(incident)
    }

    /// Most recent pipeline-originated incident for `service` detected at or
    /// after `since`.
    pub fn latest_pipeline_incident(
        &self,
        service: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Incident>, StoreError> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {} FROM incidents
             WHERE service = ?1 AND pipeline_run = 1 AND detected_at >= ?2
             ORDER BY detected_at DESC, rowid DESC
             LIMIT 1",
            INCIDENT_COLUMNS
        );
        let incident = conn
            .query_row(&sql, params![service, encode_ts(since)], incident_from_row)
            .optional()?;
        Ok(incident)
    }

    /// Move an open incident to its terminal state.
    ///
    /// Returns `false` when the incident was already terminal (or missing);
    /// the conditional update guarantees no edge ever leaves RESOLVED/ESCALATE.
    pub fn apply_terminal(&self, id: &str, patch: &TerminalPatch) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let at = encode_ts(patch.at);
        let (resolved_at, escalated_at) = match patch.verdict {
            TerminalStatus::Resolved => (Some(at), None),
            TerminalStatus::Escalate => (None, Some(at)),
        };

        let changed = conn.execute(
            "UPDATE incidents
             SET resolution_status = ?1,
                 guardian_verified = 1,
                 mttr_seconds = ?2,
                 mttr_estimate = ?3,
                 verification_output = ?4,
                 resolved_at = COALESCE(?5, resolved_at),
                 escalated_at = COALESCE(?6, escalated_at),
                 version = version + 1
             WHERE id = ?7 AND resolution_status IN ('MONITORING', 'REMEDIATING')",
            params![
                patch.verdict.as_str(),
                patch.mttr_seconds,
                patch.mttr_estimate,
                patch.output,
                resolved_at,
                escalated_at,
                id,
            ],
        )?;

        Ok(changed > 0)
    }

    pub fn list_recent(&self, limit: usize) -> Result<Vec<Incident>, StoreError> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {} FROM incidents ORDER BY detected_at DESC, rowid DESC LIMIT ?1",
            INCIDENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], incident_from_row)?;

        let mut incidents = Vec::new();
        for r in rows {
            incidents.push(r?);
        }
        Ok(incidents)
    }

    pub fn stats(&self, since: DateTime<Utc>) -> Result<IncidentStats, StoreError> {
        let conn = self.pool.get()?;
        let stats = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(resolution_status = 'RESOLVED'), 0),
                    COALESCE(SUM(resolution_status = 'ESCALATE'), 0),
                    AVG(mttr_seconds)
             FROM incidents WHERE detected_at >= ?1",
            params![encode_ts(since)],
            |row| {
                let avg: Option<f64> = row.get(3)?;
                Ok(IncidentStats {
                    incidents: row.get(0)?,
                    resolved: row.get(1)?,
                    escalated: row.get(2)?,
                    avg_mttr_seconds: avg.map(|v| v.round() as i64).unwrap_or(0),
                    manual_baseline_seconds: MANUAL_BASELINE_SECONDS,
                })
            },
        )?;
        Ok(stats)
    }
}

fn incident_from_row(row: &Row<'_>) -> rusqlite::Result<Incident> {
    Ok(Incident {
        id: row.get(0)?,
        service: row.get(1)?,
        anomaly_type: row.get(2)?,
        root_cause: row.get(3)?,
        action_taken: row.get(4)?,
        pipeline_summary: row.get(5)?,
        resolution_status: parsed_column::<ResolutionStatus>(row, 6)?,
        pipeline_run: row.get(7)?,
        detected_at: ts_column(row, 8)?,
        guardian_verified: row.get(9)?,
        mttr_seconds: row.get(10)?,
        mttr_estimate: row.get(11)?,
        verification_output: row.get(12)?,
        resolved_at: opt_ts_column(row, 13)?,
        escalated_at: opt_ts_column(row, 14)?,
        version: row.get(15)?,
    })
}
