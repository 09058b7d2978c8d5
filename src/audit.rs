//! Append-only log of agent decisions (verification verdicts, gate blocks).

use crate::storage::{encode_ts, ts_column, Pool, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub agent: String,
    pub service: String,
    pub exec_id: String,
    pub decision: String,
    pub mttr_seconds: Option<i64>,
    pub summary: String,
    pub raw_output: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AuditLog {
    pool: Pool,
}

impl AuditLog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn append(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO audit_log (agent, service, exec_id, decision, mttr_seconds, summary,
                raw_output, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.agent,
                record.service,
                record.exec_id,
                record.decision,
                record.mttr_seconds,
                record.summary,
                record.raw_output,
                encode_ts(record.recorded_at),
            ],
        )?;
        Ok(())
    }

    pub fn list_recent(&self, limit: usize) -> Result<Vec<AuditRecord>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT agent, service, exec_id, decision, mttr_seconds, summary, raw_output, recorded_at
             FROM audit_log ORDER BY recorded_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(AuditRecord {
                agent: row.get(0)?,
                service: row.get(1)?,
                exec_id: row.get(2)?,
                decision: row.get(3)?,
                mttr_seconds: row.get(4)?,
                summary: row.get(5)?,
                raw_output: row.get(6)?,
                recorded_at: ts_column(row, 7)?,
            })
        })?;

        let mut records = Vec::new();
        for r in rows {
            records.push(r?);
        }
        Ok(records)
    }
}
