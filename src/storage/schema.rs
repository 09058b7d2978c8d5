//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS incidents (
            id TEXT PRIMARY KEY,
            service TEXT NOT NULL,
            anomaly_type TEXT NOT NULL DEFAULT '',
            root_cause TEXT NOT NULL DEFAULT '',
            action_taken TEXT NOT NULL DEFAULT '',
            pipeline_summary TEXT NOT NULL DEFAULT '',
            resolution_status TEXT NOT NULL,
            pipeline_run INTEGER NOT NULL DEFAULT 0,
            detected_at TEXT NOT NULL,
            guardian_verified INTEGER NOT NULL DEFAULT 0,
            mttr_seconds INTEGER,
            mttr_estimate TEXT,
            verification_output TEXT,
            resolved_at TEXT,
            escalated_at TEXT,
            version INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS remediation_actions (
            id TEXT PRIMARY KEY,
            incident_id TEXT NOT NULL,
            service TEXT NOT NULL,
            action TEXT NOT NULL,
            anomaly_type TEXT NOT NULL DEFAULT '',
            root_cause TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            exec_id TEXT NOT NULL UNIQUE,
            confidence_score REAL NOT NULL,
            risk_level TEXT NOT NULL,
            triggered_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            claimed_at TEXT,
            executed_at TEXT,
            runner_output TEXT,
            verified INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS remediation_results (
            id INTEGER PRIMARY KEY,
            exec_id TEXT NOT NULL UNIQUE,
            incident_id TEXT NOT NULL,
            service TEXT NOT NULL,
            action TEXT NOT NULL,
            outcome TEXT NOT NULL,
            output TEXT NOT NULL,
            primary_used INTEGER NOT NULL,
            recorded_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS metrics (
            id INTEGER PRIMARY KEY,
            service TEXT NOT NULL,
            region TEXT NOT NULL,
            metric_type TEXT NOT NULL,
            value REAL NOT NULL,
            unit TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY,
            agent TEXT NOT NULL,
            service TEXT NOT NULL,
            exec_id TEXT NOT NULL DEFAULT '',
            decision TEXT NOT NULL,
            mttr_seconds INTEGER,
            summary TEXT NOT NULL DEFAULT '',
            raw_output TEXT NOT NULL DEFAULT '',
            recorded_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_incidents_service_detected ON incidents(service, detected_at);
        CREATE INDEX IF NOT EXISTS idx_actions_status_created ON remediation_actions(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_actions_status_executed ON remediation_actions(status, executed_at);
        CREATE INDEX IF NOT EXISTS idx_actions_service_created ON remediation_actions(service, created_at);
        CREATE INDEX IF NOT EXISTS idx_metrics_service_recorded ON metrics(service, recorded_at);
        CREATE INDEX IF NOT EXISTS idx_audit_recorded ON audit_log(recorded_at);

        CREATE TRIGGER IF NOT EXISTS remediation_results_write_once
        BEFORE UPDATE ON remediation_results
        BEGIN
            SELECT RAISE(ABORT, 'remediation results are write-once');
        END;",
    )?;

    conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}
