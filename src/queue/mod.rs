//! Remediation action queue.
//!
//! Each approved remediation decision is written as a `pending` action before
//! any side effect happens. Runners take ownership of an action through a
//! compare-and-swap on its `version` token; that conditional update is the
//! only thing standing between concurrent runners and a double execution.
//!
//! Status transitions are monotonic:
//! `pending -> executing -> executed | failed`.

pub mod result;

pub use self::result::{ExecutionReport, RemediationResult, ResultOutcome};

use crate::storage::{encode_ts, opt_ts_column, parsed_column, ts_column, Pool, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The version token was stale: somebody else already moved this action.
    #[error("action {id} was modified concurrently")]
    Conflict { id: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Store(e.into())
    }
}

impl From<r2d2::Error> for QueueError {
    fn from(e: r2d2::Error) -> Self {
        QueueError::Store(e.into())
    }
}

#[derive(Debug, Error)]
#[error("unknown action kind '{0}'")]
pub struct UnknownAction(pub String);

/// The fixed set of remediation operations a runner knows how to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RollbackDeployment,
    RestartService,
    ScaleCache,
    RestartDependency,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        ActionKind::RollbackDeployment,
        ActionKind::RestartService,
        ActionKind::ScaleCache,
        ActionKind::RestartDependency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::RollbackDeployment => "rollback_deployment",
            ActionKind::RestartService => "restart_service",
            ActionKind::ScaleCache => "scale_cache",
            ActionKind::RestartDependency => "restart_dependency",
        }
    }

    /// Default remediation for an anomaly type when the recommendation
    /// names none.
    pub fn for_anomaly(anomaly_type: &str) -> ActionKind {
        match anomaly_type.trim().to_ascii_lowercase().as_str() {
            "memory_leak_progressive" => ActionKind::RollbackDeployment,
            "memory_leak" => ActionKind::RestartService,
            "error_spike_sudden" => ActionKind::RollbackDeployment,
            "deployment_rollback" => ActionKind::RollbackDeployment,
            "latency_cascade" => ActionKind::RestartDependency,
            "cache_failure" => ActionKind::ScaleCache,
            "redis_failure" => ActionKind::RestartDependency,
            _ => ActionKind::RestartService,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ActionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

#[derive(Debug, Error)]
#[error("unknown action status '{0}'")]
pub struct UnknownActionStatus(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Executing,
    Executed,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Executing => "executing",
            ActionStatus::Executed => "executed",
            ActionStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        matches!(
            (self, next),
            (ActionStatus::Pending, ActionStatus::Executing)
                | (ActionStatus::Executing, ActionStatus::Executed)
                | (ActionStatus::Executing, ActionStatus::Failed)
        )
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = UnknownActionStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "executing" => Ok(ActionStatus::Executing),
            "executed" => Ok(ActionStatus::Executed),
            "failed" => Ok(ActionStatus::Failed),
            _ => Err(UnknownActionStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }

    /// Lenient parse for agent-supplied values; anything unrecognised is `low`.
    pub fn parse_lenient(s: &str) -> RiskLevel {
        s.parse().unwrap_or(RiskLevel::Low)
    }
}

#[derive(Debug, Error)]
#[error("unknown risk level '{0}'")]
pub struct UnknownRiskLevel(pub String);

impl std::str::FromStr for RiskLevel {
    type Err = UnknownRiskLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            _ => Err(UnknownRiskLevel(s.to_string())),
        }
    }
}

/// A queued remediation instruction.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationAction {
    pub id: String,
    pub incident_id: String,
    pub service: String,
    /// Stored as written; unknown kinds only fail at execution time.
    pub action: String,
    pub anomaly_type: String,
    pub root_cause: String,
    pub status: ActionStatus,
    pub exec_id: String,
    pub confidence_score: f64,
    pub risk_level: RiskLevel,
    pub triggered_by: String,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub runner_output: Option<String>,
    pub verified: bool,
    pub version: i64,
}

impl RemediationAction {
    pub fn kind(&self) -> Result<ActionKind, UnknownAction> {
        self.action.parse()
    }
}

/// Everything a consumer needs to act without going back to the agents.
#[derive(Debug, Clone)]
pub struct NewAction {
    pub incident_id: String,
    pub service: String,
    pub action: String,
    pub anomaly_type: String,
    pub root_cause: String,
    pub confidence_score: f64,
    pub risk_level: RiskLevel,
    pub triggered_by: String,
}

const ACTION_COLUMNS: &str = "id, incident_id, service, action, anomaly_type, root_cause, status,
     exec_id, confidence_score, risk_level, triggered_by, created_at, claimed_at,
     executed_at, runner_output, verified, version";

#[derive(Clone)]
pub struct ActionQueue {
    pool: Pool,
}

impl ActionQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Durably record a new `pending` action.
    pub fn enqueue(&self, new: &NewAction) -> Result<RemediationAction, QueueError> {
        let conn = self.pool.get()?;
        let id = Uuid::new_v4().to_string();
        let exec_id = new_exec_id();
        let created_at = Utc::now();

        conn.execute(
            "INSERT INTO remediation_actions (id, incident_id, service, action, anomaly_type,
                root_cause, status, exec_id, confidence_score, risk_level, triggered_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                new.incident_id,
                new.service,
                new.action,
                new.anomaly_type,
                new.root_cause,
                exec_id,
                new.confidence_score,
                new.risk_level.as_str(),
                new.triggered_by,
                encode_ts(created_at),
            ],
        )?;

        Ok(RemediationAction {
            id,
            incident_id: new.incident_id.clone(),
            service: new.service.clone(),
            action: new.action.clone(),
            anomaly_type: new.anomaly_type.clone(),
            root_cause: new.root_cause.clone(),
            status: ActionStatus::Pending,
            exec_id,
            confidence_score: new.confidence_score,
            risk_level: new.risk_level,
            triggered_by: new.triggered_by.clone(),
            created_at,
            claimed_at: None,
            executed_at: None,
            runner_output: None,
            verified: false,
            version: 1,
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<RemediationAction>, QueueError> {
        self.query_one(
            &format!("SELECT {} FROM remediation_actions WHERE id = ?1", ACTION_COLUMNS),
            params![id],
        )
    }

    pub fn find_by_exec_id(&self, exec_id: &str) -> Result<Option<RemediationAction>, QueueError> {
        self.query_one(
            &format!("SELECT {} FROM remediation_actions WHERE exec_id = ?1", ACTION_COLUMNS),
            params![exec_id],
        )
    }

    /// The single oldest `pending` action, with its current version token.
    pub fn poll_oldest_pending(&self) -> Result<Option<RemediationAction>, QueueError> {
        self.query_one(
            &format!(
                "SELECT {} FROM remediation_actions WHERE status = 'pending'
                 ORDER BY created_at ASC, rowid ASC LIMIT 1",
                ACTION_COLUMNS
            ),
            params![],
        )
    }

    /// Compare-and-swap `pending -> executing`.
    ///
    /// Fails with [`QueueError::Conflict`] when `action.version` is stale or
    /// the action is no longer pending.
    pub fn claim(&self, action: &RemediationAction) -> Result<RemediationAction, QueueError> {
        if !action.status.can_transition_to(ActionStatus::Executing) {
            return Err(QueueError::Conflict { id: action.id.clone() });
        }
        let conn = self.pool.get()?;
        let claimed_at = Utc::now();

        let changed = conn.execute(
            "UPDATE remediation_actions
             SET status = 'executing', claimed_at = ?1, version = version + 1
             WHERE id = ?2 AND version = ?3 AND status = 'pending'",
            params![encode_ts(claimed_at), action.id, action.version],
        )?;

        if changed == 0 {
            return Err(QueueError::Conflict { id: action.id.clone() });
        }

        let mut claimed = action.clone();
        claimed.status = ActionStatus::Executing;
        claimed.claimed_at = Some(claimed_at);
        claimed.version += 1;
        Ok(claimed)
    }

    /// Terminal update `executing -> executed | failed` plus the write-once
    /// result record, committed together.
    pub fn finalize(
        &self,
        action: &RemediationAction,
        report: &ExecutionReport,
    ) -> Result<(RemediationAction, RemediationResult), QueueError> {
        let status = report.final_status();
        if !action.status.can_transition_to(status) {
            return Err(QueueError::Conflict { id: action.id.clone() });
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let executed_at = Utc::now();

        let changed = tx.execute(
            "UPDATE remediation_actions
             SET status = ?1, executed_at = ?2, runner_output = ?3, version = version + 1
             WHERE id = ?4 AND version = ?5 AND status = 'executing'",
            params![
                status.as_str(),
                encode_ts(executed_at),
                report.output,
                action.id,
                action.version,
            ],
        )?;
        if changed == 0 {
            return Err(QueueError::Conflict { id: action.id.clone() });
        }

        let result = RemediationResult {
            exec_id: action.exec_id.clone(),
            incident_id: action.incident_id.clone(),
            service: action.service.clone(),
            action: action.action.clone(),
            outcome: report.outcome(),
            output: report.output.clone(),
            primary_used: report.primary_used,
            recorded_at: executed_at,
        };
        result::insert(&tx, &result)?;
        tx.commit()?;

        let mut finished = action.clone();
        finished.status = status;
        finished.executed_at = Some(executed_at);
        finished.runner_output = Some(report.output.clone());
        finished.version += 1;
        Ok((finished, result))
    }

    /// Number of actions waiting for a runner.
    pub fn depth(&self) -> Result<i64, QueueError> {
        let conn = self.pool.get()?;
        let depth = conn.query_row(
            "SELECT COUNT(*) FROM remediation_actions WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(depth)
    }

    pub fn list_recent(&self, limit: usize) -> Result<Vec<RemediationAction>, QueueError> {
        self.query_many(
            &format!(
                "SELECT {} FROM remediation_actions ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                ACTION_COLUMNS
            ),
            params![limit as i64],
        )
    }

    pub fn latest_for_service(
        &self,
        service: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<RemediationAction>, QueueError> {
        self.query_one(
            &format!(
                "SELECT {} FROM remediation_actions WHERE service = ?1 AND created_at >= ?2
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                ACTION_COLUMNS
            ),
            params![service, encode_ts(since)],
        )
    }

    /// Executed, not yet verified actions whose execution settled for at
    /// least `settle` but is no older than `staleness`, oldest first.
    pub fn verification_candidates(
        &self,
        now: DateTime<Utc>,
        settle: chrono::Duration,
        staleness: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<RemediationAction>, QueueError> {
        self.query_many(
            &format!(
                "SELECT {} FROM remediation_actions
                 WHERE status = 'executed' AND verified = 0
                   AND executed_at >= ?1 AND executed_at <= ?2
                 ORDER BY executed_at ASC, rowid ASC LIMIT ?3",
                ACTION_COLUMNS
            ),
            params![
                encode_ts(now - staleness),
                encode_ts(now - settle),
                limit as i64
            ],
        )
    }

    /// Set the durable idempotency marker. A conflict means another verifier
    /// (or an earlier run of this process) already took the action.
    pub fn mark_verified(&self, action: &RemediationAction) -> Result<RemediationAction, QueueError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE remediation_actions SET verified = 1, version = version + 1
             WHERE id = ?1 AND version = ?2 AND verified = 0",
            params![action.id, action.version],
        )?;
        if changed == 0 {
            return Err(QueueError::Conflict { id: action.id.clone() });
        }

        let mut marked = action.clone();
        marked.verified = true;
        marked.version += 1;
        Ok(marked)
    }

    pub fn results(&self, limit: usize) -> Result<Vec<RemediationResult>, QueueError> {
        let conn = self.pool.get()?;
        Ok(result::list_recent(&conn, limit)?)
    }

    pub fn result_for(&self, exec_id: &str) -> Result<Option<RemediationResult>, QueueError> {
        let conn = self.pool.get()?;
        Ok(result::get(&conn, exec_id)?)
    }

    fn query_one<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Option<RemediationAction>, QueueError> {
        let conn = self.pool.get()?;
        let action = conn.query_row(sql, params, action_from_row).optional()?;
        Ok(action)
    }

    fn query_many<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<RemediationAction>, QueueError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, action_from_row)?;

        let mut actions = Vec::new();
        for r in rows {
            actions.push(r?);
        }
        Ok(actions)
    }
}

/// Short correlation token threading an action through its result,
/// verification and audit records.
fn new_exec_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

fn action_from_row(row: &Row<'_>) -> rusqlite::Result<RemediationAction> {
    Ok(RemediationAction {
        id: row.get(0)?,
        incident_id: row.get(1)?,
        service: row.get(2)?,
        action: row.get(3)?,
        anomaly_type: row.get(4)?,
        root_cause: row.get(5)?,
        status: parsed_column::<ActionStatus>(row, 6)?,
        exec_id: row.get(7)?,
        confidence_score: row.get(8)?,
        risk_level: parsed_column::<RiskLevel>(row, 9)?,
        triggered_by: row.get(10)?,
        created_at: ts_column(row, 11)?,
        claimed_at: opt_ts_column(row, 12)?,
        executed_at: opt_ts_column(row, 13)?,
        runner_output: row.get(14)?,
        verified: row.get(15)?,
        version: row.get(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;
    use chrono::Duration;

    fn new_action(service: &str, action: &str) -> NewAction {
        NewAction {
            incident_id: "inc-1".to_string(),
            service: service.to_string(),
            action: action.to_string(),
            anomaly_type: "memory_leak".to_string(),
            root_cause: "unbounded session cache".to_string(),
            confidence_score: 0.91,
            risk_level: RiskLevel::Low,
            triggered_by: "remediation-agent".to_string(),
        }
    }

    #[test]
    fn test_enqueue_writes_pending_with_exec_id() {
        let (_dir, pool) = test_pool();
        let queue = ActionQueue::new(pool);
        let action = queue.enqueue(&new_action("payment-service", "restart_service")).unwrap();

        assert_eq!(action.status, ActionStatus::Pending);
        assert_eq!(action.exec_id.len(), 8);
        assert_eq!(queue.depth().unwrap(), 1);

        let stored = queue.get(&action.id).unwrap().unwrap();
        assert_eq!(stored.exec_id, action.exec_id);
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn test_unknown_kind_is_accepted_at_write_time() {
        let (_dir, pool) = test_pool();
        let queue = ActionQueue::new(pool);
        let action = queue.enqueue(&new_action("payment-service", "reboot_datacenter")).unwrap();
        assert_eq!(action.status, ActionStatus::Pending);
        assert!(action.kind().is_err());
    }

    #[test]
    fn test_poll_returns_oldest_pending() {
        let (_dir, pool) = test_pool();
        let queue = ActionQueue::new(pool);
        let first = queue.enqueue(&new_action("payment-service", "restart_service")).unwrap();
        let _second = queue.enqueue(&new_action("auth-service", "scale_cache")).unwrap();

        let polled = queue.poll_oldest_pending().unwrap().unwrap();
        assert_eq!(polled.id, first.id);
    }

    #[test]
    fn test_claim_with_stale_version_conflicts() {
        let (_dir, pool) = test_pool();
        let queue = ActionQueue::new(pool);
        let action = queue.enqueue(&new_action("payment-service", "restart_service")).unwrap();

        let claimed = queue.claim(&action).unwrap();
        assert_eq!(claimed.status, ActionStatus::Executing);
        assert_eq!(claimed.version, 2);

        match queue.claim(&action) {
            Err(QueueError::Conflict { id }) => assert_eq!(id, action.id),
            other => panic!("expected conflict, got {:?}", other),
        }
        assert!(queue.poll_oldest_pending().unwrap().is_none());
    }

    #[test]
    fn test_claim_rejects_snapshot_that_is_not_pending() {
        let (_dir, pool) = test_pool();
        let queue = ActionQueue::new(pool);
        let action = queue.enqueue(&new_action("payment-service", "restart_service")).unwrap();
        let claimed = queue.claim(&action).unwrap();

        assert!(matches!(queue.claim(&claimed), Err(QueueError::Conflict { .. })));
        let stored = queue.get(&action.id).unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Executing);
        assert_eq!(stored.version, claimed.version);
    }

    #[test]
    fn test_finalize_writes_matching_result() {
        let (_dir, pool) = test_pool();
        let queue = ActionQueue::new(pool);
        let action = queue.enqueue(&new_action("payment-service", "restart_service")).unwrap();
        let claimed = queue.claim(&action).unwrap();

        let (finished, result) = queue
            .finalize(&claimed, &ExecutionReport::failure("container not found", true))
            .unwrap();
        assert_eq!(finished.status, ActionStatus::Failed);
        assert_eq!(result.exec_id, action.exec_id);
        assert_eq!(result.outcome, ResultOutcome::Failure);

        let stored = queue.result_for(&action.exec_id).unwrap().unwrap();
        assert_eq!(stored.output, "container not found");

        // Terminal: finalizing again is rejected.
        assert!(matches!(
            queue.finalize(&finished, &ExecutionReport::success("again", true)),
            Err(QueueError::Conflict { .. })
        ));
    }

    #[test]
    fn test_finalize_requires_claim() {
        let (_dir, pool) = test_pool();
        let queue = ActionQueue::new(pool);
        let action = queue.enqueue(&new_action("payment-service", "restart_service")).unwrap();
        assert!(matches!(
            queue.finalize(&action, &ExecutionReport::success("ok", true)),
            Err(QueueError::Conflict { .. })
        ));
        assert!(queue.result_for(&action.exec_id).unwrap().is_none());
    }

    #[test]
    fn test_verification_candidates_window_and_marker() {
        let (_dir, pool) = test_pool();
        let queue = ActionQueue::new(pool);
        let action = queue.enqueue(&new_action("payment-service", "restart_service")).unwrap();
        let claimed = queue.claim(&action).unwrap();
        let (executed, _) = queue
            .finalize(&claimed, &ExecutionReport::success("restarted payment-service", true))
            .unwrap();
        let executed_at = executed.executed_at.unwrap();

        let settle = Duration::seconds(60);
        let staleness = Duration::minutes(10);

        // Too fresh.
        let early = queue
            .verification_candidates(executed_at + Duration::seconds(10), settle, staleness, 10)
            .unwrap();
        assert!(early.is_empty());

        // Too stale.
        let late = queue
            .verification_candidates(executed_at + Duration::minutes(11), settle, staleness, 10)
            .unwrap();
        assert!(late.is_empty());

        let now = executed_at + Duration::minutes(2);
        let ready = queue.verification_candidates(now, settle, staleness, 10).unwrap();
        assert_eq!(ready.len(), 1);

        queue.mark_verified(&ready[0]).unwrap();
        assert!(matches!(
            queue.mark_verified(&ready[0]),
            Err(QueueError::Conflict { .. })
        ));
        assert!(queue
            .verification_candidates(now, settle, staleness, 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_action_status_transitions_are_monotonic() {
        use ActionStatus::*;
        assert!(Pending.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Executed));
        assert!(Executing.can_transition_to(Failed));
        assert!(!Executing.can_transition_to(Pending));
        assert!(!Executed.can_transition_to(Executing));
        assert!(!Failed.can_transition_to(Executed));
        assert!(!Pending.can_transition_to(Executed));
    }

    #[test]
    fn test_anomaly_defaults() {
        assert_eq!(ActionKind::for_anomaly("cache_failure"), ActionKind::ScaleCache);
        assert_eq!(ActionKind::for_anomaly("LATENCY_CASCADE"), ActionKind::RestartDependency);
        assert_eq!(ActionKind::for_anomaly("something_new"), ActionKind::RestartService);
    }
}
