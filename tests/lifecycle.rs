//! End-to-end lifecycle over a shared on-disk store: pipeline -> queue ->
//! runner -> verification, with scripted agents and no real control plane.

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};

use common::*;
use remediator::api::state::AppState;
use remediator::events::Progress;
use remediator::incident::{IncidentStore, NewIncident, ResolutionStatus};
use remediator::metrics;
use remediator::pipeline::PipelineOutcome;
use remediator::queue::{ActionQueue, ActionStatus, NewAction, QueueError, RiskLevel};
use remediator::runner::{Disabled, RunOutcome, Runner};
use remediator::verify::VerificationWorker;

fn new_action(service: &str, action: &str, incident_id: &str) -> NewAction {
    NewAction {
        incident_id: incident_id.to_string(),
        service: service.to_string(),
        action: action.to_string(),
        anomaly_type: "memory_leak".to_string(),
        root_cause: "unbounded session cache".to_string(),
        confidence_score: 0.9,
        risk_level: RiskLevel::Low,
        triggered_by: REMEDIATION_AGENT.to_string(),
    }
}

fn build(pool: remediator::storage::Pool, agent: Arc<ScriptedAgent>) -> AppState {
    AppState::build(&test_config(), pool, agent, Arc::new(Disabled))
}

/// Poll `done` for up to five seconds.
async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if done() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    done()
}

/// Open a REMEDIATING pipeline incident detected `age_secs` ago and run one
/// action for it to completion.
async fn executed_action(state: &AppState, service: &str, age_secs: i64) -> (String, String) {
    let incident = state
        .incidents
        .create(&NewIncident::pipeline(
            service,
            ResolutionStatus::Remediating,
            Utc::now() - Duration::seconds(age_secs),
        ))
        .unwrap();
    state
        .queue
        .enqueue(&new_action(service, "restart_service", &incident.id))
        .unwrap();

    match state.runner.run_once().await.unwrap() {
        RunOutcome::Finished { action, .. } => {
            assert_eq!(action.status, ActionStatus::Executed);
            (incident.id, action.exec_id)
        }
        other => panic!("expected a finished action, got {:?}", other),
    }
}

#[test]
fn test_concurrent_claims_exactly_one_wins() {
    let (_dir, pool) = temp_pool();
    let queue = ActionQueue::new(pool);
    let pending = queue
        .enqueue(&new_action("payment-service", "restart_service", "inc-1"))
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let queue = queue.clone();
            let snapshot = pending.clone();
            std::thread::spawn(move || queue.claim(&snapshot))
        })
        .collect();

    let mut won = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.join().unwrap() {
            Ok(_) => won += 1,
            Err(QueueError::Conflict { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(conflicts, 7);

    let stored = queue.get(&pending.id).unwrap().unwrap();
    assert_eq!(stored.status, ActionStatus::Executing);
    assert_eq!(stored.version, 2);
}

#[tokio::test]
async fn test_competing_runners_execute_once() {
    let (_dir, pool) = temp_pool();
    let config = test_config();
    let queue = ActionQueue::new(pool);
    let action = queue
        .enqueue(&new_action("payment-service", "scale_cache", "inc-1"))
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let runner = Runner::new(queue.clone(), Arc::new(Disabled), &config.runner);
        tasks.push(tokio::spawn(async move { runner.run_once().await }));
    }

    let mut finished = 0;
    for t in tasks {
        if let RunOutcome::Finished { .. } = t.await.unwrap().unwrap() {
            finished += 1;
        }
    }
    assert_eq!(finished, 1);
    assert_eq!(queue.results(10).unwrap().len(), 1);
    assert!(queue.result_for(&action.exec_id).unwrap().is_some());
}

#[tokio::test]
async fn test_runner_falls_back_to_synthetic_recovery() {
    let (_dir, pool) = temp_pool();
    let state = build(pool.clone(), ScriptedAgent::new());
    let queued = state
        .queue
        .enqueue(&new_action("auth-service", "restart_dependency", "inc-1"))
        .unwrap();

    let (action, result) = match state.runner.run_once().await.unwrap() {
        RunOutcome::Finished { action, result } => (action, result),
        other => panic!("expected a finished action, got {:?}", other),
    };
    assert_eq!(action.status, ActionStatus::Executed);
    assert_eq!(result.exec_id, queued.exec_id);
    assert!(!result.primary_used);
    assert!(result.output.starts_with("synthetic_fallback: wrote 32 recovery points"));

    let points = metrics::for_service(&pool, "auth-service").unwrap();
    assert_eq!(points.len(), 32);
    assert!(points.iter().all(|p| p.region == "us-west-2"));

    assert!(matches!(state.runner.run_once().await.unwrap(), RunOutcome::Idle));
}

#[tokio::test]
async fn test_unknown_action_fails_without_fallback() {
    let (_dir, pool) = temp_pool();
    let state = build(pool.clone(), ScriptedAgent::new());
    state
        .queue
        .enqueue(&new_action("payment-service", "reboot_datacenter", "inc-1"))
        .unwrap();

    match state.runner.run_once().await.unwrap() {
        RunOutcome::Finished { action, result } => {
            assert_eq!(action.status, ActionStatus::Failed);
            assert_eq!(result.output, "Unknown action: reboot_datacenter");
        }
        other => panic!("expected a finished action, got {:?}", other),
    }
    assert!(metrics::for_service(&pool, "payment-service").unwrap().is_empty());
}

#[tokio::test]
async fn test_worker_resolves_incident_with_mttr() {
    let (_dir, pool) = temp_pool();
    let agent = ScriptedAgent::new();
    agent.reply(VERIFICATION_AGENT, RECOVERED);
    let state = build(pool, agent.clone());

    let (incident_id, exec_id) = executed_action(&state, "payment-service", 252).await;

    let verified = state
        .worker
        .scan_once(Utc::now() + Duration::minutes(2))
        .await
        .unwrap();
    assert_eq!(verified, 1);

    let incident = state.incidents.get(&incident_id).unwrap().unwrap();
    assert_eq!(incident.resolution_status, ResolutionStatus::Resolved);
    assert!(incident.guardian_verified);
    assert!(incident.resolved_at.is_some());
    let mttr = incident.mttr_seconds.unwrap();
    assert!((252..=254).contains(&mttr), "mttr {}", mttr);
    assert!(incident.mttr_estimate.unwrap().starts_with("~4m"));

    let audit = state.audit.list_recent(10).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].exec_id, exec_id);
    assert_eq!(audit[0].decision, "RESOLVED");

    let snapshot = state.worker.snapshot();
    assert_eq!(snapshot.resolved_count, 1);
    assert_eq!(snapshot.recent_verdicts[0].exec_id, exec_id);
}

#[tokio::test]
async fn test_worker_escalates_when_a_sample_fails() {
    let (_dir, pool) = temp_pool();
    let agent = ScriptedAgent::new();
    agent.reply(VERIFICATION_AGENT, STILL_DEGRADED);
    let state = build(pool, agent);

    let (incident_id, _) = executed_action(&state, "payment-service", 120).await;
    state
        .worker
        .scan_once(Utc::now() + Duration::minutes(2))
        .await
        .unwrap();

    let incident = state.incidents.get(&incident_id).unwrap().unwrap();
    assert_eq!(incident.resolution_status, ResolutionStatus::Escalate);
    assert!(incident.escalated_at.is_some());
    assert!(incident.resolved_at.is_none());
    assert_eq!(state.worker.snapshot().escalated_count, 1);
}

#[tokio::test]
async fn test_each_execution_is_verified_once_across_workers() {
    let (_dir, pool) = temp_pool();
    let agent = ScriptedAgent::new();
    agent.reply(VERIFICATION_AGENT, RECOVERED);
    let state = build(pool.clone(), agent.clone());

    executed_action(&state, "payment-service", 200).await;
    let later = Utc::now() + Duration::minutes(2);

    assert_eq!(state.worker.scan_once(later).await.unwrap(), 1);
    assert_eq!(state.worker.scan_once(later).await.unwrap(), 0);
    let calls = agent.calls();

    // A restarted worker sees the durable marker.
    let restarted = build(pool, agent.clone());
    assert_eq!(restarted.worker.scan_once(later).await.unwrap(), 0);
    assert_eq!(agent.calls(), calls);
    assert_eq!(state.audit.list_recent(10).unwrap().len(), 1);
}

#[tokio::test]
async fn test_terminal_incident_is_not_repatched() {
    let (_dir, pool) = temp_pool();
    let agent = ScriptedAgent::new();
    agent.reply(VERIFICATION_AGENT, RECOVERED);
    let state = build(pool, agent.clone());

    let (incident_id, _) = executed_action(&state, "payment-service", 200).await;
    state
        .worker
        .scan_once(Utc::now() + Duration::minutes(2))
        .await
        .unwrap();
    let resolved = state.incidents.get(&incident_id).unwrap().unwrap();

    // A second execution for the same service gets verified and audited, but
    // the already-terminal incident stays as it was.
    agent.reply(VERIFICATION_AGENT, STILL_DEGRADED);
    state
        .queue
        .enqueue(&new_action("payment-service", "restart_service", &incident_id))
        .unwrap();
    state.runner.run_once().await.unwrap();
    state
        .worker
        .scan_once(Utc::now() + Duration::minutes(2))
        .await
        .unwrap();

    let after = state.incidents.get(&incident_id).unwrap().unwrap();
    assert_eq!(after.resolution_status, ResolutionStatus::Resolved);
    assert_eq!(after.version, resolved.version);
    assert_eq!(state.audit.list_recent(10).unwrap().len(), 2);
    assert!(!state.worker.snapshot().recent_verdicts[0].incident_updated);
}

#[tokio::test]
async fn test_failed_verification_does_not_stop_the_scan() {
    let (_dir, pool) = temp_pool();
    let agent = ScriptedAgent::new();
    agent.reply(VERIFICATION_AGENT, RECOVERED);
    let state = build(pool, agent.clone());

    let (first_incident, first_exec) = executed_action(&state, "payment-service", 200).await;
    let (second_incident, second_exec) = executed_action(&state, "auth-service", 200).await;

    agent.fail_next(1);
    let later = Utc::now() + Duration::minutes(2);
    assert_eq!(state.worker.scan_once(later).await.unwrap(), 1);

    let snapshot = state.worker.snapshot();
    assert_eq!(snapshot.failed_count, 1);
    assert_eq!(snapshot.resolved_count, 1);
    assert_eq!(snapshot.recent_verdicts[0].exec_id, second_exec);

    let first = state.incidents.get(&first_incident).unwrap().unwrap();
    assert_eq!(first.resolution_status, ResolutionStatus::Remediating);
    let second = state.incidents.get(&second_incident).unwrap().unwrap();
    assert_eq!(second.resolution_status, ResolutionStatus::Resolved);

    // The failed execution keeps its marker and is not retried.
    assert!(state.queue.find_by_exec_id(&first_exec).unwrap().unwrap().verified);
    assert_eq!(state.worker.scan_once(later).await.unwrap(), 0);
    assert_eq!(agent.calls(), 2);
}

#[tokio::test]
async fn test_scan_error_is_counted_and_next_scan_recovers() {
    let (_dir, pool) = temp_pool();
    let agent = ScriptedAgent::new();
    agent.reply(VERIFICATION_AGENT, RECOVERED);
    let state = build(pool.clone(), agent);

    let (_, exec_id) = executed_action(&state, "payment-service", 200).await;
    let set_risk = |risk: &str| {
        pool.get()
            .unwrap()
            .execute(
                "UPDATE remediation_actions SET risk_level = ?1 WHERE exec_id = ?2",
                rusqlite::params![risk, exec_id],
            )
            .unwrap();
    };

    set_risk("bogus");
    let later = Utc::now() + Duration::minutes(2);
    assert!(state.worker.scan_once(later).await.is_err());
    assert_eq!(state.worker.snapshot().checks_run, 1);

    set_risk("low");
    assert_eq!(state.worker.scan_once(later).await.unwrap(), 1);
    assert_eq!(state.worker.snapshot().resolved_count, 1);
}

#[tokio::test]
async fn test_worker_loop_survives_a_panicking_scan() {
    let (_dir, pool) = temp_pool();
    let agent = ScriptedAgent::new();
    agent.reply(VERIFICATION_AGENT, RECOVERED);
    let mut config = test_config();
    config.verification.interval_secs = 1;
    config.verification.settle_secs = 0;
    let state = AppState::build(&config, pool, agent.clone(), Arc::new(Disabled));

    let (panicked_incident, _) = executed_action(&state, "payment-service", 200).await;
    agent.panic_next(1);
    assert!(state.worker.start());
    assert!(wait_until(|| agent.calls() >= 1).await);

    let (incident_id, _) = executed_action(&state, "auth-service", 200).await;
    assert!(wait_until(|| state.worker.snapshot().resolved_count == 1).await);

    let snapshot = state.worker.snapshot();
    assert!(snapshot.running);
    assert!(snapshot.checks_run >= 2);
    let incident = state.incidents.get(&incident_id).unwrap().unwrap();
    assert_eq!(incident.resolution_status, ResolutionStatus::Resolved);
    let untouched = state.incidents.get(&panicked_incident).unwrap().unwrap();
    assert_eq!(untouched.resolution_status, ResolutionStatus::Remediating);

    state.worker.stop().await;
    assert!(!state.worker.snapshot().running);
}

#[tokio::test]
async fn test_on_demand_verification_claims_latest_execution() {
    let (_dir, pool) = temp_pool();
    let agent = ScriptedAgent::new();
    agent.reply(VERIFICATION_AGENT, RECOVERED);
    let state = build(pool, agent);

    let (incident_id, exec_id) = executed_action(&state, "payment-service", 90).await;
    let (progress, mut rx) = Progress::channel(64);
    let report = state
        .worker
        .verify_on_demand("payment-service", &progress)
        .await
        .unwrap();
    drop(progress);

    assert_eq!(report.exec_id, exec_id);
    assert_eq!(report.incident_id.as_deref(), Some(incident_id.as_str()));

    let mut names = Vec::new();
    while let Some(ev) = rx.recv().await {
        names.push(ev.event);
    }
    assert_eq!(names.first().map(String::as_str), Some("agent_start"));
    assert_eq!(names.last().map(String::as_str), Some("guardian_verdict"));

    // The periodic scan does not verify it again.
    assert_eq!(
        state
            .worker
            .scan_once(Utc::now() + Duration::minutes(2))
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_pipeline_skips_when_already_running() {
    let (_dir, pool) = temp_pool();
    let agent = ScriptedAgent::new();
    let state = build(pool, agent.clone());

    let _held = state.lock.try_acquire().unwrap();
    let outcome = state.pipeline.run(&Progress::Silent).await.unwrap();

    assert!(matches!(outcome, PipelineOutcome::AlreadyRunning));
    assert_eq!(agent.calls(), 0);
    assert!(state.incidents.list_recent(10).unwrap().is_empty());
}

#[tokio::test]
async fn test_pipeline_stops_on_healthy_detection() {
    let (_dir, pool) = temp_pool();
    let agent = ScriptedAgent::new();
    agent.reply(DETECTION_AGENT, "- anomaly_detected: false\n- summary: all services nominal");
    let state = build(pool, agent.clone());

    let outcome = state.pipeline.run(&Progress::Silent).await.unwrap();

    assert!(matches!(outcome, PipelineOutcome::Healthy));
    assert_eq!(agent.calls(), 1);
    assert!(state.incidents.list_recent(10).unwrap().is_empty());
    assert_eq!(state.queue.depth().unwrap(), 0);
}

#[tokio::test]
async fn test_pipeline_blocked_by_in_flight_incident() {
    let (_dir, pool) = temp_pool();
    let agent = ScriptedAgent::new();
    agent.reply(
        DETECTION_AGENT,
        "- anomaly_detected: true\n- anomaly_type: memory_leak\n- affected_service: payment-service",
    );
    let state = build(pool, agent.clone());
    state
        .incidents
        .create(&NewIncident::pipeline(
            "payment-service",
            ResolutionStatus::Remediating,
            Utc::now() - Duration::minutes(3),
        ))
        .unwrap();

    let outcome = state.pipeline.run(&Progress::Silent).await.unwrap();

    match outcome {
        PipelineOutcome::Blocked { service, decision } => {
            assert_eq!(service, "payment-service");
            assert!(!decision.is_allowed());
        }
        other => panic!("expected a gate block, got {:?}", other),
    }
    assert_eq!(agent.calls(), 1);
    assert_eq!(state.incidents.list_recent(10).unwrap().len(), 1);
    assert_eq!(state.queue.depth().unwrap(), 0);
}

fn script_full_pipeline(agent: &ScriptedAgent, confidence: &str) {
    agent.reply(
        DETECTION_AGENT,
        "- anomaly_detected: true\n\
         - anomaly_type: memory_leak_progressive\n\
         - affected_service: payment-service\n\
         - confidence: 88",
    );
    agent.reply(
        INVESTIGATION_AGENT,
        "- root_cause: session cache grows without eviction since v2.4.1\n\
         - recommended_action: rollback_deployment",
    );
    agent.reply(
        REMEDIATION_AGENT,
        &format!(
            "- service: payment-service\n\
             - recommended_action: rollback_deployment\n\
             - confidence_score: {}\n\
             - risk_level: medium\n\
             - resolution_status: REMEDIATING\n\
             - pipeline_summary: roll back v2.4.1",
            confidence
        ),
    );
}

#[tokio::test]
async fn test_autonomous_pipeline_writes_incident_and_action() {
    let (_dir, pool) = temp_pool();
    let agent = ScriptedAgent::new();
    script_full_pipeline(&agent, "0.92");
    let state = build(pool, agent.clone());

    let (progress, mut rx) = Progress::channel(256);
    let outcome = state.pipeline.run(&progress).await.unwrap();
    drop(progress);

    let (incident_id, exec_id) = match outcome {
        PipelineOutcome::Remediating { incident_id, exec_id, action, .. } => {
            assert_eq!(action, "rollback_deployment");
            (incident_id, exec_id)
        }
        other => panic!("expected remediation, got {:?}", other),
    };
    assert_eq!(agent.calls(), 3);

    let incident = state.incidents.get(&incident_id).unwrap().unwrap();
    assert_eq!(incident.resolution_status, ResolutionStatus::Remediating);
    assert!(incident.pipeline_run);
    assert_eq!(incident.anomaly_type, "memory_leak_progressive");

    let action = state.queue.find_by_exec_id(&exec_id).unwrap().unwrap();
    assert_eq!(action.status, ActionStatus::Pending);
    assert_eq!(action.incident_id, incident_id);
    assert_eq!(action.risk_level, RiskLevel::Medium);

    let mut names = Vec::new();
    while let Some(ev) = rx.recv().await {
        names.push(ev.event);
    }
    assert!(names.iter().any(|n| n == "remediation_triggered"));
    assert!(names.iter().any(|n| n == "remediation_queued"));
    assert_eq!(names.last().map(String::as_str), Some("pipeline_complete"));

    // The same service is now in flight; a second run is blocked.
    let second = state.pipeline.run(&Progress::Silent).await.unwrap();
    assert!(matches!(second, PipelineOutcome::Blocked { .. }));
    assert_eq!(state.queue.depth().unwrap(), 1);
}

#[tokio::test]
async fn test_low_confidence_records_monitoring_incident() {
    let (_dir, pool) = temp_pool();
    let agent = ScriptedAgent::new();
    script_full_pipeline(&agent, "0.40");
    let state = build(pool, agent);

    let outcome = state.pipeline.run(&Progress::Silent).await.unwrap();

    let incident_id = match outcome {
        PipelineOutcome::Skipped { incident_id, .. } => incident_id,
        other => panic!("expected a skipped remediation, got {:?}", other),
    };
    let incident = state.incidents.get(&incident_id).unwrap().unwrap();
    assert_eq!(incident.resolution_status, ResolutionStatus::Monitoring);
    assert_eq!(state.queue.depth().unwrap(), 0);
}

#[tokio::test]
async fn test_full_cycle_pipeline_to_resolution() {
    let (_dir, pool) = temp_pool();
    let agent = ScriptedAgent::new();
    script_full_pipeline(&agent, "0.92");
    agent.reply(VERIFICATION_AGENT, RECOVERED);
    let state = build(pool.clone(), agent);

    let incident_id = match state.pipeline.run(&Progress::Silent).await.unwrap() {
        PipelineOutcome::Remediating { incident_id, .. } => incident_id,
        other => panic!("expected remediation, got {:?}", other),
    };
    assert!(matches!(
        state.runner.run_once().await.unwrap(),
        RunOutcome::Finished { .. }
    ));
    assert_eq!(
        state
            .worker
            .scan_once(Utc::now() + Duration::minutes(2))
            .await
            .unwrap(),
        1
    );

    let incident = IncidentStore::new(pool)
        .get(&incident_id)
        .unwrap()
        .unwrap();
    assert_eq!(incident.resolution_status, ResolutionStatus::Resolved);

    // Resolved recently: the gate now holds the service in cooldown.
    let decision = state.gate.check("payment-service", Utc::now()).unwrap();
    assert!(!decision.is_allowed());
}

#[tokio::test]
async fn test_stopped_worker_does_not_restart() {
    let (_dir, pool) = temp_pool();
    let state = build(pool, ScriptedAgent::new());
    let worker: Arc<VerificationWorker> = state.worker.clone();

    assert!(worker.start());
    assert!(!worker.start());
    worker.stop().await;
    assert!(!worker.start());
    assert!(!worker.snapshot().running);
}
