//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use remediator::agent::{AgentClient, AgentEvent};
use remediator::config::{Config, ControlPlaneKind};
use remediator::storage::{self, Pool};

/// Agent that answers each agent id with a fixed reply and counts calls.
/// The next few calls can be made to error or panic instead.
#[derive(Default)]
pub struct ScriptedAgent {
    replies: Mutex<HashMap<String, String>>,
    calls: AtomicUsize,
    failures: AtomicUsize,
    panics: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, agent_id: &str, text: &str) {
        if let Ok(mut r) = self.replies.lock() {
            r.insert(agent_id.to_string(), text.to_string());
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The next `n` calls stream an error instead of their reply.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` calls panic.
    pub fn panic_next(&self, n: usize) {
        self.panics.store(n, Ordering::SeqCst);
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl AgentClient for ScriptedAgent {
    async fn converse(&self, agent_id: &str, _prompt: &str) -> BoxStream<'static, AgentEvent> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.panics) {
            panic!("scripted agent panic");
        }
        if take_one(&self.failures) {
            return stream::once(async { AgentEvent::Error("scripted failure".to_string()) }).boxed();
        }
        let reply = self
            .replies
            .lock()
            .ok()
            .and_then(|r| r.get(agent_id).cloned());
        match reply {
            Some(text) => stream::iter(vec![
                AgentEvent::Reasoning("Fetching metrics".to_string()),
                AgentEvent::MessageChunk(text.clone()),
                AgentEvent::MessageComplete(text),
            ])
            .boxed(),
            None => stream::once(async move {
                AgentEvent::Error("no scripted reply".to_string())
            })
            .boxed(),
        }
    }
}

/// Fresh on-disk store in a temp directory. Keep the dir alive for the test.
pub fn temp_pool() -> (tempfile::TempDir, Pool) {
    let dir = tempfile::tempdir().unwrap();
    let pool = storage::open_pool(&dir.path().join("remediator.db")).unwrap();
    (dir, pool)
}

/// Defaults with no real control plane and no background loops.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.runner.control_plane = ControlPlaneKind::Disabled;
    config.runner.embedded = false;
    config.verification.enabled = false;
    config
}

pub const VERIFICATION_AGENT: &str = "guardian-verification-agent";
pub const DETECTION_AGENT: &str = "cassandra-detection-agent";
pub const INVESTIGATION_AGENT: &str = "archaeologist-investigation-agent";
pub const REMEDIATION_AGENT: &str = "surgeon-action-agent";

pub const RECOVERED: &str = "- service: payment-service\n\
- verdict: RESOLVED\n\
- memory_pct: 48.2\n\
- error_rate: 0.4\n\
- latency_ms: 120\n\
- confidence: 92\n\
- summary: Memory back to baseline after restart";

pub const STILL_DEGRADED: &str = "- service: payment-service\n\
- verdict: RESOLVED\n\
- memory_pct: 81.0\n\
- error_rate: 0.4\n\
- latency_ms: 120\n\
- confidence: 70\n\
- summary: Memory still elevated";
