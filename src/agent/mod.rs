//! Boundary to the external analysis agents (detection, investigation,
//! remediation, verification).
//!
//! Agents are consumed as a stream of [`AgentEvent`]s. Their final message is
//! free text in a loose `- field: value` format and is treated as untrusted
//! input; see [`parse`].

pub mod http;
pub mod parse;

pub use self::http::HttpAgentClient;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::events::Progress;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent {agent} failed: {message}")]
    Failed { agent: String, message: String },
    #[error("agent {0} returned no final message")]
    NoOutput(String),
}

/// One event from an agent conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Transient reasoning label.
    Reasoning(String),
    ThinkingComplete { time_to_first_token_ms: u64 },
    /// A fragment of the final message.
    MessageChunk(String),
    /// The full final message.
    MessageComplete(String),
    Error(String),
}

impl AgentEvent {
    /// Event name as forwarded to progress listeners.
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::Reasoning(_) => "reasoning",
            AgentEvent::ThinkingComplete { .. } => "thinking_complete",
            AgentEvent::MessageChunk(_) => "message_chunk",
            AgentEvent::MessageComplete(_) => "message_complete",
            AgentEvent::Error(_) => "error",
        }
    }

    pub fn text(&self) -> String {
        match self {
            AgentEvent::Reasoning(t)
            | AgentEvent::MessageChunk(t)
            | AgentEvent::MessageComplete(t)
            | AgentEvent::Error(t) => t.clone(),
            AgentEvent::ThinkingComplete { time_to_first_token_ms } => {
                format!("Thinking complete ({}ms)", time_to_first_token_ms)
            }
        }
    }
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Start a conversation. Transport failures arrive as
    /// [`AgentEvent::Error`] rather than as a `Result`.
    async fn converse(&self, agent_id: &str, prompt: &str) -> BoxStream<'static, AgentEvent>;
}

/// Used when no agent endpoint is configured; every call fails fast.
pub struct UnconfiguredAgent;

#[async_trait]
impl AgentClient for UnconfiguredAgent {
    async fn converse(&self, agent_id: &str, _prompt: &str) -> BoxStream<'static, AgentEvent> {
        let message = format!("no agent endpoint configured for {}", agent_id);
        stream::once(async move { AgentEvent::Error(message) }).boxed()
    }
}

/// Drain a conversation and return the last complete message.
pub async fn final_message(
    agent_id: &str,
    mut events: BoxStream<'static, AgentEvent>,
) -> Result<String, AgentError> {
    let mut output = None;
    while let Some(event) = events.next().await {
        match event {
            AgentEvent::MessageComplete(text) => output = Some(text),
            AgentEvent::Error(message) => {
                return Err(AgentError::Failed { agent: agent_id.to_string(), message })
            }
            _ => {}
        }
    }
    output
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| AgentError::NoOutput(agent_id.to_string()))
}

/// Run one agent, forwarding its events to `progress` between an
/// `agent_start` and an `agent_complete`.
///
/// `label` is the short agent name shown to listeners (e.g. `verification`).
pub async fn run_agent(
    client: &dyn AgentClient,
    agent_id: &str,
    label: &str,
    prompt: &str,
    progress: &Progress,
) -> Result<String, AgentError> {
    progress
        .emit("agent_start", json!({ "agent": label, "agent_id": agent_id }))
        .await;

    let mut events = client.converse(agent_id, prompt).await;
    let mut output = String::new();
    while let Some(event) = events.next().await {
        progress.emit(event.name(), event_payload(label, &event)).await;
        match event {
            AgentEvent::MessageComplete(text) => output = text,
            AgentEvent::Error(message) => {
                warn!(agent = %agent_id, error = %message, "agent call failed");
                return Err(AgentError::Failed { agent: agent_id.to_string(), message });
            }
            _ => {}
        }
    }

    progress
        .emit("agent_complete", json!({ "agent": label, "text": output }))
        .await;

    if output.trim().is_empty() {
        return Err(AgentError::NoOutput(agent_id.to_string()));
    }
    debug!(agent = %agent_id, len = output.len(), "agent finished");
    Ok(output)
}

fn event_payload(label: &str, event: &AgentEvent) -> Value {
    json!({ "agent": label, "text": event.text() })
}
