//! Streaming HTTP client for the agent host's `converse/async` endpoint.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{AgentClient, AgentEvent};

const CONVERSE_PATH: &str = "/api/agent_builder/converse/async";

pub struct HttpAgentClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpAgentClient {
    pub fn new(base_url: &str, api_key: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self) -> String {
        format!("{}{}", self.base_url, CONVERSE_PATH)
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn converse(&self, agent_id: &str, prompt: &str) -> BoxStream<'static, AgentEvent> {
        debug!(agent = %agent_id, url = %self.url(), "starting agent conversation");
        let response = self
            .client
            .post(self.url())
            .header("Authorization", format!("ApiKey {}", self.api_key))
            .header("kbn-xsrf", "true")
            .header("Accept", "text/event-stream")
            .json(&json!({ "agent_id": agent_id, "input": prompt }))
            .send()
            .await
            .and_then(|r| r.error_for_status());

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let message = e.to_string();
                return stream::once(async move { AgentEvent::Error(message) }).boxed();
            }
        };

        let state = DecodeState {
            body: response.bytes_stream().boxed(),
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            finished: false,
        };

        stream::unfold(state, |mut st| async move {
            loop {
                if let Some(event) = st.pending.pop_front() {
                    return Some((event, st));
                }
                if st.finished {
                    return None;
                }
                match st.body.next().await {
                    Some(Ok(chunk)) => {
                        let events = st.decoder.feed(&chunk);
                        st.pending.extend(events);
                    }
                    Some(Err(e)) => {
                        st.finished = true;
                        st.pending.push_back(AgentEvent::Error(e.to_string()));
                    }
                    None => {
                        st.finished = true;
                        let events = st.decoder.finish();
                        st.pending.extend(events);
                    }
                }
            }
        })
        .boxed()
    }
}

struct DecodeState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<AgentEvent>,
    finished: bool,
}

/// Incremental decoder for the agent host's server-sent events.
///
/// Frames are `event:` / `data:` line pairs; `data:` carries a JSON object
/// whose `data` member holds the payload. Lines starting with `:` are
/// keep-alive padding and a blank line ends the current frame. Event types
/// other than the four known ones (e.g. `conversation_id_set`) are dropped.
#[derive(Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    current_event: Option<String>,
}

impl SseDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<AgentEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(ev) = self.line(line.trim_end_matches(['\n', '\r'])) {
                events.push(ev);
            }
        }
        events
    }

    /// Flush a trailing line left without a newline.
    pub fn finish(&mut self) -> Vec<AgentEvent> {
        if self.buf.is_empty() {
            return Vec::new();
        }
        let rest = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&rest);
        self.line(line.trim_end_matches(['\n', '\r'])).into_iter().collect()
    }

    fn line(&mut self, line: &str) -> Option<AgentEvent> {
        if line.is_empty() {
            self.current_event = None;
            return None;
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.current_event = Some(name.trim().to_string());
            return None;
        }
        let raw = line.strip_prefix("data:")?.trim();
        let payload: Value = serde_json::from_str(raw).ok()?;
        let data = payload.get("data").cloned().unwrap_or(Value::Null);
        let text = |key: &str| data.get(key).and_then(Value::as_str).unwrap_or("").to_string();

        match self.current_event.as_deref()? {
            "reasoning" => Some(text("reasoning"))
                .filter(|t| !t.is_empty())
                .map(AgentEvent::Reasoning),
            "message_chunk" => Some(text("text_chunk"))
                .filter(|t| !t.is_empty())
                .map(AgentEvent::MessageChunk),
            "message_complete" => Some(AgentEvent::MessageComplete(text("message_content"))),
            "thinking_complete" => Some(AgentEvent::ThinkingComplete {
                time_to_first_token_ms: data
                    .get("time_to_first_token")
                    .and_then(Value::as_f64)
                    .map(|v| v.max(0.0) as u64)
                    .unwrap_or(0),
            }),
            _ => None,
        }
    }
}
