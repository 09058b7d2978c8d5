//! Turning a verification agent's reply into a terminal verdict.
//!
//! Measured samples decide whenever the reply reports any, readable or not.
//! The agent's own `verdict` field is only consulted when no metric field is
//! present, and the keyword
//! fallback after that never produces RESOLVED in the presence of a negative
//! phrase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::parse;
use crate::incident::TerminalStatus;

/// Recovery thresholds; a sample passes only when strictly below its limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub memory_percent: f64,
    /// Errors per minute.
    pub error_rate: f64,
    pub latency_ms: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            memory_percent: 65.0,
            error_rate: 2.5,
            latency_ms: 250.0,
        }
    }
}

/// Readings reported by the agent. Missing or unparseable values are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Samples {
    pub memory_percent: Option<f64>,
    pub error_rate: Option<f64>,
    pub latency_ms: Option<f64>,
}

const METRIC_FIELDS: [&str; 3] = ["memory_pct", "error_rate", "latency_ms"];

impl Samples {
    pub fn parse(output: &str) -> Self {
        let [memory, errors, latency] = METRIC_FIELDS;
        Self {
            memory_percent: parse::number(output, memory),
            error_rate: parse::number(output, errors),
            latency_ms: parse::number(output, latency),
        }
    }

    /// Whether any metric field is present, even with an unreadable value.
    fn reported(output: &str) -> bool {
        METRIC_FIELDS
            .iter()
            .any(|name| parse::field(output, name).is_some())
    }

    fn named(&self) -> [(&'static str, Option<f64>); 3] {
        [
            ("memory_percent", self.memory_percent),
            ("error_rate", self.error_rate),
            ("latency_ms", self.latency_ms),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdCheck {
    pub metric: String,
    pub observed: f64,
    pub limit: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Samples,
    Stated,
    Heuristic,
}

#[derive(Debug, Clone, Serialize)]
pub struct Assessment {
    pub verdict: TerminalStatus,
    /// 0-100.
    pub confidence: u8,
    pub checks: Vec<ThresholdCheck>,
    pub summary: String,
    pub source: VerdictSource,
}

const HEURISTIC_CONFIDENCE_CAP: u8 = 40;

const NEGATIVE_PHRASES: &[&str] = &[
    "not resolved",
    "unresolved",
    "escalate",
    "not recovered",
    "still elevated",
    "above threshold",
    "exceeds",
    "degraded",
    "failing",
    "failed",
];

pub fn assess(output: &str, thresholds: &Thresholds) -> Assessment {
    let samples = Samples::parse(output);
    let stated_confidence = stated_confidence(output);
    let agent_summary = parse::field(output, "summary");

    let limits = [thresholds.memory_percent, thresholds.error_rate, thresholds.latency_ms];
    let checks: Vec<ThresholdCheck> = samples
        .named()
        .into_iter()
        .zip(limits)
        .filter_map(|((metric, observed), limit)| {
            observed.map(|observed| ThresholdCheck {
                metric: metric.to_string(),
                observed,
                limit,
                passed: observed < limit,
            })
        })
        .collect();

    if !checks.is_empty() || Samples::reported(output) {
        return from_samples(samples, checks, stated_confidence, agent_summary);
    }

    if let Some(verdict) = parse::verdict(output, "verdict") {
        return Assessment {
            verdict,
            confidence: stated_confidence.unwrap_or(50),
            checks,
            summary: agent_summary
                .unwrap_or_else(|| "verdict stated without metric readings".to_string()),
            source: VerdictSource::Stated,
        };
    }

    let lower = output.to_lowercase();
    let negative = NEGATIVE_PHRASES.iter().any(|p| lower.contains(p));
    let positive = lower.contains("resolved") || lower.contains("recovered");
    let verdict = if positive && !negative {
        TerminalStatus::Resolved
    } else {
        TerminalStatus::Escalate
    };

    Assessment {
        verdict,
        confidence: stated_confidence
            .unwrap_or(HEURISTIC_CONFIDENCE_CAP)
            .min(HEURISTIC_CONFIDENCE_CAP),
        checks,
        summary: agent_summary
            .unwrap_or_else(|| "verdict inferred from unstructured agent output".to_string()),
        source: VerdictSource::Heuristic,
    }
}

fn from_samples(
    samples: Samples,
    checks: Vec<ThresholdCheck>,
    stated_confidence: Option<u8>,
    agent_summary: Option<String>,
) -> Assessment {
    let failed: Vec<String> = checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| format!("{} {} >= {}", c.metric, c.observed, c.limit))
        .collect();
    let missing: Vec<&str> = samples
        .named()
        .into_iter()
        .filter(|(_, v)| v.is_none())
        .map(|(name, _)| name)
        .collect();

    let (verdict, summary) = if !failed.is_empty() {
        (
            TerminalStatus::Escalate,
            format!("threshold check failed: {}", failed.join("; ")),
        )
    } else if !missing.is_empty() {
        (
            TerminalStatus::Escalate,
            format!("missing readings: {}", missing.join(", ")),
        )
    } else {
        (
            TerminalStatus::Resolved,
            agent_summary.unwrap_or_else(|| "all recovery thresholds met".to_string()),
        )
    };

    Assessment {
        verdict,
        confidence: stated_confidence.unwrap_or(80),
        checks,
        summary,
        source: VerdictSource::Samples,
    }
}

/// Agent-reported confidence on a 0-100 scale.
fn stated_confidence(output: &str) -> Option<u8> {
    parse::confidence(output, "confidence").map(|c| (c * 100.0).round() as u8)
}

/// Seconds from detection to `completed_at`, never negative.
pub fn mttr_seconds(detected_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> i64 {
    (completed_at - detected_at).num_seconds().max(0)
}

/// `~45s`, `~4m`, `~4m 12s`.
pub fn format_mttr(seconds: i64) -> String {
    let seconds = seconds.max(0);
    if seconds < 60 {
        return format!("~{}s", seconds);
    }
    let (m, s) = (seconds / 60, seconds % 60);
    if s == 0 {
        format!("~{}m", m)
    } else {
        format!("~{}m {}s", m, s)
    }
}
