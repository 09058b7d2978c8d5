//! TOML configuration for the remediator daemon and standalone runners.
//!
//! Layered like any appliance config: an explicit `--config` path, then the
//! `REMEDIATOR_CONFIG` environment variable, then the system location, then
//! compiled-in defaults. Secrets never live in the file; the agent API key is
//! read from the environment variable named by `agents.api_key_env`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::verify::Thresholds;

pub const CONFIG_ENV: &str = "REMEDIATOR_CONFIG";
const SYSTEM_CONFIG_PATH: &str = "/etc/remediator/remediator.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub gate: GateConfig,
    pub runner: RunnerConfig,
    pub verification: VerificationConfig,
    pub agents: AgentConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// An explicit path must load; the implicit locations fall back quietly.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        Ok(Self::load_or_default())
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "REMEDIATOR_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Server / storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Shared database file. Every runner process must point at the same one.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { db_path: PathBuf::from("data/remediator.db") }
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// How far back to look for the previous pipeline incident.
    pub lookback_secs: u64,
    /// A REMEDIATING incident younger than this blocks a new cycle.
    pub in_flight_secs: u64,
    /// A RESOLVED incident younger than this blocks a new cycle.
    pub cooldown_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            lookback_secs: 15 * 60,
            in_flight_secs: 15 * 60,
            cooldown_secs: 15 * 60,
        }
    }
}

impl GateConfig {
    pub fn lookback(&self) -> chrono::Duration {
        secs(self.lookback_secs)
    }

    pub fn in_flight(&self) -> chrono::Duration {
        secs(self.in_flight_secs)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        secs(self.cooldown_secs)
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlPlaneKind {
    /// Drive containers through the `docker` CLI.
    Docker,
    /// No control plane; every action goes through synthetic recovery.
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Run a poll loop inside `serve` as well as in standalone processes.
    pub embedded: bool,
    pub poll_interval_ms: u64,
    pub control_plane: ControlPlaneKind,
    pub docker_binary: String,
    pub command_timeout_secs: u64,
    /// Service name -> container name. Unmapped services use their own name.
    pub containers: HashMap<String, String>,
    /// Container restarted by `restart_dependency`.
    pub dependency_container: String,
    /// Image provisioned by `scale_cache`.
    pub cache_image: String,
    /// Service name -> region label on recovery metrics.
    pub regions: HashMap<String, String>,
    pub default_region: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let regions = [
            ("payment-service", "us-east-1"),
            ("checkout-service", "us-east-1"),
            ("auth-service", "us-west-2"),
            ("inventory-service", "us-east-1"),
        ]
        .into_iter()
        .map(|(s, r)| (s.to_string(), r.to_string()))
        .collect();

        Self {
            embedded: true,
            poll_interval_ms: 500,
            control_plane: ControlPlaneKind::Docker,
            docker_binary: "docker".to_string(),
            command_timeout_secs: 30,
            containers: HashMap::new(),
            dependency_container: "auth-redis".to_string(),
            cache_image: "redis:7-alpine".to_string(),
            regions,
            default_region: "us-east-1".to_string(),
        }
    }
}

impl RunnerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Minimum time since execution before metrics are trusted.
    pub settle_secs: u64,
    /// Executions older than this are never picked up.
    pub staleness_secs: u64,
    pub batch_size: usize,
    /// Window for locating the incident an action belongs to.
    pub incident_lookback_secs: u64,
    /// Window for locating the action behind an on-demand verification.
    pub on_demand_action_lookback_secs: u64,
    pub agent_id: String,
    pub thresholds: Thresholds,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            settle_secs: 60,
            staleness_secs: 10 * 60,
            batch_size: 10,
            incident_lookback_secs: 60 * 60,
            on_demand_action_lookback_secs: 30 * 60,
            agent_id: "guardian-verification-agent".to_string(),
            thresholds: Thresholds::default(),
        }
    }
}

impl VerificationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn settle(&self) -> chrono::Duration {
        secs(self.settle_secs)
    }

    pub fn staleness(&self) -> chrono::Duration {
        secs(self.staleness_secs)
    }

    pub fn incident_lookback(&self) -> chrono::Duration {
        secs(self.incident_lookback_secs)
    }

    pub fn on_demand_action_lookback(&self) -> chrono::Duration {
        secs(self.on_demand_action_lookback_secs)
    }
}

// ---------------------------------------------------------------------------
// Agents / pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the agent host (e.g. a Kibana deployment). Empty disables
    /// every agent call.
    pub base_url: String,
    pub api_key_env: String,
    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key_env: "REMEDIATOR_AGENT_API_KEY".to_string(),
            request_timeout_secs: 180,
        }
    }
}

impl AgentConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Write actions without an operator in the loop.
    pub autonomous: bool,
    /// Minimum recommendation confidence (0.0-1.0) for an autonomous action.
    pub confidence_threshold: f64,
    pub known_services: Vec<String>,
    pub detection_agent: String,
    pub investigation_agent: String,
    pub remediation_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            autonomous: true,
            confidence_threshold: 0.75,
            known_services: vec![
                "payment-service".to_string(),
                "checkout-service".to_string(),
                "auth-service".to_string(),
                "inventory-service".to_string(),
            ],
            detection_agent: "cassandra-detection-agent".to_string(),
            investigation_agent: "archaeologist-investigation-agent".to_string(),
            remediation_agent: "surgeon-action-agent".to_string(),
        }
    }
}

fn secs(s: u64) -> chrono::Duration {
    chrono::Duration::seconds(s.min(i64::MAX as u64) as i64)
}
