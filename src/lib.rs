//! remediator -- coordinated autonomous remediation of service incidents.
//!
//! Pipeline runs open incidents and queue remediation actions; runners claim
//! and execute them with a compare-and-swap on the shared store; the
//! verification worker confirms recovery and closes the incident with an
//! MTTR. Every process coordinates only through the SQLite store.

pub mod agent;
pub mod api;
pub mod audit;
pub mod config;
pub mod events;
pub mod gate;
pub mod incident;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod runner;
pub mod storage;
pub mod verify;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentClient, HttpAgentClient, UnconfiguredAgent};
use crate::config::{AgentConfig, Config, ControlPlaneKind, RunnerConfig};
use crate::runner::{ControlPlane, Disabled, DockerCli, Runner};

/// Agent client for the configured endpoint, or one that fails every call
/// when no endpoint or key is configured.
pub fn agent_client(cfg: &AgentConfig) -> Result<Arc<dyn AgentClient>> {
    if cfg.base_url.trim().is_empty() {
        warn!("no agent endpoint configured; pipeline and verification calls will fail");
        return Ok(Arc::new(UnconfiguredAgent));
    }
    let Some(api_key) = cfg.api_key() else {
        warn!(env = %cfg.api_key_env, "agent API key not set; pipeline and verification calls will fail");
        return Ok(Arc::new(UnconfiguredAgent));
    };
    let client = HttpAgentClient::new(&cfg.base_url, api_key, cfg.request_timeout())
        .context("failed to build agent HTTP client")?;
    Ok(Arc::new(client))
}

pub fn control_plane(cfg: &RunnerConfig) -> Arc<dyn ControlPlane> {
    match cfg.control_plane {
        ControlPlaneKind::Docker => {
            Arc::new(DockerCli::new(cfg.docker_binary.clone(), cfg.command_timeout()))
        }
        ControlPlaneKind::Disabled => Arc::new(Disabled),
    }
}

/// Start the daemon: API server, verification worker and (optionally) an
/// embedded runner loop. Returns after a graceful shutdown.
pub async fn serve(config: Config) -> Result<()> {
    info!(db_path = %config.storage.db_path.display(), "initializing database");
    let pool = storage::open_pool(&config.storage.db_path)?;

    let agent = agent_client(&config.agents)?;
    let control = control_plane(&config.runner);
    let state = api::state::AppState::build(&config, pool, agent, control);

    let shutdown = CancellationToken::new();

    if config.verification.enabled {
        state.worker.start();
    }

    let runner_task = if config.runner.embedded {
        Some(tokio::spawn(runner::run_runner_loop(
            state.runner.clone(),
            config.runner.poll_interval(),
            shutdown.child_token(),
        )))
    } else {
        None
    };

    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let app = api::router(state.clone());

    info!(%addr, "remediator listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    shutdown.cancel();
    state.worker.stop().await;
    if let Some(task) = runner_task {
        if let Err(e) = task.await {
            warn!(error = %e, "runner loop ended abnormally");
        }
    }
    Ok(())
}

/// Standalone runner process polling the shared store until interrupted.
pub async fn run_runner(config: Config) -> Result<()> {
    let pool = storage::open_pool(&config.storage.db_path)?;
    let runner = Runner::new(
        queue::ActionQueue::new(pool),
        control_plane(&config.runner),
        &config.runner,
    );

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(runner::run_runner_loop(
        runner,
        config.runner.poll_interval(),
        shutdown.clone(),
    ));

    shutdown_signal().await;
    shutdown.cancel();
    task.await.context("runner loop ended abnormally")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
