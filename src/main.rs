use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use remediator::api::state::AppState;
use remediator::config::Config;
use remediator::events::{Progress, ProgressEvent};
use remediator::queue::{ActionKind, ActionQueue, NewAction, RiskLevel};
use remediator::runner::RunOutcome;

#[derive(Parser)]
#[command(
    name = "remediator",
    about = "Coordinated autonomous remediation of service incidents",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the shared database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + verification worker + embedded runner)
    Serve {
        /// Bind address (overrides the config file)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a standalone runner process against the shared store
    Runner,

    /// Execute at most one pending action and exit
    RunOnce,

    /// Show whether a new pipeline cycle may start for a service
    Gate {
        #[arg(long)]
        service: String,
    },

    /// Inspect or add remediation actions
    Actions {
        #[command(subcommand)]
        action: ActionsCommand,
    },

    /// Verify a service now, printing streamed progress events
    Verify {
        #[arg(long)]
        service: String,
    },

    /// Run one detection -> remediation pipeline cycle, printing progress events
    Pipeline,
}

#[derive(Subcommand)]
enum ActionsCommand {
    /// List recent actions
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Queue a pending action
    Enqueue {
        #[arg(long)]
        service: String,

        /// rollback_deployment | restart_service | scale_cache | restart_dependency
        #[arg(long)]
        action: String,

        #[arg(long, default_value = "manual")]
        incident_id: String,

        #[arg(long, default_value = "")]
        anomaly_type: String,

        #[arg(long, default_value = "")]
        root_cause: String,

        #[arg(long, default_value = "1.0")]
        confidence: f64,

        #[arg(long, default_value = "low")]
        risk: String,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Print progress events as JSON lines until the sender side is dropped.
fn print_events(mut rx: mpsc::Receiver<ProgressEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            match serde_json::to_string(&ev) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!(error = %e, "unprintable event"),
            }
        }
    })
}

fn app_state(config: &Config) -> Result<AppState> {
    let pool = remediator::storage::open_pool(&config.storage.db_path)?;
    let agent = remediator::agent_client(&config.agents)?;
    let control = remediator::control_plane(&config.runner);
    Ok(AppState::build(config, pool, agent, control))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = Config::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "starting remediator daemon");
            remediator::serve(config).await?;
        }
        Commands::Runner => {
            tracing::info!(db_path = %config.storage.db_path.display(), "starting standalone runner");
            remediator::run_runner(config).await?;
        }
        Commands::RunOnce => {
            let state = app_state(&config)?;
            match state.runner.run_once().await? {
                RunOutcome::Idle => println!("No pending actions."),
                RunOutcome::Conflict { action_id } => {
                    println!("Action {} was claimed by another runner.", action_id)
                }
                RunOutcome::Finished { action, result } => {
                    println!(
                        "{} {} -> {} (exec_id {}, primary: {})",
                        action.service, action.action, action.status, action.exec_id,
                        result.primary_used
                    );
                    println!("  {}", result.output);
                }
            }
        }
        Commands::Gate { service } => {
            let state = app_state(&config)?;
            let decision = state.gate.check(&service, chrono::Utc::now())?;
            let verdict = if decision.is_allowed() { "ALLOW" } else { "BLOCK" };
            println!("{}: {}", verdict, decision.describe(&service));
        }
        Commands::Actions { action } => {
            let pool = remediator::storage::open_pool(&config.storage.db_path)?;
            let queue = ActionQueue::new(pool);

            match action {
                ActionsCommand::List { limit } => {
                    let actions = queue.list_recent(limit)?;
                    if actions.is_empty() {
                        println!("No actions found.");
                    } else {
                        println!(
                            "{:<8} | {:<18} | {:<20} | {:<9} | Created",
                            "Exec", "Service", "Action", "Status"
                        );
                        println!("{:-<8}-|-{:-<18}-|-{:-<20}-|-{:-<9}-|-{:-<25}", "", "", "", "", "");
                        for a in actions {
                            println!(
                                "{:<8} | {:<18} | {:<20} | {:<9} | {}",
                                a.exec_id,
                                a.service,
                                a.action,
                                a.status,
                                a.created_at.to_rfc3339()
                            );
                        }
                    }
                }
                ActionsCommand::Enqueue {
                    service,
                    action,
                    incident_id,
                    anomaly_type,
                    root_cause,
                    confidence,
                    risk,
                } => {
                    if action.parse::<ActionKind>().is_err() {
                        eprintln!(
                            "warning: '{}' is not a known action kind; a runner will mark it failed",
                            action
                        );
                    }
                    let queued = queue.enqueue(&NewAction {
                        incident_id,
                        service,
                        action,
                        anomaly_type,
                        root_cause,
                        confidence_score: confidence.clamp(0.0, 1.0),
                        risk_level: RiskLevel::parse_lenient(&risk),
                        triggered_by: "cli".to_string(),
                    })?;
                    println!("Queued {} (exec_id {}).", queued.id, queued.exec_id);
                }
            }
        }
        Commands::Verify { service } => {
            let state = app_state(&config)?;
            let (progress, rx) = Progress::channel(64);
            let printer = print_events(rx);
            let result = state.worker.verify_on_demand(&service, &progress).await;
            drop(progress);
            let _ = printer.await;
            let report = result?;
            println!("{} {} ({})", report.verdict, report.mttr_display, report.summary);
        }
        Commands::Pipeline => {
            let state = app_state(&config)?;
            let (progress, rx) = Progress::channel(64);
            let printer = print_events(rx);
            let outcome = state.pipeline.run(&progress).await;
            drop(progress);
            let _ = printer.await;
            println!("{}", serde_json::to_string_pretty(&outcome?)?);
        }
    }

    Ok(())
}
