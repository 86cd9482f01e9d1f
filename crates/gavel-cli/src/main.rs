//! Gavel command line: run an orchestrator or an agent.
//!
//! The `agent` subcommand doubles as the worker-container entrypoint:
//! containers are launched with `--execute-claim <id>` and identity comes
//! from the launch environment (`INSTANCE_NAME`, `AGENT_NAME`,
//! `REDIS_URL`, `AGENT_COMMAND`, ...).

use clap::{Parser, Subcommand};
use gavel_agent::{AgentEngine, AgentSettings};
use gavel_blackboard::{health_router, Blackboard, RedisBlackboard};
use gavel_core::{GavelError, GavelResult, InstanceConfig};
use gavel_orchestrator::{DockerRuntime, Orchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "gavel", about = "Gavel — blackboard-coordinated agent pool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator for an instance
    Orchestrator {
        /// Path to the instance configuration
        #[arg(short, long, default_value = "gavel.toml")]
        config: PathBuf,
        /// Instance name (namespaces all store keys and channels)
        #[arg(short, long, env = "INSTANCE_NAME")]
        instance: String,
        /// Store endpoint
        #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
        redis_url: String,
        /// Health endpoint port
        #[arg(long, env = "HEALTH_PORT", default_value_t = 8080)]
        health_port: u16,
    },
    /// Run an agent (identity from the environment)
    Agent {
        /// Execute one granted claim and exit (worker-container mode)
        #[arg(long)]
        execute_claim: Option<Uuid>,
        /// Store endpoint
        #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
        redis_url: String,
        /// Health endpoint port
        #[arg(long, env = "HEALTH_PORT", default_value_t = 8080)]
        health_port: u16,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = run(Cli::parse()).await {
        error!(error = %e, "gavel exited with error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> GavelResult<()> {
    let shutdown = CancellationToken::new();
    spawn_ctrl_c(shutdown.clone());

    match cli.command {
        Commands::Orchestrator {
            config,
            instance,
            redis_url,
            health_port,
        } => {
            let config = InstanceConfig::from_toml_file(&config)?;
            let blackboard: Arc<dyn Blackboard> =
                Arc::new(RedisBlackboard::connect(&redis_url, instance.clone()).await?);
            let runtime = Arc::new(DockerRuntime::connect().await?);
            serve_health(Arc::clone(&blackboard), health_port, &shutdown).await?;

            let mut orchestrator = Orchestrator::new(
                blackboard,
                runtime,
                config,
                instance,
                redis_url,
                shutdown.clone(),
            );
            orchestrator.run().await
        }
        Commands::Agent {
            execute_claim,
            redis_url,
            health_port,
        } => {
            let mut settings = AgentSettings::from_env()?;
            if let Ok(validator) = std::env::var("AGENT_COMMIT_VALIDATOR") {
                settings = settings.with_commit_validator(validator);
            }
            let blackboard: Arc<dyn Blackboard> = Arc::new(
                RedisBlackboard::connect(&redis_url, settings.instance.clone()).await?,
            );
            let engine = AgentEngine::new(Arc::clone(&blackboard), settings, shutdown.clone());

            match execute_claim {
                Some(claim_id) => {
                    info!(claim_id = %claim_id, "worker mode: executing one claim");
                    engine.execute_claim(claim_id).await
                }
                None => {
                    serve_health(blackboard, health_port, &shutdown).await?;
                    engine.run().await
                }
            }
        }
    }
}

fn spawn_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received; shutting down");
            shutdown.cancel();
        }
    });
}

async fn serve_health(
    blackboard: Arc<dyn Blackboard>,
    port: u16,
    shutdown: &CancellationToken,
) -> GavelResult<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(GavelError::Io)?;
    info!(port = port, "health endpoint listening");
    let router = health_router(blackboard);
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = serve.await {
            error!(error = %e, "health server failed");
        }
    });
    Ok(())
}
