//! # Harvest Worker
//!
//! Long-running worker process for the Harvest ingestion pipeline. One
//! process:
//!
//! - announces itself in the agent registry and keeps its heartbeat fresh
//! - claims pending job instances it can run and hands them to its engine
//! - evaluates triggers and enqueues their next scan window
//! - requeues jobs whose owner stopped heartbeating
//!
//! Postgres backs jobs and triggers and Redis backs the registry. Either can
//! be left unconfigured for local runs, in which case the process keeps that
//! state in memory.

mod handler;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use harvest_config::{Config, ConfigLoad, ConfigLoader};
use harvest_core::{
    Clock, SystemClock,
    coordinator::{BoundedExecutionEngine, JobClaimCoordinator, StoreScheduler},
    cursor::StrategyRegistry,
    jobs::{InMemoryJobStore, JobInstanceStore, OrphanSweeper, PostgresJobStore, TracingFailureSink},
    kv::{InMemoryKeyValueStore, RedisKeyValueStore},
    registry::AgentRegistry,
    trigger::{
        InMemoryTriggerStore, PostgresTriggerStore, StoreTriggerActionService, TriggerRunner,
        TriggerStore,
    },
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::handler::LoggingJobHandler;

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "harvest-worker")]
#[command(about = "Claims ingestion jobs, runs triggers and sweeps orphaned work")]
struct Cli {
    /// Path to a TOML or JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to an env file loaded before reading the environment
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Agent id (overrides config)
    #[arg(long)]
    agent_id: Option<String>,

    /// Run one fetch cycle, one trigger pass and one sweep, then exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Skip applying database migrations on startup
    #[arg(long, env = "HARVEST_SKIP_MIGRATIONS", default_value_t = false)]
    skip_migrations: bool,
}

struct Stores {
    jobs: Arc<dyn JobInstanceStore>,
    triggers: Arc<dyn TriggerStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Override via RUST_LOG.
                "info,harvest::heartbeat=info,harvest::fetch=info,sqlx=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut loader = ConfigLoader::new();
    if let Some(path) = cli.config.clone() {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = cli.env_file.clone() {
        loader = loader.with_env_file(path);
    }
    let ConfigLoad {
        mut config,
        warnings,
    } = loader.load().context("failed to load configuration")?;

    if let Some(agent_id) = cli.agent_id.clone() {
        config.worker.agent_id = agent_id;
    }
    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = config.metadata.source.path() {
        info!(path = %path.display(), "using configuration file");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    run(cli, config).await
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let orchestration = config.orchestration.clone();

    let stores = connect_stores(&config, cli.skip_migrations).await?;
    let registry = connect_registry(&config, clock.clone())?;

    let mut engine = BoundedExecutionEngine::new(config.worker.engine_capacity, clock.clone());
    for controller in &config.worker.controller_names {
        engine = engine.with_handler(
            controller.as_str(),
            Arc::new(LoggingJobHandler::new(controller.as_str())),
        );
    }

    let sink = Arc::new(TracingFailureSink);
    let scheduler = Arc::new(StoreScheduler::new(stores.jobs.clone(), clock.clone()));
    let coordinator = Arc::new(JobClaimCoordinator::new(
        config.agent_handle(),
        scheduler,
        registry,
        Arc::new(engine),
        sink.clone(),
        clock.clone(),
        orchestration.coordinator.clone(),
    ));
    let sweeper = Arc::new(OrphanSweeper::new(
        stores.jobs.clone(),
        sink,
        clock.clone(),
        orchestration.jobs.sweep_interval(),
    ));
    let actions = Arc::new(StoreTriggerActionService::new(
        stores.jobs.clone(),
        stores.triggers.clone(),
        clock.clone(),
    ));
    let triggers = Arc::new(TriggerRunner::new(
        stores.triggers,
        actions,
        StrategyRegistry::from_config(&orchestration.cursor),
        orchestration.jobs.clone(),
        clock.clone(),
        orchestration.trigger.run_interval(),
    ));

    // The heartbeat loop re-registers once the registry is reachable.
    match coordinator.register().await {
        Ok(()) => info!(
            worker = %coordinator.worker_id(),
            agent_type = %config.worker.agent_type,
            controllers = ?config.worker.controller_names,
            capacity = config.worker.engine_capacity,
            "worker registered"
        ),
        Err(err) => warn!(
            worker = %coordinator.worker_id(),
            error = %err,
            "registration failed; retrying with the next heartbeat"
        ),
    }

    if cli.once {
        let triggered = triggers.run_once(clock.now()).await?;
        let sweep = sweeper.sweep_once().await?;
        let fetch = coordinator.fetch_and_run_jobs().await?;
        info!(?triggered, ?sweep, ?fetch, "single pass complete");
        coordinator.drain().await;
        let heartbeat = coordinator.heartbeat_once().await?;
        if !heartbeat.registry_refreshed {
            warn!("agent registry unreachable during single pass");
        }
        coordinator.shutdown().await;
        return Ok(());
    }

    let token = CancellationToken::new();
    let loops = coordinator.start();
    let sweeper_task = sweeper.spawn(token.child_token());
    let trigger_task = triggers.spawn(token.child_token());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    token.cancel();
    let unclaimed = coordinator.shutdown().await;
    loops.join().await;
    for (name, task) in [("orphan-sweeper", sweeper_task), ("trigger-runner", trigger_task)] {
        if let Err(err) = task.await {
            warn!(task = name, error = %err, "background task ended abnormally");
        }
    }
    info!(unclaimed, "worker stopped");
    Ok(())
}

async fn connect_stores(config: &Config, skip_migrations: bool) -> anyhow::Result<Stores> {
    let Some(url) = config.database.url.as_deref() else {
        warn!("no database configured; jobs and triggers live in this process only");
        return Ok(Stores {
            jobs: Arc::new(InMemoryJobStore::new()),
            triggers: Arc::new(InMemoryTriggerStore::new()),
        });
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")?;
    if !skip_migrations {
        harvest_core::MIGRATOR
            .run(&pool)
            .await
            .context("failed to apply migrations")?;
    }

    let jobs = PostgresJobStore::new(pool.clone())
        .await
        .context("failed to prepare job store")?;
    Ok(Stores {
        jobs: Arc::new(jobs),
        triggers: Arc::new(PostgresTriggerStore::new(pool)),
    })
}

/// The Redis connection is opened lazily, so an outage only ages this worker
/// out of discovery until the server is back.
fn connect_registry(config: &Config, clock: Arc<dyn Clock>) -> anyhow::Result<AgentRegistry> {
    let registry_config = config.orchestration.registry.clone();
    match &config.redis {
        Some(redis) => {
            let backend =
                RedisKeyValueStore::lazy(&redis.url).context("invalid Redis URL")?;
            Ok(AgentRegistry::with_backend(Arc::new(backend), clock, registry_config))
        }
        None => {
            warn!("no Redis configured; the agent registry is process-local");
            let backend = InMemoryKeyValueStore::new(clock.clone());
            Ok(AgentRegistry::with_backend(Arc::new(backend), clock, registry_config))
        }
    }
}
