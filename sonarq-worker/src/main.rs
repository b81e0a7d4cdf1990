use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use sonarq_config::{Config, ConfigLoad, ConfigLoader, OrchestratorConfigSource};
use sonarq_core::scan::orchestration::{MessageLoop, ScanCollaborators, ScanOrchestrator};
use sonarq_worker::{
    infra::{
        BlobArtifactStore, MIGRATOR, PostgresResultStore, ServiceBusSource, SonarCloudEngine,
        http, result_store,
    },
    telemetry,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "sonarq-worker")]
#[command(about = "Consumes scan requests and records SonarCloud analysis results")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct RunArgs {
    /// Load this env file instead of searching for `.env`
    #[arg(long, env = "SONARQ_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// Long-poll window for each broker receive, in seconds
    #[arg(long, env = "RECEIVE_TIMEOUT_SECS", default_value_t = 30)]
    receive_timeout_secs: u64,

    /// Skip applying migrations before consuming messages
    #[arg(long, env = "SKIP_MIGRATIONS", default_value_t = false)]
    skip_migrations: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // Installed before anything else runs so loader diagnostics are kept.
    telemetry::init();
    let config = load_runtime_config(&cli.run)?;

    if let Some(Command::Db(DbCommand::Migrate)) = cli.command {
        let pool = result_store::connect(&config.database.url, 1)
            .await
            .context("failed to connect to PostgreSQL for migration")?;
        MIGRATOR.run(&pool).await.context("database migration failed")?;
        info!("Database migrations applied successfully");
        return Ok(());
    }

    run_worker(config, &cli.run).await
}

fn load_runtime_config(args: &RunArgs) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = args.env_file.as_ref() {
        loader = loader.with_env_file(path);
    }
    let ConfigLoad { config } = loader.load().context("failed to load configuration")?;

    if let Some(path) = config.metadata.env_file.as_ref() {
        info!(path = %path.display(), "loaded env file");
    }
    match &config.metadata.orchestrator_source {
        OrchestratorConfigSource::Default => info!("orchestrator tuning: defaults"),
        OrchestratorConfigSource::EnvPath(path) => {
            info!(path = %path.display(), "orchestrator tuning loaded from env path")
        }
        OrchestratorConfigSource::EnvInline => {
            info!("orchestrator tuning loaded from inline environment json")
        }
    }

    let messages = &config.orchestrator.messages;
    info!(
        worker.concurrency = messages.concurrency,
        worker.ack_policy = ?messages.ack_policy,
        worker.work_dir = %config.work_dir().display(),
        worker.ledger_ttl_secs = config.orchestrator.ledger.ttl_secs,
        sonar.host = %config.sonar.host_url,
        sonar.organization = %config.sonar.organization,
        bus.topic = %config.service_bus.topic,
        bus.subscription = %config.service_bus.subscription,
        "worker configuration in effect"
    );

    Ok(config)
}

async fn run_worker(config: Config, args: &RunArgs) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(config.work_dir())
        .await
        .with_context(|| format!("failed to create work dir {}", config.work_dir().display()))?;

    let messages = config.orchestrator.messages.clone();
    let pool_size = u32::try_from(messages.concurrency.max(1))
        .unwrap_or(u32::MAX)
        .saturating_add(1);
    let pool = result_store::connect(&config.database.url, pool_size)
        .await
        .context("failed to connect to PostgreSQL")?;
    if args.skip_migrations {
        warn!("skipping database migrations");
    } else {
        MIGRATOR.run(&pool).await.context("database migration failed")?;
    }

    let timeouts = &config.orchestrator.timeouts;
    let client = http::build_client(timeouts.fetch().max(timeouts.report()))
        .context("failed to build HTTP client")?;

    let source = Arc::new(ServiceBusSource::new(
        client.clone(),
        &config.service_bus,
        Duration::from_secs(args.receive_timeout_secs),
    ));
    let collaborators = ScanCollaborators::new(
        Arc::new(BlobArtifactStore::new(client.clone(), &config.blob)),
        Arc::new(SonarCloudEngine::new(client, &config.sonar)),
        Arc::new(PostgresResultStore::new(pool.clone())),
    );
    let orchestrator = Arc::new(ScanOrchestrator::new(&config.orchestrator, collaborators));
    let message_loop = MessageLoop::new(source, orchestrator, messages);

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_for_shutdown(shutdown.clone()));

    info!("worker started");
    message_loop.run(shutdown).await;
    pool.close().await;
    info!("worker stopped");
    Ok(())
}

async fn watch_for_shutdown(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
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
    info!("shutdown requested; draining in-flight scans");
    token.cancel();
}
