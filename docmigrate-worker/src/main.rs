//! # docmigrate worker
//!
//! Runs the executor pool against the Postgres-backed outbox and exposes the
//! job manager as a JSON-emitting operator CLI.

mod cli;

use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use docmigrate_config::{Config, ConfigLoad, ConfigLoader};
use docmigrate_core::migration::ItemFilter;
use docmigrate_core::persistence::{MigrationStore, PostgresMigrationStore};
use docmigrate_core::provider::BuiltinAdapterFactory;
use docmigrate_core::{
    CreateJobRequest, JobId, MigrationManager, ProviderRegistry, WorkerPool,
};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Command, CreateArgs, JobCommand, ProvidersCommand, QueueArgs, RunArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(&cli)?;
    match cli.command {
        Command::Migrate => run_migrate(&config).await,
        Command::Run(args) => run_workers(config, args).await,
        Command::Providers(command) => run_providers(&config, command).await,
        Command::Job(command) => run_job(&config, command).await,
    }
}

fn init_tracing() {
    // Logs go to stderr so command output on stdout stays parseable.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,migration::worker=info,sqlx=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    let ConfigLoad { config, warnings } =
        loader.load().context("failed to load configuration")?;

    if config.metadata.env_file_loaded {
        info!("loaded environment from .env");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "using configuration file");
    }
    for warning in &warnings.items {
        warn!("{warning}");
    }
    Ok(config)
}

async fn connect(config: &Config) -> anyhow::Result<sqlx::PgPool> {
    let Some(url) = config.database.primary_url.as_deref() else {
        bail!("DATABASE_URL, DATABASE_URL_FILE or [database] url must be provided");
    };
    PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")
}

/// Manager over the Postgres store with the registry rebuilt from the
/// persisted registrations.
async fn build_manager(config: &Config) -> anyhow::Result<MigrationManager> {
    let pool = connect(config).await?;
    let store: Arc<dyn MigrationStore> = Arc::new(
        PostgresMigrationStore::new(pool)
            .await
            .context("migration store is not ready; run `docmigrate migrate`")?,
    );
    let manager = MigrationManager::new(store, ProviderRegistry::new(), config.engine.clone());
    let registered = manager
        .sync_providers(&BuiltinAdapterFactory)
        .await
        .context("failed to load provider registrations")?;
    info!(providers = registered, "provider registry ready");
    Ok(manager)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}

async fn run_migrate(config: &Config) -> anyhow::Result<()> {
    let pool = connect(config).await?;
    PostgresMigrationStore::apply_migrations(&pool)
        .await
        .context("database migration failed")?;
    info!("database migrations applied successfully");
    Ok(())
}

async fn run_workers(mut config: Config, args: RunArgs) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config.engine.worker.workers = workers;
    }
    let manager = build_manager(&config).await?;
    let pool = WorkerPool::new(
        Arc::clone(manager.store()),
        manager.registry().clone(),
        config.engine.clone(),
    )
    .with_adapter_factory(Arc::new(BuiltinAdapterFactory));

    let shutdown = CancellationToken::new();
    pool.start(shutdown.clone())
        .await
        .context("failed to start worker pool")?;
    info!(pool = pool.pool_id(), "worker pool running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    shutdown.cancel();
    pool.shutdown().await.context("worker pool shutdown failed")?;
    Ok(())
}

async fn run_providers(config: &Config, command: ProvidersCommand) -> anyhow::Result<()> {
    let manager = build_manager(config).await?;
    match command {
        ProvidersCommand::Sync => {
            let factory = BuiltinAdapterFactory;
            let mut synced = Vec::with_capacity(config.providers.len());
            for seed in &config.providers {
                let registration = manager
                    .store()
                    .upsert_provider(&seed.to_registration())
                    .await
                    .with_context(|| format!("failed to upsert provider {}", seed.name))?;
                synced.push(registration);
            }
            manager
                .sync_providers(&factory)
                .await
                .context("failed to rebuild provider registry")?;
            info!(count = synced.len(), "providers synced");
            print_json(&synced)
        }
        ProvidersCommand::List => {
            let providers = manager
                .store()
                .list_providers()
                .await
                .context("failed to list providers")?;
            print_json(&providers)
        }
    }
}

async fn run_job(config: &Config, command: JobCommand) -> anyhow::Result<()> {
    let manager = build_manager(config).await?;
    match command {
        JobCommand::Create(args) => create_job(&manager, args).await,
        JobCommand::Queue(args) => queue_documents(&manager, args).await,
        JobCommand::Start(job) => print_json(&manager.start_job(JobId::from(job.job_id)).await?),
        JobCommand::Pause(job) => print_json(&manager.pause_job(JobId::from(job.job_id)).await?),
        JobCommand::Resume(job) => {
            print_json(&manager.resume_job(JobId::from(job.job_id)).await?)
        }
        JobCommand::Cancel(job) => {
            print_json(&manager.cancel_job(JobId::from(job.job_id)).await?)
        }
        JobCommand::Retry(job) => {
            let job_id = JobId::from(job.job_id);
            let requeued = manager.retry_failed(job_id).await?;
            print_json(&serde_json::json!({
                "job_id": job_id,
                "requeued": requeued,
            }))
        }
        JobCommand::Show(job) => print_json(&manager.get_job(JobId::from(job.job_id)).await?),
        JobCommand::List(args) => print_json(&manager.list_jobs(args.status).await?),
        JobCommand::Progress(job) => {
            print_json(&manager.get_progress(JobId::from(job.job_id)).await?)
        }
        JobCommand::Items(args) => {
            let filter = ItemFilter {
                status: args.status,
                limit: args.limit,
            };
            print_json(&manager.list_items(JobId::from(args.job_id), filter).await?)
        }
        JobCommand::Verify(job) => {
            let report = manager.verify_job(JobId::from(job.job_id)).await?;
            print_json(&report)?;
            report.into_result()?;
            Ok(())
        }
    }
}

async fn create_job(manager: &MigrationManager, args: CreateArgs) -> anyhow::Result<()> {
    let CreateArgs {
        name,
        source,
        dest,
        strategy,
        documents,
        prefix,
        concurrency,
        batch_size,
        max_attempts,
        dry_run,
        created_by,
        start,
    } = args;

    let mut request = CreateJobRequest::new(name, source, dest)
        .strategy(strategy)
        .dry_run(dry_run);
    if let Some(prefix) = prefix {
        request = request.prefix(prefix);
    } else if !documents.is_empty() {
        request = request.documents(documents);
    }
    if let Some(concurrency) = concurrency {
        request = request.concurrency(concurrency);
    }
    if let Some(batch_size) = batch_size {
        request = request.batch_size(batch_size);
    }
    if let Some(max_attempts) = max_attempts {
        request = request.max_attempts(max_attempts);
    }
    request.created_by = created_by;

    let mut job = manager.create_job(request).await?;
    if start {
        job = manager.start_job(job.id).await?;
    }
    print_json(&job)
}

async fn queue_documents(manager: &MigrationManager, args: QueueArgs) -> anyhow::Result<()> {
    let job_id = JobId::from(args.job_id);
    let queued = match args.prefix {
        Some(prefix) => manager.queue_prefix(job_id, &prefix).await?,
        None if args.documents.is_empty() => {
            bail!("pass at least one --document or a --prefix");
        }
        None => manager.queue_documents(job_id, &args.documents).await?,
    };
    print_json(&serde_json::json!({
        "job_id": job_id,
        "queued": queued,
    }))
}
