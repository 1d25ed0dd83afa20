use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use docmigrate_core::migration::ItemStatus;
use docmigrate_core::{JobStatus, Strategy};
use uuid::Uuid;

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "docmigrate")]
#[command(about = "Move documents between storage providers through a transactional outbox")]
pub struct Cli {
    /// Config file (TOML or JSON). Overrides DOCMIGRATE_CONFIG_PATH.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the worker pool until interrupted
    Run(RunArgs),
    /// Apply database migrations and exit
    Migrate,
    #[command(subcommand)]
    Providers(ProvidersCommand),
    #[command(subcommand)]
    Job(JobCommand),
}

#[derive(ClapArgs, Debug)]
pub struct RunArgs {
    /// Override the configured executor count
    #[arg(long)]
    pub workers: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum ProvidersCommand {
    /// Upsert the providers declared in the config file
    Sync,
    /// List persisted provider registrations
    List,
}

#[derive(Debug, Subcommand)]
pub enum JobCommand {
    /// Create a job and queue its initial selection
    Create(CreateArgs),
    /// Queue more documents on a pending, running or paused job
    Queue(QueueArgs),
    Start(JobRef),
    Pause(JobRef),
    Resume(JobRef),
    Cancel(JobRef),
    /// Requeue failed items of a failed or partial job
    Retry(JobRef),
    Show(JobRef),
    List(ListArgs),
    Progress(JobRef),
    Items(ItemsArgs),
    /// Check job counters against item rows
    Verify(JobRef),
}

#[derive(ClapArgs, Debug)]
pub struct JobRef {
    pub job_id: Uuid,
}

#[derive(ClapArgs, Debug)]
pub struct CreateArgs {
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub source: String,
    #[arg(long)]
    pub dest: String,
    #[arg(long, default_value = "copy", value_parser = parse_strategy)]
    pub strategy: Strategy,
    /// Explicit document ids; repeat the flag for several
    #[arg(long = "document", conflicts_with = "prefix")]
    pub documents: Vec<String>,
    /// Queue every source document under this prefix
    #[arg(long)]
    pub prefix: Option<String>,
    #[arg(long)]
    pub concurrency: Option<u32>,
    #[arg(long)]
    pub batch_size: Option<u32>,
    #[arg(long)]
    pub max_attempts: Option<u32>,
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
    #[arg(long)]
    pub created_by: Option<String>,
    /// Start the job right after creation
    #[arg(long, default_value_t = false)]
    pub start: bool,
}

#[derive(ClapArgs, Debug)]
pub struct QueueArgs {
    pub job_id: Uuid,
    #[arg(long = "document")]
    pub documents: Vec<String>,
    #[arg(long, conflicts_with = "documents")]
    pub prefix: Option<String>,
}

#[derive(ClapArgs, Debug)]
pub struct ListArgs {
    #[arg(long, value_parser = parse_job_status)]
    pub status: Option<JobStatus>,
}

#[derive(ClapArgs, Debug)]
pub struct ItemsArgs {
    pub job_id: Uuid,
    #[arg(long, value_parser = parse_item_status)]
    pub status: Option<ItemStatus>,
    #[arg(long)]
    pub limit: Option<usize>,
}

fn parse_strategy(raw: &str) -> Result<Strategy, String> {
    Strategy::parse(raw).map_err(|e| e.to_string())
}

fn parse_job_status(raw: &str) -> Result<JobStatus, String> {
    JobStatus::parse(raw).map_err(|e| e.to_string())
}

fn parse_item_status(raw: &str) -> Result<ItemStatus, String> {
    ItemStatus::parse(raw).map_err(|e| e.to_string())
}
