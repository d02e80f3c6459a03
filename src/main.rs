mod cmd;
mod config;
mod context;
mod domain;
mod error;
mod infra;
mod services;
mod sync;
#[cfg(test)]
mod testing;
mod workflow;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::cmd::config::{self as config_cmd, ConfigArgs};
use crate::cmd::ticket::{self, CreateArgs};
use crate::config::AppConfig;
use crate::context::AppContext;
use crate::error::AppResult;
use crate::infra::intake::IntakeClient;
use crate::infra::realtime::{RealtimeConfig, RealtimeFeed};
use crate::infra::supabase::SupabaseStore;

#[derive(Parser)]
#[command(name = "desk", author, version, about = "Live view of support tickets")]
struct Cli {
    /// Log filter, e.g. `info` or `ticket_desk=debug`. `RUST_LOG` takes precedence.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the ticket list once and print it.
    List,
    /// Print the ticket list and keep it updated until Ctrl-C.
    Watch,
    /// Submit a new ticket for classification.
    Create(CreateArgs),
    /// Check the classification service.
    Health,
    /// Manage CLI configuration.
    Config(ConfigArgs),
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> AppResult<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Config(args) => config_cmd::run(args.command),
        Commands::List => ticket::list(&load_context(true)?).await,
        Commands::Watch => ticket::watch(&load_context(true)?).await,
        Commands::Create(args) => {
            let context = load_context(args.follow)?;
            ticket::create(&context, args).await
        }
        Commands::Health => ticket::health(&load_context(false)?).await,
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_context(needs_supabase: bool) -> AppResult<AppContext> {
    let config = AppConfig::load()?;

    if needs_supabase && config.supabase_url.is_none() {
        eprintln!("Warning: Supabase URL not configured; listing and live updates will fail.");
    }
    if needs_supabase && config.supabase_key.is_none() {
        eprintln!("Warning: Supabase key not configured; listing and live updates will fail.");
    }

    let store = Arc::new(SupabaseStore::new(
        config.supabase_url.clone(),
        config.supabase_key.clone(),
        config.table.clone(),
    ));

    let feed = match config.require_supabase() {
        Ok((url, key)) => match RealtimeConfig::for_project(url, key) {
            Ok(realtime) => RealtimeFeed::new(realtime),
            Err(err) => {
                warn!("live updates disabled: {err}");
                RealtimeFeed::unconfigured()
            }
        },
        Err(_) => RealtimeFeed::unconfigured(),
    };

    let intake = Arc::new(IntakeClient::new(config.api_url.clone()));

    Ok(AppContext::new(config, store, Arc::new(feed), intake))
}
