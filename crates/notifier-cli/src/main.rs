use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use notifier_adapters::{GitHubEventFeed, HttpMetadataClient};
use notifier_mail::SmtpMailer;
use notifier_storage::{HttpTransport, PgNotificationStore};
use notifier_sync::{NotifierConfig, NotifierPipeline};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

const DB_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Parser)]
#[command(name = "issue-notifier")]
#[command(about = "Emails subscribers about newly labeled issues in tracked repositories")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run cycles on the configured cron schedule until ctrl-c.
    Run,
    /// Run a single ingest, dispatch and cleanup cycle.
    Once,
    /// Ingest events only, optionally for a single repository.
    Ingest {
        #[arg(long)]
        repo: Option<String>,
    },
    /// Send digests for pending notifications.
    Dispatch,
    /// Delete notifications already sent.
    Cleanup,
    /// Apply database migrations.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("NOTIFIER_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "notifier=debug,info"
        } else {
            "notifier=info,warn"
        })
    });

    let format = env::var("NOTIFIER_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry.with(fmt::layer().json().with_ansi(false)).init();
        }
        _ => {
            registry.with(fmt::layer().compact()).init();
        }
    }
}

async fn connect_store(config: &NotifierConfig) -> Result<Arc<PgNotificationStore>> {
    let store = PgNotificationStore::connect(&config.database_url, DB_MAX_CONNECTIONS)
        .await
        .context("connecting to the notification database")?;
    Ok(Arc::new(store))
}

async fn build_pipeline(config: &NotifierConfig) -> Result<NotifierPipeline> {
    let metadata_http = Arc::new(HttpTransport::new(config.transport_config())?);
    let feed_http = Arc::new(HttpTransport::new(config.feed_transport_config())?);
    let metadata = Arc::new(HttpMetadataClient::new(
        metadata_http,
        config.metadata_api_url.clone(),
    ));
    let feed = Arc::new(GitHubEventFeed::new(feed_http, config.github_api_url.clone()));
    let store = connect_store(config).await?;
    let mailer = Arc::new(SmtpMailer::new(&config.smtp).context("configuring smtp transport")?);

    Ok(NotifierPipeline::new(metadata, feed, store, mailer)
        .with_options(config.ingest_options())
        .with_settle(config.settle()))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = NotifierConfig::from_env();

    match cli.command.unwrap_or(Commands::Once) {
        Commands::Run => {
            let pipeline = build_pipeline(&config).await?;
            if !config.scheduler_enabled {
                warn!("NOTIFIER_SCHEDULER_ENABLED is off; running a single cycle");
                let summary = pipeline.run_cycle().await?;
                return print_json(&summary);
            }
            let mut sched = pipeline.build_scheduler(&config.cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down");
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Once => {
            let pipeline = build_pipeline(&config).await?;
            let summary = pipeline.run_cycle().await?;
            print_json(&summary)?;
        }
        Commands::Ingest { repo } => {
            let pipeline = build_pipeline(&config).await?;
            let mut repositories = pipeline
                .list_repositories()
                .await
                .context("listing tracked repositories")?;
            if let Some(name) = &repo {
                repositories.retain(|r| &r.repo_name == name);
                if repositories.is_empty() {
                    anyhow::bail!("repository {name} is not tracked");
                }
            }
            let results = pipeline.ingest_all(Uuid::new_v4(), repositories).await;
            let report = results
                .iter()
                .map(|r| match r {
                    Ok(outcome) => json!(outcome),
                    Err(err) => json!({ "error": err.to_string() }),
                })
                .collect::<Vec<_>>();
            print_json(&report)?;
        }
        Commands::Dispatch => {
            let pipeline = build_pipeline(&config).await?;
            let results = pipeline.dispatch_all().await?;
            let report = results
                .iter()
                .map(|r| match r {
                    Ok(outcome) => json!(outcome),
                    Err(err) => json!({ "error": err.to_string() }),
                })
                .collect::<Vec<_>>();
            print_json(&report)?;
        }
        Commands::Cleanup => {
            let pipeline = build_pipeline(&config).await?;
            let purged = pipeline.cleanup().await?;
            println!("purged {purged} sent notifications");
        }
        Commands::Migrate => {
            let store = connect_store(&config).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
