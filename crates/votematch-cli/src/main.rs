use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use votematch_storage::{PgPollStore, PollStore};
use votematch_sync::{SyncConfig, SyncError, SyncPipeline, SyncRunSummary};

#[derive(Debug, Parser)]
#[command(name = "votematch-cli")]
#[command(about = "Parliament vote sync and party match service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch recent polls, refresh tallies and fill in missing questions.
    Sync {
        #[arg(long)]
        limit: Option<usize>,
    },
    Migrate,
    /// Serve the JSON API (and the cron scheduler when enabled).
    Serve,
    /// Run syncs on `SYNC_CRON` until interrupted.
    Schedule,
    /// Drop synthesized questions so the next sync regenerates them.
    ResetQuestions {
        #[arg(long)]
        poll: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { limit: None }) {
        Commands::Sync { limit } => {
            let pipeline = SyncPipeline::from_config(&config, connect(&config).await?)?;
            match pipeline.run_once(limit).await {
                Ok(summary) => print_summary("sync complete", &summary),
                Err(SyncError::QuotaExceeded { summary, source }) => {
                    print_summary("sync aborted", &summary);
                    return Err(anyhow::Error::new(source).context("generative quota exhausted"));
                }
                Err(err) => return Err(err.into()),
            }
        }
        Commands::Migrate => {
            let store = PgPollStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let port: u16 = std::env::var("VOTEMATCH_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000);
            let state = votematch_web::state_from_env(&config).await?;
            let _scheduler = match &state.pipeline {
                Some(pipeline) => match pipeline.maybe_build_scheduler().await? {
                    Some(sched) => {
                        sched.start().await.context("starting scheduler")?;
                        info!(cron = %config.sync_cron, "scheduler started");
                        Some(sched)
                    }
                    None => None,
                },
                None => None,
            };
            votematch_web::serve(state, port).await?;
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let pipeline = Arc::new(SyncPipeline::from_config(&config, connect(&config).await?)?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("no cron schedule configured");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::ResetQuestions { poll } => {
            let removed = connect(&config).await?.reset_questions(poll).await?;
            match poll {
                Some(id) => println!("reset {removed} question(s) for poll {id}"),
                None => println!("reset {removed} question(s)"),
            }
        }
    }

    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<Arc<dyn PollStore>> {
    let store = PgPollStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

fn print_summary(headline: &str, summary: &SyncRunSummary) {
    println!(
        "{headline}: run_id={} listed={} new={} updated={} skipped={} questions={} errors={} reports={}",
        summary.run_id,
        summary.listed,
        summary.new_polls,
        summary.updated_polls,
        summary.skipped_polls,
        summary.questions_generated,
        summary.polls_with_errors,
        summary.reports_dir.as_deref().unwrap_or("-")
    );
}
