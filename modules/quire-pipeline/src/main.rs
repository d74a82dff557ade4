use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use quire_common::types::Issue;
use quire_common::Config;
use quire_pipeline::allocation::assign_manual;
use quire_pipeline::infra::claude::{Claude, ClaudeEvaluator, ClaudeWriter};
use quire_pipeline::infra::embedder::Embedder;
use quire_pipeline::infra::feed::FeedSource;
use quire_pipeline::infra::notify::{NoopNotifier, SlackNotifier};
use quire_pipeline::traits::{CandidateSource, Notifier};
use quire_pipeline::{Orchestrator, PipelineDeps};
use quire_store::{IssueStore, PgIssueStore};

#[derive(Parser)]
#[command(name = "quire", about = "Newsletter issue assembly pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply database migrations
    Migrate,
    /// Create a new issue in `processing`
    CreateIssue {
        /// Issue date (YYYY-MM-DD), today when omitted
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Run the full pipeline for an issue
    Run {
        #[arg(long)]
        issue: Uuid,
    },
    /// Drop everything derived for an issue and put it back into processing
    Reset {
        #[arg(long)]
        issue: Uuid,
    },
    /// Assign items to a manual-selection module
    Assign {
        #[arg(long)]
        issue: Uuid,
        /// Module slug
        #[arg(long)]
        module: String,
        /// Item ids in slot order, comma-separated
        #[arg(long, value_delimiter = ',', required = true)]
        items: Vec<Uuid>,
    },
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("quire=info".parse()?);
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

async fn connect(config: &Config) -> Result<PgIssueStore> {
    Ok(PgIssueStore::connect(&config.database_url).await?)
}

fn build_deps(config: &Config, store: Arc<dyn IssueStore>) -> Result<PipelineDeps> {
    let sources = config
        .feed_urls
        .iter()
        .map(|url| Ok(Arc::new(FeedSource::new(url.as_str())?) as Arc<dyn CandidateSource>))
        .collect::<Result<Vec<_>>>()?;
    if sources.is_empty() {
        info!("No FEED_URLS set, ingesting from the candidate pool only");
    }

    let claude = Claude::new(&config.anthropic_api_key, &config.generation_model);
    let notifier: Arc<dyn Notifier> = match &config.slack_webhook_url {
        Some(url) => {
            info!("Slack notifications enabled");
            Arc::new(SlackNotifier::new(url.clone()))
        }
        None => {
            info!("No SLACK_WEBHOOK_URL set, notifications disabled");
            Arc::new(NoopNotifier)
        }
    };

    Ok(PipelineDeps::builder()
        .store(store)
        .sources(sources)
        .evaluator(Arc::new(ClaudeEvaluator::new(claude.clone())))
        .writer(Arc::new(ClaudeWriter::new(
            claude,
            config.pipeline.headline_max_chars,
        )))
        .embedder(Arc::new(Embedder::new(&config.voyage_api_key)))
        .notifier(notifier)
        .settings(config.pipeline.clone())
        .build())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command {
        Command::Migrate => {
            let config = Config::store_from_env()?;
            config.log_redacted();
            connect(&config).await?.migrate().await?;
            info!("Migrations applied");
        }
        Command::CreateIssue { date } => {
            let config = Config::store_from_env()?;
            let store = connect(&config).await?;
            let issue = Issue::new(date.unwrap_or_else(|| Utc::now().date_naive()));
            store.create_issue(&issue).await?;
            info!(issue_id = %issue.id, issue_date = %issue.issue_date, "Issue created");
            println!("{}", issue.id);
        }
        Command::Run { issue } => {
            let config = Config::from_env()?;
            config.log_redacted();
            let store: Arc<dyn IssueStore> = Arc::new(connect(&config).await?);
            let orchestrator = Orchestrator::new(build_deps(&config, store)?);

            let report = orchestrator.run_pipeline(issue).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                match report.failure() {
                    Some(failure) => bail!("pipeline failed at {}: {}", failure.step, failure.error),
                    None => bail!("pipeline failed"),
                }
            }
        }
        Command::Reset { issue } => {
            let config = Config::store_from_env()?;
            let store = connect(&config).await?;
            let stats = store.reset_issue(issue).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Assign {
            issue,
            module,
            items,
        } => {
            let config = Config::store_from_env()?;
            let store = connect(&config).await?;
            let allocation = assign_manual(&store, issue, &module, &items).await?;
            println!("{}", serde_json::to_string_pretty(&allocation)?);
        }
    }
    Ok(())
}
