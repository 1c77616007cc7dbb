//! Command-line surface: argument parsing, config overrides and cache reuse.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::info;

use crate::agents::{AgentSuite, LangbaseAgents, OfflineAgents};
use crate::checkpoint::{CheckpointStore, ResumePoint};
use crate::compaction::HistoryCompactor;
use crate::config::Config;
use crate::error::AppResult;
use crate::langbase::LangbaseClient;
use crate::orchestrator::{AnalysisOutcome, Orchestrator};
use crate::rate_gate::RateGate;

#[derive(Debug, Parser)]
#[command(name = "equity-research", version, about = "Iterative equity research analysis")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Analyze a ticker, reusing or resuming a recent run when possible
    Analyze(AnalyzeArgs),
}

#[derive(Debug, Clone, Args)]
pub struct AnalyzeArgs {
    /// Ticker symbol, e.g. AAPL
    pub ticker: String,

    /// Company name
    #[arg(long, default_value = "")]
    pub company: String,

    /// Maximum research iterations
    #[arg(long)]
    pub iterations: Option<u32>,

    /// Confidence threshold in (0, 1]
    #[arg(long)]
    pub confidence: Option<f64>,

    /// Directory holding analysis runs
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Research hypotheses one at a time
    #[arg(long)]
    pub no_parallel: bool,

    /// Use deterministic offline collaborators instead of Langbase
    #[arg(long)]
    pub offline: bool,

    /// Ignore cached runs
    #[arg(long)]
    pub fresh: bool,

    /// Maximum age of a reusable run, in hours
    #[arg(long)]
    pub max_age_hours: Option<u64>,
}

impl AnalyzeArgs {
    /// Apply flag overrides on top of the env-derived config.
    pub fn apply(&self, config: &mut Config) {
        if let Some(iterations) = self.iterations {
            config.analysis.max_iterations = iterations;
            config.analysis.min_iterations = config.analysis.min_iterations.min(iterations);
        }
        if let Some(confidence) = self.confidence {
            config.analysis.confidence_threshold = confidence;
        }
        if let Some(work_dir) = &self.work_dir {
            config.checkpoint.work_dir = work_dir.clone();
        }
        if self.no_parallel {
            config.analysis.enable_parallel_research = false;
        }
        if let Some(hours) = self.max_age_hours {
            config.checkpoint.max_age_hours = hours;
        }
    }
}

/// What to do with previously persisted work for a ticker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheAction {
    Reuse(PathBuf),
    Resume(PathBuf),
    Fresh,
}

/// Pick the newest run for `ticker` and decide whether it can be reused.
pub async fn check_cache(
    work_dir: &Path,
    ticker: &str,
    company_name: &str,
    max_age: Duration,
) -> AppResult<CacheAction> {
    let Some(path) = CheckpointStore::find_latest_for_ticker(work_dir, ticker).await? else {
        return Ok(CacheAction::Fresh);
    };

    let validation = CheckpointStore::validate_cache(&path, ticker, company_name, max_age).await;
    if !validation.valid {
        info!(path = %path.display(), reason = %validation.reason, "Cached analysis rejected");
        return Ok(CacheAction::Fresh);
    }

    match CheckpointStore::resume_point(&path).await {
        Ok(ResumePoint::Completed { .. }) => Ok(CacheAction::Reuse(path)),
        Ok(ResumePoint::Partial { next_iteration, .. }) => {
            info!(path = %path.display(), next_iteration, "Resumable analysis found");
            Ok(CacheAction::Resume(path))
        }
        Err(e) => {
            info!(path = %path.display(), error = %e, "Cached analysis unusable");
            Ok(CacheAction::Fresh)
        }
    }
}

/// Wire collaborators, rate gate and store into an orchestrator.
pub async fn build_orchestrator(config: &Config, offline: bool) -> AppResult<Orchestrator> {
    let agents = if offline {
        info!("Using offline collaborators");
        AgentSuite::uniform(Arc::new(OfflineAgents::new()))
    } else {
        config.require_langbase()?;
        let client = LangbaseClient::new(&config.langbase, config.request.clone())?;
        info!(base_url = %client.base_url(), "Langbase client initialized");
        let agents = LangbaseAgents::new(client, config.pipes.clone(), config.pricing.clone());
        agents.ensure_pipes().await?;
        AgentSuite::uniform(Arc::new(agents))
    };

    let orchestrator = Orchestrator::new(
        config.analysis.clone(),
        agents,
        Arc::new(RateGate::from_config(&config.rate_limit)),
        CheckpointStore::new(config.checkpoint.work_dir.clone()),
        HistoryCompactor::new(config.compaction.clone()),
    )?;
    Ok(orchestrator)
}

/// Run `analyze`: reuse, resume or start a run.
pub async fn analyze(config: &Config, args: &AnalyzeArgs) -> AppResult<AnalysisOutcome> {
    let orchestrator = build_orchestrator(config, args.offline).await?;

    let action = if args.fresh {
        CacheAction::Fresh
    } else {
        check_cache(
            &config.checkpoint.work_dir,
            &args.ticker,
            &args.company,
            Duration::from_secs(config.checkpoint.max_age_hours * 3600),
        )
        .await?
    };

    match action {
        CacheAction::Reuse(path) | CacheAction::Resume(path) => orchestrator.resume(&path).await,
        CacheAction::Fresh => orchestrator.run(&args.ticker, &args.company).await,
    }
}
