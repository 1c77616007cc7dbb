//! # Equity Research
//!
//! Control plane for iterative, LLM-driven equity analysis. A run generates
//! hypotheses about a company, researches them in rate-limited parallel passes,
//! periodically synthesizes a bull/bear view, scores each pass and stops once
//! confidence is high enough, then writes a narrative report.
//!
//! ## Architecture
//!
//! ```text
//! CLI → Orchestrator ─┬─ AgentSuite (Langbase pipes | offline heuristics)
//!                     ├─ RateGate (token bucket shared by research tasks)
//!                     ├─ HistoryCompactor
//!                     └─ CheckpointStore (JSON files, atomic writes)
//! ```
//!
//! Every iteration is persisted before the stopping decision, so an interrupted
//! run resumes from its last completed iteration.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use equity_research::agents::{AgentSuite, OfflineAgents};
//! use equity_research::{CheckpointStore, Config, HistoryCompactor, Orchestrator, RateGate};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let orchestrator = Orchestrator::new(
//!         config.analysis.clone(),
//!         AgentSuite::uniform(Arc::new(OfflineAgents::new())),
//!         Arc::new(RateGate::from_config(&config.rate_limit)),
//!         CheckpointStore::new(config.checkpoint.work_dir.clone()),
//!         HistoryCompactor::new(config.compaction.clone()),
//!     )?;
//!     let outcome = orchestrator.run("AAPL", "Apple Inc.").await?;
//!     println!("{:?}", outcome.stop_reason);
//!     Ok(())
//! }
//! ```

/// Collaborator contracts and their Langbase and offline implementations.
pub mod agents;
/// Durable analysis state: atomic JSON files, cache validation, resume points.
pub mod checkpoint;
/// Command-line arguments and cache reuse.
pub mod cli;
/// Bounded iteration history.
pub mod compaction;
/// Configuration management.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Langbase API client and types for pipe communication.
pub mod langbase;
/// Iteration loop, stopping policy and hypothesis refinement.
pub mod orchestrator;
/// System prompts for Langbase pipes.
pub mod prompts;
/// Token-bucket rate limiting.
pub mod rate_gate;
/// Analysis state model.
pub mod state;

pub use checkpoint::CheckpointStore;
pub use compaction::HistoryCompactor;
pub use config::Config;
pub use error::{AppError, AppResult};
pub use orchestrator::{AnalysisOutcome, Orchestrator, StoppingDecision};
pub use rate_gate::RateGate;
