//! End-to-end runs with the offline collaborators.
//!
//! Offline research reports confidence 0.5 + 0.1 per pass, so with a 0.85
//! threshold and three mandatory iterations every run stops at iteration 4.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use equity_research::agents::{AgentSuite, OfflineAgents};
use equity_research::checkpoint::{CheckpointStore, FINAL_REPORT_FILE};
use equity_research::cli::{check_cache, CacheAction};
use equity_research::config::{AnalysisConfig, CompactionConfig, RateLimitConfig};
use equity_research::state::{AnalysisStatus, Phase};
use equity_research::{HistoryCompactor, Orchestrator, RateGate, StoppingDecision};

const DAY: Duration = Duration::from_secs(24 * 3600);

fn orchestrator(work_dir: &TempDir) -> Orchestrator {
    Orchestrator::new(
        AnalysisConfig::default(),
        AgentSuite::uniform(Arc::new(OfflineAgents::new())),
        Arc::new(RateGate::from_config(&RateLimitConfig {
            requests_per_second: 200.0,
            burst: 20,
        })),
        CheckpointStore::new(work_dir.path()),
        HistoryCompactor::new(CompactionConfig::default()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_offline_run_completes_with_confidence() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(&dir);
    let progress = orchestrator.subscribe();

    let outcome = orchestrator.run("aapl", "Apple Inc.").await.unwrap();
    let record = &outcome.record;

    assert_eq!(outcome.stop_reason, Some(StoppingDecision::ConfidenceMet));
    assert_eq!(record.status, AnalysisStatus::Completed);
    assert_eq!(record.ticker, "AAPL");
    assert_eq!(record.iterations.len(), 4);
    assert_eq!(record.last_successful_iteration, 4);
    assert!(record.final_report.is_some());
    assert!(!record.evidence_bundle.is_empty());
    assert_eq!(progress.borrow().phase, Phase::Done);

    let final_output = orchestrator
        .store()
        .load_final_output(&record.analysis_id)
        .await
        .unwrap();
    assert_eq!(final_output.ticker, "AAPL");
    assert!(outcome.analysis_dir.join(FINAL_REPORT_FILE).exists());

    let persisted = orchestrator.store().load(&record.analysis_id).await.unwrap();
    assert_eq!(persisted.status, AnalysisStatus::Completed);
    assert_eq!(persisted.confidence_history(), record.confidence_history());
}

#[tokio::test]
async fn test_completed_run_is_reused_from_cache() {
    let dir = TempDir::new().unwrap();
    let first = orchestrator(&dir).run("MSFT", "Microsoft").await.unwrap();

    let action = check_cache(dir.path(), "msft", "Microsoft", DAY).await.unwrap();
    let CacheAction::Reuse(path) = action else {
        panic!("expected a reusable run, got {action:?}");
    };

    let reused = orchestrator(&dir).resume(&path).await.unwrap();
    assert_eq!(reused.stop_reason, None);
    assert_eq!(reused.record.analysis_id, first.record.analysis_id);
    assert_eq!(reused.record.iterations.len(), first.record.iterations.len());
}

#[tokio::test]
async fn test_other_ticker_starts_fresh() {
    let dir = TempDir::new().unwrap();
    orchestrator(&dir).run("MSFT", "Microsoft").await.unwrap();

    let action = check_cache(dir.path(), "NVDA", "", DAY).await.unwrap();
    assert_eq!(action, CacheAction::Fresh);
}

#[tokio::test]
async fn test_interrupted_run_is_resumed_from_cache() {
    let dir = TempDir::new().unwrap();
    let completed = orchestrator(&dir).run("AAPL", "Apple Inc.").await.unwrap();

    // Rewind the persisted run to look like it was cut off after iteration 2.
    let store = CheckpointStore::new(dir.path());
    let mut record = completed.record.clone();
    record.iterations.truncate(2);
    record.last_successful_iteration = 2;
    record.status = AnalysisStatus::InProgress;
    record.final_report = None;
    record.final_evaluation = None;
    store.save(&record).await.unwrap();
    tokio::fs::remove_file(store.final_report_path(&record.analysis_id))
        .await
        .unwrap();

    let action = check_cache(dir.path(), "AAPL", "Apple Inc.", DAY).await.unwrap();
    let CacheAction::Resume(path) = action else {
        panic!("expected a resumable run, got {action:?}");
    };

    let resumed = orchestrator(&dir).resume(&path).await.unwrap();
    assert_eq!(resumed.stop_reason, Some(StoppingDecision::ConfidenceMet));
    assert_eq!(resumed.record.analysis_id, record.analysis_id);
    assert_eq!(resumed.record.status, AnalysisStatus::Completed);
    assert_eq!(resumed.record.iterations.len(), 4);
}
