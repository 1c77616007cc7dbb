//! Cache validation and resume-point tests against on-disk runs.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use equity_research::checkpoint::{CheckpointStore, FinalOutput, ResumePoint};
use equity_research::state::{
    AnalysisRecord, EvidenceItem, FinalEvaluation, Hypothesis, ImpactTier, IterationRecord,
    NarrativeReport, Rating,
};

const DAY: Duration = Duration::from_secs(24 * 3600);

fn record_with_iterations(count: u32) -> AnalysisRecord {
    let mut record = AnalysisRecord::new("AAPL", "Apple Inc.");
    record
        .set_hypotheses(vec![
            Hypothesis::new("h1", "Services growth", "Services grow", ImpactTier::High),
            Hypothesis::new("h2", "Margin expansion", "Mix lifts margins", ImpactTier::Medium),
        ])
        .unwrap();
    for i in 1..=count {
        let mut iteration = IterationRecord::new(i);
        iteration.add_research("h1", vec![EvidenceItem::new("h1", format!("finding {i}"), 0.7)]);
        iteration.confidence = 0.5 + 0.1 * f64::from(i);
        iteration.quality_score = 0.6;
        iteration.complete();
        record.record_iteration(iteration).unwrap();
    }
    record
}

fn report() -> NarrativeReport {
    NarrativeReport {
        headline: "Apple: services carry the story".to_string(),
        thesis: "Recurring revenue offsets hardware cyclicality".to_string(),
        sections: vec![],
        risks: vec!["Regulation".to_string()],
        rating: Rating::Buy,
    }
}

fn evaluation() -> FinalEvaluation {
    FinalEvaluation {
        overall_score: 0.8,
        dimension_scores: BTreeMap::new(),
        strengths: vec![],
        weaknesses: vec![],
    }
}

async fn completed_run(store: &CheckpointStore, with_report: bool) -> AnalysisRecord {
    let mut record = record_with_iterations(2);
    record.mark_completed(report(), evaluation()).unwrap();
    store.save(&record).await.unwrap();
    if with_report {
        store
            .save_final_report(&FinalOutput {
                analysis_id: record.analysis_id.clone(),
                ticker: record.ticker.clone(),
                company_name: record.company_name.clone(),
                generated_at: Utc::now(),
                report: report(),
                evaluation: evaluation(),
            })
            .await
            .unwrap();
    }
    record
}

#[tokio::test]
async fn test_fresh_partial_run_is_valid() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    let record = record_with_iterations(2);
    let path = store.save(&record).await.unwrap();

    let validation = CheckpointStore::validate_cache(&path, "aapl", "Apple Inc.", DAY).await;
    assert!(validation.valid, "{}", validation.reason);
}

#[tokio::test]
async fn test_ticker_mismatch_is_invalid() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    let path = store.save(&record_with_iterations(1)).await.unwrap();

    let validation = CheckpointStore::validate_cache(&path, "MSFT", "", DAY).await;
    assert!(!validation.valid);
    assert!(validation.reason.contains("ticker"));
}

#[tokio::test]
async fn test_company_mismatch_is_invalid() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    let path = store.save(&record_with_iterations(1)).await.unwrap();

    let validation = CheckpointStore::validate_cache(&path, "AAPL", "Apricot Corp", DAY).await;
    assert!(!validation.valid);
    assert!(validation.reason.contains("company"));

    // An empty company name matches anything.
    let validation = CheckpointStore::validate_cache(&path, "AAPL", "", DAY).await;
    assert!(validation.valid);
}

#[tokio::test]
async fn test_stale_run_is_invalid() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    let mut record = record_with_iterations(1);
    record.updated_at = Utc::now() - chrono::Duration::hours(30);
    let path = store.save(&record).await.unwrap();

    let validation = CheckpointStore::validate_cache(&path, "AAPL", "", DAY).await;
    assert!(!validation.valid);
    assert!(validation.reason.contains("age"), "{}", validation.reason);
}

#[tokio::test]
async fn test_completed_run_without_report_is_invalid() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    let record = completed_run(&store, false).await;
    let path = store.state_path(&record.analysis_id);

    let validation = CheckpointStore::validate_cache(&path, "AAPL", "", DAY).await;
    assert!(!validation.valid);
    assert!(validation.reason.contains("final_report.json"));
    assert!(CheckpointStore::resume_point(&path).await.is_err());
}

#[tokio::test]
async fn test_corrupt_state_is_invalid() {
    let dir = TempDir::new().unwrap();
    let run_dir = dir.path().join("AAPL_20260101_000000_deadbeef");
    tokio::fs::create_dir_all(&run_dir).await.unwrap();
    let path = run_dir.join("analysis_state.json");
    tokio::fs::write(&path, b"{\"ticker\": \"AAPL\", \"status\":")
        .await
        .unwrap();

    let validation = CheckpointStore::validate_cache(&path, "AAPL", "", DAY).await;
    assert!(!validation.valid);
    assert!(validation.reason.contains("checkpoint"));
}

#[tokio::test]
async fn test_unknown_status_is_invalid() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    let path = store.save(&record_with_iterations(1)).await.unwrap();

    let mut raw: serde_json::Value =
        serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
    raw["status"] = serde_json::json!("archived");
    tokio::fs::write(&path, serde_json::to_vec_pretty(&raw).unwrap())
        .await
        .unwrap();

    let validation = CheckpointStore::validate_cache(&path, "AAPL", "", DAY).await;
    assert!(!validation.valid);
    assert!(validation.reason.contains("archived"), "{}", validation.reason);
}

#[tokio::test]
async fn test_missing_state_is_invalid() {
    let dir = TempDir::new().unwrap();
    let validation =
        CheckpointStore::validate_cache(&dir.path().join("nope"), "AAPL", "", DAY).await;
    assert!(!validation.valid);
}

#[tokio::test]
async fn test_resume_point_for_partial_run() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    let record = record_with_iterations(3);
    store.save(&record).await.unwrap();

    let point = CheckpointStore::resume_point(&store.analysis_dir(&record.analysis_id))
        .await
        .unwrap();
    assert_eq!(
        point,
        ResumePoint::Partial {
            completed_iterations: 3,
            has_hypotheses: true,
            next_iteration: 4,
        }
    );
}

#[tokio::test]
async fn test_resume_point_for_completed_run() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    let record = completed_run(&store, true).await;

    let point = CheckpointStore::resume_point(&store.state_path(&record.analysis_id))
        .await
        .unwrap();
    match point {
        ResumePoint::Completed { final_output } => {
            assert_eq!(final_output.analysis_id, record.analysis_id);
            assert_eq!(final_output.report.rating, Rating::Buy);
        }
        other => panic!("expected completed resume point, got {other:?}"),
    }
}
