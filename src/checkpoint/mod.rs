//! Durable, atomic persistence of analysis state.
//!
//! Layout under `<work_dir>/<analysis_id>/`:
//!
//! ```text
//! analysis_state.json          full AnalysisRecord
//! iteration_NN.json            one per iteration, full fidelity
//! validated_hypotheses.json    active hypothesis set
//! evidence_bundle.json         aggregated evidence
//! final_report.json            narrative + final evaluation
//! checkpoints/
//!   checkpoint_iterNN_<phase>.json
//!   latest.json                overwritten on every checkpoint
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place, so a
//! reader never observes a partial write and one failed write cannot corrupt the
//! others.

mod cache;

pub use cache::{CacheValidation, ResumePoint};

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CheckpointError, CheckpointResult};
use crate::state::{
    AnalysisRecord, EvidenceItem, FinalEvaluation, Hypothesis, IterationRecord, NarrativeReport,
    Phase, Progress, SynthesisInsight,
};

pub const STATE_FILE: &str = "analysis_state.json";
pub const HYPOTHESES_FILE: &str = "validated_hypotheses.json";
pub const EVIDENCE_FILE: &str = "evidence_bundle.json";
pub const FINAL_REPORT_FILE: &str = "final_report.json";
pub const CHECKPOINT_DIR: &str = "checkpoints";
pub const LATEST_FILE: &str = "latest.json";

pub fn iteration_file_name(iteration: u32) -> String {
    format!("iteration_{:02}.json", iteration)
}

pub fn checkpoint_file_name(iteration: u32, phase: Phase) -> String {
    format!("checkpoint_iter{:02}_{}.json", iteration, phase.as_str())
}

/// Metrics captured alongside each checkpoint entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub cost_usd: f64,
    pub tokens: u64,
    pub confidence: f64,
    pub quality_score: f64,
    pub iterations_completed: u32,
    pub evidence_count: usize,
    pub failed_steps: usize,
}

/// One persisted (iteration, phase) checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub analysis_id: String,
    pub ticker: String,
    pub company_name: String,
    pub phase: Phase,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub hypotheses: Vec<Hypothesis>,
    /// Evidence of the latest iteration; the full bundle lives in its own file.
    pub evidence: Vec<EvidenceItem>,
    pub synthesis: Option<SynthesisInsight>,
    /// Valuation output is produced outside this crate and only passed through.
    #[serde(default)]
    pub valuation: Option<serde_json::Value>,
    pub narrative: Option<NarrativeReport>,
    pub metrics: MetricsSnapshot,
    pub progress: Progress,
}

impl CheckpointEntry {
    /// Snapshot everything available on `record` at this phase.
    pub fn from_record(record: &AnalysisRecord, phase: Phase, progress: Progress) -> Self {
        let latest = record.latest_iteration();
        let synthesis = record
            .iterations
            .iter()
            .rev()
            .find_map(|i| i.synthesis.clone());

        Self {
            analysis_id: record.analysis_id.clone(),
            ticker: record.ticker.clone(),
            company_name: record.company_name.clone(),
            phase,
            iteration: progress.iteration,
            timestamp: Utc::now(),
            hypotheses: record.validated_hypotheses.clone(),
            evidence: latest.map(|i| i.evidence.clone()).unwrap_or_default(),
            synthesis,
            valuation: None,
            narrative: record.final_report.clone(),
            metrics: MetricsSnapshot {
                cost_usd: record.usage.cost_usd,
                tokens: record.usage.tokens,
                confidence: latest.map(|i| i.confidence).unwrap_or(0.0),
                quality_score: latest.map(|i| i.quality_score).unwrap_or(0.0),
                iterations_completed: record.last_successful_iteration,
                evidence_count: record.evidence_bundle.len(),
                failed_steps: record.iterations.iter().map(|i| i.errors.len()).sum(),
            },
            progress,
        }
    }
}

/// Contents of `final_report.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalOutput {
    pub analysis_id: String,
    pub ticker: String,
    pub company_name: String,
    pub generated_at: DateTime<Utc>,
    pub report: NarrativeReport,
    pub evaluation: FinalEvaluation,
}

/// File-backed store keyed by analysis id under a working directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    work_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn analysis_dir(&self, analysis_id: &str) -> PathBuf {
        self.work_dir.join(analysis_id)
    }

    pub fn state_path(&self, analysis_id: &str) -> PathBuf {
        self.analysis_dir(analysis_id).join(STATE_FILE)
    }

    pub fn final_report_path(&self, analysis_id: &str) -> PathBuf {
        self.analysis_dir(analysis_id).join(FINAL_REPORT_FILE)
    }

    /// Write the full record and, when present, its latest iteration.
    pub async fn save(&self, record: &AnalysisRecord) -> CheckpointResult<PathBuf> {
        let path = self.state_path(&record.analysis_id);
        write_json_atomic(&path, record).await?;
        if let Some(iteration) = record.latest_iteration() {
            // Compaction may have rewritten older entries; only the newest file
            // is refreshed so iteration files keep full fidelity.
            if !iteration.compacted {
                self.save_iteration(&record.analysis_id, iteration).await?;
            }
        }
        debug!(
            analysis_id = %record.analysis_id,
            status = %record.status,
            iterations = record.iterations.len(),
            "Saved analysis state"
        );
        Ok(path)
    }

    pub async fn save_iteration(
        &self,
        analysis_id: &str,
        iteration: &IterationRecord,
    ) -> CheckpointResult<PathBuf> {
        let path = self
            .analysis_dir(analysis_id)
            .join(iteration_file_name(iteration.iteration));
        write_json_atomic(&path, iteration).await?;
        Ok(path)
    }

    pub async fn save_hypotheses(
        &self,
        analysis_id: &str,
        hypotheses: &[Hypothesis],
    ) -> CheckpointResult<PathBuf> {
        let path = self.analysis_dir(analysis_id).join(HYPOTHESES_FILE);
        write_json_atomic(&path, &hypotheses).await?;
        Ok(path)
    }

    pub async fn save_evidence_bundle(
        &self,
        analysis_id: &str,
        evidence: &[EvidenceItem],
    ) -> CheckpointResult<PathBuf> {
        let path = self.analysis_dir(analysis_id).join(EVIDENCE_FILE);
        write_json_atomic(&path, &evidence).await?;
        Ok(path)
    }

    pub async fn save_final_report(&self, output: &FinalOutput) -> CheckpointResult<PathBuf> {
        let path = self.final_report_path(&output.analysis_id);
        write_json_atomic(&path, output).await?;
        Ok(path)
    }

    /// Write one (iteration, phase) checkpoint and repoint `latest.json` at it.
    pub async fn save_checkpoint(&self, entry: &CheckpointEntry) -> CheckpointResult<PathBuf> {
        let dir = self.analysis_dir(&entry.analysis_id).join(CHECKPOINT_DIR);
        let path = dir.join(checkpoint_file_name(entry.iteration, entry.phase));
        write_json_atomic(&path, entry).await?;
        write_json_atomic(&dir.join(LATEST_FILE), entry).await?;
        debug!(
            analysis_id = %entry.analysis_id,
            phase = %entry.phase,
            iteration = entry.iteration,
            "Checkpoint written"
        );
        Ok(path)
    }

    pub async fn load(&self, analysis_id: &str) -> CheckpointResult<AnalysisRecord> {
        Self::load_record(&self.state_path(analysis_id)).await
    }

    /// Load a record from an analysis directory, its state file, or any file in
    /// its `checkpoints/` directory.
    pub async fn load_record(path: &Path) -> CheckpointResult<AnalysisRecord> {
        let state_path = resolve_state_path(path).await;
        read_json(&state_path).await
    }

    pub async fn load_iteration(
        &self,
        analysis_id: &str,
        iteration: u32,
    ) -> CheckpointResult<IterationRecord> {
        read_json(&self.analysis_dir(analysis_id).join(iteration_file_name(iteration))).await
    }

    pub async fn load_final_output(&self, analysis_id: &str) -> CheckpointResult<FinalOutput> {
        read_json(&self.final_report_path(analysis_id)).await
    }

    /// O(1) lookup of the most recent checkpoint entry of one analysis.
    pub async fn latest_checkpoint(
        &self,
        analysis_id: &str,
    ) -> CheckpointResult<Option<CheckpointEntry>> {
        let path = self
            .analysis_dir(analysis_id)
            .join(CHECKPOINT_DIR)
            .join(LATEST_FILE);
        match read_json(&path).await {
            Ok(entry) => Ok(Some(entry)),
            Err(CheckpointError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Most recently modified analysis state file under `work_dir`.
    pub async fn find_latest(work_dir: &Path) -> CheckpointResult<Option<PathBuf>> {
        let candidates = list_state_files(work_dir).await?;
        Ok(candidates
            .into_iter()
            .max_by_key(|(_, modified)| *modified)
            .map(|(path, _)| path))
    }

    /// Like [`Self::find_latest`] but only considers runs for `ticker`.
    ///
    /// Unreadable state files are skipped.
    pub async fn find_latest_for_ticker(
        work_dir: &Path,
        ticker: &str,
    ) -> CheckpointResult<Option<PathBuf>> {
        let mut candidates = list_state_files(work_dir).await?;
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        for (path, _) in candidates {
            match Self::load_record(&path).await {
                Ok(record) if record.ticker.eq_ignore_ascii_case(ticker.trim()) => {
                    return Ok(Some(path));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint")
                }
            }
        }
        Ok(None)
    }
}

async fn list_state_files(work_dir: &Path) -> CheckpointResult<Vec<(PathBuf, SystemTime)>> {
    let mut entries = match tokio::fs::read_dir(work_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(work_dir, e)),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error(work_dir, e))?
    {
        let state_path = entry.path().join(STATE_FILE);
        if let Ok(meta) = tokio::fs::metadata(&state_path).await {
            if let Ok(modified) = meta.modified() {
                found.push((state_path, modified));
            }
        }
    }
    Ok(found)
}

pub(crate) async fn resolve_state_path(path: &Path) -> PathBuf {
    let is_dir = tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if is_dir {
        return path.join(STATE_FILE);
    }

    let in_checkpoint_dir = path
        .parent()
        .and_then(|p| p.file_name())
        .is_some_and(|name| name == CHECKPOINT_DIR);
    match path.parent().and_then(Path::parent) {
        Some(analysis_dir) if in_checkpoint_dir => analysis_dir.join(STATE_FILE),
        _ => path.to_path_buf(),
    }
}

/// Serialize `value` as pretty JSON to a temp sibling, fsync, then rename over `path`.
pub(crate) async fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> CheckpointResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| io_error(dir, e))?;

    let bytes = serde_json::to_vec_pretty(value)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkpoint".to_string());
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        file.write_all(&bytes).await.map_err(|e| io_error(&tmp, e))?;
        file.sync_all().await.map_err(|e| io_error(&tmp, e))?;
        drop(file);
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| io_error(path, e))
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> CheckpointResult<T> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CheckpointError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(io_error(path, e)),
    };
    serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn io_error(path: &Path, source: std::io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}
