use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use super::{read_json, resolve_state_path, FinalOutput, FINAL_REPORT_FILE};
use crate::error::{CheckpointError, CheckpointResult};
use crate::state::{AnalysisRecord, AnalysisStatus};

/// Whether a persisted run may be reused for a new request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheValidation {
    pub valid: bool,
    pub reason: String,
}

impl CacheValidation {
    fn valid() -> Self {
        Self {
            valid: true,
            reason: "checkpoint is valid".to_string(),
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: reason.into(),
        }
    }
}

/// Where a resumed run picks up.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumePoint {
    /// Nothing left to do; the final output is on disk.
    Completed { final_output: Box<FinalOutput> },
    Partial {
        completed_iterations: u32,
        has_hypotheses: bool,
        next_iteration: u32,
    },
}

impl super::CheckpointStore {
    /// Check that the run at `path` belongs to `ticker`/`company_name`, is recent
    /// enough and is internally consistent.
    ///
    /// Never fails: an unreadable or corrupt checkpoint is simply invalid.
    pub async fn validate_cache(
        path: &Path,
        ticker: &str,
        company_name: &str,
        max_age: Duration,
    ) -> CacheValidation {
        let state_path = resolve_state_path(path).await;

        let raw: serde_json::Value = match read_json(&state_path).await {
            Ok(raw) => raw,
            Err(e) => return CacheValidation::invalid(format!("unreadable checkpoint: {}", e)),
        };
        if let Some(status) = raw.get("status").and_then(|s| s.as_str()) {
            if AnalysisStatus::from_str(status).is_err() {
                return CacheValidation::invalid(format!("unknown status '{}'", status));
            }
        }
        let record: AnalysisRecord = match serde_json::from_value(raw) {
            Ok(record) => record,
            Err(e) => return CacheValidation::invalid(format!("corrupt checkpoint: {}", e)),
        };

        let result = check_record(&record, &state_path, ticker, company_name, max_age).await;
        debug!(
            path = %state_path.display(),
            valid = result.valid,
            reason = %result.reason,
            "Validated cached analysis"
        );
        result
    }

    /// Decide where to continue the run persisted at `path`.
    pub async fn resume_point(path: &Path) -> CheckpointResult<ResumePoint> {
        let state_path = resolve_state_path(path).await;
        let record: AnalysisRecord = read_json(&state_path).await?;

        if record.status == AnalysisStatus::Completed {
            let report_path = sibling(&state_path, FINAL_REPORT_FILE);
            return match read_json::<FinalOutput>(&report_path).await {
                Ok(final_output) => Ok(ResumePoint::Completed {
                    final_output: Box::new(final_output),
                }),
                Err(CheckpointError::NotFound { path }) => Err(CheckpointError::Corrupt {
                    path,
                    message: "completed analysis has no final report".to_string(),
                }),
                Err(e) => Err(e),
            };
        }

        Ok(ResumePoint::Partial {
            completed_iterations: record.last_successful_iteration,
            has_hypotheses: !record.validated_hypotheses.is_empty(),
            next_iteration: record.last_successful_iteration + 1,
        })
    }
}

async fn check_record(
    record: &AnalysisRecord,
    state_path: &Path,
    ticker: &str,
    company_name: &str,
    max_age: Duration,
) -> CacheValidation {
    if !record.ticker.eq_ignore_ascii_case(ticker.trim()) {
        return CacheValidation::invalid(format!(
            "ticker mismatch: checkpoint has {}, requested {}",
            record.ticker,
            ticker.trim().to_uppercase()
        ));
    }

    let requested = company_name.trim();
    let cached = record.company_name.trim();
    if !requested.is_empty() && !cached.is_empty() && !requested.eq_ignore_ascii_case(cached) {
        return CacheValidation::invalid(format!(
            "company mismatch: checkpoint has '{}', requested '{}'",
            cached, requested
        ));
    }

    // A clock-skewed future timestamp counts as fresh.
    let age = (Utc::now() - record.updated_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    if age > max_age {
        return CacheValidation::invalid(format!(
            "checkpoint age {:.1}h exceeds max age {:.1}h",
            age.as_secs_f64() / 3600.0,
            max_age.as_secs_f64() / 3600.0
        ));
    }

    if record.status == AnalysisStatus::Completed {
        let report_exists = tokio::fs::try_exists(sibling(state_path, FINAL_REPORT_FILE))
            .await
            .unwrap_or(false);
        if !report_exists {
            return CacheValidation::invalid("completed analysis is missing final_report.json");
        }
    }

    CacheValidation::valid()
}

fn sibling(state_path: &Path, name: &str) -> std::path::PathBuf {
    state_path
        .parent()
        .map(|dir| dir.join(name))
        .unwrap_or_else(|| Path::new(name).to_path_buf())
}
