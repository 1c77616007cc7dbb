use std::path::PathBuf;

use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Langbase error: {0}")]
    Langbase(#[from] LangbaseError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Rate gate error: {0}")]
    RateGate(#[from] RateGateError),
}

/// Checkpoint persistence errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt checkpoint {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Checkpoint not found: {path}")]
    NotFound { path: PathBuf },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Langbase API errors
#[derive(Debug, Error)]
pub enum LangbaseError {
    #[error("Langbase unavailable: {message} (retries: {retries})")]
    Unavailable { message: String, retries: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors surfaced by a single collaborator call.
///
/// These are always recoverable from the orchestrator's point of view, except in
/// the narrative and final evaluation phases.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{agent} transport failed: {source}")]
    Transport {
        agent: String,
        #[source]
        source: LangbaseError,
    },

    #[error("{agent} returned an invalid payload after {attempts} attempt(s): {message}")]
    Schema {
        agent: String,
        attempts: u32,
        message: String,
    },

    #[error("{agent} timed out after {timeout_ms}ms")]
    Timeout { agent: String, timeout_ms: u64 },

    #[error("{agent} failed: {message}")]
    Failed { agent: String, message: String },
}

/// Fatal analysis errors
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Phase {phase} failed: {message} (checkpoint: {checkpoint})")]
    PhaseFailed {
        phase: String,
        message: String,
        checkpoint: String,
    },

    #[error("Invalid analysis configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Analysis {analysis_id} is already {status}")]
    Terminal { analysis_id: String, status: String },
}

/// Rate gate usage errors. Contention is never an error; only requests that can
/// never be satisfied are rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateGateError {
    #[error("Requested {requested} tokens exceeds gate capacity {capacity}")]
    ExceedsCapacity { requested: u32, capacity: u32 },
}

impl AgentError {
    /// Name of the collaborator that produced the error.
    pub fn agent(&self) -> &str {
        match self {
            AgentError::Transport { agent, .. }
            | AgentError::Schema { agent, .. }
            | AgentError::Timeout { agent, .. }
            | AgentError::Failed { agent, .. } => agent,
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for checkpoint operations
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Result type alias for Langbase operations
pub type LangbaseResult<T> = Result<T, LangbaseError>;

/// Result type alias for collaborator calls
pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "missing key".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: missing key");
    }

    #[test]
    fn test_checkpoint_error_display() {
        let err = CheckpointError::NotFound {
            path: PathBuf::from("/tmp/run/analysis_state.json"),
        };
        assert_eq!(
            err.to_string(),
            "Checkpoint not found: /tmp/run/analysis_state.json"
        );

        let err = CheckpointError::Corrupt {
            path: PathBuf::from("state.json"),
            message: "EOF while parsing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Corrupt checkpoint state.json: EOF while parsing"
        );
    }

    #[test]
    fn test_langbase_error_display() {
        let err = LangbaseError::Unavailable {
            message: "server down".to_string(),
            retries: 3,
        };
        assert_eq!(err.to_string(), "Langbase unavailable: server down (retries: 3)");

        let err = LangbaseError::Api {
            status: 401,
            message: "unauthorized".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 401 - unauthorized");

        let err = LangbaseError::Timeout { timeout_ms: 5000 };
        assert_eq!(err.to_string(), "Request timeout after 5000ms");
    }

    #[test]
    fn test_agent_error_display_and_name() {
        let err = AgentError::Timeout {
            agent: "research".to_string(),
            timeout_ms: 1500,
        };
        assert_eq!(err.to_string(), "research timed out after 1500ms");
        assert_eq!(err.agent(), "research");

        let err = AgentError::Schema {
            agent: "narrative".to_string(),
            attempts: 3,
            message: "missing field `headline`".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "narrative returned an invalid payload after 3 attempt(s): missing field `headline`"
        );
        assert_eq!(err.agent(), "narrative");
    }

    #[test]
    fn test_analysis_error_mentions_checkpoint() {
        let err = AnalysisError::PhaseFailed {
            phase: "build_narrative".to_string(),
            message: "pipe unavailable".to_string(),
            checkpoint: "/work/AAPL_x/analysis_state.json".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("build_narrative"));
        assert!(text.contains("/work/AAPL_x/analysis_state.json"));
    }

    #[test]
    fn test_rate_gate_error_display() {
        let err = RateGateError::ExceedsCapacity {
            requested: 5,
            capacity: 2,
        };
        assert_eq!(err.to_string(), "Requested 5 tokens exceeds gate capacity 2");
    }

    #[test]
    fn test_conversions_to_app_error() {
        let app_err: AppError = LangbaseError::Timeout { timeout_ms: 1000 }.into();
        assert!(matches!(app_err, AppError::Langbase(_)));

        let app_err: AppError = AgentError::Failed {
            agent: "synthesis".to_string(),
            message: "boom".to_string(),
        }
        .into();
        assert!(matches!(app_err, AppError::Agent(_)));

        let app_err: AppError = CheckpointError::NotFound {
            path: PathBuf::from("x"),
        }
        .into();
        assert!(matches!(app_err, AppError::Checkpoint(_)));
    }
}
