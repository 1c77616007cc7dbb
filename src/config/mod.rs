use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AnalysisError, AppError};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub langbase: LangbaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub pipes: PipeConfig,
    pub analysis: AnalysisConfig,
    pub rate_limit: RateLimitConfig,
    pub compaction: CompactionConfig,
    pub checkpoint: CheckpointConfig,
    pub pricing: PricingConfig,
}

/// Langbase API configuration
#[derive(Debug, Clone)]
pub struct LangbaseConfig {
    pub api_key: String,
    pub base_url: String,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Correction attempts when a pipe returns a payload that fails schema validation
    pub schema_retries: u32,
}

/// Langbase pipe name configuration, one pipe per collaborator
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub hypothesis: String,
    pub research: String,
    pub synthesis: String,
    pub evaluation: String,
    pub narrative: String,
    pub final_evaluation: String,
}

/// Iteration loop and stopping policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    pub max_iterations: u32,
    /// Stopping on confidence is disabled below this floor
    pub min_iterations: u32,
    pub confidence_threshold: f64,
    /// Iteration numbers at which a synthesis pass runs
    pub checkpoint_iterations: BTreeSet<u32>,
    /// Number of top hypotheses carried into synthesis
    pub synthesis_top_n: usize,
    pub enable_parallel_research: bool,
    pub enable_compaction: bool,
    pub research_timeout_ms: u64,
    /// Number of trailing confidence deltas inspected for early convergence (0 disables)
    pub convergence_window: usize,
    pub convergence_epsilon: f64,
    /// Consecutive iterations without any successful research before stopping (0 disables)
    pub max_failed_iterations: u32,
    pub max_cost_usd: Option<f64>,
    /// Upper bound on active hypotheses after follow-ups are added
    pub max_hypotheses: usize,
}

/// Shared research rate limit
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst: u32,
}

/// Iteration history compaction
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionConfig {
    pub preserve_recent: usize,
    pub max_evidence_per_iteration: usize,
    pub max_insight_chars: usize,
}

/// Checkpoint location and cache freshness
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub work_dir: PathBuf,
    pub max_age_hours: u64,
}

/// Token pricing used for cost accounting
#[derive(Debug, Clone)]
pub struct PricingConfig {
    pub usd_per_1k_tokens: f64,
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

/// Parse a comma separated list of iteration numbers, ignoring blanks and junk.
pub fn parse_iteration_set(raw: &str) -> BTreeSet<u32> {
    raw.split(',')
        .filter_map(|s| s.trim().parse::<u32>().ok())
        .filter(|n| *n > 0)
        .collect()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let langbase = LangbaseConfig {
            api_key: env::var("LANGBASE_API_KEY").unwrap_or_default(),
            base_url: env::var("LANGBASE_BASE_URL")
                .unwrap_or_else(|_| "https://api.langbase.com".to_string()),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: parse_env("REQUEST_TIMEOUT_MS", 60000),
            max_retries: parse_env("MAX_RETRIES", 3),
            retry_delay_ms: parse_env("RETRY_DELAY_MS", 1000),
            schema_retries: parse_env("LANGBASE_SCHEMA_RETRIES", 2),
        };

        let pipes = PipeConfig {
            hypothesis: env::var("PIPE_HYPOTHESIS")
                .unwrap_or_else(|_| "equity-hypothesis-v1".to_string()),
            research: env::var("PIPE_RESEARCH")
                .unwrap_or_else(|_| "equity-research-v1".to_string()),
            synthesis: env::var("PIPE_SYNTHESIS")
                .unwrap_or_else(|_| "equity-synthesis-v1".to_string()),
            evaluation: env::var("PIPE_EVALUATION")
                .unwrap_or_else(|_| "equity-evaluation-v1".to_string()),
            narrative: env::var("PIPE_NARRATIVE")
                .unwrap_or_else(|_| "equity-narrative-v1".to_string()),
            final_evaluation: env::var("PIPE_FINAL_EVALUATION")
                .unwrap_or_else(|_| "equity-final-evaluation-v1".to_string()),
        };

        let defaults = AnalysisConfig::default();
        let analysis = AnalysisConfig {
            max_iterations: parse_env("ANALYSIS_MAX_ITERATIONS", defaults.max_iterations),
            min_iterations: parse_env("ANALYSIS_MIN_ITERATIONS", defaults.min_iterations),
            confidence_threshold: parse_env(
                "ANALYSIS_CONFIDENCE_THRESHOLD",
                defaults.confidence_threshold,
            ),
            checkpoint_iterations: env::var("ANALYSIS_CHECKPOINT_ITERATIONS")
                .map(|raw| parse_iteration_set(&raw))
                .unwrap_or(defaults.checkpoint_iterations),
            synthesis_top_n: parse_env("ANALYSIS_SYNTHESIS_TOP_N", defaults.synthesis_top_n),
            enable_parallel_research: parse_bool_env(
                "ANALYSIS_PARALLEL_RESEARCH",
                defaults.enable_parallel_research,
            ),
            enable_compaction: parse_bool_env("ANALYSIS_COMPACTION", defaults.enable_compaction),
            research_timeout_ms: parse_env(
                "ANALYSIS_RESEARCH_TIMEOUT_MS",
                defaults.research_timeout_ms,
            ),
            convergence_window: parse_env(
                "ANALYSIS_CONVERGENCE_WINDOW",
                defaults.convergence_window,
            ),
            convergence_epsilon: parse_env(
                "ANALYSIS_CONVERGENCE_EPSILON",
                defaults.convergence_epsilon,
            ),
            max_failed_iterations: parse_env(
                "ANALYSIS_MAX_FAILED_ITERATIONS",
                defaults.max_failed_iterations,
            ),
            max_cost_usd: env::var("ANALYSIS_MAX_COST_USD")
                .ok()
                .and_then(|s| s.trim().parse().ok()),
            max_hypotheses: parse_env("ANALYSIS_MAX_HYPOTHESES", defaults.max_hypotheses),
        };

        let rate_limit = RateLimitConfig {
            requests_per_second: parse_env("RESEARCH_RATE_PER_SECOND", 2.0),
            burst: parse_env("RESEARCH_RATE_BURST", 4),
        };

        let compaction = CompactionConfig {
            preserve_recent: parse_env("COMPACTION_PRESERVE_RECENT", 3),
            max_evidence_per_iteration: parse_env("COMPACTION_MAX_EVIDENCE", 10),
            max_insight_chars: parse_env("COMPACTION_MAX_INSIGHT_CHARS", 2000),
        };

        let checkpoint = CheckpointConfig {
            work_dir: PathBuf::from(
                env::var("ANALYSIS_WORK_DIR").unwrap_or_else(|_| "./analysis_runs".to_string()),
            ),
            max_age_hours: parse_env("CACHE_MAX_AGE_HOURS", 24),
        };

        let pricing = PricingConfig {
            usd_per_1k_tokens: parse_env("PRICING_USD_PER_1K_TOKENS", 0.002),
        };

        let rate = rate_limit.requests_per_second;
        if !(rate.is_finite() && rate > 0.0) || rate_limit.burst == 0 {
            return Err(AppError::Config {
                message: "RESEARCH_RATE_PER_SECOND and RESEARCH_RATE_BURST must be positive"
                    .to_string(),
            });
        }

        Ok(Config {
            langbase,
            logging,
            request,
            pipes,
            analysis,
            rate_limit,
            compaction,
            checkpoint,
            pricing,
        })
    }

    /// Check the settings that only matter when talking to Langbase.
    pub fn require_langbase(&self) -> Result<(), AppError> {
        if self.langbase.api_key.trim().is_empty() {
            return Err(AppError::Config {
                message: "LANGBASE_API_KEY is required".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            langbase: LangbaseConfig::default(),
            logging: LoggingConfig::default(),
            request: RequestConfig::default(),
            pipes: PipeConfig::default(),
            analysis: AnalysisConfig::default(),
            rate_limit: RateLimitConfig::default(),
            compaction: CompactionConfig::default(),
            checkpoint: CheckpointConfig::default(),
            pricing: PricingConfig::default(),
        }
    }
}

impl Default for LangbaseConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.langbase.com".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60000,
            max_retries: 3,
            retry_delay_ms: 1000,
            schema_retries: 2,
        }
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            hypothesis: "equity-hypothesis-v1".to_string(),
            research: "equity-research-v1".to_string(),
            synthesis: "equity-synthesis-v1".to_string(),
            evaluation: "equity-evaluation-v1".to_string(),
            narrative: "equity-narrative-v1".to_string(),
            final_evaluation: "equity-final-evaluation-v1".to_string(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            min_iterations: 3,
            confidence_threshold: 0.85,
            checkpoint_iterations: [3, 6, 9, 12, 15].into_iter().collect(),
            synthesis_top_n: 5,
            enable_parallel_research: true,
            enable_compaction: true,
            research_timeout_ms: 120_000,
            convergence_window: 3,
            convergence_epsilon: 0.01,
            max_failed_iterations: 3,
            max_cost_usd: None,
            max_hypotheses: 10,
        }
    }
}

impl AnalysisConfig {
    /// Reject configurations the iteration loop cannot honour.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        let invalid = |field: &str, reason: &str| AnalysisError::InvalidConfig {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if self.max_iterations == 0 {
            return Err(invalid("max_iterations", "must be at least 1"));
        }
        if self.min_iterations > self.max_iterations {
            return Err(invalid("min_iterations", "cannot exceed max_iterations"));
        }
        if !(self.confidence_threshold > 0.0 && self.confidence_threshold <= 1.0) {
            return Err(invalid("confidence_threshold", "must be in (0, 1]"));
        }
        if self.synthesis_top_n == 0 {
            return Err(invalid("synthesis_top_n", "must be at least 1"));
        }
        if self.research_timeout_ms == 0 {
            return Err(invalid("research_timeout_ms", "must be positive"));
        }
        if self.convergence_epsilon < 0.0 {
            return Err(invalid("convergence_epsilon", "cannot be negative"));
        }
        if self.max_cost_usd.is_some_and(|c| c <= 0.0) {
            return Err(invalid("max_cost_usd", "must be positive when set"));
        }
        Ok(())
    }

    /// Whether a synthesis pass runs on this iteration.
    pub fn is_checkpoint_iteration(&self, iteration: u32) -> bool {
        self.checkpoint_iterations.contains(&iteration)
    }

    pub fn research_timeout(&self) -> Duration {
        Duration::from_millis(self.research_timeout_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 2.0,
            burst: 4,
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            preserve_recent: 3,
            max_evidence_per_iteration: 10,
            max_insight_chars: 2000,
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./analysis_runs"),
            max_age_hours: 24,
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            usd_per_1k_tokens: 0.002,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_iteration_set() {
        let set = parse_iteration_set("3, 6,x,,9,0");
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![3, 6, 9]);
    }

    #[test]
    fn test_default_analysis_config_is_valid() {
        assert!(AnalysisConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_min_above_max() {
        let config = AnalysisConfig {
            min_iterations: 6,
            max_iterations: 5,
            ..AnalysisConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_iterations"));
    }

    #[test]
    fn test_validate_rejects_threshold_out_of_range() {
        for threshold in [0.0, -0.1, 1.01] {
            let config = AnalysisConfig {
                confidence_threshold: threshold,
                ..AnalysisConfig::default()
            };
            assert!(config.validate().is_err(), "threshold {threshold} accepted");
        }
        let config = AnalysisConfig {
            confidence_threshold: 1.0,
            ..AnalysisConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_budget() {
        let config = AnalysisConfig {
            max_cost_usd: Some(0.0),
            ..AnalysisConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_is_checkpoint_iteration() {
        let config = AnalysisConfig::default();
        assert!(config.is_checkpoint_iteration(3));
        assert!(!config.is_checkpoint_iteration(4));
    }
}
