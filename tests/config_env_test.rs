//! Config environment variable tests
//!
//! These tests verify that Config::from_env() correctly reads and applies
//! environment variable overrides. Config::from_env() also loads a .env file via
//! dotenvy, so the tests only assert on variables they set themselves.
//!
//! Tests use #[serial] to prevent race conditions with shared env vars.

use equity_research::config::{Config, LogFormat};
use serial_test::serial;
use std::env;
use std::path::PathBuf;

#[test]
#[serial]
fn test_config_from_env_without_api_key() {
    // The key is only required for Langbase-backed runs.
    let saved = env::var("LANGBASE_API_KEY").ok();
    env::remove_var("LANGBASE_API_KEY");

    let config = Config::from_env().unwrap();
    assert!(config.require_langbase().is_err());

    if let Some(key) = saved {
        env::set_var("LANGBASE_API_KEY", key);
    }
}

#[test]
#[serial]
fn test_config_from_env_custom_base_url() {
    env::set_var("LANGBASE_BASE_URL", "https://custom.api.com");

    let config = Config::from_env().unwrap();
    assert_eq!(config.langbase.base_url, "https://custom.api.com");

    env::remove_var("LANGBASE_BASE_URL");
}

#[test]
#[serial]
fn test_config_from_env_json_log_format() {
    env::set_var("LOG_FORMAT", "json");

    let config = Config::from_env().unwrap();
    assert_eq!(config.logging.format, LogFormat::Json);

    env::remove_var("LOG_FORMAT");
}

#[test]
#[serial]
fn test_config_from_env_custom_request() {
    env::set_var("REQUEST_TIMEOUT_MS", "45000");
    env::set_var("MAX_RETRIES", "5");
    env::set_var("RETRY_DELAY_MS", "2000");
    env::set_var("LANGBASE_SCHEMA_RETRIES", "4");

    let config = Config::from_env().unwrap();
    assert_eq!(config.request.timeout_ms, 45000);
    assert_eq!(config.request.max_retries, 5);
    assert_eq!(config.request.retry_delay_ms, 2000);
    assert_eq!(config.request.schema_retries, 4);

    env::remove_var("REQUEST_TIMEOUT_MS");
    env::remove_var("MAX_RETRIES");
    env::remove_var("RETRY_DELAY_MS");
    env::remove_var("LANGBASE_SCHEMA_RETRIES");
}

#[test]
#[serial]
fn test_config_from_env_analysis_overrides() {
    env::set_var("ANALYSIS_MAX_ITERATIONS", "6");
    env::set_var("ANALYSIS_MIN_ITERATIONS", "2");
    env::set_var("ANALYSIS_CONFIDENCE_THRESHOLD", "0.8");
    env::set_var("ANALYSIS_CHECKPOINT_ITERATIONS", "2, 4,x");
    env::set_var("ANALYSIS_PARALLEL_RESEARCH", "false");
    env::set_var("ANALYSIS_MAX_COST_USD", "1.5");

    let config = Config::from_env().unwrap();
    assert_eq!(config.analysis.max_iterations, 6);
    assert_eq!(config.analysis.min_iterations, 2);
    assert_eq!(config.analysis.confidence_threshold, 0.8);
    assert_eq!(
        config.analysis.checkpoint_iterations.iter().copied().collect::<Vec<_>>(),
        vec![2, 4]
    );
    assert!(!config.analysis.enable_parallel_research);
    assert_eq!(config.analysis.max_cost_usd, Some(1.5));

    for key in [
        "ANALYSIS_MAX_ITERATIONS",
        "ANALYSIS_MIN_ITERATIONS",
        "ANALYSIS_CONFIDENCE_THRESHOLD",
        "ANALYSIS_CHECKPOINT_ITERATIONS",
        "ANALYSIS_PARALLEL_RESEARCH",
        "ANALYSIS_MAX_COST_USD",
    ] {
        env::remove_var(key);
    }
}

#[test]
#[serial]
fn test_config_from_env_invalid_numbers_fall_back() {
    env::set_var("ANALYSIS_MAX_ITERATIONS", "not-a-number");

    let config = Config::from_env().unwrap();
    assert_eq!(config.analysis.max_iterations, 10);

    env::remove_var("ANALYSIS_MAX_ITERATIONS");
}

#[test]
#[serial]
fn test_config_from_env_rate_and_checkpoint() {
    env::set_var("RESEARCH_RATE_PER_SECOND", "5.5");
    env::set_var("RESEARCH_RATE_BURST", "8");
    env::set_var("ANALYSIS_WORK_DIR", "/tmp/equity-runs");
    env::set_var("CACHE_MAX_AGE_HOURS", "48");

    let config = Config::from_env().unwrap();
    assert_eq!(config.rate_limit.requests_per_second, 5.5);
    assert_eq!(config.rate_limit.burst, 8);
    assert_eq!(config.checkpoint.work_dir, PathBuf::from("/tmp/equity-runs"));
    assert_eq!(config.checkpoint.max_age_hours, 48);

    env::remove_var("RESEARCH_RATE_PER_SECOND");
    env::remove_var("RESEARCH_RATE_BURST");
    env::remove_var("ANALYSIS_WORK_DIR");
    env::remove_var("CACHE_MAX_AGE_HOURS");
}

#[test]
#[serial]
fn test_config_from_env_rejects_zero_burst() {
    env::set_var("RESEARCH_RATE_BURST", "0");

    let result = Config::from_env();
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("RESEARCH_RATE_BURST"));

    env::remove_var("RESEARCH_RATE_BURST");
}

#[test]
#[serial]
fn test_config_from_env_rejects_non_finite_rate() {
    for value in ["NaN", "inf"] {
        env::set_var("RESEARCH_RATE_PER_SECOND", value);
        let result = Config::from_env();
        assert!(result.is_err(), "rate {value} accepted");
        assert!(result.unwrap_err().to_string().contains("RESEARCH_RATE_PER_SECOND"));
    }

    env::remove_var("RESEARCH_RATE_PER_SECOND");
}

#[test]
#[serial]
fn test_config_from_env_custom_pipes() {
    env::set_var("PIPE_RESEARCH", "my-research-pipe");

    let config = Config::from_env().unwrap();
    assert_eq!(config.pipes.research, "my-research-pipe");
    assert_eq!(config.pipes.narrative, "equity-narrative-v1");

    env::remove_var("PIPE_RESEARCH");
}
