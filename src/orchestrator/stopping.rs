//! When to stop iterating.

use serde::{Deserialize, Serialize};

use crate::config::AnalysisConfig;

/// Outcome of the stopping check after a persisted iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoppingDecision {
    ConfidenceMet,
    MaxIterationsReached,
    EarlyConvergence,
    ErrorThresholdExceeded,
    BudgetExhausted,
    None,
}

impl StoppingDecision {
    pub fn should_stop(&self) -> bool {
        !matches!(self, StoppingDecision::None)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StoppingDecision::ConfidenceMet => "confidence_met",
            StoppingDecision::MaxIterationsReached => "max_iterations_reached",
            StoppingDecision::EarlyConvergence => "early_convergence",
            StoppingDecision::ErrorThresholdExceeded => "error_threshold_exceeded",
            StoppingDecision::BudgetExhausted => "budget_exhausted",
            StoppingDecision::None => "none",
        }
    }
}

impl std::fmt::Display for StoppingDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot the policy decides on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoppingInput {
    pub iteration: u32,
    pub confidence: f64,
    /// Confidence of every completed iteration, oldest first, current included.
    pub confidence_history: Vec<f64>,
    pub consecutive_failed_iterations: u32,
    pub cost_usd: f64,
}

/// Pure stopping rules, first match wins:
/// max iterations, budget, confidence, early convergence, error threshold.
#[derive(Debug, Clone)]
pub struct StoppingPolicy {
    max_iterations: u32,
    min_iterations: u32,
    confidence_threshold: f64,
    convergence_window: usize,
    convergence_epsilon: f64,
    max_failed_iterations: u32,
    max_cost_usd: Option<f64>,
}

impl StoppingPolicy {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            min_iterations: config.min_iterations,
            confidence_threshold: config.confidence_threshold,
            convergence_window: config.convergence_window,
            convergence_epsilon: config.convergence_epsilon,
            max_failed_iterations: config.max_failed_iterations,
            max_cost_usd: config.max_cost_usd,
        }
    }

    pub fn decide(&self, input: &StoppingInput) -> StoppingDecision {
        if input.iteration >= self.max_iterations {
            return StoppingDecision::MaxIterationsReached;
        }
        if let Some(budget) = self.max_cost_usd {
            if input.cost_usd >= budget {
                return StoppingDecision::BudgetExhausted;
            }
        }

        let past_minimum = input.iteration >= self.min_iterations;
        if past_minimum && input.confidence >= self.confidence_threshold {
            return StoppingDecision::ConfidenceMet;
        }
        if past_minimum && self.has_converged(&input.confidence_history) {
            return StoppingDecision::EarlyConvergence;
        }
        if self.max_failed_iterations > 0
            && input.consecutive_failed_iterations >= self.max_failed_iterations
        {
            return StoppingDecision::ErrorThresholdExceeded;
        }
        StoppingDecision::None
    }

    /// The last `window` absolute deltas are all below epsilon.
    fn has_converged(&self, history: &[f64]) -> bool {
        let window = self.convergence_window;
        if window == 0 || history.len() < window + 1 {
            return false;
        }
        history[history.len() - window - 1..]
            .windows(2)
            .all(|pair| (pair[1] - pair[0]).abs() < self.convergence_epsilon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AnalysisConfig {
        AnalysisConfig {
            max_iterations: 10,
            min_iterations: 3,
            confidence_threshold: 0.85,
            convergence_window: 3,
            convergence_epsilon: 0.01,
            max_failed_iterations: 3,
            max_cost_usd: None,
            ..AnalysisConfig::default()
        }
    }

    fn input(iteration: u32, history: &[f64]) -> StoppingInput {
        StoppingInput {
            iteration,
            confidence: history.last().copied().unwrap_or(0.0),
            confidence_history: history.to_vec(),
            consecutive_failed_iterations: 0,
            cost_usd: 0.0,
        }
    }

    #[test]
    fn test_never_confidence_met_below_minimum() {
        let policy = StoppingPolicy::new(&config());
        for iteration in 1..3 {
            for confidence in [0.0, 0.5, 0.85, 0.99, 1.0] {
                let mut i = input(iteration, &[]);
                i.confidence = confidence;
                assert_ne!(
                    policy.decide(&i),
                    StoppingDecision::ConfidenceMet,
                    "iteration {iteration} confidence {confidence}"
                );
            }
        }
    }

    #[test]
    fn test_max_iterations_is_hard_ceiling() {
        let policy = StoppingPolicy::new(&config());
        for iteration in 10..15 {
            let mut i = input(iteration, &[0.1, 0.2]);
            i.consecutive_failed_iterations = 10;
            assert_eq!(policy.decide(&i), StoppingDecision::MaxIterationsReached);
        }
    }

    #[test]
    fn test_rising_confidence_stops_at_threshold() {
        let policy = StoppingPolicy::new(&config());
        let history = [0.70, 0.75, 0.81, 0.90];
        let decisions: Vec<StoppingDecision> = (1..=4)
            .map(|n| policy.decide(&input(n, &history[..n as usize])))
            .collect();
        assert_eq!(
            decisions,
            vec![
                StoppingDecision::None,
                StoppingDecision::None,
                StoppingDecision::None,
                StoppingDecision::ConfidenceMet,
            ]
        );
    }

    #[test]
    fn test_low_confidence_runs_to_max() {
        let policy = StoppingPolicy::new(&AnalysisConfig {
            max_iterations: 5,
            convergence_window: 0,
            ..config()
        });
        let history = [0.40, 0.50, 0.55, 0.58, 0.60];
        for n in 1..5 {
            assert_eq!(
                policy.decide(&input(n, &history[..n as usize])),
                StoppingDecision::None
            );
        }
        assert_eq!(
            policy.decide(&input(5, &history)),
            StoppingDecision::MaxIterationsReached
        );
    }

    #[test]
    fn test_early_convergence_after_flat_window() {
        let policy = StoppingPolicy::new(&config());
        assert_eq!(
            policy.decide(&input(4, &[0.60, 0.601, 0.602, 0.603])),
            StoppingDecision::EarlyConvergence
        );
        // Not enough deltas yet.
        assert_eq!(
            policy.decide(&input(3, &[0.60, 0.601, 0.602])),
            StoppingDecision::None
        );
        // One large step inside the window.
        assert_eq!(
            policy.decide(&input(4, &[0.60, 0.65, 0.651, 0.652])),
            StoppingDecision::None
        );
    }

    #[test]
    fn test_zero_window_disables_convergence() {
        let policy = StoppingPolicy::new(&AnalysisConfig {
            convergence_window: 0,
            ..config()
        });
        assert_eq!(
            policy.decide(&input(5, &[0.5, 0.5, 0.5, 0.5, 0.5])),
            StoppingDecision::None
        );
    }

    #[test]
    fn test_error_threshold() {
        let policy = StoppingPolicy::new(&config());
        let mut i = input(2, &[0.0, 0.0]);
        i.consecutive_failed_iterations = 3;
        assert_eq!(policy.decide(&i), StoppingDecision::ErrorThresholdExceeded);

        i.consecutive_failed_iterations = 2;
        assert_eq!(policy.decide(&i), StoppingDecision::None);
    }

    #[test]
    fn test_budget_precedes_confidence() {
        let policy = StoppingPolicy::new(&AnalysisConfig {
            max_cost_usd: Some(1.0),
            ..config()
        });
        let mut i = input(4, &[0.9, 0.9, 0.9, 0.95]);
        i.cost_usd = 1.0;
        assert_eq!(policy.decide(&i), StoppingDecision::BudgetExhausted);

        i.cost_usd = 0.5;
        assert_eq!(policy.decide(&i), StoppingDecision::ConfidenceMet);
    }

    #[test]
    fn test_decide_is_deterministic() {
        let policy = StoppingPolicy::new(&config());
        let i = input(4, &[0.2, 0.4, 0.6, 0.7]);
        let first = policy.decide(&i);
        for _ in 0..10 {
            assert_eq!(policy.decide(&i), first);
        }
    }
}
