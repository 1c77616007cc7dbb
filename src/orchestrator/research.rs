//! Research fan-out for one iteration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::agents::{AgentOutput, ResearchAgent, ResearchFindings, ResearchRequest};
use crate::error::{AgentError, AgentResult};
use crate::rate_gate::RateGate;
use crate::state::{CostCounter, StepFailure};

const AGENT: &str = "research";

/// Merged outcome of every research call in an iteration.
#[derive(Debug, Default)]
pub(crate) struct ResearchBatch {
    /// Successful findings, in hypothesis order.
    pub findings: Vec<ResearchFindings>,
    pub failures: Vec<StepFailure>,
    pub usage: CostCounter,
}

impl ResearchBatch {
    fn absorb(&mut self, hypothesis_id: &str, result: AgentResult<AgentOutput<ResearchFindings>>) {
        match result {
            Ok(output) => {
                self.usage.add(output.usage);
                self.findings.push(output.value);
            }
            Err(e) => {
                warn!(hypothesis_id, error = %e, "Research call failed");
                self.failures
                    .push(StepFailure::new(AGENT, e.to_string()).for_hypothesis(hypothesis_id));
            }
        }
    }
}

/// One research call: take a gate token, then call under the deadline.
async fn research_one(
    agent: Arc<dyn ResearchAgent>,
    gate: Arc<RateGate>,
    request: ResearchRequest,
    timeout: Duration,
) -> AgentResult<AgentOutput<ResearchFindings>> {
    gate.acquire(1).await.map_err(|e| AgentError::Failed {
        agent: AGENT.to_string(),
        message: e.to_string(),
    })?;

    let hypothesis_id = request.hypothesis.id.clone();
    let start = Instant::now();
    match tokio::time::timeout(timeout, agent.research(request)).await {
        Ok(result) => {
            debug!(
                hypothesis_id = %hypothesis_id,
                latency_ms = start.elapsed().as_millis(),
                ok = result.is_ok(),
                "Research call returned"
            );
            result
        }
        Err(_) => Err(AgentError::Timeout {
            agent: AGENT.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Spawn one task per request and wait for all of them.
///
/// Failed, timed-out and panicked tasks become [`StepFailure`]s; survivors are
/// merged in request order.
pub(crate) async fn research_parallel(
    agent: Arc<dyn ResearchAgent>,
    gate: Arc<RateGate>,
    requests: Vec<ResearchRequest>,
    timeout: Duration,
) -> ResearchBatch {
    let mut set = JoinSet::new();
    for (index, request) in requests.into_iter().enumerate() {
        let agent = Arc::clone(&agent);
        let gate = Arc::clone(&gate);
        set.spawn(async move {
            let hypothesis_id = request.hypothesis.id.clone();
            let result = research_one(agent, gate, request, timeout).await;
            (index, hypothesis_id, result)
        });
    }

    let mut completed = Vec::with_capacity(set.len());
    let mut batch = ResearchBatch::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(done) => completed.push(done),
            Err(e) => {
                warn!(error = %e, "Research task aborted");
                batch
                    .failures
                    .push(StepFailure::new(AGENT, format!("research task aborted: {}", e)));
            }
        }
    }

    completed.sort_by_key(|(index, _, _)| *index);
    for (_, hypothesis_id, result) in completed {
        batch.absorb(&hypothesis_id, result);
    }
    batch
}

/// Call research for each request in order.
pub(crate) async fn research_sequential(
    agent: Arc<dyn ResearchAgent>,
    gate: Arc<RateGate>,
    requests: Vec<ResearchRequest>,
    timeout: Duration,
) -> ResearchBatch {
    let mut batch = ResearchBatch::default();
    for request in requests {
        let hypothesis_id = request.hypothesis.id.clone();
        let result = research_one(Arc::clone(&agent), Arc::clone(&gate), request, timeout).await;
        batch.absorb(&hypothesis_id, result);
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{MockResearchAgent, Verdict};
    use crate::state::{EvidenceItem, Hypothesis, ImpactTier};

    fn request(id: &str) -> ResearchRequest {
        ResearchRequest {
            ticker: "AAPL".to_string(),
            company_name: "Apple".to_string(),
            iteration: 1,
            hypothesis: Hypothesis::new(id, id, "thesis", ImpactTier::Medium),
            prior_evidence: vec![],
        }
    }

    fn findings(id: &str) -> AgentOutput<ResearchFindings> {
        AgentOutput::new(
            ResearchFindings {
                hypothesis_id: id.to_string(),
                evidence: vec![EvidenceItem::new(id, format!("{} evidence", id), 0.6)],
                verdict: Verdict::Inconclusive,
                gaps: vec![],
            },
            CostCounter::new(0.01, 10),
        )
    }

    fn mock_failing_on(failing: &'static str) -> Arc<dyn ResearchAgent> {
        let mut mock = MockResearchAgent::new();
        mock.expect_research().returning(move |req| {
            if req.hypothesis.id == failing {
                Err(AgentError::Failed {
                    agent: AGENT.to_string(),
                    message: "upstream error".to_string(),
                })
            } else {
                Ok(findings(&req.hypothesis.id))
            }
        });
        Arc::new(mock)
    }

    #[tokio::test]
    async fn test_parallel_merges_in_request_order() {
        let gate = Arc::new(RateGate::new(100.0, 10));
        let batch = research_parallel(
            mock_failing_on("none"),
            gate,
            vec![request("h1"), request("h2"), request("h3")],
            Duration::from_secs(5),
        )
        .await;

        let ids: Vec<&str> = batch
            .findings
            .iter()
            .map(|f| f.hypothesis_id.as_str())
            .collect();
        assert_eq!(ids, vec!["h1", "h2", "h3"]);
        assert!(batch.failures.is_empty());
        assert_eq!(batch.usage.tokens, 30);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_not_fatal() {
        let gate = Arc::new(RateGate::new(100.0, 10));
        let batch = research_sequential(
            mock_failing_on("h2"),
            gate,
            vec![request("h1"), request("h2"), request("h3")],
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(batch.findings.len(), 2);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].hypothesis_id.as_deref(), Some("h2"));
    }

    #[tokio::test]
    async fn test_each_call_takes_a_gate_token() {
        let gate = Arc::new(RateGate::new(0.5, 3));
        research_parallel(
            mock_failing_on("none"),
            Arc::clone(&gate),
            vec![request("h1"), request("h2"), request("h3")],
            Duration::from_secs(5),
        )
        .await;
        assert!(gate.available() < 1.0);
    }
}
