//! Collaborator contracts used by the orchestrator.
//!
//! Every collaborator is an async trait so the orchestrator can be driven by
//! Langbase pipes ([`LangbaseAgents`]), deterministic heuristics
//! ([`OfflineAgents`]) or test doubles. Requests are owned copies; collaborators
//! never see the live [`crate::state::AnalysisRecord`].

mod langbase;
mod offline;

pub use langbase::LangbaseAgents;
pub use offline::{heuristic_evaluation, OfflineAgents};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AgentResult;
use crate::state::{
    CostCounter, EvidenceItem, FinalEvaluation, Hypothesis, NarrativeReport, SynthesisInsight,
};

/// A collaborator result together with what producing it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput<T> {
    pub value: T,
    pub usage: CostCounter,
}

impl<T> AgentOutput<T> {
    pub fn new(value: T, usage: CostCounter) -> Self {
        Self { value, usage }
    }

    /// Output that cost nothing (offline heuristics, fakes).
    pub fn free(value: T) -> Self {
        Self::new(value, CostCounter::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisRequest {
    pub ticker: String,
    pub company_name: String,
    pub max_hypotheses: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchRequest {
    pub ticker: String,
    pub company_name: String,
    pub iteration: u32,
    pub hypothesis: Hypothesis,
    /// Evidence already gathered for this hypothesis in earlier iterations.
    pub prior_evidence: Vec<EvidenceItem>,
}

/// How the research pass judged a hypothesis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Supported,
    Refuted,
    #[default]
    Inconclusive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchFindings {
    pub hypothesis_id: String,
    pub evidence: Vec<EvidenceItem>,
    pub verdict: Verdict,
    /// Open questions; each may become a follow-up hypothesis.
    pub gaps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub ticker: String,
    pub company_name: String,
    pub iteration: u32,
    pub hypotheses: Vec<Hypothesis>,
    pub evidence: Vec<EvidenceItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub ticker: String,
    pub iteration: u32,
    pub hypotheses: Vec<Hypothesis>,
    /// Evidence gathered in this iteration.
    pub evidence: Vec<EvidenceItem>,
    pub synthesis: Option<SynthesisInsight>,
    pub confidence_history: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationEvaluation {
    pub quality_score: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeRequest {
    pub ticker: String,
    pub company_name: String,
    pub hypotheses: Vec<Hypothesis>,
    pub evidence: Vec<EvidenceItem>,
    pub synthesis: Option<SynthesisInsight>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalEvaluationRequest {
    pub ticker: String,
    pub report: NarrativeReport,
    pub evidence_count: usize,
    pub iterations: u32,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HypothesisAgent: Send + Sync {
    async fn generate(&self, request: HypothesisRequest)
        -> AgentResult<AgentOutput<Vec<Hypothesis>>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResearchAgent: Send + Sync {
    async fn research(&self, request: ResearchRequest)
        -> AgentResult<AgentOutput<ResearchFindings>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SynthesisAgent: Send + Sync {
    async fn synthesize(
        &self,
        request: SynthesisRequest,
    ) -> AgentResult<AgentOutput<SynthesisInsight>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EvaluationAgent: Send + Sync {
    async fn evaluate_iteration(
        &self,
        request: EvaluationRequest,
    ) -> AgentResult<AgentOutput<IterationEvaluation>>;

    async fn evaluate_final(
        &self,
        request: FinalEvaluationRequest,
    ) -> AgentResult<AgentOutput<FinalEvaluation>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NarrativeAgent: Send + Sync {
    async fn build_narrative(
        &self,
        request: NarrativeRequest,
    ) -> AgentResult<AgentOutput<NarrativeReport>>;
}

/// The full set of collaborators an orchestrator runs against.
#[derive(Clone)]
pub struct AgentSuite {
    pub hypothesis: Arc<dyn HypothesisAgent>,
    pub research: Arc<dyn ResearchAgent>,
    pub synthesis: Arc<dyn SynthesisAgent>,
    pub evaluation: Arc<dyn EvaluationAgent>,
    pub narrative: Arc<dyn NarrativeAgent>,
}

impl AgentSuite {
    /// Use one implementation for every role.
    pub fn uniform<A>(agent: Arc<A>) -> Self
    where
        A: HypothesisAgent
            + ResearchAgent
            + SynthesisAgent
            + EvaluationAgent
            + NarrativeAgent
            + 'static,
    {
        Self {
            hypothesis: agent.clone(),
            research: agent.clone(),
            synthesis: agent.clone(),
            evaluation: agent.clone(),
            narrative: agent,
        }
    }

    pub fn with_research(mut self, research: Arc<dyn ResearchAgent>) -> Self {
        self.research = research;
        self
    }

    pub fn with_synthesis(mut self, synthesis: Arc<dyn SynthesisAgent>) -> Self {
        self.synthesis = synthesis;
        self
    }

    pub fn with_evaluation(mut self, evaluation: Arc<dyn EvaluationAgent>) -> Self {
        self.evaluation = evaluation;
        self
    }

    pub fn with_narrative(mut self, narrative: Arc<dyn NarrativeAgent>) -> Self {
        self.narrative = narrative;
        self
    }
}

impl std::fmt::Debug for AgentSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSuite").finish_non_exhaustive()
    }
}

/// Extract JSON from a completion string, handling markdown code blocks.
///
/// Tries raw JSON first, then a ```json fenced block, then any fenced block.
pub(crate) fn extract_json_from_completion(completion: &str) -> Result<&str, String> {
    let trimmed = completion.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    if completion.contains("```json") {
        return completion
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ```json block but content was empty or malformed".to_string());
    }

    if completion.contains("```") {
        return completion
            .split("```")
            .nth(1)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ``` block but content was empty or malformed".to_string());
    }

    Err(format!(
        "No JSON found in response. First 100 chars: '{}'",
        completion.chars().take(100).collect::<String>()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_raw_json() {
        assert_eq!(
            extract_json_from_completion("  {\"a\": 1}  ").unwrap(),
            "{\"a\": 1}"
        );
    }

    #[test]
    fn test_extract_fenced_json() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nthanks";
        assert_eq!(extract_json_from_completion(text).unwrap(), "{\"a\": 1}");

        let text = "```\n[1, 2]\n```";
        assert_eq!(extract_json_from_completion(text).unwrap(), "[1, 2]");
    }

    #[test]
    fn test_extract_rejects_prose() {
        let err = extract_json_from_completion("I cannot help with that").unwrap_err();
        assert!(err.contains("No JSON found"));
    }

    #[test]
    fn test_agent_output_free_has_no_cost() {
        let output = AgentOutput::free(3);
        assert_eq!(output.value, 3);
        assert_eq!(output.usage, CostCounter::default());
    }
}
