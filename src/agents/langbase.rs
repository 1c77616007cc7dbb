use std::collections::HashSet;
use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    extract_json_from_completion, AgentOutput, EvaluationAgent, EvaluationRequest,
    FinalEvaluationRequest, HypothesisAgent, HypothesisRequest, IterationEvaluation,
    NarrativeAgent, NarrativeRequest, ResearchAgent, ResearchFindings, ResearchRequest,
    SynthesisAgent, SynthesisRequest, Verdict,
};
use crate::config::{PipeConfig, PricingConfig};
use crate::error::{AgentError, AgentResult, LangbaseResult};
use crate::langbase::{LangbaseClient, Message, PipeRequest};
use crate::prompts::{
    schema_correction_message, EVALUATION_PROMPT, FINAL_EVALUATION_PROMPT, HYPOTHESIS_PROMPT,
    NARRATIVE_PROMPT, RESEARCH_PROMPT, SYNTHESIS_PROMPT,
};
use crate::state::{
    CostCounter, EvidenceItem, FinalEvaluation, Hypothesis, ImpactTier, NarrativeReport,
    Relevance, SourceType, SynthesisInsight,
};

/// Collaborators backed by Langbase pipes, one pipe per role.
///
/// Responses are parsed into typed payloads at this boundary. A payload that
/// fails to parse or validate is sent back to the pipe with the error, up to
/// `schema_retries` times.
#[derive(Clone)]
pub struct LangbaseAgents {
    client: LangbaseClient,
    pipes: PipeConfig,
    pricing: PricingConfig,
    schema_retries: u32,
}

impl LangbaseAgents {
    pub fn new(client: LangbaseClient, pipes: PipeConfig, pricing: PricingConfig) -> Self {
        let schema_retries = client.request_config().schema_retries;
        Self {
            client,
            pipes,
            pricing,
            schema_retries,
        }
    }

    /// Create or update every collaborator pipe with its system prompt.
    pub async fn ensure_pipes(&self) -> LangbaseResult<()> {
        let pipes = [
            (&self.pipes.hypothesis, "Equity hypothesis generation", HYPOTHESIS_PROMPT),
            (&self.pipes.research, "Equity hypothesis research", RESEARCH_PROMPT),
            (&self.pipes.synthesis, "Equity bull/bear synthesis", SYNTHESIS_PROMPT),
            (&self.pipes.evaluation, "Equity iteration evaluation", EVALUATION_PROMPT),
            (&self.pipes.narrative, "Equity research narrative", NARRATIVE_PROMPT),
            (
                &self.pipes.final_evaluation,
                "Equity report review",
                FINAL_EVALUATION_PROMPT,
            ),
        ];
        for (name, description, prompt) in pipes {
            self.client.ensure_pipe(name, description, prompt).await?;
        }
        Ok(())
    }

    fn cost_of(&self, tokens: u64) -> CostCounter {
        CostCounter::new(
            tokens as f64 / 1000.0 * self.pricing.usd_per_1k_tokens,
            tokens,
        )
    }

    async fn call_json<T: Payload>(
        &self,
        agent: &str,
        pipe: &str,
        system_prompt: &str,
        context: &impl Serialize,
    ) -> AgentResult<AgentOutput<T>> {
        let start = Instant::now();
        let body = serde_json::to_string_pretty(context).map_err(|e| AgentError::Failed {
            agent: agent.to_string(),
            message: format!("Failed to encode request: {}", e),
        })?;

        let mut messages = vec![Message::system(system_prompt), Message::user(body)];
        let mut usage = CostCounter::default();
        let attempts = self.schema_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let response = self
                .client
                .call_pipe(PipeRequest::new(pipe, messages.clone()))
                .await
                .map_err(|source| AgentError::Transport {
                    agent: agent.to_string(),
                    source,
                })?;
            usage.add(self.cost_of(response.total_tokens()));

            match parse_payload::<T>(&response.completion) {
                Ok(value) => {
                    info!(
                        agent,
                        pipe,
                        attempt,
                        tokens = usage.tokens,
                        latency_ms = start.elapsed().as_millis(),
                        "Collaborator call succeeded"
                    );
                    return Ok(AgentOutput::new(value, usage));
                }
                Err(e) => {
                    warn!(agent, pipe, attempt, error = %e, "Collaborator payload rejected");
                    messages.push(Message::assistant(response.completion));
                    messages.push(Message::user(schema_correction_message(&e)));
                    last_error = e;
                }
            }
        }

        Err(AgentError::Schema {
            agent: agent.to_string(),
            attempts,
            message: last_error,
        })
    }
}

/// A wire payload that can be checked beyond what serde enforces.
trait Payload: DeserializeOwned {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

fn parse_payload<T: Payload>(completion: &str) -> Result<T, String> {
    let json = extract_json_from_completion(completion)?;
    let value: T = serde_json::from_str(json).map_err(|e| e.to_string())?;
    value.validate()?;
    Ok(value)
}

fn check_unit(field: &str, value: f64) -> Result<(), String> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("{} must be between 0.0 and 1.0, got {}", field, value))
    }
}

// ============================================================================
// Wire payloads
// ============================================================================

#[derive(Debug, Deserialize)]
struct HypothesesPayload {
    hypotheses: Vec<HypothesisPayload>,
}

#[derive(Debug, Deserialize)]
struct HypothesisPayload {
    #[serde(default)]
    id: Option<String>,
    title: String,
    thesis: String,
    impact: ImpactTier,
    #[serde(default)]
    evidence_needed: Vec<String>,
}

impl Payload for HypothesesPayload {
    fn validate(&self) -> Result<(), String> {
        if self.hypotheses.is_empty() {
            return Err("hypotheses must not be empty".to_string());
        }
        if self.hypotheses.iter().any(|h| h.title.trim().is_empty()) {
            return Err("every hypothesis needs a title".to_string());
        }
        Ok(())
    }
}

impl HypothesesPayload {
    /// Assign ids where missing or duplicated and apply the cap.
    fn into_hypotheses(self, max: usize) -> Vec<Hypothesis> {
        let mut seen: HashSet<String> = HashSet::new();
        self.hypotheses
            .into_iter()
            .take(max.max(1))
            .enumerate()
            .map(|(i, h)| {
                let id = match h
                    .id
                    .filter(|id| !id.trim().is_empty() && !seen.contains(id.as_str()))
                {
                    Some(id) => id,
                    None => free_hypothesis_id(&seen, i + 1),
                };
                seen.insert(id.clone());
                Hypothesis::new(id, h.title, h.thesis, h.impact)
                    .with_evidence_needed(h.evidence_needed)
            })
            .collect()
    }
}

/// First `h{n}` at or after `start` not already taken.
fn free_hypothesis_id(seen: &HashSet<String>, start: usize) -> String {
    let mut n = start;
    loop {
        let id = format!("h{}", n);
        if !seen.contains(&id) {
            return id;
        }
        n += 1;
    }
}

#[derive(Debug, Deserialize)]
struct ResearchPayload {
    #[serde(default)]
    evidence: Vec<EvidencePayload>,
    #[serde(default)]
    verdict: Verdict,
    #[serde(default)]
    gaps: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EvidencePayload {
    summary: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    source_type: SourceType,
    confidence: f64,
    #[serde(default)]
    relevance: Relevance,
    #[serde(default = "default_true")]
    supports: bool,
}

fn default_true() -> bool {
    true
}

impl Payload for ResearchPayload {
    fn validate(&self) -> Result<(), String> {
        for item in &self.evidence {
            if item.summary.trim().is_empty() {
                return Err("evidence summary must not be empty".to_string());
            }
            check_unit("evidence confidence", item.confidence)?;
        }
        Ok(())
    }
}

impl ResearchPayload {
    fn into_findings(self, hypothesis_id: &str) -> ResearchFindings {
        let evidence = self
            .evidence
            .into_iter()
            .map(|e| {
                let item = EvidenceItem::new(hypothesis_id, e.summary, e.confidence)
                    .with_source(e.source, e.source_type)
                    .with_relevance(e.relevance);
                if e.supports {
                    item
                } else {
                    item.contradicting()
                }
            })
            .collect();
        ResearchFindings {
            hypothesis_id: hypothesis_id.to_string(),
            evidence,
            verdict: self.verdict,
            gaps: self
                .gaps
                .into_iter()
                .filter(|g| !g.trim().is_empty())
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SynthesisPayload {
    summary: String,
    #[serde(default)]
    bull_case: String,
    #[serde(default)]
    bear_case: String,
    #[serde(default)]
    key_risks: Vec<String>,
    #[serde(default)]
    confidence: f64,
}

impl Payload for SynthesisPayload {
    fn validate(&self) -> Result<(), String> {
        if self.summary.trim().is_empty() {
            return Err("summary must not be empty".to_string());
        }
        check_unit("confidence", self.confidence)
    }
}

impl Payload for IterationEvaluation {
    fn validate(&self) -> Result<(), String> {
        check_unit("quality_score", self.quality_score)?;
        check_unit("confidence", self.confidence)
    }
}

impl Payload for NarrativeReport {
    fn validate(&self) -> Result<(), String> {
        if self.headline.trim().is_empty() || self.thesis.trim().is_empty() {
            return Err("headline and thesis must not be empty".to_string());
        }
        Ok(())
    }
}

impl Payload for FinalEvaluation {
    fn validate(&self) -> Result<(), String> {
        check_unit("overall_score", self.overall_score)?;
        for (dimension, score) in &self.dimension_scores {
            check_unit(dimension, *score)?;
        }
        Ok(())
    }
}

// ============================================================================
// Collaborator implementations
// ============================================================================

#[async_trait]
impl HypothesisAgent for LangbaseAgents {
    async fn generate(
        &self,
        request: HypothesisRequest,
    ) -> AgentResult<AgentOutput<Vec<Hypothesis>>> {
        let output: AgentOutput<HypothesesPayload> = self
            .call_json("hypothesis", &self.pipes.hypothesis, HYPOTHESIS_PROMPT, &request)
            .await?;
        let hypotheses = output.value.into_hypotheses(request.max_hypotheses);
        debug!(ticker = %request.ticker, count = hypotheses.len(), "Hypotheses generated");
        Ok(AgentOutput::new(hypotheses, output.usage))
    }
}

#[async_trait]
impl ResearchAgent for LangbaseAgents {
    async fn research(
        &self,
        request: ResearchRequest,
    ) -> AgentResult<AgentOutput<ResearchFindings>> {
        let output: AgentOutput<ResearchPayload> = self
            .call_json("research", &self.pipes.research, RESEARCH_PROMPT, &request)
            .await?;
        Ok(AgentOutput::new(
            output.value.into_findings(&request.hypothesis.id),
            output.usage,
        ))
    }
}

#[async_trait]
impl SynthesisAgent for LangbaseAgents {
    async fn synthesize(
        &self,
        request: SynthesisRequest,
    ) -> AgentResult<AgentOutput<SynthesisInsight>> {
        let output: AgentOutput<SynthesisPayload> = self
            .call_json("synthesis", &self.pipes.synthesis, SYNTHESIS_PROMPT, &request)
            .await?;
        let payload = output.value;
        Ok(AgentOutput::new(
            SynthesisInsight {
                hypothesis_ids: request.hypotheses.iter().map(|h| h.id.clone()).collect(),
                summary: payload.summary,
                bull_case: payload.bull_case,
                bear_case: payload.bear_case,
                key_risks: payload.key_risks,
                confidence: payload.confidence,
            },
            output.usage,
        ))
    }
}

#[async_trait]
impl EvaluationAgent for LangbaseAgents {
    async fn evaluate_iteration(
        &self,
        request: EvaluationRequest,
    ) -> AgentResult<AgentOutput<IterationEvaluation>> {
        self.call_json("evaluation", &self.pipes.evaluation, EVALUATION_PROMPT, &request)
            .await
    }

    async fn evaluate_final(
        &self,
        request: FinalEvaluationRequest,
    ) -> AgentResult<AgentOutput<FinalEvaluation>> {
        self.call_json(
            "final_evaluation",
            &self.pipes.final_evaluation,
            FINAL_EVALUATION_PROMPT,
            &request,
        )
        .await
    }
}

#[async_trait]
impl NarrativeAgent for LangbaseAgents {
    async fn build_narrative(
        &self,
        request: NarrativeRequest,
    ) -> AgentResult<AgentOutput<NarrativeReport>> {
        self.call_json("narrative", &self.pipes.narrative, NARRATIVE_PROMPT, &request)
            .await
    }
}
