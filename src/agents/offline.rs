use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;

use super::{
    AgentOutput, EvaluationAgent, EvaluationRequest, FinalEvaluationRequest, HypothesisAgent,
    HypothesisRequest, IterationEvaluation, NarrativeAgent, NarrativeRequest, ResearchAgent,
    ResearchFindings, ResearchRequest, SynthesisAgent, SynthesisRequest, Verdict,
};
use crate::error::AgentResult;
use crate::state::{
    EvidenceItem, FinalEvaluation, Hypothesis, ImpactTier, NarrativeReport, Rating, Relevance,
    ReportSection, SourceType, SynthesisInsight,
};

/// Score an iteration without a model.
///
/// Quality is the share of active hypotheses with at least one evidence item;
/// confidence is the mean evidence confidence, 0.0 when nothing was found.
pub fn heuristic_evaluation(
    hypotheses: &[Hypothesis],
    evidence: &[EvidenceItem],
) -> IterationEvaluation {
    let covered: HashSet<&str> = evidence.iter().map(|e| e.hypothesis_id.as_str()).collect();
    let quality_score = if hypotheses.is_empty() {
        0.0
    } else {
        let hit = hypotheses
            .iter()
            .filter(|h| covered.contains(h.id.as_str()))
            .count();
        hit as f64 / hypotheses.len() as f64
    };
    let confidence = if evidence.is_empty() {
        0.0
    } else {
        evidence.iter().map(|e| e.confidence).sum::<f64>() / evidence.len() as f64
    };
    IterationEvaluation {
        quality_score,
        confidence,
    }
}

/// Deterministic collaborators for running without Langbase.
///
/// Evidence confidence rises by 0.1 per iteration from 0.5, so a default run
/// settles after a handful of iterations.
#[derive(Debug, Clone, Default)]
pub struct OfflineAgents;

impl OfflineAgents {
    pub fn new() -> Self {
        Self
    }

    fn confidence_for(iteration: u32) -> f64 {
        (0.5 + 0.1 * f64::from(iteration)).min(0.95)
    }
}

#[async_trait]
impl HypothesisAgent for OfflineAgents {
    async fn generate(
        &self,
        request: HypothesisRequest,
    ) -> AgentResult<AgentOutput<Vec<Hypothesis>>> {
        let name = if request.company_name.is_empty() {
            request.ticker.clone()
        } else {
            request.company_name.clone()
        };
        let hypotheses = vec![
            Hypothesis::new(
                "h1",
                "Revenue growth durability",
                format!("{} sustains above-market revenue growth", name),
                ImpactTier::High,
            )
            .with_evidence_needed(vec!["segment revenue trend".to_string()]),
            Hypothesis::new(
                "h2",
                "Margin trajectory",
                format!("{} expands operating margin over the next year", name),
                ImpactTier::Medium,
            )
            .with_evidence_needed(vec!["operating margin history".to_string()]),
            Hypothesis::new(
                "h3",
                "Valuation support",
                format!("{} trades below its historical multiple", name),
                ImpactTier::Low,
            ),
        ];
        Ok(AgentOutput::free(
            hypotheses
                .into_iter()
                .take(request.max_hypotheses.max(1))
                .collect(),
        ))
    }
}

#[async_trait]
impl ResearchAgent for OfflineAgents {
    async fn research(
        &self,
        request: ResearchRequest,
    ) -> AgentResult<AgentOutput<ResearchFindings>> {
        let hypothesis = &request.hypothesis;
        let confidence = Self::confidence_for(request.iteration);
        let evidence = vec![
            EvidenceItem::new(
                &hypothesis.id,
                format!(
                    "{}: filing review, pass {}",
                    hypothesis.title, request.iteration
                ),
                confidence,
            )
            .with_source(format!("{} annual report", request.ticker), SourceType::Filing)
            .with_relevance(Relevance::High),
            EvidenceItem::new(
                &hypothesis.id,
                format!(
                    "{}: market data check, pass {}",
                    hypothesis.title, request.iteration
                ),
                confidence,
            )
            .with_source(format!("{} price history", request.ticker), SourceType::MarketData)
            .with_relevance(Relevance::Medium),
        ];
        let verdict = if confidence >= 0.8 {
            Verdict::Supported
        } else {
            Verdict::Inconclusive
        };
        Ok(AgentOutput::free(ResearchFindings {
            hypothesis_id: hypothesis.id.clone(),
            evidence,
            verdict,
            gaps: Vec::new(),
        }))
    }
}

#[async_trait]
impl SynthesisAgent for OfflineAgents {
    async fn synthesize(
        &self,
        request: SynthesisRequest,
    ) -> AgentResult<AgentOutput<SynthesisInsight>> {
        let supporting = request.evidence.iter().filter(|e| e.supports).count();
        let contradicting = request.evidence.len() - supporting;
        let titles: Vec<&str> = request.hypotheses.iter().map(|h| h.title.as_str()).collect();
        let confidence = heuristic_evaluation(&request.hypotheses, &request.evidence).confidence;

        Ok(AgentOutput::free(SynthesisInsight {
            hypothesis_ids: request.hypotheses.iter().map(|h| h.id.clone()).collect(),
            summary: format!(
                "{} after iteration {}: {}",
                request.ticker,
                request.iteration,
                titles.join("; ")
            ),
            bull_case: format!("{} supporting evidence items", supporting),
            bear_case: format!("{} contradicting evidence items", contradicting),
            key_risks: Vec::new(),
            confidence,
        }))
    }
}

#[async_trait]
impl EvaluationAgent for OfflineAgents {
    async fn evaluate_iteration(
        &self,
        request: EvaluationRequest,
    ) -> AgentResult<AgentOutput<IterationEvaluation>> {
        Ok(AgentOutput::free(heuristic_evaluation(
            &request.hypotheses,
            &request.evidence,
        )))
    }

    async fn evaluate_final(
        &self,
        request: FinalEvaluationRequest,
    ) -> AgentResult<AgentOutput<FinalEvaluation>> {
        let evidence_score = (request.evidence_count as f64 / 20.0).min(1.0);
        let structure_score = (request.report.sections.len() as f64 / 3.0).min(1.0);
        let risk_score = if request.report.risks.is_empty() { 0.3 } else { 0.8 };

        let mut dimension_scores = BTreeMap::new();
        dimension_scores.insert("evidence".to_string(), evidence_score);
        dimension_scores.insert("structure".to_string(), structure_score);
        dimension_scores.insert("risk_coverage".to_string(), risk_score);

        let overall_score = (evidence_score + structure_score + risk_score) / 3.0;
        Ok(AgentOutput::free(FinalEvaluation {
            overall_score,
            dimension_scores,
            strengths: vec![format!(
                "{} iterations of research",
                request.iterations
            )],
            weaknesses: vec!["Generated without a language model".to_string()],
        }))
    }
}

#[async_trait]
impl NarrativeAgent for OfflineAgents {
    async fn build_narrative(
        &self,
        request: NarrativeRequest,
    ) -> AgentResult<AgentOutput<NarrativeReport>> {
        let rating = if request.confidence >= 0.7 {
            Rating::Buy
        } else if request.confidence >= 0.4 {
            Rating::Hold
        } else {
            Rating::Sell
        };

        let sections = request
            .hypotheses
            .iter()
            .map(|h| {
                let count = request
                    .evidence
                    .iter()
                    .filter(|e| e.hypothesis_id == h.id)
                    .count();
                ReportSection {
                    title: h.title.clone(),
                    body: format!("{} ({} evidence items)", h.thesis, count),
                }
            })
            .collect();

        let risks = request
            .synthesis
            .as_ref()
            .map(|s| s.key_risks.clone())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| vec!["Evidence gathered offline; verify before use".to_string()]);

        Ok(AgentOutput::free(NarrativeReport {
            headline: format!(
                "{}: {:?} at {:.0}% confidence",
                request.ticker,
                rating,
                request.confidence * 100.0
            ),
            thesis: request
                .synthesis
                .as_ref()
                .map(|s| s.summary.clone())
                .unwrap_or_else(|| format!("Research summary for {}", request.ticker)),
            sections,
            risks,
            rating,
        }))
    }
}
