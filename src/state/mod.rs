//! Analysis state model.
//!
//! One [`AnalysisRecord`] per run, owning an ordered history of
//! [`IterationRecord`]s. Records are owned by the orchestrating task; collaborators
//! only ever see copies.


use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AnalysisError;

/// Lifecycle status of an analysis run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    #[default]
    InProgress,
    Completed,
    #[serde(alias = "error")]
    Failed,
    /// The process exited mid-run; set when a resume attempt finds the record.
    Interrupted,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::InProgress => "in_progress",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
            AnalysisStatus::Interrupted => "interrupted",
        }
    }

    /// Completed and failed records are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisStatus::Completed | AnalysisStatus::Failed)
    }
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AnalysisStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in_progress" => Ok(AnalysisStatus::InProgress),
            "completed" => Ok(AnalysisStatus::Completed),
            "failed" | "error" => Ok(AnalysisStatus::Failed),
            "interrupted" => Ok(AnalysisStatus::Interrupted),
            _ => Err(format!("Unknown analysis status: {}", s)),
        }
    }
}

/// Phases of one analysis run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    GenerateHypotheses,
    ResearchIteration,
    SynthesisCheckpoint,
    EvaluateIteration,
    Persist,
    StoppingCheck,
    BuildNarrative,
    FinalEvaluation,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::GenerateHypotheses => "generate_hypotheses",
            Phase::ResearchIteration => "research_iteration",
            Phase::SynthesisCheckpoint => "synthesis_checkpoint",
            Phase::EvaluateIteration => "evaluate_iteration",
            Phase::Persist => "persist",
            Phase::StoppingCheck => "stopping_check",
            Phase::BuildNarrative => "build_narrative",
            Phase::FinalEvaluation => "final_evaluation",
            Phase::Done => "done",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress snapshot published while a run advances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub phase: Phase,
    pub iteration: u32,
    pub max_iterations: u32,
    /// 0-100.
    pub percent: f64,
    pub message: String,
}

impl Progress {
    /// Iterations make up the bulk of the run; hypotheses and the closing phases
    /// get fixed slices of the bar.
    pub fn at(phase: Phase, iteration: u32, max_iterations: u32) -> Self {
        let loop_share = |done: u32| {
            let max = f64::from(max_iterations.max(1));
            10.0 + 80.0 * (f64::from(done.min(max_iterations)) / max)
        };
        let percent = match phase {
            Phase::Init => 0.0,
            Phase::GenerateHypotheses => 5.0,
            Phase::ResearchIteration
            | Phase::SynthesisCheckpoint
            | Phase::EvaluateIteration
            | Phase::Persist
            | Phase::StoppingCheck => loop_share(iteration.saturating_sub(1)),
            Phase::BuildNarrative => 92.0,
            Phase::FinalEvaluation => 97.0,
            Phase::Done => 100.0,
        };
        Self {
            phase,
            iteration,
            max_iterations,
            percent,
            message: String::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Expected impact of a hypothesis on the investment thesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImpactTier {
    High,
    Medium,
    Low,
}

impl ImpactTier {
    /// Sort key, lower is more important.
    pub fn rank(&self) -> u8 {
        match self {
            ImpactTier::High => 0,
            ImpactTier::Medium => 1,
            ImpactTier::Low => 2,
        }
    }
}

impl std::str::FromStr for ImpactTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "HIGH" => Ok(ImpactTier::High),
            "MEDIUM" => Ok(ImpactTier::Medium),
            "LOW" => Ok(ImpactTier::Low),
            _ => Err(format!("Unknown impact tier: {}", s)),
        }
    }
}

/// Where a hypothesis came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypothesisOrigin {
    #[default]
    Generated,
    /// Added between iterations from a research gap.
    FollowUp,
}

/// A falsifiable, scoped claim about the company's investment thesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: String,
    pub title: String,
    pub thesis: String,
    pub impact: ImpactTier,
    #[serde(default)]
    pub evidence_needed: Vec<String>,
    /// Mean confidence of the evidence gathered in the latest research pass.
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub origin: HypothesisOrigin,
}

impl Hypothesis {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        thesis: impl Into<String>,
        impact: ImpactTier,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            thesis: thesis.into(),
            impact,
            evidence_needed: Vec::new(),
            confidence: 0.0,
            origin: HypothesisOrigin::Generated,
        }
    }

    pub fn with_evidence_needed(mut self, needed: Vec<String>) -> Self {
        self.evidence_needed = needed;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

/// Kind of source an evidence item was drawn from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Filing,
    News,
    MarketData,
    Analyst,
    Web,
    #[default]
    Other,
}

/// Relevance of an evidence item to its hypothesis, used to rank items
/// during compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relevance {
    VeryHigh,
    High,
    #[default]
    Medium,
    Low,
    VeryLow,
}

impl Relevance {
    /// Sort key, lower is more relevant.
    pub fn rank(&self) -> u8 {
        match self {
            Relevance::VeryHigh => 0,
            Relevance::High => 1,
            Relevance::Medium => 2,
            Relevance::Low => 3,
            Relevance::VeryLow => 4,
        }
    }
}

/// A single piece of evidence gathered for a hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub hypothesis_id: String,
    pub summary: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub source_type: SourceType,
    /// Confidence in [0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub relevance: Relevance,
    /// Whether the item supports (true) or contradicts (false) the hypothesis.
    #[serde(default = "default_supports")]
    pub supports: bool,
}

fn default_supports() -> bool {
    true
}

impl EvidenceItem {
    pub fn new(
        hypothesis_id: impl Into<String>,
        summary: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            hypothesis_id: hypothesis_id.into(),
            summary: summary.into(),
            source: String::new(),
            source_type: SourceType::Other,
            confidence: confidence.clamp(0.0, 1.0),
            relevance: Relevance::Medium,
            supports: true,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>, source_type: SourceType) -> Self {
        self.source = source.into();
        self.source_type = source_type;
        self
    }

    pub fn with_relevance(mut self, relevance: Relevance) -> Self {
        self.relevance = relevance;
        self
    }

    pub fn contradicting(mut self) -> Self {
        self.supports = false;
        self
    }
}

/// Compact per-hypothesis research outcome kept in iteration history instead of the
/// full evidence payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchSummary {
    pub hypothesis_id: String,
    pub evidence_count: usize,
    pub sources_used: Vec<String>,
}

/// Outcome of a synthesis (bull/bear reconciliation) pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisInsight {
    pub hypothesis_ids: Vec<String>,
    pub summary: String,
    #[serde(default)]
    pub bull_case: String,
    #[serde(default)]
    pub bear_case: String,
    #[serde(default)]
    pub key_risks: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
}

/// Cost and token counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostCounter {
    pub cost_usd: f64,
    pub tokens: u64,
}

impl CostCounter {
    pub fn new(cost_usd: f64, tokens: u64) -> Self {
        Self { cost_usd, tokens }
    }

    pub fn add(&mut self, other: CostCounter) {
        self.cost_usd += other.cost_usd;
        self.tokens += other.tokens;
    }
}

/// A collaborator step that failed inside an iteration without aborting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hypothesis_id: Option<String>,
    pub message: String,
}

impl StepFailure {
    pub fn new(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            hypothesis_id: None,
            message: message.into(),
        }
    }

    pub fn for_hypothesis(mut self, hypothesis_id: impl Into<String>) -> Self {
        self.hypothesis_id = Some(hypothesis_id.into());
        self
    }
}

/// One pass of the research loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based, monotonic.
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub evidence: Vec<EvidenceItem>,
    pub sources: Vec<String>,
    pub research_summary: Vec<ResearchSummary>,
    /// Present only on checkpoint iterations.
    pub synthesis: Option<SynthesisInsight>,
    pub quality_score: f64,
    pub confidence: f64,
    pub usage: CostCounter,
    #[serde(default)]
    pub errors: Vec<StepFailure>,
    #[serde(default)]
    pub compacted: bool,
}

impl IterationRecord {
    pub fn new(iteration: u32) -> Self {
        Self {
            iteration,
            started_at: Utc::now(),
            completed_at: None,
            evidence: Vec::new(),
            sources: Vec::new(),
            research_summary: Vec::new(),
            synthesis: None,
            quality_score: 0.0,
            confidence: 0.0,
            usage: CostCounter::default(),
            errors: Vec::new(),
            compacted: false,
        }
    }

    /// Merge one hypothesis' research result into this iteration.
    pub fn add_research(&mut self, hypothesis_id: &str, evidence: Vec<EvidenceItem>) {
        let sources_used: Vec<String> = evidence
            .iter()
            .map(|e| e.source.clone())
            .filter(|s| !s.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        self.research_summary.push(ResearchSummary {
            hypothesis_id: hypothesis_id.to_string(),
            evidence_count: evidence.len(),
            sources_used: sources_used.clone(),
        });

        let mut sources: BTreeSet<String> = self.sources.drain(..).collect();
        sources.extend(sources_used);
        self.sources = sources.into_iter().collect();
        self.evidence.extend(evidence);
    }

    pub fn record_failure(&mut self, failure: StepFailure) {
        self.errors.push(failure);
    }

    /// True when at least one hypothesis was researched successfully.
    pub fn research_succeeded(&self) -> bool {
        !self.research_summary.is_empty()
    }

    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
    }
}

/// Rating carried by the final narrative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Buy,
    Hold,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSection {
    pub title: String,
    pub body: String,
}

/// Final report produced by the narrative collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeReport {
    pub headline: String,
    pub thesis: String,
    #[serde(default)]
    pub sections: Vec<ReportSection>,
    #[serde(default)]
    pub risks: Vec<String>,
    pub rating: Rating,
}

/// Final quality assessment of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalEvaluation {
    pub overall_score: f64,
    #[serde(default)]
    pub dimension_scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
}

/// Aggregate record of one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub analysis_id: String,
    pub ticker: String,
    #[serde(default)]
    pub company_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: AnalysisStatus,
    pub hypotheses: Vec<Hypothesis>,
    pub validated_hypotheses: Vec<Hypothesis>,
    pub iterations: Vec<IterationRecord>,
    pub evidence_bundle: Vec<EvidenceItem>,
    pub final_report: Option<NarrativeReport>,
    pub final_evaluation: Option<FinalEvaluation>,
    pub usage: CostCounter,
    pub error: Option<String>,
    /// 0 until the first iteration has been persisted.
    pub last_successful_iteration: u32,
}

/// Build a globally unique analysis id: `<TICKER>_<YYYYMMDD_HHMMSS>_<8 hex>`.
pub fn generate_analysis_id(ticker: &str, at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        ticker.trim().to_uppercase(),
        at.format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    )
}

impl AnalysisRecord {
    pub fn new(ticker: impl Into<String>, company_name: impl Into<String>) -> Self {
        let ticker = ticker.into().trim().to_uppercase();
        let now = Utc::now();
        Self {
            analysis_id: generate_analysis_id(&ticker, now),
            ticker,
            company_name: company_name.into(),
            created_at: now,
            updated_at: now,
            status: AnalysisStatus::InProgress,
            hypotheses: Vec::new(),
            validated_hypotheses: Vec::new(),
            iterations: Vec::new(),
            evidence_bundle: Vec::new(),
            final_report: None,
            final_evaluation: None,
            usage: CostCounter::default(),
            error: None,
            last_successful_iteration: 0,
        }
    }

    pub fn ensure_mutable(&self) -> Result<(), AnalysisError> {
        if self.status.is_terminal() {
            return Err(AnalysisError::Terminal {
                analysis_id: self.analysis_id.clone(),
                status: self.status.to_string(),
            });
        }
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Set the generated hypotheses; they also become the active set.
    pub fn set_hypotheses(&mut self, hypotheses: Vec<Hypothesis>) -> Result<(), AnalysisError> {
        self.ensure_mutable()?;
        self.validated_hypotheses = hypotheses.clone();
        self.hypotheses = hypotheses;
        self.touch();
        Ok(())
    }

    /// Append a completed iteration and fold its evidence and cost into the run.
    pub fn record_iteration(&mut self, iteration: IterationRecord) -> Result<(), AnalysisError> {
        self.ensure_mutable()?;

        let mut seen: HashSet<(String, String)> = self
            .evidence_bundle
            .iter()
            .map(|e| (e.hypothesis_id.clone(), e.summary.clone()))
            .collect();
        for item in &iteration.evidence {
            if seen.insert((item.hypothesis_id.clone(), item.summary.clone())) {
                self.evidence_bundle.push(item.clone());
            }
        }

        self.usage.add(iteration.usage);
        self.last_successful_iteration = iteration.iteration;
        self.iterations.push(iteration);
        self.touch();
        Ok(())
    }

    pub fn add_usage(&mut self, usage: CostCounter) {
        self.usage.add(usage);
    }

    pub fn mark_completed(
        &mut self,
        report: NarrativeReport,
        evaluation: FinalEvaluation,
    ) -> Result<(), AnalysisError> {
        self.ensure_mutable()?;
        self.final_report = Some(report);
        self.final_evaluation = Some(evaluation);
        self.status = AnalysisStatus::Completed;
        self.error = None;
        self.touch();
        Ok(())
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) -> Result<(), AnalysisError> {
        self.ensure_mutable()?;
        self.status = AnalysisStatus::Failed;
        self.error = Some(message.into());
        self.touch();
        Ok(())
    }

    pub fn mark_interrupted(&mut self) -> Result<(), AnalysisError> {
        self.ensure_mutable()?;
        self.status = AnalysisStatus::Interrupted;
        self.touch();
        Ok(())
    }

    /// Flip an interrupted record back to running for a resumed attempt.
    pub fn mark_resumed(&mut self) -> Result<(), AnalysisError> {
        self.ensure_mutable()?;
        self.status = AnalysisStatus::InProgress;
        self.touch();
        Ok(())
    }

    /// Start a new run that carries over the completed work of `previous`.
    ///
    /// Used to retry a failed run: the failed record stays immutable on disk and
    /// the new record gets its own id.
    pub fn continue_from(previous: &AnalysisRecord) -> Self {
        let mut record = AnalysisRecord::new(&previous.ticker, &previous.company_name);
        record.hypotheses = previous.hypotheses.clone();
        record.validated_hypotheses = previous.validated_hypotheses.clone();
        record.iterations = previous.iterations.clone();
        record.evidence_bundle = previous.evidence_bundle.clone();
        record.usage = previous.usage;
        record.last_successful_iteration = previous.last_successful_iteration;
        record
    }

    pub fn latest_iteration(&self) -> Option<&IterationRecord> {
        self.iterations.last()
    }

    pub fn confidence_history(&self) -> Vec<f64> {
        self.iterations.iter().map(|i| i.confidence).collect()
    }

    /// Number of trailing iterations in which no research call succeeded.
    pub fn consecutive_failed_iterations(&self) -> u32 {
        self.iterations
            .iter()
            .rev()
            .take_while(|i| !i.research_succeeded())
            .count() as u32
    }
}
