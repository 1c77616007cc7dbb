//! Iterative analysis state machine.
//!
//! ```text
//! Init → GenerateHypotheses → { ResearchIteration → [SynthesisCheckpoint]
//!      → EvaluateIteration → Persist → StoppingCheck }* → BuildNarrative
//!      → FinalEvaluation → Persist → Done
//! ```
//!
//! Every iteration is persisted before the stopping decision, so a crash at any
//! point loses at most the in-flight iteration.

mod refine;
mod research;
mod stopping;


pub use refine::{refine_hypotheses, select_top_hypotheses};
pub use stopping::{StoppingDecision, StoppingInput, StoppingPolicy};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::agents::{
    heuristic_evaluation, AgentSuite, EvaluationRequest, FinalEvaluationRequest,
    HypothesisRequest, NarrativeRequest, ResearchFindings, ResearchRequest, SynthesisRequest,
};
use crate::checkpoint::{CheckpointEntry, CheckpointStore, FinalOutput, ResumePoint};
use crate::compaction::HistoryCompactor;
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, AppError, AppResult};
use crate::rate_gate::RateGate;
use crate::state::{
    AnalysisRecord, AnalysisStatus, EvidenceItem, IterationRecord, Phase, Progress, StepFailure,
};

/// Result of a finished (or reused) analysis.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub record: AnalysisRecord,
    /// `None` when a completed run was loaded instead of executed.
    pub stop_reason: Option<StoppingDecision>,
    pub analysis_dir: PathBuf,
}

/// Drives one analysis run against a set of collaborators.
pub struct Orchestrator {
    config: AnalysisConfig,
    agents: AgentSuite,
    gate: Arc<RateGate>,
    store: CheckpointStore,
    compactor: HistoryCompactor,
    policy: StoppingPolicy,
    progress: watch::Sender<Progress>,
}

impl Orchestrator {
    pub fn new(
        config: AnalysisConfig,
        agents: AgentSuite,
        gate: Arc<RateGate>,
        store: CheckpointStore,
        compactor: HistoryCompactor,
    ) -> Result<Self, AnalysisError> {
        config.validate()?;
        let policy = StoppingPolicy::new(&config);
        let (progress, _) = watch::channel(Progress::at(Phase::Init, 0, config.max_iterations));
        Ok(Self {
            config,
            agents,
            gate,
            store,
            compactor,
            policy,
            progress,
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Receive progress updates for every run of this orchestrator.
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    /// Run a fresh analysis of `ticker`.
    pub async fn run(&self, ticker: &str, company_name: &str) -> AppResult<AnalysisOutcome> {
        let mut record = AnalysisRecord::new(ticker, company_name);
        info!(
            analysis_id = %record.analysis_id,
            ticker = %record.ticker,
            max_iterations = self.config.max_iterations,
            parallel = self.config.enable_parallel_research,
            "Starting analysis"
        );
        self.publish(Progress::at(Phase::Init, 0, self.config.max_iterations));
        self.store.save(&record).await?;

        self.generate_hypotheses(&mut record).await?;
        self.drive(record, 1).await
    }

    /// Continue the run persisted at `path` (analysis dir, state file or checkpoint).
    ///
    /// A completed run is returned as is. A failed run is continued under a new
    /// analysis id so the failed record stays untouched.
    pub async fn resume(&self, path: &Path) -> AppResult<AnalysisOutcome> {
        let point = CheckpointStore::resume_point(path).await?;
        let mut record = CheckpointStore::load_record(path).await?;

        let next_iteration = match point {
            ResumePoint::Completed { .. } => {
                info!(analysis_id = %record.analysis_id, "Analysis already completed");
                let analysis_dir = self.store.analysis_dir(&record.analysis_id);
                return Ok(AnalysisOutcome {
                    record,
                    stop_reason: None,
                    analysis_dir,
                });
            }
            ResumePoint::Partial { next_iteration, .. } => next_iteration,
        };

        if record.status == AnalysisStatus::InProgress {
            // The process that owned it is gone.
            record.mark_interrupted()?;
            self.store.save(&record).await?;
        }

        if record.status == AnalysisStatus::Failed {
            let previous = record.analysis_id.clone();
            record = AnalysisRecord::continue_from(&record);
            info!(
                previous = %previous,
                analysis_id = %record.analysis_id,
                "Continuing failed analysis under a new id"
            );
        } else {
            record.mark_resumed()?;
        }
        info!(
            analysis_id = %record.analysis_id,
            next_iteration,
            "Resuming analysis"
        );
        self.store.save(&record).await?;

        if record.validated_hypotheses.is_empty() {
            self.generate_hypotheses(&mut record).await?;
        }
        self.drive(record, next_iteration).await
    }

    async fn generate_hypotheses(&self, record: &mut AnalysisRecord) -> AppResult<()> {
        self.publish(Progress::at(Phase::GenerateHypotheses, 0, self.config.max_iterations));
        let request = HypothesisRequest {
            ticker: record.ticker.clone(),
            company_name: record.company_name.clone(),
            max_hypotheses: self.config.max_hypotheses,
        };

        let output = match self.agents.hypothesis.generate(request).await {
            Ok(output) => output,
            Err(e) => {
                return Err(self
                    .fail(record, Phase::GenerateHypotheses, e.to_string())
                    .await)
            }
        };
        record.add_usage(output.usage);
        if output.value.is_empty() {
            return Err(self
                .fail(record, Phase::GenerateHypotheses, "no hypotheses generated")
                .await);
        }

        info!(
            analysis_id = %record.analysis_id,
            count = output.value.len(),
            "Hypotheses generated"
        );
        record.set_hypotheses(output.value)?;
        self.store
            .save_hypotheses(&record.analysis_id, &record.validated_hypotheses)
            .await?;
        self.store.save(record).await?;
        Ok(())
    }

    async fn drive(
        &self,
        mut record: AnalysisRecord,
        start_iteration: u32,
    ) -> AppResult<AnalysisOutcome> {
        let max = self.config.max_iterations;
        let mut stop = if start_iteration > 1 {
            self.decide(&record, start_iteration - 1)
        } else {
            StoppingDecision::None
        };
        if start_iteration > max {
            stop = StoppingDecision::MaxIterationsReached;
        }

        let mut iteration = start_iteration;
        while !stop.should_stop() {
            let findings = self.run_iteration(&mut record, iteration).await?;

            self.publish(Progress::at(Phase::StoppingCheck, iteration, max));
            stop = self.decide(&record, iteration);
            self.checkpoint(&record, Phase::StoppingCheck, iteration).await?;
            info!(
                analysis_id = %record.analysis_id,
                iteration,
                confidence = record.latest_iteration().map(|i| i.confidence).unwrap_or(0.0),
                decision = %stop,
                "Stopping check"
            );

            if !stop.should_stop() {
                let refined = refine_hypotheses(
                    &record.validated_hypotheses,
                    &findings,
                    iteration,
                    self.config.max_hypotheses,
                );
                if refined != record.validated_hypotheses {
                    debug!(
                        before = record.validated_hypotheses.len(),
                        after = refined.len(),
                        "Hypotheses refined"
                    );
                    record.validated_hypotheses = refined;
                    record.touch();
                    self.store
                        .save_hypotheses(&record.analysis_id, &record.validated_hypotheses)
                        .await?;
                    self.store.save(&record).await?;
                }
                iteration += 1;
            }
        }

        self.finish(record, stop).await
    }

    fn decide(&self, record: &AnalysisRecord, iteration: u32) -> StoppingDecision {
        let input = StoppingInput {
            iteration,
            confidence: record.latest_iteration().map(|i| i.confidence).unwrap_or(0.0),
            confidence_history: record.confidence_history(),
            consecutive_failed_iterations: record.consecutive_failed_iterations(),
            cost_usd: record.usage.cost_usd,
        };
        self.policy.decide(&input)
    }

    /// Research, optional synthesis, evaluation and persistence of one iteration.
    async fn run_iteration(
        &self,
        record: &mut AnalysisRecord,
        iteration: u32,
    ) -> AppResult<Vec<ResearchFindings>> {
        let max = self.config.max_iterations;
        let mut current = IterationRecord::new(iteration);

        self.publish(
            Progress::at(Phase::ResearchIteration, iteration, max).with_message(format!(
                "researching {} hypotheses",
                record.validated_hypotheses.len()
            )),
        );
        let findings = self.research(record, &mut current).await;

        if self.config.is_checkpoint_iteration(iteration) {
            self.publish(Progress::at(Phase::SynthesisCheckpoint, iteration, max));
            self.synthesize(record, &mut current).await;
        }

        self.publish(Progress::at(Phase::EvaluateIteration, iteration, max));
        self.evaluate(record, &mut current).await;

        self.publish(Progress::at(Phase::Persist, iteration, max));
        self.persist_iteration(record, current).await?;
        Ok(findings)
    }

    async fn research(
        &self,
        record: &mut AnalysisRecord,
        current: &mut IterationRecord,
    ) -> Vec<ResearchFindings> {
        let requests: Vec<ResearchRequest> = record
            .validated_hypotheses
            .iter()
            .map(|h| ResearchRequest {
                ticker: record.ticker.clone(),
                company_name: record.company_name.clone(),
                iteration: current.iteration,
                hypothesis: h.clone(),
                prior_evidence: record
                    .evidence_bundle
                    .iter()
                    .filter(|e| e.hypothesis_id == h.id)
                    .cloned()
                    .collect(),
            })
            .collect();

        let agent = Arc::clone(&self.agents.research);
        let gate = Arc::clone(&self.gate);
        let timeout = self.config.research_timeout();
        let batch = if self.config.enable_parallel_research {
            research::research_parallel(agent, gate, requests, timeout).await
        } else {
            research::research_sequential(agent, gate, requests, timeout).await
        };

        current.usage.add(batch.usage);
        for failure in batch.failures {
            current.record_failure(failure);
        }
        for finding in &batch.findings {
            current.add_research(&finding.hypothesis_id, finding.evidence.clone());
        }

        for hypothesis in record.validated_hypotheses.iter_mut() {
            let found: Vec<f64> = current
                .evidence
                .iter()
                .filter(|e| e.hypothesis_id == hypothesis.id)
                .map(|e| e.confidence)
                .collect();
            if !found.is_empty() {
                hypothesis.confidence = found.iter().sum::<f64>() / found.len() as f64;
            }
        }

        info!(
            iteration = current.iteration,
            succeeded = batch.findings.len(),
            failed = current.errors.len(),
            evidence = current.evidence.len(),
            "Research complete"
        );
        batch.findings
    }

    async fn synthesize(&self, record: &AnalysisRecord, current: &mut IterationRecord) {
        let top = select_top_hypotheses(&record.validated_hypotheses, self.config.synthesis_top_n);
        let evidence: Vec<EvidenceItem> = record
            .evidence_bundle
            .iter()
            .chain(current.evidence.iter())
            .filter(|e| top.iter().any(|h| h.id == e.hypothesis_id))
            .cloned()
            .collect();

        let request = SynthesisRequest {
            ticker: record.ticker.clone(),
            company_name: record.company_name.clone(),
            iteration: current.iteration,
            hypotheses: top,
            evidence,
        };
        match self.agents.synthesis.synthesize(request).await {
            Ok(output) => {
                current.usage.add(output.usage);
                current.synthesis = Some(output.value);
            }
            Err(e) => {
                warn!(iteration = current.iteration, error = %e, "Synthesis failed");
                current.record_failure(StepFailure::new("synthesis", e.to_string()));
            }
        }
    }

    async fn evaluate(&self, record: &AnalysisRecord, current: &mut IterationRecord) {
        let request = EvaluationRequest {
            ticker: record.ticker.clone(),
            iteration: current.iteration,
            hypotheses: record.validated_hypotheses.clone(),
            evidence: current.evidence.clone(),
            synthesis: current.synthesis.clone(),
            confidence_history: record.confidence_history(),
        };

        let evaluation = match self.agents.evaluation.evaluate_iteration(request).await {
            Ok(output) => {
                current.usage.add(output.usage);
                output.value
            }
            Err(e) => {
                warn!(
                    iteration = current.iteration,
                    error = %e,
                    "Evaluation failed, using heuristic scores"
                );
                current.record_failure(StepFailure::new("evaluation", e.to_string()));
                heuristic_evaluation(&record.validated_hypotheses, &current.evidence)
            }
        };
        current.quality_score = evaluation.quality_score.clamp(0.0, 1.0);
        current.confidence = evaluation.confidence.clamp(0.0, 1.0);
    }

    async fn persist_iteration(
        &self,
        record: &mut AnalysisRecord,
        mut current: IterationRecord,
    ) -> AppResult<()> {
        current.complete();
        let iteration = current.iteration;
        self.store
            .save_iteration(&record.analysis_id, &current)
            .await?;
        record.record_iteration(current)?;

        if self.config.enable_compaction {
            self.compactor
                .compact_in_place(&mut record.iterations, iteration);
        }

        self.store.save(record).await?;
        self.store
            .save_hypotheses(&record.analysis_id, &record.validated_hypotheses)
            .await?;
        self.store
            .save_evidence_bundle(&record.analysis_id, &record.evidence_bundle)
            .await?;
        self.checkpoint(record, Phase::Persist, iteration).await?;

        debug!(
            analysis_id = %record.analysis_id,
            iteration,
            cost_usd = record.usage.cost_usd,
            tokens = record.usage.tokens,
            "Iteration persisted"
        );
        Ok(())
    }

    async fn finish(
        &self,
        mut record: AnalysisRecord,
        stop: StoppingDecision,
    ) -> AppResult<AnalysisOutcome> {
        let max = self.config.max_iterations;
        let iteration = record.last_successful_iteration;
        let synthesis = record
            .iterations
            .iter()
            .rev()
            .find_map(|i| i.synthesis.clone());
        let confidence = record.latest_iteration().map(|i| i.confidence).unwrap_or(0.0);

        self.publish(Progress::at(Phase::BuildNarrative, iteration, max));
        let request = NarrativeRequest {
            ticker: record.ticker.clone(),
            company_name: record.company_name.clone(),
            hypotheses: record.validated_hypotheses.clone(),
            evidence: record.evidence_bundle.clone(),
            synthesis,
            confidence,
        };
        let report = match self.agents.narrative.build_narrative(request).await {
            Ok(output) => {
                record.add_usage(output.usage);
                output.value
            }
            Err(e) => {
                return Err(self
                    .fail(&mut record, Phase::BuildNarrative, e.to_string())
                    .await)
            }
        };
        self.checkpoint(&record, Phase::BuildNarrative, iteration).await?;

        self.publish(Progress::at(Phase::FinalEvaluation, iteration, max));
        let request = FinalEvaluationRequest {
            ticker: record.ticker.clone(),
            report: report.clone(),
            evidence_count: record.evidence_bundle.len(),
            iterations: iteration,
        };
        let evaluation = match self.agents.evaluation.evaluate_final(request).await {
            Ok(output) => {
                record.add_usage(output.usage);
                output.value
            }
            Err(e) => {
                return Err(self
                    .fail(&mut record, Phase::FinalEvaluation, e.to_string())
                    .await)
            }
        };

        let output = FinalOutput {
            analysis_id: record.analysis_id.clone(),
            ticker: record.ticker.clone(),
            company_name: record.company_name.clone(),
            generated_at: chrono::Utc::now(),
            report: report.clone(),
            evaluation: evaluation.clone(),
        };
        // The report goes first so a completed state file always has one.
        self.store.save_final_report(&output).await?;
        record.mark_completed(report, evaluation)?;
        self.store.save(&record).await?;

        let mut entry = CheckpointEntry::from_record(
            &record,
            Phase::Done,
            Progress::at(Phase::Done, iteration, max),
        );
        entry.narrative = record.final_report.clone();
        self.store.save_checkpoint(&entry).await?;
        self.publish(Progress::at(Phase::Done, iteration, max).with_message(stop.as_str()));

        info!(
            analysis_id = %record.analysis_id,
            iterations = iteration,
            stop_reason = %stop,
            cost_usd = record.usage.cost_usd,
            tokens = record.usage.tokens,
            "Analysis completed"
        );
        let analysis_dir = self.store.analysis_dir(&record.analysis_id);
        Ok(AnalysisOutcome {
            record,
            stop_reason: Some(stop),
            analysis_dir,
        })
    }

    /// Mark the record failed, persist it and build the error for `phase`.
    async fn fail(
        &self,
        record: &mut AnalysisRecord,
        phase: Phase,
        message: impl Into<String>,
    ) -> AppError {
        let message = message.into();
        error!(
            analysis_id = %record.analysis_id,
            phase = %phase,
            error = %message,
            "Analysis phase failed"
        );
        if let Err(e) = record.mark_failed(message.clone()) {
            warn!(error = %e, "Could not mark analysis failed");
        }
        let checkpoint = self.store.state_path(&record.analysis_id);
        if let Err(e) = self.store.save(record).await {
            warn!(error = %e, "Failed to persist failed analysis");
        }
        AnalysisError::PhaseFailed {
            phase: phase.to_string(),
            message,
            checkpoint: checkpoint.display().to_string(),
        }
        .into()
    }

    async fn checkpoint(
        &self,
        record: &AnalysisRecord,
        phase: Phase,
        iteration: u32,
    ) -> AppResult<()> {
        let progress = Progress::at(phase, iteration, self.config.max_iterations);
        let entry = CheckpointEntry::from_record(record, phase, progress);
        self.store.save_checkpoint(&entry).await?;
        Ok(())
    }

    fn publish(&self, progress: Progress) {
        debug!(
            phase = %progress.phase,
            iteration = progress.iteration,
            percent = progress.percent,
            "Progress"
        );
        self.progress.send_replace(progress);
    }
}
