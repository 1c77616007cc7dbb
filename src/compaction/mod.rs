//! Bounded iteration history.
//!
//! Older iterations are summarized in place while the most recent
//! `preserve_recent` stay at full fidelity. Numeric fields (quality, confidence,
//! cost, tokens) are never touched because trend and regression checks read them.

use tracing::debug;

use crate::config::CompactionConfig;
use crate::state::{IterationRecord, SynthesisInsight};

/// Appended to any free text cut down by compaction.
pub const TRUNCATION_MARKER: &str = " [truncated]";

/// What a compaction pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub records_compacted: usize,
    pub evidence_dropped: usize,
    pub insights_truncated: usize,
}

impl CompactionStats {
    pub fn is_noop(&self) -> bool {
        self.records_compacted == 0
    }
}

/// Summarizes older [`IterationRecord`]s.
#[derive(Debug, Clone)]
pub struct HistoryCompactor {
    config: CompactionConfig,
}

impl HistoryCompactor {
    pub fn new(config: CompactionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Return a compacted copy of `iterations`; length is always preserved.
    pub fn compact(
        &self,
        iterations: &[IterationRecord],
        current_iteration: u32,
    ) -> Vec<IterationRecord> {
        let mut out = iterations.to_vec();
        self.compact_in_place(&mut out, current_iteration);
        out
    }

    /// Compact every record older than the preserved window.
    pub fn compact_in_place(
        &self,
        iterations: &mut [IterationRecord],
        current_iteration: u32,
    ) -> CompactionStats {
        let cutoff = iterations.len().saturating_sub(self.config.preserve_recent);
        let mut stats = CompactionStats::default();

        for record in iterations[..cutoff].iter_mut() {
            if self.is_compacted(record) {
                continue;
            }
            let (dropped, truncated) = self.compact_record(record);
            stats.records_compacted += 1;
            stats.evidence_dropped += dropped;
            stats.insights_truncated += truncated;
        }

        if !stats.is_noop() {
            debug!(
                current_iteration,
                records = stats.records_compacted,
                evidence_dropped = stats.evidence_dropped,
                insights_truncated = stats.insights_truncated,
                "Compacted iteration history"
            );
        }
        stats
    }

    fn is_compacted(&self, record: &IterationRecord) -> bool {
        record.compacted
            && record.evidence.len() <= self.config.max_evidence_per_iteration
    }

    fn compact_record(&self, record: &mut IterationRecord) -> (usize, usize) {
        let before = record.evidence.len();
        if before > self.config.max_evidence_per_iteration {
            // Stable sort keeps original order among equally relevant items.
            record.evidence.sort_by_key(|e| e.relevance.rank());
            record.evidence.truncate(self.config.max_evidence_per_iteration);
        }
        let dropped = before - record.evidence.len();

        for summary in record.research_summary.iter_mut() {
            summary.sources_used.dedup();
        }

        let truncated = match record.synthesis.as_mut() {
            Some(insight) => self.truncate_insight(insight),
            None => 0,
        };

        record.compacted = true;
        (dropped, truncated)
    }

    fn truncate_insight(&self, insight: &mut SynthesisInsight) -> usize {
        let max = self.config.max_insight_chars;
        let mut truncated = 0;
        for text in [
            &mut insight.summary,
            &mut insight.bull_case,
            &mut insight.bear_case,
        ] {
            if truncate_text(text, max) {
                truncated += 1;
            }
        }
        truncated
    }
}

/// Cut `text` to `max_chars` characters plus [`TRUNCATION_MARKER`].
///
/// Returns whether the text changed. Already truncated text is left alone.
pub fn truncate_text(text: &mut String, max_chars: usize) -> bool {
    if text.chars().count() <= max_chars {
        return false;
    }
    if let Some(body) = text.strip_suffix(TRUNCATION_MARKER) {
        if body.chars().count() <= max_chars {
            return false;
        }
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str(TRUNCATION_MARKER);
    *text = cut;
    true
}
