//! Hypothesis refinement between iterations and top-N selection for synthesis.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::agents::{ResearchFindings, Verdict};
use crate::state::{Hypothesis, HypothesisOrigin, ImpactTier};

/// Produce the active hypothesis set for the next iteration.
///
/// Refuted hypotheses are dropped unless that would leave none. Each research
/// gap becomes a LOW-impact follow-up until `max_hypotheses` is reached;
/// follow-ups whose title matches an existing hypothesis are skipped.
pub fn refine_hypotheses(
    active: &[Hypothesis],
    findings: &[ResearchFindings],
    iteration: u32,
    max_hypotheses: usize,
) -> Vec<Hypothesis> {
    let refuted: HashSet<&str> = findings
        .iter()
        .filter(|f| f.verdict == Verdict::Refuted)
        .map(|f| f.hypothesis_id.as_str())
        .collect();

    let mut next: Vec<Hypothesis> = active
        .iter()
        .filter(|h| !refuted.contains(h.id.as_str()))
        .cloned()
        .collect();
    if next.is_empty() {
        // Keep the first one; there must always be something to research.
        next.extend(active.first().cloned());
    }

    let mut titles: HashSet<String> = next.iter().map(|h| normalize(&h.title)).collect();
    for finding in findings {
        for (k, gap) in finding.gaps.iter().enumerate() {
            if next.len() >= max_hypotheses {
                return next;
            }
            if !titles.insert(normalize(gap)) {
                continue;
            }
            let mut follow_up = Hypothesis::new(
                format!("{}-f{}-{}", finding.hypothesis_id, iteration, k + 1),
                gap.trim(),
                format!("Follow-up on {}: {}", finding.hypothesis_id, gap.trim()),
                ImpactTier::Low,
            );
            follow_up.origin = HypothesisOrigin::FollowUp;
            next.push(follow_up);
        }
    }
    next
}

fn normalize(title: &str) -> String {
    title.trim().to_lowercase()
}

/// Highest-priority `n` hypotheses: impact tier first, then descending
/// confidence, then original order.
pub fn select_top_hypotheses(hypotheses: &[Hypothesis], n: usize) -> Vec<Hypothesis> {
    let mut ranked = hypotheses.to_vec();
    ranked.sort_by(|a, b| {
        a.impact.rank().cmp(&b.impact.rank()).then_with(|| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
        })
    });
    ranked.truncate(n);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn hyp(id: &str, impact: ImpactTier, confidence: f64) -> Hypothesis {
        Hypothesis::new(id, format!("title {}", id), "thesis", impact).with_confidence(confidence)
    }

    fn finding(id: &str, verdict: Verdict, gaps: &[&str]) -> ResearchFindings {
        ResearchFindings {
            hypothesis_id: id.to_string(),
            evidence: vec![],
            verdict,
            gaps: gaps.iter().map(|g| g.to_string()).collect(),
        }
    }

    fn ids(hypotheses: &[Hypothesis]) -> Vec<&str> {
        hypotheses.iter().map(|h| h.id.as_str()).collect()
    }

    #[test]
    fn test_refuted_hypotheses_dropped() {
        let active = vec![hyp("h1", ImpactTier::High, 0.5), hyp("h2", ImpactTier::Low, 0.5)];
        let next = refine_hypotheses(&active, &[finding("h1", Verdict::Refuted, &[])], 2, 10);
        assert_eq!(ids(&next), vec!["h2"]);
    }

    #[test]
    fn test_last_hypothesis_never_dropped() {
        let active = vec![hyp("h1", ImpactTier::High, 0.5)];
        let next = refine_hypotheses(&active, &[finding("h1", Verdict::Refuted, &[])], 2, 10);
        assert_eq!(ids(&next), vec!["h1"]);
    }

    #[test]
    fn test_gaps_become_capped_follow_ups() {
        let active = vec![hyp("h1", ImpactTier::High, 0.5), hyp("h2", ImpactTier::Low, 0.5)];
        let findings = vec![
            finding("h1", Verdict::Supported, &["Pricing power", "title h2", "Churn"]),
            finding("h2", Verdict::Inconclusive, &["Capex cycle"]),
        ];
        let next = refine_hypotheses(&active, &findings, 3, 4);

        assert_eq!(ids(&next), vec!["h1", "h2", "h1-f3-1", "h1-f3-3"]);
        assert!(next[2..]
            .iter()
            .all(|h| h.origin == HypothesisOrigin::FollowUp && h.impact == ImpactTier::Low));
    }

    #[test]
    fn test_top_n_orders_by_tier_then_confidence_then_position() {
        let hypotheses = vec![
            hyp("low", ImpactTier::Low, 0.99),
            hyp("med-a", ImpactTier::Medium, 0.4),
            hyp("high", ImpactTier::High, 0.1),
            hyp("med-b", ImpactTier::Medium, 0.7),
            hyp("med-c", ImpactTier::Medium, 0.4),
        ];
        let top = select_top_hypotheses(&hypotheses, 4);
        assert_eq!(ids(&top), vec!["high", "med-b", "med-a", "med-c"]);
    }
}
