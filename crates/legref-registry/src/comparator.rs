use std::collections::HashMap;

use legref_core::reference::Reference;
use legref_core::stage::{AuditSummary, Auditor};

/// C13: inter-agent agreement analysis and a single 0-10 quality score.
/// Reads the accumulated set only; it never mutates a reference, matching
/// the "never mutated after C12" lifecycle rule.
pub struct Comparator;

impl Comparator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Comparator {
    fn default() -> Self {
        Self::new()
    }
}

impl Auditor for Comparator {
    fn audit(&self, refs: &[Reference]) -> AuditSummary {
        if refs.is_empty() {
            return AuditSummary {
                quality_score: 0.0,
                agent_agreement: HashMap::new(),
                notes: vec!["no references to audit".to_string()],
            };
        }

        let mut agent_agreement: HashMap<String, u32> = HashMap::new();
        for r in refs {
            *agent_agreement.entry(r.provenance.agent.clone()).or_insert(0) += 1;
        }

        let validated = refs.iter().filter(|r| r.flags.validated).count();
        let titled = refs.iter().filter(|r| r.flags.title_resolved).count();
        let hallucinated = refs.iter().filter(|r| r.flags.hallucinated).count();
        let avg_confidence: f32 =
            refs.iter().map(|r| r.confidence as f32).sum::<f32>() / refs.len() as f32;

        let validated_ratio = validated as f32 / refs.len() as f32;
        let titled_ratio = titled as f32 / refs.len() as f32;
        let hallucination_penalty = hallucinated as f32 / refs.len() as f32;

        let score = (avg_confidence / 100.0 * 4.0)
            + (validated_ratio * 3.0)
            + (titled_ratio * 2.0)
            + 1.0
            - (hallucination_penalty * 3.0);
        let quality_score = score.clamp(0.0, 10.0);

        let mut notes = Vec::new();
        if hallucinated > 0 {
            notes.push(format!("{hallucinated} reference(s) demoted as hallucinated"));
        }
        if validated_ratio < 0.5 {
            notes.push("fewer than half of references resolved a registry id".to_string());
        }

        AuditSummary {
            quality_score,
            agent_agreement,
            notes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use legref_core::reference::ReferenceKind;

    #[test]
    fn empty_set_scores_zero() {
        let comparator = Comparator::new();
        let summary = comparator.audit(&[]);
        assert_eq!(summary.quality_score, 0.0);
    }

    #[test]
    fn fully_validated_set_scores_high() {
        let comparator = Comparator::new();
        let mut r = Reference::new("LPAC", ReferenceKind::Law, "A", 1);
        r.confidence = 90;
        r.flags.validated = true;
        r.flags.title_resolved = true;
        let summary = comparator.audit(&[r]);
        assert!(summary.quality_score > 8.0);
        assert_eq!(summary.agent_agreement.get("A"), Some(&1));
    }
}
