use std::sync::Arc;

use async_trait::async_trait;

use legref_core::llm::{permissive_json, LlmClient};
use legref_core::reference::Reference;
use legref_core::stage::{ConvergenceEngine, ExtractorAgent};

const LLM_CLUSTER_MAX_CANDIDATES: usize = 20;

/// C6: runs the three extractor agents for up to `max_rounds` rounds,
/// folding each round's candidates into the accumulated set with semantic
/// dedup, and stopping at the first round that adds nothing new. Agents
/// are expected in priority order A, B, C: on a same-round collision the
/// earlier agent's fields win.
pub struct MultiAgentConvergence {
    agents: Vec<Arc<dyn ExtractorAgent>>,
    cluster_client: Option<LlmClient>,
    max_rounds: u32,
    intermediate_confidence_threshold: u8,
}

impl MultiAgentConvergence {
    pub fn new(
        agents: Vec<Arc<dyn ExtractorAgent>>,
        cluster_client: Option<LlmClient>,
        max_rounds: u32,
        intermediate_confidence_threshold: u8,
    ) -> Self {
        Self {
            agents,
            cluster_client,
            max_rounds,
            intermediate_confidence_threshold,
        }
    }

    async fn run_round(&self, text: &str, round: u32, accumulated: &[Reference]) -> Vec<Reference> {
        let calls = self
            .agents
            .iter()
            .map(|agent| {
                let agent = Arc::clone(agent);
                let owned_text = text.to_string();
                let previous = accumulated.to_vec();
                async move {
                    match agent.extract(&owned_text, round, &previous).await {
                        Ok(refs) => refs,
                        Err(e) => {
                            tracing::warn!(agent = agent.name(), round, error = %e, "extractor agent failed this round");
                            Vec::new()
                        }
                    }
                }
            })
            .collect::<Vec<_>>();

        let results = futures::future::join_all(calls).await;

        // Fold in priority order A -> B -> C so earlier agents win ties
        // against both each other and against what's already accumulated.
        let mut round_refs: Vec<Reference> = Vec::new();
        for candidates in results {
            for candidate in candidates {
                let already_known = accumulated.iter().any(|r| r.semantically_equal(&candidate))
                    || round_refs.iter().any(|r| r.semantically_equal(&candidate));
                if !already_known {
                    round_refs.push(candidate);
                }
            }
        }

        if round_refs.len() <= LLM_CLUSTER_MAX_CANDIDATES && !round_refs.is_empty() {
            round_refs = self.cluster_merge(round_refs).await;
        }

        round_refs
            .into_iter()
            .filter(|r| r.confidence >= self.intermediate_confidence_threshold)
            .collect()
    }

    /// Best-effort merge of near-duplicates the rule-based equality check
    /// misses (different wording for the same citation). Fails open: any
    /// error or malformed reply returns the input unchanged rather than
    /// blocking convergence.
    async fn cluster_merge(&self, candidates: Vec<Reference>) -> Vec<Reference> {
        let Some(client) = &self.cluster_client else {
            return candidates;
        };
        if candidates.len() < 2 {
            return candidates;
        }

        let items: Vec<serde_json::Value> = candidates
            .iter()
            .enumerate()
            .map(|(i, r)| serde_json::json!({"index": i, "raw_text": r.raw_text, "law": r.law, "article": r.article}))
            .collect();
        let prompt = format!(
            "These candidate legal-reference extractions may contain duplicates describing the \
             same citation with different wording. Group indices that refer to the same citation. \
             Respond with a JSON array of arrays of indices, e.g. [[0,2],[1]]. Every index must \
             appear exactly once.\n\n{}",
            serde_json::Value::Array(items)
        );

        let Ok(reply) = client.generate(&prompt, None).await else {
            return candidates;
        };
        let value = permissive_json(&reply);
        let Some(groups) = value.as_array() else {
            return candidates;
        };

        let mut seen = vec![false; candidates.len()];
        let mut merged = Vec::new();
        for group in groups {
            let Some(indices) = group.as_array() else { continue };
            let mut idxs: Vec<usize> = indices.iter().filter_map(|v| v.as_u64()).map(|v| v as usize).collect();
            idxs.retain(|&i| i < candidates.len() && !seen[i]);
            if idxs.is_empty() {
                continue;
            }
            idxs.sort_unstable();
            for &i in &idxs {
                seen[i] = true;
            }
            merged.push(candidates[idxs[0]].clone());
        }
        // Fail open on a partial/garbled grouping: anything the model
        // didn't account for is kept rather than dropped.
        for (i, was_seen) in seen.iter().enumerate() {
            if !was_seen {
                merged.push(candidates[i].clone());
            }
        }
        merged
    }
}

#[async_trait]
impl ConvergenceEngine for MultiAgentConvergence {
    async fn run(&self, text: &str) -> (Vec<Reference>, u32, bool) {
        let mut accumulated: Vec<Reference> = Vec::new();
        let mut rounds_used = 0;
        let mut converged = false;

        for round in 1..=self.max_rounds {
            rounds_used = round;
            let new_refs = self.run_round(text, round, &accumulated).await;
            if new_refs.is_empty() {
                converged = true;
                break;
            }
            accumulated.extend(new_refs);
        }

        (accumulated, rounds_used, converged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use legref_core::reference::ReferenceKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedAgent {
        name: &'static str,
        batches: Vec<Vec<&'static str>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ExtractorAgent for FixedAgent {
        fn name(&self) -> &str {
            self.name
        }
        async fn extract(&self, _text: &str, round: u32, _previous: &[Reference]) -> anyhow::Result<Vec<Reference>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let idx = (round - 1) as usize;
            let laws = self.batches.get(idx).cloned().unwrap_or_default();
            Ok(laws
                .into_iter()
                .map(|l| {
                    let mut r = Reference::new(l, ReferenceKind::Law, self.name, round);
                    r.law = Some(l.to_string());
                    r.confidence = 80;
                    r
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn stops_at_fixed_point_when_a_round_adds_nothing() {
        let agent_a = Arc::new(FixedAgent {
            name: "A",
            batches: vec![vec!["Ley 39/2015"], vec![]],
            calls: AtomicU32::new(0),
        });
        let engine = MultiAgentConvergence::new(vec![agent_a], None, 7, 60);
        let (refs, rounds, converged) = engine.run("texto").await;
        assert_eq!(refs.len(), 1);
        assert_eq!(rounds, 2);
        assert!(converged);
    }

    #[tokio::test]
    async fn caps_at_max_rounds_without_converging() {
        let agent_a = Arc::new(FixedAgent {
            name: "A",
            batches: vec![vec!["Ley 1/2001"], vec!["Ley 2/2002"], vec!["Ley 3/2003"]],
            calls: AtomicU32::new(0),
        });
        let engine = MultiAgentConvergence::new(vec![agent_a], None, 3, 60);
        let (refs, rounds, converged) = engine.run("texto").await;
        assert_eq!(refs.len(), 3);
        assert_eq!(rounds, 3);
        assert!(!converged);
    }
}
