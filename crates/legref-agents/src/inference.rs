use std::sync::Arc;

use async_trait::async_trait;

use legref_core::llm::{permissive_json, LlmClient};
use legref_core::reference::{Reference, ReferenceKind};
use legref_core::stage::InferenceEngine;
use legref_registry::article_fetcher::ArticleFetcher;
use legref_registry::boe::BoeClient;

struct ProposedNorm {
    concept: String,
    law: String,
    registry_id: String,
    articles: Vec<String>,
    confidence: u8,
}

/// C11 (BETA): proposes references never written verbatim in the text by
/// detecting legal concepts it discusses and mapping them to a norm, then
/// rejecting any proposal whose articles mostly don't exist in the real
/// BOE index. Disabled by default; the orchestrator only calls this when
/// the inference agent is turned on.
pub struct ConceptInferenceEngine {
    concept_client: LlmClient,
    mapping_client: LlmClient,
    article_fetcher: Arc<ArticleFetcher>,
    min_survival_pct: u8,
}

impl ConceptInferenceEngine {
    pub fn new(
        concept_client: LlmClient,
        mapping_client: LlmClient,
        article_fetcher: Arc<ArticleFetcher>,
        min_survival_pct: u8,
    ) -> Self {
        Self {
            concept_client,
            mapping_client,
            article_fetcher,
            min_survival_pct,
        }
    }

    async fn detect_concepts(&self, text: &str) -> Vec<String> {
        let prompt = format!(
            "List up to 8 distinct legal concepts or institutions this Spanish study text \
             discusses without ever citing the law or article that governs them (e.g. \"silencio \
             administrativo\", \"recurso de alzada\"). Respond with a JSON array of short strings, \
             or [] if none.\n\nTEXT:\n{text}"
        );
        let Ok(reply) = self.concept_client.generate(&prompt, None).await else {
            return Vec::new();
        };
        let value = permissive_json(&reply);
        value
            .as_array()
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }

    async fn map_concept(&self, concept: &str) -> Option<ProposedNorm> {
        let prompt = format!(
            "The Spanish legal concept \"{concept}\" is governed by a specific law and, ideally, \
             specific articles. Respond with a JSON object {{\"law\": \"<law name>\", \
             \"boe_id\": \"<BOE-A-YYYY-NNNNN identifier of the governing norm>\", \
             \"articles\": [\"<article number>\", ...], \"confidence\": <0-100 self-reported>}}. \
             If you are not confident, set confidence below 70."
        );
        let reply = self.mapping_client.generate(&prompt, None).await.ok()?;
        let value = permissive_json(&reply);
        let law = value.get("law")?.as_str()?.to_string();
        let registry_id = value.get("boe_id")?.as_str()?.to_string();
        let confidence = value.get("confidence").and_then(|v| v.as_u64()).unwrap_or(0) as u8;
        if confidence < 70 {
            return None;
        }
        let articles: Vec<String> = value
            .get("articles")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        if articles.is_empty() {
            return None;
        }

        Some(ProposedNorm {
            concept: concept.to_string(),
            law,
            registry_id,
            articles,
            confidence,
        })
    }

    /// Keeps only articles confirmed to exist in the norm's real index;
    /// rejects the whole proposal if fewer than `min_survival_pct` of the
    /// proposed articles survive.
    async fn cross_check(&self, proposal: ProposedNorm) -> Option<Vec<Reference>> {
        let total = proposal.articles.len();
        let mut survivors = Vec::new();
        for article in &proposal.articles {
            if self.article_fetcher.fetch(&proposal.registry_id, article).await.is_some() {
                survivors.push(article.clone());
            }
        }
        if survivors.is_empty() {
            return None;
        }
        let survival_pct = (survivors.len() * 100 / total.max(1)) as u8;
        if survival_pct < self.min_survival_pct {
            return None;
        }

        Some(
            survivors
                .into_iter()
                .map(|article| {
                    let mut r = Reference::new(
                        format!("{} (inferred from concept: {})", proposal.law, proposal.concept),
                        ReferenceKind::Law,
                        "inference",
                        0,
                    );
                    r.law = Some(proposal.law.clone());
                    r.article = Some(article);
                    r.registry_id = Some(proposal.registry_id.clone());
                    r.registry_url = Some(BoeClient::registry_url(&proposal.registry_id));
                    r.confidence = proposal.confidence;
                    r.flags.inferred = true;
                    r.flags.validated = true;
                    r.note(format!("inferred from concept \"{}\"", proposal.concept));
                    r
                })
                .collect(),
        )
    }
}

#[async_trait]
impl InferenceEngine for ConceptInferenceEngine {
    async fn infer(&self, text: &str, existing_refs: &[Reference]) -> Vec<Reference> {
        let concepts = self.detect_concepts(text).await;
        let mut results = Vec::new();

        for concept in concepts {
            let Some(proposal) = self.map_concept(&concept).await else {
                continue;
            };
            let Some(candidates) = self.cross_check(proposal).await else {
                continue;
            };
            for candidate in candidates {
                let is_duplicate = existing_refs.iter().any(|existing| {
                    existing.registry_id.as_deref() == candidate.registry_id.as_deref()
                        && existing.article.as_deref() == candidate.article.as_deref()
                }) || results.iter().any(|r: &Reference| {
                    r.registry_id.as_deref() == candidate.registry_id.as_deref()
                        && r.article.as_deref() == candidate.article.as_deref()
                });
                if !is_duplicate {
                    results.push(candidate);
                }
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cross_check_rejects_proposal_below_survival_threshold() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let fetcher = Arc::new(ArticleFetcher::new(BoeClient::new("https://example.invalid", dir.path())));
        let engine = ConceptInferenceEngine::new(
            LlmClient::new("concept", "model", 0.2, "key"),
            LlmClient::new("mapping", "model", 0.0, "key"),
            fetcher,
            80,
        );
        let proposal = ProposedNorm {
            concept: "silencio administrativo".to_string(),
            law: "ley 39/2015".to_string(),
            registry_id: "BOE-A-2015-10565".to_string(),
            articles: vec!["24".to_string(), "9999".to_string()],
            confidence: 75,
        };
        // Neither article resolves without network access, so the whole
        // proposal is rejected rather than partially accepted.
        let result = engine.cross_check(proposal).await;
        assert!(result.is_none());
    }
}
