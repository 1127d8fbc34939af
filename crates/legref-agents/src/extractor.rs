use std::collections::HashSet;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use legref_core::llm::{permissive_json, LlmClient};
use legref_core::reference::{Reference, ReferenceKind};
use legref_core::stage::ExtractorAgent;

/// Prompt strategy distinguishing the three extractors; only the prompt
/// text and temperature differ, the call shape is identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorStrategy {
    /// Agent A: only explicit citations; reject on doubt. Precision bias.
    Conservative,
    /// Agent B: implicit citations and abbreviations, seeded with a
    /// known sigla list. Recall bias.
    Aggressive,
    /// Agent C ("hound"): no sigla hints, catches natural-language
    /// references ("this code", "the Statute"). Recall of prose.
    Hound,
}

impl ExtractorStrategy {
    pub fn agent_name(self) -> &'static str {
        match self {
            ExtractorStrategy::Conservative => "A",
            ExtractorStrategy::Aggressive => "B",
            ExtractorStrategy::Hound => "C",
        }
    }

    pub fn temperature(self) -> f32 {
        match self {
            ExtractorStrategy::Conservative => 0.1,
            ExtractorStrategy::Aggressive => 0.4,
            ExtractorStrategy::Hound => 0.4,
        }
    }

    fn system_prompt(self, sigla_hints: &str) -> String {
        match self {
            ExtractorStrategy::Conservative => "You extract legal citations from Spanish study text. \
                Only report citations that are explicitly written out (law name/number, article number). \
                If you are unsure whether something is a citation, do not report it.".to_string(),
            ExtractorStrategy::Aggressive => format!(
                "You extract legal citations from Spanish study text, including abbreviations \
                 (siglas) and implicit references. Known siglas for reference:\n{sigla_hints}\n\
                 Prefer recall: when in doubt, include the candidate at lower confidence.",
            ),
            ExtractorStrategy::Hound => "You extract legal citations from Spanish study text, \
                specifically natural-language references such as \"this code\", \"the Statute\", \
                \"la presente ley\" that do not name the law explicitly. Do not rely on any sigla list; \
                read the prose.".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRef {
    raw_text: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    law: Option<String>,
    #[serde(default)]
    article: Option<String>,
    #[serde(default = "default_confidence")]
    confidence: u8,
}

fn default_confidence() -> u8 {
    60
}

/// Extracts a batch of references from `text`, sharing the LLM call shape
/// across all three agents; only strategy/temperature differ.
pub struct LlmExtractor {
    strategy: ExtractorStrategy,
    client: LlmClient,
    sigla_hints: String,
}

impl LlmExtractor {
    pub fn new(strategy: ExtractorStrategy, model: &str, api_key: &str, sigla_hints: String) -> Self {
        let client = LlmClient::new(strategy.agent_name(), model, strategy.temperature(), api_key);
        Self {
            strategy,
            client,
            sigla_hints,
        }
    }

    fn build_prompt(&self, text: &str, round_number: u32) -> String {
        format!(
            "Round {round_number}. Extract every legal reference from the following text as a \
             JSON array of objects with fields raw_text, kind, law, article, confidence (0-100). \
             kind must be one of: law, royal_decree, organic_law, legislative_rd, article, code, \
             constitution, eu_regulation, eu_directive, eu_decision, abbreviation, contextual. \
             Respond with ONLY the JSON array.\n\nTEXT:\n{text}"
        )
    }

    fn parse_kind(raw: Option<&str>) -> ReferenceKind {
        match raw.unwrap_or("").to_lowercase().as_str() {
            "royal_decree" => ReferenceKind::RoyalDecree,
            "organic_law" => ReferenceKind::OrganicLaw,
            "legislative_rd" => ReferenceKind::LegislativeRd,
            "article" => ReferenceKind::Article,
            "code" => ReferenceKind::Code,
            "constitution" => ReferenceKind::Constitution,
            "eu_regulation" => ReferenceKind::EuRegulation,
            "eu_directive" => ReferenceKind::EuDirective,
            "eu_decision" => ReferenceKind::EuDecision,
            "abbreviation" => ReferenceKind::Abbreviation,
            "contextual" => ReferenceKind::Contextual,
            _ => ReferenceKind::Law,
        }
    }

    /// Regex-based fallback used when the provider returns malformed
    /// JSON: extracts obvious "Ley N/YYYY"-shaped citations at reduced
    /// confidence rather than aborting the round.
    fn regex_fallback(&self, text: &str, round_number: u32) -> Vec<Reference> {
        #[allow(clippy::unwrap_used)]
        let re = Regex::new(r"(?i)(ley org[aá]nica|ley|real decreto legislativo|real decreto)\s+(\d+)/(\d{4})").unwrap();
        re.find_iter(text)
            .map(|m| {
                let mut r = Reference::new(m.as_str(), ReferenceKind::Law, self.strategy.agent_name(), round_number);
                r.law = Some(m.as_str().to_string());
                r.confidence = 30;
                r.note("produced by regex fallback after malformed LLM output");
                r
            })
            .collect()
    }

    fn filter_seen(&self, candidates: Vec<Reference>, previous_refs: &[Reference]) -> Vec<Reference> {
        let seen: HashSet<String> = previous_refs.iter().map(|r| r.case_normalized_text()).collect();
        candidates
            .into_iter()
            .filter(|r| !seen.contains(&r.case_normalized_text()))
            .collect()
    }
}

#[async_trait]
impl ExtractorAgent for LlmExtractor {
    fn name(&self) -> &str {
        self.strategy.agent_name()
    }

    async fn extract(
        &self,
        text: &str,
        round_number: u32,
        previous_refs: &[Reference],
    ) -> anyhow::Result<Vec<Reference>> {
        let system = self.strategy.system_prompt(&self.sigla_hints);
        let prompt = self.build_prompt(text, round_number);

        let candidates = match self.client.generate(&prompt, Some(&system)).await {
            Ok(reply) => {
                let value = permissive_json(&reply);
                match value.as_array() {
                    Some(items) => items
                        .iter()
                        .filter_map(|item| serde_json::from_value::<RawRef>(item.clone()).ok())
                        .map(|raw| {
                            let mut r = Reference::new(
                                raw.raw_text,
                                Self::parse_kind(raw.kind.as_deref()),
                                self.strategy.agent_name(),
                                round_number,
                            );
                            r.law = raw.law;
                            r.article = raw.article;
                            r.confidence = raw.confidence;
                            r
                        })
                        .collect(),
                    // The reply wasn't a JSON array; fall back to scanning
                    // the source text directly rather than the reply.
                    None => self.regex_fallback(text, round_number),
                }
            }
            Err(e) => {
                tracing::warn!(agent = self.strategy.agent_name(), error = %e, "extractor call failed, using regex fallback");
                self.regex_fallback(text, round_number)
            }
        };

        Ok(self.filter_seen(candidates, previous_refs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_temperatures_match_bias() {
        assert_eq!(ExtractorStrategy::Conservative.temperature(), 0.1);
        assert_eq!(ExtractorStrategy::Aggressive.temperature(), 0.4);
        assert_eq!(ExtractorStrategy::Hound.temperature(), 0.4);
    }

    #[test]
    fn regex_fallback_finds_law_citations() {
        let extractor = LlmExtractor::new(ExtractorStrategy::Conservative, "model", "key", String::new());
        let refs = extractor.regex_fallback("Segun la Ley 39/2015 y el Real Decreto 203/2021...", 1);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].confidence, 30);
    }

    #[test]
    fn filter_seen_drops_case_insensitive_duplicates() {
        let extractor = LlmExtractor::new(ExtractorStrategy::Conservative, "model", "key", String::new());
        let mut prior = Reference::new("Ley 39/2015", ReferenceKind::Law, "A", 0);
        prior.law = Some("Ley 39/2015".into());
        let mut candidate = Reference::new("LEY 39/2015", ReferenceKind::Law, "A", 1);
        candidate.law = Some("Ley 39/2015".into());
        let filtered = extractor.filter_seen(vec![candidate], &[prior]);
        assert!(filtered.is_empty());
    }
}
