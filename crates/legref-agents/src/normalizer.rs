use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use legref_core::abbreviations::AbbreviationRegistry;
use legref_core::llm::LlmClient;
use legref_core::reference::{LawCategory, Reference, ReferenceKind};
use legref_core::stage::PipelineStage;
use legref_registry::eurlex::{synthesize_celex_from_pair, CelexActType};

fn eu_kind_words() -> &'static [(&'static str, CelexActType)] {
    &[
        ("reglamento", CelexActType::Regulation),
        ("directiva", CelexActType::Directive),
        ("decision", CelexActType::Decision),
        ("decisión", CelexActType::Decision),
    ]
}

fn law_kind_re() -> Regex {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)^(ley org[aá]nica|ley|real decreto legislativo|real decreto)\s+(\d+)/(\d{4})").unwrap()
}

fn eu_number_year_re() -> Regex {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)(reglamento|directiva|decisi[oó]n)\D{0,40}?(\d{1,4})/(\d{4})").unwrap()
}

/// C9: canonicalizes law strings, distinguishes EU from Spanish
/// references, expands siglas, and synthesizes a CELEX for EU acts so the
/// validator can confirm them downstream.
pub struct Normalizer {
    abbreviations: Arc<AbbreviationRegistry>,
    disambiguator: Option<LlmClient>,
}

impl Normalizer {
    pub fn new(abbreviations: Arc<AbbreviationRegistry>, disambiguator: Option<LlmClient>) -> Self {
        Self { abbreviations, disambiguator }
    }

    fn expand_sigla(&self, r: &mut Reference) -> bool {
        let Some(law) = r.law.clone() else { return false };
        let trimmed = law.trim();
        // A sigla is short and has no internal whitespace-delimited
        // sentence structure; longer strings are already full names.
        if trimmed.chars().count() > 12 || trimmed.contains(' ') && trimmed.split(' ').count() > 2 {
            return false;
        }
        let Some(entry) = self.abbreviations.lookup(trimmed) else {
            return false;
        };
        r.law = Some(entry.canonical_name.clone());
        if entry.is_eu {
            r.kind = classify_eu_kind(&entry.canonical_name).unwrap_or(ReferenceKind::EuRegulation);
        } else if let Some(id) = &entry.registry_id {
            r.registry_id = Some(id.clone());
            r.registry_url = Some(legref_registry::boe::BoeClient::registry_url(id));
        }
        true
    }

    fn canonicalize_spanish(&self, r: &mut Reference) {
        let Some(law) = r.law.clone() else { return };
        if let Some(caps) = law_kind_re().captures(&law) {
            let kind_word = caps.get(1).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
            let number = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            let year = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
            r.law = Some(format!("{kind_word} {number}/{year}"));
            r.law_kind = Some(kind_word.clone());
            r.kind = match kind_word.as_str() {
                k if k.contains("orgánica") || k.contains("organica") => ReferenceKind::OrganicLaw,
                k if k.contains("legislativo") => ReferenceKind::LegislativeRd,
                k if k.contains("real decreto") => ReferenceKind::RoyalDecree,
                _ => ReferenceKind::Law,
            };
        }
        r.category = Some(classify_category(&law));
    }

    fn synthesize_eu(&self, r: &mut Reference) {
        let Some(law) = r.law.clone() else { return };
        let Some(caps) = eu_number_year_re().captures(&law) else { return };
        let kind_word = caps.get(1).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
        let a = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        let b = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
        let Some(act_type) = classify_eu_kind(&kind_word).and_then(|k| match k {
            ReferenceKind::EuRegulation => Some(CelexActType::Regulation),
            ReferenceKind::EuDirective => Some(CelexActType::Directive),
            ReferenceKind::EuDecision => Some(CelexActType::Decision),
            _ => None,
        }) else {
            return;
        };
        r.kind = match act_type {
            CelexActType::Regulation => ReferenceKind::EuRegulation,
            CelexActType::Directive => ReferenceKind::EuDirective,
            CelexActType::Decision => ReferenceKind::EuDecision,
        };
        if let Some(celex) = synthesize_celex_from_pair(act_type, a, b) {
            r.registry_id = Some(celex.clone());
            r.registry_url = Some(legref_registry::eurlex::eurlex_url(&celex, "ES", "TXT"));
        }
        r.flags.title_european = true;
    }

    /// When a sigla resolves to more than one plausible canonical law
    /// (not representable by the current flat map, but kept for future
    /// multi-entry sources), ask the model to pick using surrounding
    /// context rather than defaulting silently.
    async fn disambiguate(&self, raw_text: &str, candidates: &[String]) -> Option<String> {
        let client = self.disambiguator.as_ref()?;
        let prompt = format!(
            "The abbreviation in \"{raw_text}\" could refer to any of: {}. Which one is meant? \
             Reply with ONLY the matching option, verbatim.",
            candidates.join(" | ")
        );
        let reply = client.generate(&prompt, None).await.ok()?;
        let trimmed = reply.trim();
        candidates.iter().find(|c| c.as_str() == trimmed).cloned()
    }
}

fn classify_eu_kind(text: &str) -> Option<ReferenceKind> {
    let lower = text.to_lowercase();
    eu_kind_words().iter().find(|(w, _)| lower.contains(w)).map(|(_, t)| match t {
        CelexActType::Regulation => ReferenceKind::EuRegulation,
        CelexActType::Directive => ReferenceKind::EuDirective,
        CelexActType::Decision => ReferenceKind::EuDecision,
    })
}

fn classify_category(law: &str) -> LawCategory {
    let lower = law.to_lowercase();
    if lower.starts_with("ley") || lower.starts_with("código") || lower.starts_with("codigo") || lower.contains("constitución") {
        LawCategory::Normativa
    } else if lower.starts_with("real decreto") || lower.starts_with("orden") {
        LawCategory::Disposicion
    } else {
        LawCategory::Otra
    }
}

#[async_trait]
impl PipelineStage for Normalizer {
    fn label(&self) -> &str {
        "normalize"
    }

    async fn run(&self, mut refs: Vec<Reference>, _full_text: &str) -> Vec<Reference> {
        for r in &mut refs {
            let was_sigla = self.expand_sigla(r);

            if r.kind.is_eu() || r.law.as_deref().is_some_and(|l| classify_eu_kind(l).is_some()) {
                self.synthesize_eu(r);
            } else if !was_sigla || r.law.as_deref().is_some_and(|l| law_kind_re().is_match(l)) {
                self.canonicalize_spanish(r);
            }

            r.flags.normalized = true;
        }
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(law: &str) -> Reference {
        let mut r = Reference::new(law, ReferenceKind::Law, "A", 1);
        r.law = Some(law.to_string());
        r
    }

    #[tokio::test]
    async fn expands_spanish_sigla_to_canonical_name() {
        let normalizer = Normalizer::new(Arc::new(AbbreviationRegistry::with_builtin_seed()), None);
        let refs = normalizer.run(vec![make("LPAC")], "").await;
        assert_eq!(refs[0].law.as_deref(), Some("ley 39/2015"));
        assert_eq!(refs[0].registry_id.as_deref(), Some("BOE-A-2015-10565"));
    }

    #[tokio::test]
    async fn canonicalizes_law_kind_and_category() {
        let normalizer = Normalizer::new(Arc::new(AbbreviationRegistry::with_builtin_seed()), None);
        let refs = normalizer.run(vec![make("Ley Orgánica 6/1985")], "").await;
        assert_eq!(refs[0].kind, ReferenceKind::OrganicLaw);
        assert_eq!(refs[0].category, Some(LawCategory::Normativa));
    }

    #[tokio::test]
    async fn synthesizes_celex_for_eu_regulation() {
        let normalizer = Normalizer::new(Arc::new(AbbreviationRegistry::with_builtin_seed()), None);
        let refs = normalizer.run(vec![make("Reglamento 2016/679")], "").await;
        assert_eq!(refs[0].kind, ReferenceKind::EuRegulation);
        assert_eq!(refs[0].registry_id.as_deref(), Some("32016R0679"));
    }
}
