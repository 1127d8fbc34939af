use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use legref_core::abbreviations::AbbreviationRegistry;
use legref_core::reference::Reference;
use legref_core::stage::PipelineStage;

use crate::article_fetcher::ArticleFetcher;
use crate::boe::BoeClient;
use crate::eurlex::EurLexClient;

/// Static `(kind, number)` -> BOE-ID map of high-frequency laws, tried
/// after the sigla map and before a live BOE search.
fn static_law_map() -> HashMap<(&'static str, &'static str), &'static str> {
    HashMap::from([
        (("ley", "39/2015"), "BOE-A-2015-10565"),
        (("ley", "40/2015"), "BOE-A-2015-10566"),
        (("ley", "1/2000"), "BOE-A-2000-323"),
        (("ley", "29/1998"), "BOE-A-1998-16718"),
        (("ley", "15/2015"), "BOE-A-2015-7391"),
        (("ley orgánica", "6/1985"), "BOE-A-1985-12666"),
        (("codigo penal", ""), "BOE-A-1995-25444"),
        (("codigo civil", ""), "BOE-A-1889-4763"),
    ])
}

fn law_number_re() -> Regex {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)(ley org[aá]nica|ley|real decreto legislativo|real decreto)\s+(\d+)/(\d{4})")
        .unwrap()
}

/// `(kind, number, year)` extracted from a normalized law string.
fn extract_kind_number_year(law: &str) -> Option<(String, String, String)> {
    let caps = law_number_re().captures(law)?;
    let kind = caps.get(1)?.as_str().to_lowercase();
    let number = caps.get(2)?.as_str().to_string();
    let year = caps.get(3)?.as_str().to_string();
    Some((kind, number, year))
}

/// C10: resolves `registry_id` and confirms article existence.
pub struct Validator {
    abbreviations: Arc<AbbreviationRegistry>,
    boe: Arc<BoeClient>,
    eurlex: Arc<EurLexClient>,
    article_fetcher: Arc<ArticleFetcher>,
    max_workers: usize,
    verify_articles: bool,
}

impl Validator {
    pub fn new(
        abbreviations: Arc<AbbreviationRegistry>,
        boe: Arc<BoeClient>,
        eurlex: Arc<EurLexClient>,
        article_fetcher: Arc<ArticleFetcher>,
        max_workers: usize,
        verify_articles: bool,
    ) -> Self {
        Self {
            abbreviations,
            boe,
            eurlex,
            article_fetcher,
            max_workers,
            verify_articles,
        }
    }

    async fn validate_one(&self, mut r: Reference) -> Reference {
        if r.kind.is_eu() {
            return self.validate_eu(r).await;
        }

        let static_map = static_law_map();

        // (a) static sigla -> BOE-ID map.
        let from_sigla = r
            .law
            .as_deref()
            .and_then(|law| self.abbreviations.lookup(law))
            .and_then(|e| e.registry_id.clone());

        let registry_id = if let Some(id) = from_sigla {
            Some(id)
        } else if let Some((kind, number, year)) = r.law.as_deref().and_then(extract_kind_number_year) {
            // (b) static (kind, "number/year") map.
            let num_year = format!("{number}/{year}");
            static_map
                .get(&(kind.as_str(), num_year.as_str()))
                .map(|s| s.to_string())
                .or_else(|| static_map.get(&(kind.as_str(), "")).map(|s| s.to_string()))
        } else {
            None
        };

        let registry_id = match registry_id {
            Some(id) => Some(id),
            None => self.resolve_via_search(&r, &static_map).await,
        };

        let Some(registry_id) = registry_id else {
            r.note("BOE-ID could not be resolved");
            return r;
        };

        r.registry_id = Some(registry_id.clone());
        r.registry_url = Some(BoeClient::registry_url(&registry_id));
        r.flags.validated = true;

        if self.verify_articles {
            if let Some(article) = r.article.clone() {
                let found = self.article_fetcher.fetch(&registry_id, &article).await;
                match found {
                    Some(fetched) => {
                        r.flags.is_subpoint = fetched.is_subpoint;
                        r.subpoint_number = fetched.subpoint_number;
                    }
                    None => {
                        r.mark_hallucinated(format!(
                            "article {article} not found in index of {registry_id}"
                        ));
                    }
                }
            }
        }

        r
    }

    /// (c) BOE search API by `numero_oficial:<number>/<year>`, verifying
    /// the returned title matches the requested kind; (d) if
    /// `official_title` is present, extract a number/year/kind from it
    /// and retry from (b).
    async fn resolve_via_search(
        &self,
        r: &Reference,
        static_map: &HashMap<(&'static str, &'static str), &'static str>,
    ) -> Option<String> {
        if let Some((kind, number, year)) = r.law.as_deref().and_then(extract_kind_number_year) {
            let hits = self.boe.search_law_hits(&number, &year).await;
            if let Some(hit) = hits.into_iter().find(|h| title_matches_kind(&h.title, &kind)) {
                return Some(hit.registry_id);
            }
        }

        if let Some(title) = &r.official_title {
            if let Some((kind, number, year)) = extract_kind_number_year(title) {
                let num_year = format!("{number}/{year}");
                if let Some(id) = static_map.get(&(kind.as_str(), num_year.as_str())) {
                    return Some(id.to_string());
                }
            }
        }

        None
    }

    async fn validate_eu(&self, mut r: Reference) -> Reference {
        let Some(celex) = r.registry_id.clone() else {
            r.note("EU reference missing synthesized CELEX");
            return r;
        };
        let (exists, metadata) = self.eurlex.celex_exists(&celex).await;
        if exists {
            r.flags.validated = true;
            if let Some(meta) = metadata {
                if r.official_title.is_none() {
                    r.official_title = meta.title;
                }
            }
        } else {
            r.note("CELEX existence could not be confirmed; still exportable");
        }
        r
    }
}

fn title_matches_kind(title: &str, kind: &str) -> bool {
    let title = title.to_lowercase();
    match kind {
        k if k.contains("organica") => title.contains("organica") || title.contains("orgánica"),
        k if k.contains("real decreto legislativo") => title.contains("real decreto legislativo"),
        k if k.contains("real decreto") => title.contains("real decreto") && !title.contains("legislativo"),
        _ => title.contains("ley"),
    }
}

#[async_trait]
impl PipelineStage for Validator {
    fn label(&self) -> &str {
        "validate"
    }

    /// Per-ref fan-out bounded by `max_workers` (spec 5.2); results may
    /// complete out of order, restored here by index.
    async fn run(&self, refs: Vec<Reference>, _full_text: &str) -> Vec<Reference> {
        use futures::stream::{self, StreamExt};

        let total = refs.len();
        let results = stream::iter(refs.into_iter().enumerate())
            .map(|(idx, r)| async move { (idx, self.validate_one(r).await) })
            .buffer_unordered(self.max_workers.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut ordered: Vec<Option<Reference>> = (0..total).map(|_| None).collect();
        for (idx, r) in results {
            ordered[idx] = Some(r);
        }
        debug!(count = total, "validation finished");
        ordered.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use legref_core::reference::ReferenceKind;

    fn make(law: &str) -> Reference {
        let mut r = Reference::new(law, ReferenceKind::Law, "A", 1);
        r.law = Some(law.to_string());
        r.confidence = 90;
        r
    }

    #[test]
    fn extracts_kind_number_year() {
        let (kind, number, year) = extract_kind_number_year("Ley Orgánica 6/1985").expect("parses");
        assert_eq!(kind, "ley orgánica");
        assert_eq!(number, "6");
        assert_eq!(year, "1985");
    }

    #[tokio::test]
    async fn resolves_via_sigla_map_without_network() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let validator = Validator::new(
            Arc::new(AbbreviationRegistry::with_builtin_seed()),
            Arc::new(BoeClient::new("https://example.invalid", dir.path())),
            Arc::new(EurLexClient::new("https://example.invalid", dir.path())),
            Arc::new(ArticleFetcher::new(BoeClient::new(
                "https://example.invalid",
                dir.path(),
            ))),
            4,
            false,
        );
        let r = make("LPAC");
        let validated = validator.validate_one(r).await;
        assert_eq!(validated.registry_id.as_deref(), Some("BOE-A-2015-10565"));
        assert!(validated.flags.validated);
    }
}
