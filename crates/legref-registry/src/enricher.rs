use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use legref_core::reference::Reference;
use legref_core::stage::PipelineStage;

use crate::article_fetcher::ArticleFetcher;

/// Export-prep enrichment: fetches the authoritative article body for
/// every validated, non-hallucinated ref with an article number. Per-ref
/// fan-out, same bound as the validator.
pub struct ArticleEnricher {
    fetcher: Arc<ArticleFetcher>,
    max_workers: usize,
}

impl ArticleEnricher {
    pub fn new(fetcher: Arc<ArticleFetcher>, max_workers: usize) -> Self {
        Self { fetcher, max_workers }
    }

    async fn enrich_one(&self, mut r: Reference) -> Reference {
        if r.flags.hallucinated || !r.flags.validated {
            return r;
        }
        let (Some(registry_id), Some(article)) = (r.registry_id.clone(), r.article.clone()) else {
            return r;
        };
        if let Some(fetched) = self.fetcher.fetch(&registry_id, &article).await {
            r.article_body = Some(fetched.body_html);
            if r.official_title.is_none() {
                r.official_title = Some(fetched.title);
            }
        }
        r
    }
}

#[async_trait]
impl PipelineStage for ArticleEnricher {
    fn label(&self) -> &str {
        "enrich"
    }

    async fn run(&self, refs: Vec<Reference>, _full_text: &str) -> Vec<Reference> {
        let total = refs.len();
        let results = stream::iter(refs.into_iter().enumerate())
            .map(|(idx, r)| async move { (idx, self.enrich_one(r).await) })
            .buffer_unordered(self.max_workers.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut ordered: Vec<Option<Reference>> = (0..total).map(|_| None).collect();
        for (idx, r) in results {
            ordered[idx] = Some(r);
        }
        ordered.into_iter().flatten().collect()
    }
}
