use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use legref_agents::context_resolver::ContextResolver;
use legref_agents::convergence::MultiAgentConvergence;
use legref_agents::extractor::{ExtractorStrategy, LlmExtractor};
use legref_agents::inference::ConceptInferenceEngine;
use legref_agents::normalizer::Normalizer;
use legref_agents::title_resolver::TitleResolver;
use legref_core::abbreviations::AbbreviationRegistry;
use legref_core::config::Config;
use legref_core::job::JobManager;
use legref_core::llm::LlmClient;
use legref_core::orchestrator::Orchestrator;
use legref_core::stage::{ExtractorAgent, InferenceEngine};
use legref_registry::article_fetcher::ArticleFetcher;
use legref_registry::boe::BoeClient;
use legref_registry::comparator::Comparator;
use legref_registry::enricher::ArticleEnricher;
use legref_registry::eurlex::EurLexClient;
use legref_registry::validator::Validator;

/// Thin demo binary: runs the full extraction pipeline against a single
/// document and prints the resulting references as JSON. The orchestration
/// itself lives entirely in `legref-core`/`legref-agents`/`legref-registry`;
/// this binary only wires the concrete stages together.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let path = env::args().nth(1).context("usage: legref <path-to-document.txt>")?;
    let document_text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;

    let config = Config::from_env();
    let api_key = env::var("LLM_API_KEY").unwrap_or_default();

    let mut abbreviations = AbbreviationRegistry::with_builtin_seed();
    abbreviations.load_extra_from_file(&config.abbreviations_file);
    let abbreviations = Arc::new(abbreviations);

    let boe = Arc::new(BoeClient::new(config.boe_api_base.clone(), config.cache_dir.clone()));
    let eurlex = Arc::new(EurLexClient::new(
        config.eurlex_sparql_endpoint.clone(),
        config.cache_dir.clone(),
    ));
    let article_fetcher = Arc::new(ArticleFetcher::new(BoeClient::new(
        config.boe_api_base.clone(),
        config.cache_dir.clone(),
    )));

    let model = config.llm_model.as_str();
    let key = api_key.as_str();

    let sigla_hints = abbreviations.hint_block();
    let agents: Vec<Arc<dyn ExtractorAgent>> = vec![
        Arc::new(LlmExtractor::new(
            ExtractorStrategy::Conservative,
            model,
            key,
            sigla_hints.clone(),
        )),
        Arc::new(LlmExtractor::new(
            ExtractorStrategy::Aggressive,
            model,
            key,
            sigla_hints.clone(),
        )),
        Arc::new(LlmExtractor::new(ExtractorStrategy::Hound, model, key, sigla_hints)),
    ];
    let cluster_client = LlmClient::new("dedup", model, 0.0, key);
    let convergence = Arc::new(MultiAgentConvergence::new(
        agents,
        Some(cluster_client),
        config.max_rounds,
        config.intermediate_confidence_threshold,
    ));

    let context_resolver = Arc::new(ContextResolver::new(
        LlmClient::new("context", model, 0.2, key),
        config.context_promote_threshold,
    ));
    let title_resolver = Arc::new(TitleResolver::new(
        LlmClient::new("title", model, 0.1, key),
        Arc::clone(&abbreviations),
    ));
    let normalizer = Arc::new(Normalizer::new(
        Arc::clone(&abbreviations),
        Some(LlmClient::new("disambiguate", model, 0.0, key)),
    ));
    let validator = Arc::new(Validator::new(
        Arc::clone(&abbreviations),
        Arc::clone(&boe),
        Arc::clone(&eurlex),
        Arc::clone(&article_fetcher),
        config.max_workers as usize,
        true,
    ));
    let enricher = Arc::new(ArticleEnricher::new(Arc::clone(&article_fetcher), config.max_workers as usize));
    let auditor = Arc::new(Comparator::new());

    let inference: Option<Arc<dyn InferenceEngine>> = if config.use_inference_agent {
        Some(Arc::new(ConceptInferenceEngine::new(
            LlmClient::new("concept", model, 0.3, key),
            LlmClient::new("mapping", model, 0.0, key),
            Arc::clone(&article_fetcher),
            config.inference_min_survival_pct,
        )))
    } else {
        None
    };

    let orchestrator = Orchestrator::new(
        config,
        convergence,
        context_resolver,
        title_resolver,
        normalizer,
        validator,
        inference,
        enricher,
        auditor,
    );

    let jobs = JobManager::new();
    let job_id = jobs.create().await;
    jobs.start(&job_id).await;

    info!(job_id = %job_id, path = %path, "starting extraction run");
    let report = orchestrator.run(&job_id, &jobs, &document_text).await;
    jobs.complete(&job_id, report.clone()).await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
