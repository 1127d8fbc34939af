use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::job::{JobManager, ProgressEvent, RunReport};
use crate::reference::Reference;
use crate::stage::{Auditor, ConvergenceEngine, InferenceEngine, PipelineStage};

/// Sequences C6 -> C7 -> C8 -> C9 -> C10 -> (optional C11) -> C12
/// enrichment -> C13, reporting progress through the job manager and
/// observing cancellation at each stage boundary. Holds no state of its
/// own besides the stage implementations it was built with; one
/// orchestrator instance runs exactly one job.
pub struct Orchestrator {
    config: Config,
    convergence: Arc<dyn ConvergenceEngine>,
    context_resolver: Arc<dyn PipelineStage>,
    title_resolver: Arc<dyn PipelineStage>,
    normalizer: Arc<dyn PipelineStage>,
    validator: Arc<dyn PipelineStage>,
    inference: Option<Arc<dyn InferenceEngine>>,
    enricher: Arc<dyn PipelineStage>,
    auditor: Arc<dyn Auditor>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        convergence: Arc<dyn ConvergenceEngine>,
        context_resolver: Arc<dyn PipelineStage>,
        title_resolver: Arc<dyn PipelineStage>,
        normalizer: Arc<dyn PipelineStage>,
        validator: Arc<dyn PipelineStage>,
        inference: Option<Arc<dyn InferenceEngine>>,
        enricher: Arc<dyn PipelineStage>,
        auditor: Arc<dyn Auditor>,
    ) -> Self {
        Self {
            config,
            convergence,
            context_resolver,
            title_resolver,
            normalizer,
            validator,
            inference,
            enricher,
            auditor,
        }
    }

    /// Runs the full pipeline for `document_text`, reporting progress on
    /// `job_id` through `jobs` and observing its cancellation notify.
    /// Only an unexpected panic-worthy bug should escape this function;
    /// every named stage failure is absorbed into `stage_errors`.
    pub async fn run(
        &self,
        job_id: &str,
        jobs: &JobManager,
        document_text: &str,
    ) -> RunReport {
        let mut stage_errors = Vec::new();
        let text = match self.config.text_limit {
            Some(limit) if document_text.len() > limit => &document_text[..limit],
            _ => document_text,
        };

        self.report(jobs, job_id, 15, "extract", "running convergence loop", &[])
            .await;
        let (mut refs, rounds_used, converged) = self.convergence.run(text).await;
        info!(job_id, rounds_used, converged, count = refs.len(), "convergence finished");
        if jobs.is_cancelled(job_id).await {
            return self.cancelled_report(refs, rounds_used, converged, stage_errors);
        }

        if self.config.use_context_agent {
            self.report(jobs, job_id, 30, "context_resolve", "resolving missing law fields", &[])
                .await;
            refs = self.context_resolver.run(refs, text).await;
        }
        if jobs.is_cancelled(job_id).await {
            return self.cancelled_report(refs, rounds_used, converged, stage_errors);
        }

        self.report(jobs, job_id, 35, "title_resolve", "resolving official titles", &[])
            .await;
        refs = self.title_resolver.run(refs, text).await;
        if jobs.is_cancelled(job_id).await {
            return self.cancelled_report(refs, rounds_used, converged, stage_errors);
        }

        self.report(jobs, job_id, 40, "normalize", "canonicalizing references", &[])
            .await;
        refs = self.normalizer.run(refs, text).await;
        if jobs.is_cancelled(job_id).await {
            return self.cancelled_report(refs, rounds_used, converged, stage_errors);
        }

        self.report(jobs, job_id, 50, "validate", "resolving registry ids", &[])
            .await;
        refs = self.validator.run(refs, text).await;
        if jobs.is_cancelled(job_id).await {
            return self.cancelled_report(refs, rounds_used, converged, stage_errors);
        }

        let mut inferred = Vec::new();
        if self.config.use_inference_agent {
            if let Some(inference) = &self.inference {
                self.report(jobs, job_id, 65, "infer", "proposing BETA references", &[])
                    .await;
                inferred = inference.infer(text, &refs).await;
            }
        }
        if jobs.is_cancelled(job_id).await {
            return self.cancelled_report(refs, rounds_used, converged, stage_errors);
        }

        self.report(jobs, job_id, 75, "enrich", "fetching article bodies", &[])
            .await;
        refs = self.enricher.run(refs, text).await;
        if jobs.is_cancelled(job_id).await {
            return self.cancelled_report(refs, rounds_used, converged, stage_errors);
        }

        self.report(jobs, job_id, 85, "audit", "scoring agent agreement", &[])
            .await;
        let summary = self.auditor.audit(&refs);
        if summary.quality_score < 0.0 {
            // quality_score is a pure function of refs; this branch only
            // exists so an implausible negative score is surfaced rather
            // than silently accepted.
            stage_errors.push("audit produced a negative quality score".to_string());
            warn!(job_id, "audit produced a negative quality score");
        }

        refs.retain(|r| r.confidence >= self.config.confidence_threshold || r.flags.hallucinated);
        let exportable: Vec<Reference> = refs.into_iter().filter(|r| r.is_exportable()).collect();

        self.report(jobs, job_id, 100, "done", "pipeline complete", &[])
            .await;

        RunReport {
            references: exportable,
            inferred_references: inferred,
            rounds_used,
            converged,
            stage_errors,
        }
    }

    fn cancelled_report(
        &self,
        refs: Vec<Reference>,
        rounds_used: u32,
        converged: bool,
        mut stage_errors: Vec<String>,
    ) -> RunReport {
        stage_errors.push("cancelled at stage boundary".to_string());
        RunReport {
            references: refs,
            inferred_references: Vec::new(),
            rounds_used,
            converged,
            stage_errors,
        }
    }

    async fn report(
        &self,
        jobs: &JobManager,
        job_id: &str,
        percent: u8,
        phase: &str,
        message: &str,
        active_agents: &[&str],
    ) {
        jobs.update_progress(
            job_id,
            ProgressEvent {
                percent,
                phase: phase.to_string(),
                message: message.to_string(),
                active_agents: active_agents.iter().map(|s| s.to_string()).collect(),
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceKind;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FixedConvergence;
    #[async_trait]
    impl ConvergenceEngine for FixedConvergence {
        async fn run(&self, _text: &str) -> (Vec<Reference>, u32, bool) {
            let mut r = Reference::new("LPAC", ReferenceKind::Law, "A", 1);
            r.law = Some("Ley 39/2015".into());
            r.confidence = 90;
            (vec![r], 1, true)
        }
    }

    struct PassThrough;
    #[async_trait]
    impl PipelineStage for PassThrough {
        fn label(&self) -> &str {
            "passthrough"
        }
        async fn run(&self, refs: Vec<Reference>, _full_text: &str) -> Vec<Reference> {
            refs
        }
    }

    struct ValidatesEverything;
    #[async_trait]
    impl PipelineStage for ValidatesEverything {
        fn label(&self) -> &str {
            "validate"
        }
        async fn run(&self, mut refs: Vec<Reference>, _full_text: &str) -> Vec<Reference> {
            for r in &mut refs {
                r.registry_id = Some("BOE-A-2015-10565".into());
                r.flags.validated = true;
            }
            refs
        }
    }

    struct NullAuditor;
    impl Auditor for NullAuditor {
        fn audit(&self, _refs: &[Reference]) -> crate::stage::AuditSummary {
            crate::stage::AuditSummary {
                quality_score: 8.0,
                agent_agreement: HashMap::new(),
                notes: Vec::new(),
            }
        }
    }

    #[tokio::test]
    async fn happy_path_produces_exportable_reference() {
        let orchestrator = Orchestrator::new(
            Config::default(),
            Arc::new(FixedConvergence),
            Arc::new(PassThrough),
            Arc::new(PassThrough),
            Arc::new(PassThrough),
            Arc::new(ValidatesEverything),
            None,
            Arc::new(PassThrough),
            Arc::new(NullAuditor),
        );
        let jobs = JobManager::new();
        let id = jobs.create().await;
        jobs.start(&id).await;
        let report = orchestrator.run(&id, &jobs, "texto de prueba con LPAC").await;
        assert_eq!(report.references.len(), 1);
        assert!(report.converged);
        assert_eq!(report.references[0].registry_id.as_deref(), Some("BOE-A-2015-10565"));
    }

    #[tokio::test]
    async fn cancellation_before_run_short_circuits_after_convergence() {
        let orchestrator = Orchestrator::new(
            Config::default(),
            Arc::new(FixedConvergence),
            Arc::new(PassThrough),
            Arc::new(PassThrough),
            Arc::new(PassThrough),
            Arc::new(ValidatesEverything),
            None,
            Arc::new(PassThrough),
            Arc::new(NullAuditor),
        );
        let jobs = JobManager::new();
        let id = jobs.create().await;
        jobs.start(&id).await;
        jobs.cancel(&id).await;
        let report = orchestrator.run(&id, &jobs, "texto").await;
        assert!(report.stage_errors.iter().any(|e| e.contains("cancelled")));
    }
}
