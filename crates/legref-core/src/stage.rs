use async_trait::async_trait;

use crate::reference::Reference;

/// Trait implemented by each of the three extractor agents. Kept minimal
/// and async: a single entry point the orchestrator calls without caring
/// which concrete agent it holds.
#[async_trait]
pub trait ExtractorAgent: Send + Sync {
    fn name(&self) -> &str;

    /// Extracts a batch of references from `text`, filtering out any
    /// already present in `previous_refs` (compared case-normalized).
    async fn extract(
        &self,
        text: &str,
        round_number: u32,
        previous_refs: &[Reference],
    ) -> anyhow::Result<Vec<Reference>>;
}

/// Trait implemented by C7/C8/C9/C10 and C12's enrichment step: stages
/// that transform the whole accumulated set. Non-essential stages (C7,
/// C8) are expected to pass refs through unchanged on error rather than
/// propagate; essential stages (C10) degrade to per-ref failure instead.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn label(&self) -> &str;

    async fn run(&self, refs: Vec<Reference>, full_text: &str) -> Vec<Reference>;
}

/// C6: multi-round fan-out of the three extractor agents with semantic
/// dedup and fixed-point termination.
#[async_trait]
pub trait ConvergenceEngine: Send + Sync {
    async fn run(&self, text: &str) -> (Vec<Reference>, u32, bool);
}

/// C11 (BETA): proposes additional references never seen verbatim in the
/// text, cross-checked against official indices.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn infer(&self, text: &str, existing_refs: &[Reference]) -> Vec<Reference>;
}

/// C13: inter-agent agreement analysis and a single 0-10 quality score.
pub trait Auditor: Send + Sync {
    fn audit(&self, refs: &[Reference]) -> AuditSummary;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditSummary {
    pub quality_score: f32,
    pub agent_agreement: std::collections::HashMap<String, u32>,
    pub notes: Vec<String>,
}
