use thiserror::Error;

/// Typed error kinds surfaced at the boundaries spec'd by the error
/// handling design: most internal failures are absorbed per-ref or
/// per-stage and never reach this type, but the job manager and
/// orchestrator need to distinguish these cases by kind.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed document or unreadable configuration. Fatal to the job.
    #[error("input error: {0}")]
    Input(String),

    /// LLM timeout, HTTP 5xx, network reset. Retried opportunistically by
    /// the caller's strategy cascade; surfaced here only when the whole
    /// cascade is exhausted.
    #[error("provider transient error: {0}")]
    ProviderTransient(String),

    /// LLM returned unparseable JSON, or a registry returned no match.
    /// Never fatal; the caller records it against the ref's audit trail.
    #[error("provider semantic error: {0}")]
    ProviderSemantic(String),

    /// The run was cancelled at a stage boundary.
    #[error("cancelled")]
    Cancelled,

    /// Unexpected condition that should not normally be reachable.
    #[error("internal error: {0}")]
    Bug(String),
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}
