use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::PipelineError;

/// Per-agent call counters. Character-count token estimates are an
/// acceptable heuristic per the wrapper's contract — this is cost
/// reporting only, never used for truncation decisions.
#[derive(Debug, Default)]
pub struct LlmMetrics {
    pub total_calls: AtomicU64,
    pub total_tokens_prompt: AtomicU64,
    pub total_tokens_response: AtomicU64,
    pub total_errors: AtomicU64,
    pub total_time_ms: AtomicI64,
}

impl LlmMetrics {
    pub fn snapshot(&self) -> LlmMetricsSnapshot {
        LlmMetricsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_tokens_prompt: self.total_tokens_prompt.load(Ordering::Relaxed),
            total_tokens_response: self.total_tokens_response.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            total_time_ms: self.total_time_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LlmMetricsSnapshot {
    pub total_calls: u64,
    pub total_tokens_prompt: u64,
    pub total_tokens_response: u64,
    pub total_errors: u64,
    pub total_time_ms: i64,
}

/// Uniform text-generation call, fixed temperature per agent at
/// construction. This wrapper is the *only* place that talks to the LLM
/// provider; every agent in `legref-agents` goes through it.
pub struct LlmClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    name: String,
    temperature: f32,
    max_output_tokens: u32,
    metrics: LlmMetrics,
}

#[derive(Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    parts: Option<Vec<Part>>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

impl LlmClient {
    pub fn new(name: impl Into<String>, model: impl Into<String>, temperature: f32, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
            api_key: api_key.into(),
            model: model.into(),
            name: name.into(),
            temperature,
            max_output_tokens: 65_000,
            metrics: LlmMetrics::default(),
        }
    }

    pub fn metrics(&self) -> LlmMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Generates text for `prompt`, optionally prefixed by a system
    /// instruction (the provider has no native system-role parameter, so
    /// the two are concatenated exactly like the source agent wrapper
    /// this is modeled on).
    pub async fn generate(
        &self,
        prompt: &str,
        system_instruction: Option<&str>,
    ) -> Result<String, PipelineError> {
        let full_prompt = match system_instruction {
            Some(sys) if !sys.is_empty() => format!("{sys}\n\n{prompt}"),
            _ => prompt.to_string(),
        };

        self.metrics.total_calls.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let url = format!(
            "{}/{}:generateContent?key={}",
            self.api_base, self.model, self.api_key
        );
        let body = serde_json::json!({
            "contents": [{"parts": [{"text": full_prompt}]}],
            "generationConfig": {
                "temperature": self.temperature,
                "maxOutputTokens": self.max_output_tokens,
            }
        });

        let result = self.http.post(&url).json(&body).send().await;
        let elapsed_ms = start.elapsed().as_millis() as i64;
        self.metrics.total_time_ms.fetch_add(elapsed_ms, Ordering::Relaxed);

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                self.metrics.total_errors.fetch_add(1, Ordering::Relaxed);
                warn!(agent = %self.name, error = %e, "llm call failed");
                return Err(PipelineError::ProviderTransient(e.to_string()));
            }
        };

        if !response.status().is_success() {
            self.metrics.total_errors.fetch_add(1, Ordering::Relaxed);
            let status = response.status();
            return Err(PipelineError::ProviderTransient(format!(
                "http {status}"
            )));
        }

        let parsed: GenerateResponse = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                self.metrics.total_errors.fetch_add(1, Ordering::Relaxed);
                return Err(PipelineError::ProviderSemantic(e.to_string()));
            }
        };

        let text = parsed
            .candidates
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.content)
            .and_then(|c| c.parts)
            .and_then(|p| p.into_iter().next())
            .and_then(|p| p.text)
            .unwrap_or_default();

        if text.is_empty() {
            self.metrics.total_errors.fetch_add(1, Ordering::Relaxed);
            return Err(PipelineError::ProviderSemantic(
                "empty response text".to_string(),
            ));
        }

        // 1 token ~= 4 characters, matching the source wrapper's heuristic.
        self.metrics
            .total_tokens_prompt
            .fetch_add((full_prompt.len() / 4) as u64, Ordering::Relaxed);
        self.metrics
            .total_tokens_response
            .fetch_add((text.len() / 4) as u64, Ordering::Relaxed);

        debug!(agent = %self.name, elapsed_ms, len = text.len(), "llm call succeeded");
        Ok(text)
    }
}

/// Strips a leading/trailing markdown code fence (```json ... ``` or
/// ``` ... ```) around an LLM reply, as replies commonly wrap JSON in one.
pub fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        return rest.trim_start().trim_end_matches("```").trim();
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        return rest.trim_start().trim_end_matches("```").trim();
    }
    trimmed
}

/// Permissive JSON decode: strips fences, tolerates extra fields and
/// missing optionals via `serde_json::Value`, never panics on malformed
/// input. Returns `Value::Null` on failure rather than propagating, so
/// callers can fall through to a regex-based fallback at reduced
/// confidence.
pub fn permissive_json(text: &str) -> Value {
    serde_json::from_str(strip_fences(text)).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_fence() {
        let raw = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_fences(raw), "{\"a\":1}");
    }

    #[test]
    fn strips_plain_fence() {
        let raw = "```\n[1,2,3]\n```";
        assert_eq!(strip_fences(raw), "[1,2,3]");
    }

    #[test]
    fn passes_through_unfenced() {
        assert_eq!(strip_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn permissive_json_tolerates_garbage() {
        assert_eq!(permissive_json("not json at all"), Value::Null);
    }

    #[test]
    fn permissive_json_parses_fenced_object() {
        let v = permissive_json("```json\n{\"x\":true}\n```");
        assert_eq!(v["x"], Value::Bool(true));
    }
}
