use async_trait::async_trait;
use regex::{escape, Regex, RegexBuilder};

use legref_core::llm::{permissive_json, LlmClient};
use legref_core::reference::Reference;
use legref_core::stage::PipelineStage;

const WINDOW_RADIUS: usize = 1500;
const CONTEXT_BATCH: usize = 10;
const PRINCIPAL_LAW_SCAN_CHARS: usize = 5000;

/// C7: fills in `law` for references whose `raw_text` names an article but
/// not a law ("el articulo 17 de la presente ley"), by locating the raw
/// text in the source document and asking the model to resolve it from
/// surrounding prose. Non-essential: any failure leaves refs unchanged.
pub struct ContextResolver {
    client: LlmClient,
    promote_threshold: u8,
}

impl ContextResolver {
    pub fn new(client: LlmClient, promote_threshold: u8) -> Self {
        Self { client, promote_threshold }
    }

    fn locate(&self, full_text: &str, raw_text: &str) -> Option<(usize, usize)> {
        if let Some(pos) = full_text.find(raw_text) {
            return Some((pos, pos + raw_text.len()));
        }
        // Tolerant fallback: collapse whitespace runs in raw_text into \s+.
        let pattern = escape(raw_text).replace("\\ ", r"\s+");
        let re = RegexBuilder::new(&pattern).case_insensitive(true).build().ok()?;
        let m = re.find(full_text)?;
        Some((m.start(), m.end()))
    }

    fn window(&self, full_text: &str, start: usize, end: usize) -> String {
        let window_start = start.saturating_sub(WINDOW_RADIUS);
        let window_end = (end + WINDOW_RADIUS).min(full_text.len());
        full_text
            .get(window_start..window_end)
            .unwrap_or(full_text)
            .to_string()
    }

    /// Scans the first slice of the document for a self-describing law
    /// title ("Ley 39/2015, de 1 de octubre..."), used as the fallback
    /// referent for "la presente ley"-style raw texts.
    async fn detect_principal_law(&self, full_text: &str) -> Option<String> {
        let head: String = full_text.chars().take(PRINCIPAL_LAW_SCAN_CHARS).collect();
        let prompt = format!(
            "This is the opening of a Spanish legal study document. If it names the law it is \
             studying (e.g. \"Ley 39/2015, de 1 de octubre\"), reply with ONLY that law name. \
             If none is named, reply with exactly NONE.\n\nTEXT:\n{head}"
        );
        let reply = self.client.generate(&prompt, None).await.ok()?;
        let trimmed = reply.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
            return None;
        }
        Some(trimmed.to_string())
    }

    async fn resolve_batch(&self, batch: &[(usize, String)], full_text: &str) -> Vec<Option<(String, u8)>> {
        let contexts: Vec<serde_json::Value> = batch
            .iter()
            .map(|(idx, raw)| {
                let window = match self.locate(full_text, raw) {
                    Some((s, e)) => self.window(full_text, s, e),
                    None => raw.clone(),
                };
                serde_json::json!({"index": idx, "raw_text": raw, "context": window})
            })
            .collect();

        let prompt = format!(
            "For each item below, a legal reference's raw text lacks an explicit law name \
             (e.g. it reads \"la presente ley\" or \"dicho articulo\"). Using the surrounding \
             context, identify which law each refers to. Respond with a JSON array of objects \
             {{\"index\": <n>, \"law\": \"<resolved law name or null>\", \"confidence\": <0-100>}}.\n\n{}",
            serde_json::Value::Array(contexts)
        );

        let Ok(reply) = self.client.generate(&prompt, None).await else {
            return batch.iter().map(|_| None).collect();
        };
        let value = permissive_json(&reply);
        let Some(items) = value.as_array() else {
            return batch.iter().map(|_| None).collect();
        };

        let mut results: Vec<Option<(String, u8)>> = batch.iter().map(|_| None).collect();
        for item in items {
            let Some(index) = item.get("index").and_then(|v| v.as_u64()) else {
                continue;
            };
            let Some(pos) = batch.iter().position(|(idx, _)| *idx as u64 == index) else {
                continue;
            };
            let law = item.get("law").and_then(|v| v.as_str()).map(str::to_string);
            let confidence = item.get("confidence").and_then(|v| v.as_u64()).unwrap_or(0) as u8;
            if let Some(law) = law {
                if !law.is_empty() {
                    results[pos] = Some((law, confidence));
                }
            }
        }
        results
    }

    fn is_self_referential(raw_text: &str) -> bool {
        #[allow(clippy::unwrap_used)]
        let re = Regex::new(r"(?i)(la presente|esta misma|dicha|este mismo)\s+(ley|norma|código|codigo|reglamento)").unwrap();
        re.is_match(raw_text)
    }
}

#[async_trait]
impl PipelineStage for ContextResolver {
    fn label(&self) -> &str {
        "context_resolve"
    }

    async fn run(&self, mut refs: Vec<Reference>, full_text: &str) -> Vec<Reference> {
        let principal_law = self.detect_principal_law(full_text).await;

        let incomplete_idx: Vec<usize> = refs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.confidence < 100)
            .map(|(i, _)| i)
            .collect();
        if incomplete_idx.is_empty() {
            return refs;
        }

        for chunk in incomplete_idx.chunks(CONTEXT_BATCH) {
            let batch: Vec<(usize, String)> = chunk.iter().map(|&i| (i, refs[i].raw_text.clone())).collect();

            // Self-referential phrasing resolves from the principal law
            // scan without spending a model call per item.
            let mut remaining = Vec::new();
            for (idx, raw) in &batch {
                if Self::is_self_referential(raw) {
                    if let Some(law) = &principal_law {
                        refs[*idx].law = Some(law.clone());
                        refs[*idx].confidence = refs[*idx].confidence.max(80);
                        refs[*idx].flags.context_resolved = true;
                        continue;
                    }
                }
                remaining.push((*idx, raw.clone()));
            }
            if remaining.is_empty() {
                continue;
            }

            let resolved = self.resolve_batch(&remaining, full_text).await;
            for ((idx, _), outcome) in remaining.iter().zip(resolved) {
                if let Some((law, confidence)) = outcome {
                    refs[*idx].law = Some(law);
                    refs[*idx].flags.context_resolved = true;
                    refs[*idx].confidence = refs[*idx].confidence.max(confidence);
                    if confidence >= self.promote_threshold {
                        refs[*idx].confidence = 100;
                    }
                } else {
                    refs[*idx].note("context resolution could not determine referenced law");
                }
            }
        }

        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_self_referential_phrasing() {
        assert!(ContextResolver::is_self_referential("el articulo 17 de la presente ley"));
        assert!(!ContextResolver::is_self_referential("el articulo 17 de la Ley 39/2015"));
    }

    #[test]
    fn locate_falls_back_to_whitespace_tolerant_match() {
        let resolver = ContextResolver::new(LlmClient::new("ctx", "model", 0.0, "key"), 95);
        let full = "antes   del articulo 17    de la ley despues";
        let found = resolver.locate(full, "articulo 17 de la ley");
        assert!(found.is_some());
    }
}
