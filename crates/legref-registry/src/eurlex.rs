use serde::{Deserialize, Serialize};

use crate::cache::{DiskCache, Ttl};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CelexActType {
    Regulation,
    Directive,
    Decision,
}

impl CelexActType {
    fn letter(self) -> char {
        match self {
            CelexActType::Regulation => 'R',
            CelexActType::Directive => 'L',
            CelexActType::Decision => 'D',
        }
    }

    fn from_letter(c: char) -> Option<Self> {
        match c {
            'R' => Some(CelexActType::Regulation),
            'L' => Some(CelexActType::Directive),
            'D' => Some(CelexActType::Decision),
            _ => None,
        }
    }
}

/// `3` + 4-digit year + {R,L,D} + 4-digit zero-padded number.
pub fn synthesize_celex(kind: CelexActType, year: u32, number: u32) -> String {
    format!("3{:04}{}{:04}", year, kind.letter(), number)
}

/// Parses a CELEX id back into `(kind, year, number)`; used by P6's
/// round-trip property test and by the validator's existence check.
pub fn parse_celex(celex: &str) -> Option<(CelexActType, u32, u32)> {
    let celex = celex.trim();
    if !celex.starts_with('3') || celex.len() != 10 {
        return None;
    }
    let year: u32 = celex.get(1..5)?.parse().ok()?;
    let kind = CelexActType::from_letter(celex.chars().nth(5)?)?;
    let number: u32 = celex.get(6..10)?.parse().ok()?;
    Some((kind, year, number))
}

/// Synthesizes a CELEX id from a raw `YYYY/NNN` or `NNN/YYYY` citation,
/// handling both orderings (the year is always the 4-digit side) per the
/// normalizer's rule.
pub fn synthesize_celex_from_pair(kind: CelexActType, a: &str, b: &str) -> Option<String> {
    let (year_str, number_str) = if a.len() == 4 { (a, b) } else { (b, a) };
    let year: u32 = year_str.parse().ok()?;
    let number: u32 = number_str.parse().ok()?;
    Some(synthesize_celex(kind, year, number))
}

pub fn eurlex_url(celex: &str, lang: &str, format: &str) -> String {
    format!("https://eur-lex.europa.eu/legal-content/{lang}/{format}/?uri=CELEX:{celex}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CelexMetadata {
    pub title: Option<String>,
}

/// Minimal SPARQL client against the EUR-Lex publications endpoint.
pub struct EurLexClient {
    http: reqwest::Client,
    endpoint: String,
    cache: DiskCache,
}

impl EurLexClient {
    pub fn new(endpoint: impl Into<String>, cache_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            cache: DiskCache::new(cache_dir),
        }
    }

    /// `celex_exists(celex) -> (bool, metadata?)`. Failure leaves the ref
    /// unvalidated but still exportable, since the EU URL is deterministic
    /// from the CELEX alone.
    pub async fn celex_exists(&self, celex: &str) -> (bool, Option<CelexMetadata>) {
        if let Some(cached) = self.cache.get::<CelexMetadata>("eurlex_celex", celex, Ttl::days(30)) {
            return (true, Some(cached));
        }

        let query = format!(
            "PREFIX cdm: <http://publications.europa.eu/ontology/cdm#> \
             SELECT ?title WHERE {{ ?work cdm:resource_legal_id_celex \"{celex}\" . \
             OPTIONAL {{ ?work cdm:expression_title ?title }} }} LIMIT 1"
        );

        let response = match self
            .http
            .get(&self.endpoint)
            .query(&[("query", query.as_str()), ("format", "application/sparql-results+json")])
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
        {
            Ok(r) => r,
            Err(_) => return (false, None),
        };
        let Ok(body) = response.json::<serde_json::Value>().await else {
            return (false, None);
        };
        let bindings = body["results"]["bindings"].as_array().cloned().unwrap_or_default();
        if bindings.is_empty() {
            return (false, None);
        }
        let title = bindings[0]["title"]["value"].as_str().map(str::to_string);
        let meta = CelexMetadata { title };
        self.cache.put("eurlex_celex", celex, &meta);
        (true, Some(meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesizes_and_round_trips() {
        let celex = synthesize_celex(CelexActType::Regulation, 2016, 679);
        assert_eq!(celex, "32016R0679");
        let (kind, year, number) = parse_celex(&celex).expect("round trip");
        assert_eq!(kind, CelexActType::Regulation);
        assert_eq!(year, 2016);
        assert_eq!(number, 679);
    }

    #[test]
    fn handles_number_slash_year_ordering() {
        let celex = synthesize_celex_from_pair(CelexActType::Directive, "2019", "790").expect("ok");
        assert_eq!(celex, "32019L0790");
        let celex2 = synthesize_celex_from_pair(CelexActType::Directive, "790", "2019").expect("ok");
        assert_eq!(celex2, celex);
    }

    #[test]
    fn rejects_malformed_celex() {
        assert!(parse_celex("not-a-celex").is_none());
        assert!(parse_celex("32016X0679").is_none());
    }

    #[test]
    fn eurlex_url_format() {
        assert_eq!(
            eurlex_url("32016R0679", "ES", "TXT"),
            "https://eur-lex.europa.eu/legal-content/ES/TXT/?uri=CELEX:32016R0679"
        );
    }
}
