use std::collections::HashMap;

/// Pipeline configuration loaded from environment / `.env` file.
///
/// Every field here corresponds to a recognized option; unset keys fall
/// back to the defaults below.
#[derive(Debug, Clone)]
pub struct Config {
    /// Convergence bound, 1-10.
    pub max_rounds: u32,
    /// Intra-stage worker pool size, 1-8.
    pub max_workers: u32,
    /// Final-output confidence filter, 50-95.
    pub confidence_threshold: u8,
    /// Intermediate filtering threshold applied during extraction.
    pub intermediate_confidence_threshold: u8,
    pub use_context_agent: bool,
    pub use_inference_agent: bool,
    pub use_cache: bool,
    /// Truncate the source document to this many characters, if set.
    pub text_limit: Option<usize>,

    /// Inference agent's survival rule: reject a proposal unless at
    /// least this percentage of its proposed articles exist in the
    /// norm's real index. Left as a tunable per spec's open questions.
    pub inference_min_survival_pct: u8,
    /// Context resolver's promotion rule: refs at or above this
    /// confidence are promoted to 100 after the second pass.
    pub context_promote_threshold: u8,

    pub max_concurrent_jobs: u32,
    pub max_job_timeout_s: u64,

    pub boe_api_base: String,
    pub eurlex_sparql_endpoint: String,
    pub cache_dir: String,
    pub llm_model: String,

    /// Optional path to a JSON file with extra sigla -> canonical name
    /// entries layered on top of the built-in registry.
    pub abbreviations_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_rounds: 7,
            max_workers: 4,
            confidence_threshold: 70,
            intermediate_confidence_threshold: 60,
            use_context_agent: true,
            use_inference_agent: false,
            use_cache: true,
            text_limit: None,
            inference_min_survival_pct: 50,
            context_promote_threshold: 95,
            max_concurrent_jobs: 4,
            max_job_timeout_s: 1800,
            boe_api_base: "https://www.boe.es/datosabiertos/api".to_string(),
            eurlex_sparql_endpoint: "https://publications.europa.eu/webapi/rdf/sparql"
                .to_string(),
            cache_dir: "store/cache".to_string(),
            llm_model: "gemini-2.5-pro".to_string(),
            abbreviations_file: String::new(),
        }
    }
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u8(key: &str, dotenv: &HashMap<String, String>, default: u8) -> u8 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_usize_opt(key: &str, dotenv: &HashMap<String, String>) -> Option<usize> {
    get(key, dotenv).and_then(|v| v.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let dotenv = parse_dotenv();
        let default = Config::default();

        Config {
            max_rounds: get_u32("MAX_ROUNDS", &dotenv, default.max_rounds).clamp(1, 10),
            max_workers: get_u32("MAX_WORKERS", &dotenv, default.max_workers).clamp(1, 8),
            confidence_threshold: get_u8(
                "CONFIDENCE_THRESHOLD",
                &dotenv,
                default.confidence_threshold,
            )
            .clamp(50, 95),
            intermediate_confidence_threshold: get_u8(
                "INTERMEDIATE_CONFIDENCE_THRESHOLD",
                &dotenv,
                default.intermediate_confidence_threshold,
            ),
            use_context_agent: get_bool(
                "USE_CONTEXT_AGENT",
                &dotenv,
                default.use_context_agent,
            ),
            use_inference_agent: get_bool(
                "USE_INFERENCE_AGENT",
                &dotenv,
                default.use_inference_agent,
            ),
            use_cache: get_bool("USE_CACHE", &dotenv, default.use_cache),
            text_limit: get_usize_opt("TEXT_LIMIT", &dotenv).or(default.text_limit),
            inference_min_survival_pct: get_u8(
                "INFERENCE_MIN_SURVIVAL_PCT",
                &dotenv,
                default.inference_min_survival_pct,
            ),
            context_promote_threshold: get_u8(
                "CONTEXT_PROMOTE_THRESHOLD",
                &dotenv,
                default.context_promote_threshold,
            ),
            max_concurrent_jobs: get_u32(
                "MAX_CONCURRENT_JOBS",
                &dotenv,
                default.max_concurrent_jobs,
            ),
            max_job_timeout_s: get_u64(
                "MAX_JOB_TIMEOUT_S",
                &dotenv,
                default.max_job_timeout_s,
            ),
            boe_api_base: get_str("BOE_API_BASE", &dotenv, &default.boe_api_base),
            eurlex_sparql_endpoint: get_str(
                "EURLEX_SPARQL_ENDPOINT",
                &dotenv,
                &default.eurlex_sparql_endpoint,
            ),
            cache_dir: get_str("CACHE_DIR", &dotenv, &default.cache_dir),
            llm_model: get_str("LLM_MODEL", &dotenv, &default.llm_model),
            abbreviations_file: get_str("ABBREVIATIONS_FILE", &dotenv, ""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = Config::default();
        assert_eq!(c.max_rounds, 7);
        assert_eq!(c.max_workers, 4);
        assert_eq!(c.confidence_threshold, 70);
        assert_eq!(c.intermediate_confidence_threshold, 60);
        assert!(c.use_context_agent);
        assert!(!c.use_inference_agent);
    }

    #[test]
    fn clamps_out_of_range_env() {
        std::env::set_var("MAX_ROUNDS", "99");
        let c = Config::from_env();
        assert_eq!(c.max_rounds, 10);
        std::env::remove_var("MAX_ROUNDS");
    }
}
