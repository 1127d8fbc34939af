use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use regex::Regex;

use crate::boe::BoeClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArticle {
    pub title: String,
    pub body_html: String,
    pub is_subpoint: bool,
    pub subpoint_number: Option<String>,
}

const ARTICLE_CACHE_CAP: usize = 200;

/// Retrieves authoritative article text by trying multiple block-id
/// patterns, then the norm's index, then recursing on a subpoint's base
/// number. All three strategies share one LRU cache keyed by
/// `(registry_id, article_number)`; network failures surface as `None`
/// rather than an error, matching the cascade's "move on" contract.
pub struct ArticleFetcher {
    boe: BoeClient,
    article_cache: Mutex<LruCache<(String, String), FetchedArticle>>,
}

impl ArticleFetcher {
    pub fn new(boe: BoeClient) -> Self {
        let cap = NonZeroUsize::new(ARTICLE_CACHE_CAP).unwrap_or(NonZeroUsize::MIN);
        Self {
            boe,
            article_cache: Mutex::new(LruCache::new(cap)),
        }
    }

    pub async fn fetch(&self, registry_id: &str, article_number: &str) -> Option<FetchedArticle> {
        let cache_key = (registry_id.to_string(), article_number.to_string());
        if let Some(hit) = self.article_cache.lock().expect("lock poisoned").get(&cache_key) {
            return Some(hit.clone());
        }

        let result = self.fetch_uncached(registry_id, article_number).await;
        if let Some(article) = &result {
            self.article_cache
                .lock()
                .expect("lock poisoned")
                .put(cache_key, article.clone());
        }
        result
    }

    async fn fetch_uncached(&self, registry_id: &str, article_number: &str) -> Option<FetchedArticle> {
        if let Some(article) = self.try_direct(registry_id, article_number).await {
            return Some(article);
        }
        if let Some(article) = self.try_index(registry_id, article_number).await {
            return Some(article);
        }
        // Subpoint fallback: "117.3" -> "117", "22.e)" -> "22".
        let base = base_article_number(article_number);
        if base != article_number {
            if let Some(mut article) = Box::pin(self.fetch(registry_id, &base)).await {
                article.is_subpoint = true;
                article.subpoint_number = Some(article_number.to_string());
                return Some(article);
            }
        }
        None
    }

    /// Tries synthetic block ids in the order confirmed by the source
    /// fetcher: `a<n>`, the LOPJ Spanish-word form, `art<n>`, `a<n>bis`,
    /// `art<n>bis`.
    async fn try_direct(&self, registry_id: &str, article_number: &str) -> Option<FetchedArticle> {
        let base = base_article_number(article_number);
        let mut candidates = vec![format!("a{base}")];
        if let Ok(n) = base.parse::<u32>() {
            candidates.push(format!("a{}", number_to_spanish_words(n)));
        }
        candidates.push(format!("art{base}"));
        candidates.push(format!("a{base}bis"));
        candidates.push(format!("art{base}bis"));

        for block_id in candidates {
            if let Some(xml) = self.boe.fetch_block(registry_id, &block_id).await {
                if let Some(article) = extract_article_from_block(&xml, article_number) {
                    return Some(article);
                }
            }
        }
        None
    }

    async fn try_index(&self, registry_id: &str, article_number: &str) -> Option<FetchedArticle> {
        let index = self.boe.fetch_index(registry_id).await;
        if index.is_empty() {
            return None;
        }
        let base = base_article_number(article_number);
        let patterns = index_patterns(article_number, &base);

        for block in &index {
            if patterns.iter().any(|re| re.is_match(&block.title)) {
                if let Some(xml) = self.boe.fetch_block(registry_id, &block.block_id).await {
                    if let Some(article) = extract_article_from_block(&xml, article_number) {
                        return Some(article);
                    }
                }
            }
        }
        None
    }
}

fn base_article_number(article_number: &str) -> String {
    article_number
        .split('.')
        .next()
        .unwrap_or(article_number)
        .split(')')
        .next()
        .unwrap_or(article_number)
        .to_string()
}

fn index_patterns(full: &str, base: &str) -> Vec<Regex> {
    let mut patterns = Vec::new();
    let esc_full = regex::escape(full);
    let esc_base = regex::escape(base);
    if full != base {
        patterns.push(ci(&format!(r"^Art[ií]culo\s+{esc_full}\.?$")));
        patterns.push(ci(&format!(r"^Art[ií]culo\s+{esc_full}\b")));
    }
    patterns.push(ci(&format!(r"^Art[ií]culo\s+{esc_base}\.?$")));
    patterns.push(ci(&format!(r"^Art[ií]culo\s+{esc_base}\b")));
    patterns.push(ci(&format!(r"\bArt\.\s*{esc_base}\b")));
    patterns.into_iter().flatten().collect()
}

fn ci(pattern: &str) -> Option<Regex> {
    Regex::new(&format!("(?i){pattern}")).ok()
}

fn extract_article_from_block(xml: &str, _article_number: &str) -> Option<FetchedArticle> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current_tag = String::new();
    let mut code = String::new();
    let mut title = String::new();
    let mut body = String::new();
    let mut in_version = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                current_tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if current_tag == "bloque" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"titulo" {
                            title = String::from_utf8_lossy(&attr.value).to_string();
                        }
                    }
                } else if current_tag == "version" {
                    in_version = true;
                } else if in_version {
                    body.push('<');
                    body.push_str(&current_tag);
                    body.push('>');
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().to_string();
                if current_tag == "code" {
                    code.push_str(&text);
                } else if in_version {
                    body.push_str(&text);
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == "version" {
                    in_version = false;
                } else if in_version {
                    body.push_str("</");
                    body.push_str(&name);
                    body.push('>');
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    if code.trim() != "200" && !code.is_empty() {
        return None;
    }
    if body.is_empty() {
        return None;
    }
    Some(FetchedArticle {
        title,
        body_html: body,
        is_subpoint: false,
        subpoint_number: None,
    })
}

const UNITS: [&str; 10] = ["cero", "uno", "dos", "tres", "cuatro", "cinco", "seis", "siete", "ocho", "nueve"];
const TEENS: [&str; 10] = [
    "diez", "once", "doce", "trece", "catorce", "quince", "dieciséis", "diecisiete", "dieciocho", "diecinueve",
];
const TENS: [&str; 10] = [
    "", "", "veinte", "treinta", "cuarenta", "cincuenta", "sesenta", "setenta", "ochenta", "noventa",
];
const HUNDREDS: [&str; 10] = [
    "", "ciento", "doscientos", "trescientos", "cuatrocientos", "quinientos", "seiscientos", "setecientos",
    "ochocientos", "novecientos",
];

/// Spanish-number-to-words conversion used by the LOPJ block-id pattern
/// (e.g. article 117 -> "acientodiecisiete"). A pure function of the
/// article integer, deliberately kept standalone with its own tests.
pub fn number_to_spanish_words(n: u32) -> String {
    if n == 0 {
        return UNITS[0].to_string();
    }
    if n < 10 {
        return UNITS[n as usize].to_string();
    }
    if n < 20 {
        return TEENS[(n - 10) as usize].to_string();
    }
    if n < 100 {
        let tens = n / 10;
        let unit = n % 10;
        if unit == 0 {
            return TENS[tens as usize].to_string();
        }
        if tens == 2 {
            return format!("veinti{}", UNITS[unit as usize]);
        }
        return format!("{}y{}", TENS[tens as usize], UNITS[unit as usize]);
    }
    if n == 100 {
        return "cien".to_string();
    }
    if n < 1000 {
        let hundreds = n / 100;
        let rest = n % 100;
        let prefix = HUNDREDS[hundreds as usize];
        if rest == 0 {
            return prefix.to_string();
        }
        return format!("{}{}", prefix, number_to_spanish_words(rest));
    }
    // LOPJ article numbers never exceed a few hundred; fall back to the
    // decimal digits concatenated for anything unexpectedly large.
    n.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spanish_words_for_117() {
        assert_eq!(number_to_spanish_words(117), "cientodiecisiete");
    }

    #[test]
    fn spanish_words_small_numbers() {
        assert_eq!(number_to_spanish_words(7), "siete");
        assert_eq!(number_to_spanish_words(21), "veintiuno");
        assert_eq!(number_to_spanish_words(45), "cuarentaycinco");
    }

    #[test]
    fn base_article_number_strips_subpoints() {
        assert_eq!(base_article_number("117.3"), "117");
        assert_eq!(base_article_number("22.e)"), "22");
        assert_eq!(base_article_number("517.2.5.º"), "517");
        assert_eq!(base_article_number("17"), "17");
    }

    #[test]
    fn extracts_article_body_from_block_xml() {
        let xml = r#"<response><code>200</code><bloque titulo="Artículo 17"><version><p>Texto del articulo.</p></version></bloque></response>"#;
        let article = extract_article_from_block(xml, "17").expect("parsed");
        assert_eq!(article.title, "Artículo 17");
        assert!(article.body_html.contains("Texto del articulo."));
    }
}
