use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{DiskCache, Ttl};

pub const BOE_API_BASE: &str = "https://www.boe.es/datosabiertos/api";
const USER_AGENT: &str = "Mozilla/5.0 (compatible; LegalReferenceExtractor/1.0)";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexBlock {
    pub block_id: String,
    pub title: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub registry_id: String,
    pub title: String,
}

/// Minimal read-only client for the BOE "legislación consolidada" API.
/// Every method goes through an on-disk cache keyed by request
/// parameters; network failures return `None`/`empty` rather than
/// propagating, matching the fetcher's "strategy cascade moves on"
/// contract.
pub struct BoeClient {
    http: reqwest::Client,
    api_base: String,
    cache: DiskCache,
}

impl BoeClient {
    pub fn new(api_base: impl Into<String>, cache_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
            cache: DiskCache::new(cache_dir),
        }
    }

    /// `search_law(number, year) -> registry_id?`. Searches by
    /// `numero_oficial:<number>/<year>` and returns the first hit whose
    /// title plausibly matches; callers that need title confirmation
    /// should use `search_law_hits` instead.
    pub async fn search_law(&self, number: &str, year: &str) -> Option<String> {
        self.search_law_hits(number, year).await.into_iter().next().map(|h| h.registry_id)
    }

    pub async fn search_law_hits(&self, number: &str, year: &str) -> Vec<SearchHit> {
        let cache_key = format!("{number}/{year}");
        if let Some(hits) = self.cache.get::<Vec<SearchHit>>("boe_search", &cache_key, Ttl::hours(24)) {
            return hits;
        }

        let query = serde_json::json!({
            "query": {"query_string": {"query": format!("numero_oficial:{number}/{year}")}}
        });
        let url = format!(
            "{}/legislacion-consolidada?query={}&limit=5",
            self.api_base,
            urlencoding::encode(&query.to_string())
        );

        let Ok(response) = self.http.get(&url).header("User-Agent", USER_AGENT).send().await else {
            warn!(number, year, "boe search request failed");
            return Vec::new();
        };
        let Ok(body) = response.text().await else {
            return Vec::new();
        };
        let hits = parse_search_results(&body);
        if !hits.is_empty() {
            self.cache.put("boe_search", &cache_key, &hits);
        }
        hits
    }

    /// `fetch_index(registry_id) -> [{block_id, title}]`. Cached
    /// separately from article bodies with a 30-day TTL: indices rarely
    /// change for a consolidated norm.
    pub async fn fetch_index(&self, registry_id: &str) -> Vec<IndexBlock> {
        if let Some(blocks) = self.cache.get::<Vec<IndexBlock>>("boe_index", registry_id, Ttl::days(30)) {
            return blocks;
        }
        let url = format!("{}/legislacion-consolidada/id/{registry_id}/texto/indice", self.api_base);
        let Ok(response) = self.http.get(&url).header("User-Agent", USER_AGENT).send().await else {
            return Vec::new();
        };
        let Ok(body) = response.text().await else {
            return Vec::new();
        };
        let blocks = parse_index(&body);
        debug!(registry_id, count = blocks.len(), "fetched boe index");
        if !blocks.is_empty() {
            self.cache.put("boe_index", registry_id, &blocks);
        }
        blocks
    }

    /// `fetch_block(registry_id, block_id) -> xml_or_null`. Consolidated
    /// law text is immutable once published, so this is cached with a
    /// 30-day TTL.
    pub async fn fetch_block(&self, registry_id: &str, block_id: &str) -> Option<String> {
        let cache_key = format!("{registry_id}/{block_id}");
        if let Some(xml) = self.cache.get::<String>("boe_block", &cache_key, Ttl::days(30)) {
            return Some(xml);
        }
        let url = format!(
            "{}/legislacion-consolidada/id/{registry_id}/texto/bloque/{block_id}",
            self.api_base
        );
        let response = self.http.get(&url).header("User-Agent", USER_AGENT).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body = response.text().await.ok()?;
        self.cache.put("boe_block", &cache_key, &body);
        Some(body)
    }

    /// `fetch_title(boe_id) -> title?`. Titles are immutable, so they
    /// have no expiry.
    pub async fn fetch_title(&self, registry_id: &str) -> Option<String> {
        if let Some(title) = self.cache.get::<String>("boe_title", registry_id, Ttl::NO_EXPIRY) {
            return Some(title);
        }
        let url = format!("{}/legislacion-consolidada/id/{registry_id}", self.api_base);
        let response = self.http.get(&url).header("User-Agent", USER_AGENT).send().await.ok()?;
        let body = response.text().await.ok()?;
        let title = parse_first_tag(&body, "titulo")?;
        self.cache.put("boe_title", registry_id, &title);
        Some(title)
    }

    pub fn registry_url(registry_id: &str) -> String {
        format!("https://www.boe.es/buscar/act.php?id={registry_id}")
    }

    pub fn article_url(registry_id: &str, article: &str) -> String {
        format!("{}#a{article}", Self::registry_url(registry_id))
    }
}

fn parse_search_results(xml: &str) -> Vec<SearchHit> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut hits = Vec::new();
    let mut buf = Vec::new();
    let mut current_tag = String::new();
    let mut identificador = String::new();
    let mut titulo = String::new();
    let mut in_item = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                current_tag = tag_name(&e);
                if current_tag == "item" {
                    in_item = true;
                    identificador.clear();
                    titulo.clear();
                }
            }
            Ok(Event::Text(t)) => {
                if in_item {
                    let text = t.unescape().unwrap_or_default().to_string();
                    match current_tag.as_str() {
                        "identificador" => identificador.push_str(&text),
                        "titulo" => titulo.push_str(&text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                if tag_name_end(&e) == "item" && in_item {
                    if !identificador.is_empty() {
                        hits.push(SearchHit {
                            registry_id: identificador.clone(),
                            title: titulo.clone(),
                        });
                    }
                    in_item = false;
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    hits
}

fn parse_index(xml: &str) -> Vec<IndexBlock> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut blocks = Vec::new();
    let mut buf = Vec::new();
    let mut current_tag = String::new();
    let mut id = String::new();
    let mut title = String::new();
    let mut updated = String::new();
    let mut in_block = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                current_tag = tag_name(&e);
                if current_tag == "bloque" {
                    in_block = true;
                    id.clear();
                    title.clear();
                    updated.clear();
                }
            }
            Ok(Event::Text(t)) => {
                if in_block {
                    let text = t.unescape().unwrap_or_default().to_string();
                    match current_tag.as_str() {
                        "id" => id.push_str(&text),
                        "titulo" => title.push_str(&text),
                        "fecha_actualizacion" => updated.push_str(&text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                if tag_name_end(&e) == "bloque" && in_block {
                    if !id.is_empty() && !title.is_empty() {
                        blocks.push(IndexBlock {
                            block_id: id.clone(),
                            title: title.clone(),
                            updated_at: updated.clone(),
                        });
                    }
                    in_block = false;
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    blocks
}

fn parse_first_tag(xml: &str, wanted: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current_tag = String::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => current_tag = tag_name(&e),
            Ok(Event::Text(t)) => {
                if current_tag == wanted {
                    return Some(t.unescape().unwrap_or_default().to_string());
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    None
}

fn tag_name(e: &quick_xml::events::BytesStart) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_string()
}

fn tag_name_end(e: &quick_xml::events::BytesEnd) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_search_results() {
        let xml = r#"<response><item><identificador>BOE-A-2015-10565</identificador><titulo>Ley 39/2015, de 1 de octubre</titulo></item></response>"#;
        let hits = parse_search_results(xml);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].registry_id, "BOE-A-2015-10565");
    }

    #[test]
    fn parses_index_blocks_skipping_empty_entries() {
        let xml = r#"<indice>
            <bloque><id>a117</id><titulo>Artículo 117</titulo><fecha_actualizacion>2020-01-01</fecha_actualizacion></bloque>
            <bloque><id></id><titulo></titulo></bloque>
        </indice>"#;
        let blocks = parse_index(xml);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].block_id, "a117");
    }

    #[test]
    fn registry_url_format() {
        assert_eq!(
            BoeClient::registry_url("BOE-A-2015-10565"),
            "https://www.boe.es/buscar/act.php?id=BOE-A-2015-10565"
        );
        assert_eq!(
            BoeClient::article_url("BOE-A-2015-10565", "17"),
            "https://www.boe.es/buscar/act.php?id=BOE-A-2015-10565#a17"
        );
    }
}
