//! arXiv client and the Download executor.
//!
//! Metadata comes from the Atom API (`/api/query?id_list=…`), the PDF from
//! `{pdf_base_url}/{id}`.  Both calls go through the shared arXiv
//! [`RateGate`]; arXiv asks for at least three seconds between requests.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

use super::http::{build_client, classify_status};
use super::{ExecutorError, StageExecutor};
use crate::config::ArxivConfig;
use crate::paper::{normalize_paper_id, PaperMetadata};
use crate::pipeline::Step;
use crate::rate_limit::RateGate;
use crate::store::{ArtifactRef, ArtifactStore};

// ---------------------------------------------------------------------------
// ArxivError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ArxivError {
    #[error("arXiv request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("arXiv returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("paper not found on arXiv: {0}")]
    NotFound(String),

    /// The download did not look like a PDF.
    #[error("not a PDF: {0}")]
    NotPdf(String),
}

impl From<ArxivError> for ExecutorError {
    fn from(e: ArxivError) -> Self {
        match e {
            ArxivError::Request(e) => ExecutorError::from(e),
            ArxivError::Status { status, body } => match reqwest::StatusCode::from_u16(status) {
                Ok(code) => classify_status(code, &body),
                Err(_) => ExecutorError::permanent(format!("HTTP {status}")),
            },
            e @ (ArxivError::NotFound(_) | ArxivError::NotPdf(_)) => {
                ExecutorError::permanent(e.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ArxivClient
// ---------------------------------------------------------------------------

pub struct ArxivClient {
    client: reqwest::Client,
    config: ArxivConfig,
    gate: Arc<RateGate>,
}

impl ArxivClient {
    pub fn new(config: &ArxivConfig, gate: Arc<RateGate>) -> Self {
        Self {
            client: build_client(),
            config: config.clone(),
            gate,
        }
    }

    /// Metadata of one paper.
    pub async fn fetch_metadata(&self, paper_id: &str) -> Result<PaperMetadata, ArxivError> {
        let query = [("id_list", paper_id), ("max_results", "1")];
        let feed = self.get_feed(&query).await?;
        parse_feed(&feed)
            .into_iter()
            .next()
            .ok_or_else(|| ArxivError::NotFound(paper_id.to_string()))
    }

    /// Most recently submitted papers matching a free-text query.
    pub async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<PaperMetadata>, ArxivError> {
        log::info!("arxiv: searching '{query}' (max {max_results})");
        let search_query = format!("all:{query}");
        let max = max_results.to_string();
        let params = [
            ("search_query", search_query.as_str()),
            ("start", "0"),
            ("max_results", max.as_str()),
            ("sortBy", "submittedDate"),
            ("sortOrder", "descending"),
        ];
        let feed = self.get_feed(&params).await?;
        let papers = parse_feed(&feed);
        log::info!("arxiv: found {} papers", papers.len());
        Ok(papers)
    }

    /// Raw PDF bytes of a paper.
    pub async fn download_pdf(&self, meta: &PaperMetadata) -> Result<Vec<u8>, ArxivError> {
        let url = meta
            .pdf_url
            .clone()
            .unwrap_or_else(|| format!("{}/{}", self.config.pdf_base_url, meta.paper_id));

        self.gate.acquire().await;
        log::debug!("arxiv: GET {url}");
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ArxivError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?.to_vec();
        if !bytes.starts_with(b"%PDF") {
            return Err(ArxivError::NotPdf(url));
        }
        Ok(bytes)
    }

    async fn get_feed(&self, query: &[(&str, &str)]) -> Result<String, ArxivError> {
        self.gate.acquire().await;
        let response = self
            .client
            .get(&self.config.api_url)
            .query(query)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ArxivError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

// ---------------------------------------------------------------------------
// ArxivDownloader (Download step)
// ---------------------------------------------------------------------------

/// Fetches metadata and PDF; stores `metadata.json` and `paper.pdf`.
pub struct ArxivDownloader {
    arxiv: ArxivClient,
    store: Arc<dyn ArtifactStore>,
}

impl ArxivDownloader {
    pub fn new(arxiv: ArxivClient, store: Arc<dyn ArtifactStore>) -> Self {
        Self { arxiv, store }
    }
}

#[async_trait]
impl StageExecutor for ArxivDownloader {
    async fn execute(
        &self,
        _input: Option<&ArtifactRef>,
        metadata: &PaperMetadata,
    ) -> Result<ArtifactRef, ExecutorError> {
        let paper_id = &metadata.paper_id;
        let mut meta = self.arxiv.fetch_metadata(paper_id).await?;
        // Keep the key the caller used; the feed id may differ in form.
        meta.paper_id = paper_id.clone();
        log::info!("arxiv: {paper_id} is \"{}\"", meta.display_title());
        self.store.put_metadata(&meta)?;

        let pdf = self.arxiv.download_pdf(&meta).await?;
        log::info!("arxiv: downloaded {paper_id} ({} bytes)", pdf.len());
        Ok(self.store.put(paper_id, Step::Download, &pdf)?)
    }
}

// ---------------------------------------------------------------------------
// Atom feed parsing
// ---------------------------------------------------------------------------

static ENTRY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<entry>(.*?)</entry>").expect("valid regex"));
static AUTHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<author>\s*<name>(.*?)</name>").expect("valid regex")
});
static CATEGORY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<category[^>]*\bterm="([^"]+)""#).expect("valid regex"));
static LINK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<link\b[^>]*>").expect("valid regex"));
static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(lt|gt|quot|apos|amp|#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6});").expect("valid regex")
});
static HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bhref="([^"]+)""#).expect("valid regex"));

/// Parse an arXiv Atom feed into metadata records.
///
/// Entries without a usable id (including the API's error entries) are
/// skipped.
pub fn parse_feed(xml: &str) -> Vec<PaperMetadata> {
    ENTRY_RE
        .captures_iter(xml)
        .filter_map(|c| parse_entry(c.get(1)?.as_str()))
        .collect()
}

fn parse_entry(entry: &str) -> Option<PaperMetadata> {
    let raw_id = tag_text(entry, "id")?;
    if raw_id.contains("/api/errors") {
        log::warn!("arxiv: API error entry: {}", tag_text(entry, "summary").unwrap_or_default());
        return None;
    }
    let paper_id = normalize_paper_id(&raw_id)?;

    let published = tag_text(entry, "published")
        .and_then(|p| DateTime::parse_from_rfc3339(&p).ok())
        .map(|d| d.with_timezone(&Utc));

    let pdf_url = LINK_RE
        .find_iter(entry)
        .map(|m| m.as_str())
        .find(|link| link.contains(r#"title="pdf""#))
        .and_then(|link| HREF_RE.captures(link))
        .map(|c| c[1].to_string());

    Some(PaperMetadata {
        paper_id,
        title: tag_text(entry, "title"),
        authors: AUTHOR_RE
            .captures_iter(entry)
            .map(|c| clean_text(&c[1]))
            .collect(),
        summary: tag_text(entry, "summary"),
        published,
        categories: CATEGORY_RE
            .captures_iter(entry)
            .map(|c| c[1].to_string())
            .collect(),
        pdf_url,
    })
}

/// Text of the first `<tag>…</tag>`, whitespace collapsed and entities
/// decoded.
fn tag_text(entry: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = entry.find(&open)? + open.len();
    let end = start + entry[start..].find(&close)?;
    let text = clean_text(&entry[start..end]);
    (!text.is_empty()).then_some(text)
}

fn clean_text(raw: &str) -> String {
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    decode_entities(&text)
}

/// Decode XML entities in one pass, so `&amp;lt;` stays `&lt;`.  Numeric
/// references that name no valid char are left as written.
fn decode_entities(text: &str) -> String {
    ENTITY_RE
        .replace_all(text, |c: &regex::Captures<'_>| {
            let name = &c[1];
            let decoded = match name {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "amp" => Some('&'),
                _ => {
                    let code = match name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => name[1..].parse::<u32>().ok(),
                    };
                    code.and_then(char::from_u32)
                }
            };
            decoded.map_or_else(|| c[0].to_string(), String::from)
        })
        .into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
