//! Paper identifiers and metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata handed to every stage executor.
///
/// Written by the download step next to the PDF.  Before that (or when the
/// file is missing) a bare record holding only the id is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperMetadata {
    pub paper_id: String,
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    /// The arXiv abstract.
    pub summary: Option<String>,
    pub published: Option<DateTime<Utc>>,
    #[serde(default)]
    pub categories: Vec<String>,
    pub pdf_url: Option<String>,
}

impl PaperMetadata {
    /// Metadata carrying nothing but the identifier.
    pub fn bare(paper_id: impl Into<String>) -> Self {
        Self {
            paper_id: paper_id.into(),
            title: None,
            authors: Vec::new(),
            summary: None,
            published: None,
            categories: Vec::new(),
            pdf_url: None,
        }
    }

    /// Title for prompts and logs; falls back to the id.
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.paper_id)
    }

    /// `"A, B, C"` or `"Unknown"`.
    pub fn authors_line(&self) -> String {
        if self.authors.is_empty() {
            "Unknown".to_string()
        } else {
            self.authors.join(", ")
        }
    }

    /// Publication month, e.g. `"June 2017"`.
    pub fn published_month(&self) -> Option<String> {
        self.published.map(|p| p.format("%B %Y").to_string())
    }
}

/// Normalize a user-supplied arXiv identifier.
///
/// Strips surrounding whitespace, an `arXiv:` prefix, a URL prefix
/// (`https://arxiv.org/abs/…` or `/pdf/…`), a trailing `.pdf` and the version
/// suffix (`v2`).  Returns `None` for an empty result.
///
/// ```
/// use arxiv_to_speech::paper::normalize_paper_id;
///
/// assert_eq!(normalize_paper_id("arXiv:1706.03762v7").as_deref(), Some("1706.03762"));
/// assert_eq!(normalize_paper_id("hep-th/9901001v1").as_deref(), Some("hep-th/9901001"));
/// ```
pub fn normalize_paper_id(raw: &str) -> Option<String> {
    let mut id = raw.trim();

    for prefix in [
        "https://arxiv.org/abs/",
        "http://arxiv.org/abs/",
        "https://arxiv.org/pdf/",
        "http://arxiv.org/pdf/",
        "arXiv:",
        "arxiv:",
    ] {
        if let Some(rest) = id.strip_prefix(prefix) {
            id = rest;
        }
    }
    id = id.strip_suffix(".pdf").unwrap_or(id);

    // Version suffix: a trailing `v` followed only by digits.
    if let Some(pos) = id.rfind('v') {
        let digits = &id[pos + 1..];
        if pos > 0 && !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            id = &id[..pos];
        }
    }

    let id = id.trim_matches('/');
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}
