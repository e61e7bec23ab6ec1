//! Extract step: PDF text layer to plain text.

use std::sync::Arc;

use async_trait::async_trait;

use super::{require_input, ExecutorError, StageExecutor};
use crate::paper::PaperMetadata;
use crate::pipeline::Step;
use crate::store::{ArtifactRef, ArtifactStore};

/// Pulls the embedded text out of `paper.pdf` with `pdf-extract`.
///
/// Parsing runs on the blocking pool.  A PDF without a text layer (scanned
/// pages) yields no text and fails permanently.
pub struct PdfTextExtractor {
    store: Arc<dyn ArtifactStore>,
}

impl PdfTextExtractor {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StageExecutor for PdfTextExtractor {
    async fn execute(
        &self,
        input: Option<&ArtifactRef>,
        metadata: &PaperMetadata,
    ) -> Result<ArtifactRef, ExecutorError> {
        let pdf = self.store.read(require_input(input)?)?;
        log::debug!(
            "extract: parsing {} ({} bytes)",
            metadata.paper_id,
            pdf.len()
        );

        let text = tokio::task::spawn_blocking(move || extract_text(&pdf))
            .await
            .map_err(|e| ExecutorError::permanent(format!("PDF parser crashed: {e}")))??;

        log::info!(
            "extract: {} yielded {} chars",
            metadata.paper_id,
            text.chars().count()
        );
        Ok(self
            .store
            .put(&metadata.paper_id, Step::Extract, text.as_bytes())?)
    }
}

/// Text of a PDF, whitespace tidied.
pub fn extract_text(pdf: &[u8]) -> Result<String, ExecutorError> {
    let raw = pdf_extract::extract_text_from_mem(pdf)
        .map_err(|e| ExecutorError::permanent(format!("PDF parsing failed: {e}")))?;
    let text = tidy(&raw);
    if text.is_empty() {
        return Err(ExecutorError::permanent("PDF contains no extractable text"));
    }
    Ok(text)
}

/// Trim trailing spaces on every line and collapse runs of blank lines.
fn tidy(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut blank_run = 0;
    for line in raw.lines().map(str::trim_end) {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}
