//! Prompt builder for spoken paper summaries.
//!
//! [`PromptBuilder`] turns paper metadata plus extracted text into a
//! `(system_msg, user_msg)` pair, sent as chat messages or as the Messages
//! API `system` field plus one user turn.  Text longer than the configured budget
//! is cut at a character boundary and marked as truncated.

use crate::paper::PaperMetadata;

// ---------------------------------------------------------------------------
// System instruction
// ---------------------------------------------------------------------------

const SYSTEM_INSTRUCTION: &str = "\
You write spoken summaries of research papers for a listener who cannot see the text.
Task: Explain what the paper is about, what it contributes and why it matters.

Rules:
1. Write plain prose meant to be read aloud: no headings, bullet points, tables or markdown.
2. Spell out symbols and abbreviations the first time they appear.
3. Describe equations and figures in words instead of quoting them.
4. Stay faithful to the paper; do not invent results.
5. Reply with ONLY the summary text.";

const TRUNCATION_MARKER: &str = "\n\n[... paper text truncated ...]";

// ---------------------------------------------------------------------------
// PromptBuilder
// ---------------------------------------------------------------------------

/// Builds summary prompts.
///
/// # Example
/// ```rust
/// use arxiv_to_speech::paper::PaperMetadata;
/// use arxiv_to_speech::stages::PromptBuilder;
///
/// let builder = PromptBuilder::new(10_000);
/// let meta = PaperMetadata::bare("1706.03762");
/// let (system, user) = builder.build_chat(&meta, "We propose the Transformer.");
/// assert!(system.contains("spoken summaries"));
/// assert!(user.contains("We propose the Transformer."));
/// ```
pub struct PromptBuilder {
    max_input_chars: usize,
}

impl PromptBuilder {
    pub fn new(max_input_chars: usize) -> Self {
        Self { max_input_chars }
    }

    /// Build a **(system_msg, user_msg)** pair.
    ///
    /// The user message holds, in order: title, authors, publication month
    /// (when known), then the paper text.
    pub fn build_chat(&self, meta: &PaperMetadata, paper_text: &str) -> (String, String) {
        let mut user_msg = String::with_capacity(paper_text.len().min(self.max_input_chars) + 512);
        user_msg.push_str(&format!("Title: {}\n", meta.display_title()));
        user_msg.push_str(&format!("Authors: {}\n", meta.authors_line()));
        if let Some(month) = meta.published_month() {
            user_msg.push_str(&format!("Published: {month}\n"));
        }
        user_msg.push_str("\nPaper content:\n");
        user_msg.push_str(&self.truncate(paper_text));
        user_msg.push_str("\n\nSummary:\n");

        (SYSTEM_INSTRUCTION.to_string(), user_msg)
    }

    fn truncate(&self, text: &str) -> String {
        match text.char_indices().nth(self.max_input_chars) {
            None => text.to_string(),
            Some((cut, _)) => {
                log::debug!(
                    "prompt: truncating paper text from {} bytes to {cut}",
                    text.len()
                );
                let mut out = text[..cut].to_string();
                out.push_str(TRUNCATION_MARKER);
                out
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn attention() -> PaperMetadata {
        let mut meta = PaperMetadata::bare("1706.03762");
        meta.title = Some("Attention Is All You Need".into());
        meta.authors = vec!["Ashish Vaswani".into(), "Noam Shazeer".into()];
        meta.published = Some(Utc.with_ymd_and_hms(2017, 6, 12, 17, 57, 34).unwrap());
        meta
    }

    #[test]
    fn user_message_carries_metadata() {
        let (_, user) = PromptBuilder::new(1000).build_chat(&attention(), "body");
        assert!(user.starts_with("Title: Attention Is All You Need\n"));
        assert!(user.contains("Authors: Ashish Vaswani, Noam Shazeer\n"));
        assert!(user.contains("Published: June 2017\n"));
        assert!(user.contains("Paper content:\nbody"));
    }

    #[test]
    fn missing_metadata_uses_fallbacks() {
        let (_, user) = PromptBuilder::new(1000).build_chat(&PaperMetadata::bare("x"), "t");
        assert!(user.contains("Title: x\n"));
        assert!(user.contains("Authors: Unknown\n"));
        assert!(!user.contains("Published:"));
    }

    #[test]
    fn long_text_is_truncated_on_char_boundary() {
        let text = "é".repeat(50);
        let (_, user) = PromptBuilder::new(10).build_chat(&attention(), &text);
        assert!(user.contains(&format!("{}{}", "é".repeat(10), TRUNCATION_MARKER)));
        assert!(!user.contains(&"é".repeat(11)));
    }

    #[test]
    fn short_text_is_untouched() {
        let (_, user) = PromptBuilder::new(10).build_chat(&attention(), "0123456789");
        assert!(user.contains("0123456789\n\nSummary:"));
        assert!(!user.contains("truncated"));
    }
}
