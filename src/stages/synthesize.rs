//! Synthesize step: summary text to MP3 via `/v1/audio/speech`.
//!
//! The speech endpoint accepts at most [`MAX_TTS_CHARS`] characters per
//! request, so the summary is split at sentence boundaries and the MP3
//! responses are concatenated (MP3 frames are self-delimiting).

use std::sync::Arc;

use async_trait::async_trait;

use super::http::{build_client, check_response, with_auth};
use super::{require_input, ExecutorError, StageExecutor};
use crate::config::TtsConfig;
use crate::paper::PaperMetadata;
use crate::pipeline::Step;
use crate::rate_limit::RateGate;
use crate::store::{read_text, ArtifactRef, ArtifactStore};

/// Input limit of the OpenAI speech endpoint.
pub const MAX_TTS_CHARS: usize = 4096;

pub struct ApiSynthesizer {
    client: reqwest::Client,
    config: TtsConfig,
    store: Arc<dyn ArtifactStore>,
    gate: Arc<RateGate>,
}

impl ApiSynthesizer {
    pub fn from_config(config: &TtsConfig, store: Arc<dyn ArtifactStore>, gate: Arc<RateGate>) -> Self {
        Self {
            client: build_client(),
            config: config.clone(),
            store,
            gate,
        }
    }

    fn request_body(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "model":           self.config.model,
            "voice":           self.config.voice,
            "input":           text,
            "response_format": "mp3"
        })
    }

    async fn speak(&self, text: &str) -> Result<Vec<u8>, ExecutorError> {
        let url = format!("{}/v1/audio/speech", self.config.base_url.trim_end_matches('/'));
        self.gate.acquire().await;
        let req = with_auth(
            self.client.post(&url).json(&self.request_body(text)),
            self.config.api_key.as_deref(),
        );
        let response = check_response(req.send().await?).await?;
        let audio = response.bytes().await?;
        if audio.is_empty() {
            return Err(ExecutorError::retryable("TTS returned no audio"));
        }
        Ok(audio.to_vec())
    }
}

#[async_trait]
impl StageExecutor for ApiSynthesizer {
    async fn execute(
        &self,
        input: Option<&ArtifactRef>,
        metadata: &PaperMetadata,
    ) -> Result<ArtifactRef, ExecutorError> {
        let summary = read_text(self.store.as_ref(), require_input(input)?)?;
        let chunks = split_for_tts(&summary, MAX_TTS_CHARS);
        if chunks.is_empty() {
            return Err(ExecutorError::permanent("summary is empty"));
        }
        log::info!(
            "synthesize: {} with {}/{} ({} chunks)",
            metadata.paper_id,
            self.config.model,
            self.config.voice,
            chunks.len()
        );

        let mut audio = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let part = self.speak(chunk).await?;
            log::debug!("synthesize: chunk {}/{} → {} bytes", i + 1, chunks.len(), part.len());
            audio.extend_from_slice(&part);
        }

        Ok(self
            .store
            .put(&metadata.paper_id, Step::Synthesize, &audio)?)
    }
}

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

/// Split `text` into pieces of at most `max_chars` characters.
///
/// Cuts prefer the last sentence end (`.`, `!`, `?` followed by whitespace)
/// inside the window, then the last whitespace, then a hard cut.
pub fn split_for_tts(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text.trim();

    while !rest.is_empty() {
        // Byte offset just past `max_chars` characters, or the whole rest.
        let window_end = rest
            .char_indices()
            .nth(max_chars)
            .map_or(rest.len(), |(i, _)| i);
        if window_end == rest.len() {
            chunks.push(rest.to_string());
            break;
        }

        let window = &rest[..window_end];
        let cut = sentence_cut(window)
            .or_else(|| window.rfind(char::is_whitespace).filter(|&i| i > 0))
            .unwrap_or(window_end);

        let (head, tail) = rest.split_at(cut);
        let head = head.trim();
        if !head.is_empty() {
            chunks.push(head.to_string());
        }
        rest = tail.trim_start();
    }
    chunks
}

/// Byte offset just after the last sentence terminator in `window` that is
/// followed by whitespace.
fn sentence_cut(window: &str) -> Option<usize> {
    let bytes = window.as_bytes();
    (1..bytes.len())
        .rev()
        .find(|&i| matches!(bytes[i - 1], b'.' | b'!' | b'?') && bytes[i].is_ascii_whitespace())
}
