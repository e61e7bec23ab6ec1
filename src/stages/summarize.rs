//! Summarize step: one executor per [`LlmProvider`].
//!
//! | provider            | executor                | endpoint               |
//! |---------------------|-------------------------|------------------------|
//! | `openai_compatible` | [`ApiSummarizer`]       | `/v1/chat/completions` |
//! | `anthropic`         | [`AnthropicSummarizer`] | `/v1/messages`         |
//!
//! Both send the same prompt and store `summary.txt`.  All connection
//! details come from [`LlmConfig`].

use std::sync::Arc;

use async_trait::async_trait;

use super::http::{build_client, check_response, with_auth};
use super::prompt::PromptBuilder;
use super::{require_input, ExecutorError, StageExecutor};
use crate::config::{LlmConfig, LlmProvider};
use crate::paper::PaperMetadata;
use crate::pipeline::Step;
use crate::rate_limit::RateGate;
use crate::store::{read_text, ArtifactRef, ArtifactStore};

pub struct ApiSummarizer {
    client: reqwest::Client,
    config: LlmConfig,
    prompt_builder: PromptBuilder,
    store: Arc<dyn ArtifactStore>,
    gate: Arc<RateGate>,
}

impl ApiSummarizer {
    pub fn from_config(config: &LlmConfig, store: Arc<dyn ArtifactStore>, gate: Arc<RateGate>) -> Self {
        Self {
            client: build_client(),
            config: config.clone(),
            prompt_builder: PromptBuilder::new(config.max_input_chars),
            store,
            gate,
        }
    }

    /// Request body for one summary.
    fn request_body(&self, meta: &PaperMetadata, paper_text: &str) -> serde_json::Value {
        let (system_msg, user_msg) = self.prompt_builder.build_chat(meta, paper_text);
        serde_json::json!({
            "model":       self.config.model(),
            "messages": [
                { "role": "system", "content": system_msg },
                { "role": "user",   "content": user_msg   }
            ],
            "stream":      false,
            "temperature": self.config.temperature,
            "max_tokens":  self.config.max_tokens
        })
    }

    /// Send the text to the model and return its summary.
    pub async fn summarize(
        &self,
        meta: &PaperMetadata,
        paper_text: &str,
    ) -> Result<String, ExecutorError> {
        let url = format!("{}/v1/chat/completions", self.config.base_url());
        let body = self.request_body(meta, paper_text);

        self.gate.acquire().await;
        let req = with_auth(self.client.post(&url).json(&body), self.config.api_key.as_deref());
        let response = check_response(req.send().await?).await?;

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ExecutorError::retryable(format!("failed to parse LLM response: {e}")))?;
        parse_completion(&json)
    }
}

/// Text of the first choice; empty output is permanent.
fn parse_completion(json: &serde_json::Value) -> Result<String, ExecutorError> {
    non_empty(json["choices"][0]["message"]["content"].as_str())
}

fn non_empty(text: Option<&str>) -> Result<String, ExecutorError> {
    let text = text.unwrap_or_default().trim();
    if text.is_empty() {
        return Err(ExecutorError::permanent("LLM returned an empty response"));
    }
    Ok(text.to_string())
}

/// The summarizer selected by `config.provider`.
pub fn summarizer_for(
    config: &LlmConfig,
    store: Arc<dyn ArtifactStore>,
    gate: Arc<RateGate>,
) -> Arc<dyn StageExecutor> {
    match config.provider {
        LlmProvider::OpenaiCompatible => Arc::new(ApiSummarizer::from_config(config, store, gate)),
        LlmProvider::Anthropic => Arc::new(AnthropicSummarizer::from_config(config, store, gate)),
    }
}

#[async_trait]
impl StageExecutor for ApiSummarizer {
    async fn execute(
        &self,
        input: Option<&ArtifactRef>,
        metadata: &PaperMetadata,
    ) -> Result<ArtifactRef, ExecutorError> {
        let text = load_paper_text(self.store.as_ref(), input, metadata, self.config.model())?;
        let summary = self.summarize(metadata, &text).await?;
        store_summary(self.store.as_ref(), metadata, &summary)
    }
}

fn load_paper_text(
    store: &dyn ArtifactStore,
    input: Option<&ArtifactRef>,
    metadata: &PaperMetadata,
    model: &str,
) -> Result<String, ExecutorError> {
    let text = read_text(store, require_input(input)?)?;
    log::info!(
        "summarize: {} with {model} ({} chars in)",
        metadata.paper_id,
        text.chars().count()
    );
    Ok(text)
}

fn store_summary(
    store: &dyn ArtifactStore,
    metadata: &PaperMetadata,
    summary: &str,
) -> Result<ArtifactRef, ExecutorError> {
    log::info!(
        "summarize: {} done ({} chars out)",
        metadata.paper_id,
        summary.chars().count()
    );
    Ok(store.put(&metadata.paper_id, Step::Summarize, summary.as_bytes())?)
}

// ---------------------------------------------------------------------------
// AnthropicSummarizer
// ---------------------------------------------------------------------------

/// `anthropic-version` header sent with every Messages API request.
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicSummarizer {
    client: reqwest::Client,
    config: LlmConfig,
    prompt_builder: PromptBuilder,
    store: Arc<dyn ArtifactStore>,
    gate: Arc<RateGate>,
}

impl AnthropicSummarizer {
    pub fn from_config(config: &LlmConfig, store: Arc<dyn ArtifactStore>, gate: Arc<RateGate>) -> Self {
        Self {
            client: build_client(),
            config: config.clone(),
            prompt_builder: PromptBuilder::new(config.max_input_chars),
            store,
            gate,
        }
    }

    fn request_body(&self, meta: &PaperMetadata, paper_text: &str) -> serde_json::Value {
        let (system_msg, user_msg) = self.prompt_builder.build_chat(meta, paper_text);
        serde_json::json!({
            "model":       self.config.model(),
            "max_tokens":  self.config.max_tokens,
            "temperature": self.config.temperature,
            "system":      system_msg,
            "messages": [
                { "role": "user", "content": user_msg }
            ]
        })
    }

    pub async fn summarize(
        &self,
        meta: &PaperMetadata,
        paper_text: &str,
    ) -> Result<String, ExecutorError> {
        let url = format!("{}/v1/messages", self.config.base_url());
        let body = self.request_body(meta, paper_text);

        self.gate.acquire().await;
        let mut req = self
            .client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.header("x-api-key", key);
        }
        let response = check_response(req.send().await?).await?;

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ExecutorError::retryable(format!("failed to parse LLM response: {e}")))?;
        parse_message(&json)
    }
}

/// Text of the first `text` content block; empty output is permanent.
fn parse_message(json: &serde_json::Value) -> Result<String, ExecutorError> {
    let text = json["content"]
        .as_array()
        .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
        .and_then(|b| b["text"].as_str());
    non_empty(text)
}

#[async_trait]
impl StageExecutor for AnthropicSummarizer {
    async fn execute(
        &self,
        input: Option<&ArtifactRef>,
        metadata: &PaperMetadata,
    ) -> Result<ArtifactRef, ExecutorError> {
        let text = load_paper_text(self.store.as_ref(), input, metadata, self.config.model())?;
        let summary = self.summarize(metadata, &text).await?;
        store_summary(self.store.as_ref(), metadata, &summary)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::stages::ErrorClass;
    use crate::store::MemoryArtifactStore;

    fn make_config(api_key: Option<&str>) -> LlmConfig {
        LlmConfig {
            provider: LlmProvider::OpenaiCompatible,
            base_url: Some("http://localhost:11434".into()),
            api_key: api_key.map(|s| s.to_string()),
            model: Some("qwen2.5:3b".into()),
            temperature: 0.7,
            max_tokens: 4096,
            max_input_chars: 100,
        }
    }

    fn make(api_key: Option<&str>) -> ApiSummarizer {
        ApiSummarizer::from_config(
            &make_config(api_key),
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(RateGate::new("llm", Duration::ZERO)),
        )
    }

    #[test]
    fn request_body_uses_config() {
        let body = make(None).request_body(&PaperMetadata::bare("p"), "text");
        assert_eq!(body["model"], "qwen2.5:3b");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert!(body["messages"][1]["content"]
            .as_str()
            .unwrap()
            .contains("Paper content:\ntext"));
    }

    #[test]
    fn completion_text_is_trimmed() {
        let json = serde_json::json!({
            "choices": [{ "message": { "content": "  A spoken summary. \n" } }]
        });
        assert_eq!(parse_completion(&json).unwrap(), "A spoken summary.");
    }

    #[test]
    fn empty_completion_is_permanent() {
        for json in [
            serde_json::json!({ "choices": [] }),
            serde_json::json!({ "choices": [{ "message": { "content": "   " } }] }),
        ] {
            assert_eq!(parse_completion(&json).unwrap_err().class, ErrorClass::Permanent);
        }
    }

    #[tokio::test]
    async fn missing_input_is_permanent() {
        let err = make(Some("sk-test"))
            .execute(None, &PaperMetadata::bare("p"))
            .await
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::Permanent);
    }

    fn make_anthropic() -> AnthropicSummarizer {
        let config = LlmConfig {
            provider: LlmProvider::Anthropic,
            api_key: Some("sk-ant-test".into()),
            ..LlmConfig::default()
        };
        AnthropicSummarizer::from_config(
            &config,
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(RateGate::new("llm", Duration::ZERO)),
        )
    }

    #[test]
    fn anthropic_request_body_uses_config() {
        let body = make_anthropic().request_body(&PaperMetadata::bare("p"), "text");
        assert_eq!(body["model"], "claude-haiku-4-5");
        assert_eq!(body["max_tokens"], 4096);
        assert!(body["system"].as_str().unwrap().contains("spoken summaries"));
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains("Paper content:\ntext"));
    }

    #[test]
    fn anthropic_message_text_is_trimmed() {
        let json = serde_json::json!({
            "content": [{ "type": "text", "text": " A spoken summary.\n" }],
            "stop_reason": "end_turn"
        });
        assert_eq!(parse_message(&json).unwrap(), "A spoken summary.");
    }

    #[test]
    fn anthropic_empty_message_is_permanent() {
        for json in [
            serde_json::json!({ "content": [] }),
            serde_json::json!({ "content": [{ "type": "text", "text": "  " }] }),
            serde_json::json!({ "type": "error" }),
        ] {
            assert_eq!(parse_message(&json).unwrap_err().class, ErrorClass::Permanent);
        }
    }

    #[tokio::test]
    async fn anthropic_missing_input_is_permanent() {
        let err = make_anthropic()
            .execute(None, &PaperMetadata::bare("p"))
            .await
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::Permanent);
    }

    /// Verify that both summarizers are usable as `dyn StageExecutor`.
    #[test]
    fn summarizers_are_object_safe() {
        let exec: Box<dyn StageExecutor> = Box::new(make(None));
        drop(exec);
        let exec: Box<dyn StageExecutor> = Box::new(make_anthropic());
        drop(exec);
    }
}
