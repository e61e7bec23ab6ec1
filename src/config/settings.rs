//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across tasks.
//! Every section is `#[serde(default)]`, so a `settings.toml` only needs the
//! keys it wants to change.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::AppPaths;
use crate::pipeline::Step;

/// Environment variables consulted when an API key is left empty.
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

// ---------------------------------------------------------------------------
// StorageConfig
// ---------------------------------------------------------------------------

/// Where the artifact store lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the artifact store.  `None` means the platform data dir.
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// The configured data dir, or the platform default.
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| AppPaths::new().data_dir)
    }
}

// ---------------------------------------------------------------------------
// PipelineConfig
// ---------------------------------------------------------------------------

/// Retry, livelock and timeout policy of the state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Attempts per step before a retryable failure escalates to `Failed`.
    pub max_attempts: u32,
    /// Upper bound on `advance` calls made by one `run_to_completion`.
    pub max_total_steps: u32,
    /// Backoff before the second attempt; doubles per further attempt.
    pub backoff_base_ms: u64,
    /// Ceiling for the backoff delay.
    pub backoff_max_ms: u64,
    pub download_timeout_secs: u64,
    pub extract_timeout_secs: u64,
    pub summarize_timeout_secs: u64,
    pub synthesize_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_total_steps: 32,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            download_timeout_secs: 120,
            extract_timeout_secs: 120,
            summarize_timeout_secs: 180,
            synthesize_timeout_secs: 300,
        }
    }
}

impl PipelineConfig {
    /// Timeout applied to a single executor call for `step`.
    pub fn timeout_for(&self, step: Step) -> Duration {
        let secs = match step {
            Step::Download => self.download_timeout_secs,
            Step::Extract => self.extract_timeout_secs,
            Step::Summarize => self.summarize_timeout_secs,
            Step::Synthesize => self.synthesize_timeout_secs,
        };
        Duration::from_secs(secs)
    }
}

// ---------------------------------------------------------------------------
// RateLimitConfig
// ---------------------------------------------------------------------------

/// Minimum spacing between two calls to the same external API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// arXiv asks for one request every 3 seconds.
    pub arxiv_interval_ms: u64,
    pub llm_interval_ms: u64,
    pub tts_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            arxiv_interval_ms: 3_000,
            llm_interval_ms: 500,
            tts_interval_ms: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// ArxivConfig
// ---------------------------------------------------------------------------

/// arXiv endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArxivConfig {
    /// Atom query API (`?id_list=` / `?search_query=`).
    pub api_url: String,
    /// Prefix for PDF downloads; the paper id is appended.
    pub pdf_base_url: String,
}

impl Default for ArxivConfig {
    fn default() -> Self {
        Self {
            api_url: "https://export.arxiv.org/api/query".into(),
            pdf_base_url: "https://arxiv.org/pdf".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// LlmProvider
// ---------------------------------------------------------------------------

/// Which API serves the summarize step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    /// `/v1/chat/completions` (OpenAI, Groq, Ollama, vLLM …).
    #[default]
    OpenaiCompatible,
    /// Anthropic Messages API (`/v1/messages`).
    Anthropic,
}

impl LlmProvider {
    pub fn default_base_url(self) -> &'static str {
        match self {
            LlmProvider::OpenaiCompatible => "https://api.openai.com",
            LlmProvider::Anthropic => "https://api.anthropic.com",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            LlmProvider::OpenaiCompatible => "gpt-4o-mini",
            LlmProvider::Anthropic => "claude-haiku-4-5",
        }
    }

    /// Environment variable that supplies a missing API key.
    pub fn api_key_env(self) -> &'static str {
        match self {
            LlmProvider::OpenaiCompatible => OPENAI_API_KEY_ENV,
            LlmProvider::Anthropic => ANTHROPIC_API_KEY_ENV,
        }
    }
}

// ---------------------------------------------------------------------------
// LlmConfig
// ---------------------------------------------------------------------------

/// Settings for the summarization step.
///
/// `base_url` and `model` fall back to the provider's defaults when unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    /// API root; the provider's endpoint path is appended.
    pub base_url: Option<String>,
    /// API key; `None` for local providers such as Ollama.
    pub api_key: Option<String>,
    pub model: Option<String>,
    /// Sampling temperature (0.0 – 1.0).
    pub temperature: f32,
    /// Maximum tokens the summary may use.
    pub max_tokens: u32,
    /// Extracted text beyond this many characters is cut before prompting.
    pub max_input_chars: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            base_url: None,
            api_key: None,
            model: None,
            temperature: 0.7,
            max_tokens: 4_096,
            max_input_chars: 120_000,
        }
    }
}

impl LlmConfig {
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(self.provider.default_base_url())
            .trim_end_matches('/')
    }

    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(self.provider.default_model())
    }
}

// ---------------------------------------------------------------------------
// TtsConfig
// ---------------------------------------------------------------------------

/// Settings for the speech synthesis step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Base URL of an OpenAI-compatible API (`/v1/audio/speech` is appended).
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Voice name (alloy, echo, fable, onyx, nova, shimmer …).
    pub voice: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            api_key: None,
            model: "gpt-4o-mini-tts".into(),
            voice: "alloy".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// DriverConfig
// ---------------------------------------------------------------------------

/// Batch driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Papers processed concurrently.
    pub concurrency: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { concurrency: 2 }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// ```rust,no_run
/// use arxiv_to_speech::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub rate_limit: RateLimitConfig,
    pub arxiv: ArxivConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub driver: DriverConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid settings in {}", path.display()))
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("cannot write {}", path.display()))
    }

    /// Fill empty API keys from the environment: the LLM key from its
    /// provider's variable, the TTS key from `OPENAI_API_KEY`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_api_keys(|name| std::env::var(name).ok());
    }

    fn apply_api_keys(&mut self, env: impl Fn(&str) -> Option<String>) {
        fill_key(&mut self.llm.api_key, env(self.llm.provider.api_key_env()));
        fill_key(&mut self.tts.api_key, env(OPENAI_API_KEY_ENV));
    }
}

fn fill_key(slot: &mut Option<String>, key: Option<String>) {
    let Some(key) = key.filter(|k| !k.trim().is_empty()) else {
        return;
    };
    if slot.as_deref().map_or(true, str::is_empty) {
        *slot = Some(key);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
