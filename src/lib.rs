//! arxiv-to-speech: fetch arXiv papers, summarize them with an LLM and
//! read the summary aloud with a TTS model.
//!
//! Progress is persisted per paper, so interrupted or failed runs resume at
//! the step that broke.  See [`pipeline`] for the architecture.

pub mod cli;
pub mod config;
pub mod paper;
pub mod pipeline;
pub mod rate_limit;
pub mod stages;
pub mod store;
