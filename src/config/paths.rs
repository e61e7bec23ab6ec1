//! Where settings and the artifact store live.
//!
//! ```text
//! settings.toml   <config_dir>/arxiv-to-speech/settings.toml
//! store root      <data_local_dir>/arxiv-to-speech/
//!                   └── papers/<encoded id>/{status.json, metadata.json, paper.pdf, ...}
//! ```
//!
//! Setting `ARXIV_TO_SPEECH_HOME` puts both under one directory instead,
//! which keeps a portable or per-project install self-contained.

use std::path::{Path, PathBuf};

/// Environment variable that relocates settings and data under one root.
pub const HOME_ENV: &str = "ARXIV_TO_SPEECH_HOME";

const APP_DIR: &str = "arxiv-to-speech";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub settings_file: PathBuf,
    /// Default store root, used when `storage.data_dir` is unset.
    pub data_dir: PathBuf,
}

impl AppPaths {
    /// Resolve from `ARXIV_TO_SPEECH_HOME`, else the platform dirs.
    pub fn new() -> Self {
        match std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            Some(home) => Self::under(Path::new(&home)),
            None => Self::platform(),
        }
    }

    /// Everything below a single directory.
    pub fn under(home: &Path) -> Self {
        Self {
            settings_file: home.join("settings.toml"),
            data_dir: home.join("data"),
        }
    }

    fn platform() -> Self {
        // No platform dir (rare, e.g. no $HOME): fall back to the cwd.
        let base = |dir: Option<PathBuf>| dir.unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR);
        Self {
            settings_file: base(dirs::config_dir()).join("settings.toml"),
            data_dir: base(dirs::data_local_dir()),
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}
