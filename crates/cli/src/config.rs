//! Config file discovery and secrets for the CLI.

use std::path::{Path, PathBuf};

use {
    anyhow::Context,
    directories::ProjectDirs,
    secrecy::Secret,
    tracing::debug,
    worknotes_index::config::IndexConfig,
};

const CONFIG_FILENAME: &str = "config.toml";

/// Platform config location, e.g. `~/.config/worknotes/config.toml` on Linux.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "worknotes").map(|dirs| dirs.config_dir().join(CONFIG_FILENAME))
}

/// Resolve configuration: an explicit path must exist; the platform default
/// is used only when present; otherwise built-in defaults apply.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<IndexConfig> {
    if let Some(path) = explicit {
        return IndexConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    match default_config_path() {
        Some(path) if path.exists() => {
            debug!(path = %path.display(), "using platform config");
            Ok(IndexConfig::load(&path)?)
        },
        _ => {
            let config = IndexConfig::default();
            config.validate()?;
            Ok(config)
        },
    }
}

/// Wrap the embedding API key, failing with a hint when it is absent.
pub fn require_api_key(key: Option<String>) -> anyhow::Result<Secret<String>> {
    match key {
        Some(key) if !key.trim().is_empty() => Ok(Secret::new(key)),
        _ => anyhow::bail!("OPENAI_API_KEY is not set (export it or add it to .env)"),
    }
}
