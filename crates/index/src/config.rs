use std::path::Path;

use serde::Deserialize;

/// Configuration for the indexing subsystem.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Path to the SQLite database file (or `:memory:` for tests).
    pub db_path: String,
    /// Target chunk size in tokens (approximated as 4 characters per token).
    pub chunk_size_tokens: usize,
    /// Fraction of a chunk shared with the next one (0.0–1.0, exclusive).
    pub chunk_overlap_ratio: f64,
    /// Per-field byte limit enforced by the vector store on metadata values.
    pub metadata_byte_budget: usize,
    /// Reciprocal Rank Fusion smoothing constant.
    pub rrf_k: u32,
    /// Multiplier applied to the requested limit before querying each engine.
    pub search_overfetch_factor: usize,
    pub default_search_limit: usize,
    /// Overfetch multiplier for RAG scopes filtered after retrieval.
    pub rag_overfetch_factor: usize,
    /// Matches scoring below this cosine similarity are discarded.
    pub rag_similarity_threshold: f32,
    pub rag_top_k: usize,
    /// Upper bound on candidates inspected when looking for stale chunks.
    pub stale_scan_limit: usize,
    pub retry_max_attempts: u32,
    pub retry_sweep_interval_secs: u64,
    pub retry_sweep_batch_size: usize,
    pub embeddings: EmbeddingsConfig,
}

/// Remote embedding endpoint settings. The API key is never read from the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub base_url: String,
    pub model: String,
    pub dimensions: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            model: "text-embedding-3-small".into(),
            dimensions: 1536,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            db_path: "worknotes.db".into(),
            chunk_size_tokens: 512,
            chunk_overlap_ratio: 0.2,
            metadata_byte_budget: 64,
            rrf_k: 60,
            search_overfetch_factor: 2,
            default_search_limit: 10,
            rag_overfetch_factor: 3,
            rag_similarity_threshold: 0.5,
            rag_top_k: 5,
            stale_scan_limit: 500,
            retry_max_attempts: 3,
            retry_sweep_interval_secs: 60,
            retry_sweep_batch_size: 20,
            embeddings: EmbeddingsConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl IndexConfig {
    /// Load configuration from a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size_tokens == 0 {
            return Err(ConfigError::Invalid("chunk_size_tokens must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.chunk_overlap_ratio) {
            return Err(ConfigError::Invalid(
                "chunk_overlap_ratio must be in [0, 1)".into(),
            ));
        }
        if self.rrf_k == 0 {
            return Err(ConfigError::Invalid("rrf_k must be > 0".into()));
        }
        if self.search_overfetch_factor == 0 || self.rag_overfetch_factor == 0 {
            return Err(ConfigError::Invalid("overfetch factors must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.rag_similarity_threshold) {
            return Err(ConfigError::Invalid(
                "rag_similarity_threshold must be in [0, 1]".into(),
            ));
        }
        if self.metadata_byte_budget == 0 {
            return Err(ConfigError::Invalid("metadata_byte_budget must be > 0".into()));
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = IndexConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size_tokens, 512);
        assert_eq!(config.rrf_k, 60);
        assert_eq!(config.retry_max_attempts, 3);
    }

    #[test]
    fn load_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worknotes.toml");
        std::fs::write(
            &path,
            "chunk_size_tokens = 256\n\n[embeddings]\nmodel = \"bge-m3\"\ndimensions = 1024\n",
        )
        .unwrap();

        let config = IndexConfig::load(&path).unwrap();
        assert_eq!(config.chunk_size_tokens, 256);
        assert_eq!(config.embeddings.model, "bge-m3");
        assert_eq!(config.embeddings.dimensions, 1024);
        assert_eq!(config.embeddings.base_url, "https://api.openai.com");
        assert_eq!(config.rrf_k, 60);
    }

    #[test]
    fn load_rejects_invalid_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worknotes.toml");
        std::fs::write(&path, "chunk_overlap_ratio = 1.0\n").unwrap();

        let err = IndexConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn load_missing_file_is_read_error() {
        let err = IndexConfig::load(Path::new("/nonexistent/worknotes.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
