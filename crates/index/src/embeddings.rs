use std::time::Duration;

use async_trait::async_trait;

/// Turns text into dense vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// Embed many texts in one call. Implementations backed by a batching API
    /// should override this; the default embeds sequentially.
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Stable identifier of provider + model, used to tell embedding spaces apart.
    fn provider_key(&self) -> &str {
        self.model_name()
    }
}

/// Provider failures that callers may want to tell apart.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding provider rate limited the request")]
    RateLimited { retry_after: Option<Duration> },
    #[error("embedding provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed embedding response: {0}")]
    Decode(String),
    #[error("embedding provider returned no vectors")]
    EmptyResponse,
}

/// Classification recorded alongside a failure in the retry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    Provider,
    Other,
}

impl FailureKind {
    pub fn classify(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<EmbeddingError>() {
            Some(EmbeddingError::RateLimited { .. }) => Self::RateLimited,
            Some(_) => Self::Provider,
            None => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Provider => "provider",
            Self::Other => "other",
        }
    }
}
