//! OpenAI-compatible embeddings provider using the `/v1/embeddings` endpoint.
use std::time::Duration;

use async_trait::async_trait;
use {
    reqwest::{StatusCode, header::RETRY_AFTER},
    secrecy::ExposeSecret,
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
};

#[cfg(feature = "metrics")]
use metrics::{counter, histogram};

use crate::embeddings::{EmbeddingError, EmbeddingProvider};

pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    api_key: secrecy::Secret<String>,
    base_url: String,
    model: String,
    dims: usize,
    provider_key: String,
}

fn compute_provider_key(base_url: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"openai:");
    hasher.update(base_url.as_bytes());
    hasher.update(b":");
    hasher.update(model.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn has_version_suffix(base_url: &str) -> bool {
    let Some(last_segment) = base_url.rsplit('/').next() else {
        return false;
    };
    let Some(rest) = last_segment.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

fn embeddings_endpoint(base_url: &str) -> String {
    let normalized = normalize_base_url(base_url);
    if normalized.ends_with("/embeddings") {
        return normalized;
    }
    if has_version_suffix(&normalized) {
        return format!("{normalized}/embeddings");
    }
    format!("{normalized}/v1/embeddings")
}

impl OpenAiEmbeddingProvider {
    pub fn new(api_key: secrecy::Secret<String>) -> Self {
        let base_url = normalize_base_url("https://api.openai.com");
        let model = "text-embedding-3-small".to_string();
        let provider_key = compute_provider_key(&base_url, &model);
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            model,
            dims: 1536,
            provider_key,
        }
    }

    pub fn with_model(mut self, model: String, dims: usize) -> Self {
        self.model = model;
        self.dims = dims;
        self.provider_key = compute_provider_key(&self.base_url, &self.model);
        self
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = normalize_base_url(&url);
        self.provider_key = compute_provider_key(&self.base_url, &self.model);
        self
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// Decode a response body into one vector per input, in input order.
fn decode_embeddings(body: &str, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let resp: EmbeddingResponse =
        serde_json::from_str(body).map_err(|e| EmbeddingError::Decode(e.to_string()))?;
    if resp.data.is_empty() && expected > 0 {
        return Err(EmbeddingError::EmptyResponse);
    }
    if resp.data.len() != expected {
        return Err(EmbeddingError::Decode(format!(
            "expected {expected} embeddings, got {}",
            resp.data.len()
        )));
    }

    let mut data = resp.data;
    // Some compatible servers omit `index`; keep arrival order then.
    if data.iter().all(|d| d.index.is_some()) {
        data.sort_by_key(|d| d.index);
    }
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| EmbeddingError::EmptyResponse.into())
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        #[cfg(feature = "metrics")]
        let start = std::time::Instant::now();

        #[cfg(feature = "metrics")]
        counter!("worknotes_embeddings_generated_total", "provider" => "openai")
            .increment(texts.len() as u64);

        let req = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let resp = self
            .client
            .post(embeddings_endpoint(&self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&req)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
            return Err(EmbeddingError::RateLimited { retry_after }.into());
        }
        let body = resp.text().await?;

        #[cfg(feature = "metrics")]
        histogram!("worknotes_embedding_duration_seconds", "provider" => "openai")
            .record(start.elapsed().as_secs_f64());

        if !status.is_success() {
            return Err(EmbeddingError::Http {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            }
            .into());
        }

        Ok(decode_embeddings(&body, texts.len())?)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_key(&self) -> &str {
        &self.provider_key
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_from_host_base_uses_v1_embeddings() {
        assert_eq!(
            embeddings_endpoint("https://api.openai.com"),
            "https://api.openai.com/v1/embeddings"
        );
    }

    #[test]
    fn endpoint_from_v1_base_appends_embeddings_once() {
        assert_eq!(
            embeddings_endpoint("https://gateway.internal/v1/"),
            "https://gateway.internal/v1/embeddings"
        );
    }

    #[test]
    fn endpoint_preserves_explicit_embeddings_url() {
        assert_eq!(
            embeddings_endpoint("https://api.example.com/v1/embeddings"),
            "https://api.example.com/v1/embeddings"
        );
    }

    #[test]
    fn provider_key_changes_with_model() {
        let small = OpenAiEmbeddingProvider::new(secrecy::Secret::new("sk-test".into()));
        let large = OpenAiEmbeddingProvider::new(secrecy::Secret::new("sk-test".into()))
            .with_model("text-embedding-3-large".into(), 3072);
        assert_ne!(small.provider_key(), large.provider_key());
        assert_eq!(small.provider_key().len(), 16);
        assert_eq!(large.dimensions(), 3072);
    }

    #[test]
    fn decode_orders_by_index() {
        let body = r#"{"data":[
            {"index":1,"embedding":[0.0,1.0]},
            {"index":0,"embedding":[1.0,0.0]}
        ]}"#;
        let vectors = decode_embeddings(body, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn decode_rejects_count_mismatch_and_garbage() {
        let body = r#"{"data":[{"embedding":[1.0]}]}"#;
        assert!(matches!(
            decode_embeddings(body, 2),
            Err(EmbeddingError::Decode(_))
        ));
        assert!(matches!(
            decode_embeddings("<html>oops</html>", 1),
            Err(EmbeddingError::Decode(_))
        ));
        assert!(matches!(
            decode_embeddings(r#"{"data":[]}"#, 1),
            Err(EmbeddingError::EmptyResponse)
        ));
    }

    #[test]
    fn retry_after_parses_seconds() {
        let value = reqwest::header::HeaderValue::from_static("7");
        assert_eq!(
            parse_retry_after(Some(&value)),
            Some(Duration::from_secs(7))
        );
        assert_eq!(parse_retry_after(None), None);
    }
}
