use async_trait::async_trait;
use log::warn;
use serde::Deserialize;
use serde_json::json;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Map text to a fixed-length vector, or None when the service is
    /// unavailable. Callers treat None as "no semantic signal", never as an
    /// error.
    async fn embed(&self, text: &str) -> Option<Vec<f32>>;
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI embeddings client. Without an API key every call returns None and
/// search simply runs without the semantic signal.
pub struct OpenAiEmbeddings {
    http: reqwest::Client,
    api_key: Option<String>,
}

impl OpenAiEmbeddings {
    pub fn from_env() -> Self {
        let api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!("[EMBED] OPENAI_API_KEY not set; semantic scoring disabled");
        }
        Self {
            http: reqwest::Client::new(),
            api_key,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let api_key = self.api_key.as_ref()?;
        let resp = self
            .http
            .post("https://api.openai.com/v1/embeddings")
            .bearer_auth(api_key)
            .json(&json!({
                "model": "text-embedding-ada-002",
                "input": text,
            }))
            .send()
            .await;

        match resp {
            Ok(r) => match r.json::<EmbeddingResponse>().await {
                Ok(body) => body.data.into_iter().next().map(|d| d.embedding),
                Err(e) => {
                    warn!("[EMBED] Bad embedding response: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("[EMBED] Embedding request failed: {}", e);
                None
            }
        }
    }
}

/// Cosine similarity in [-1, 1]. Empty or mismatched vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for i in 0..a.len() {
        dot += a[i] as f64 * b[i] as f64;
        norm_a += (a[i] as f64).powi(2);
        norm_b += (b[i] as f64).powi(2);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_vector_with_itself_is_one() {
        let v = vec![0.5f32, -1.25, 3.0, 0.75];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-9, "got {}", sim);
    }

    #[test]
    fn cosine_empty_vector_scores_zero() {
        let v = vec![1.0f32, 2.0];
        assert_eq!(cosine_similarity(&v, &[]), 0.0);
        assert_eq!(cosine_similarity(&[], &v), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn cosine_length_mismatch_scores_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn cosine_orthogonal_is_zero_and_opposite_is_negative() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        let sim = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((sim + 1.0).abs() < 1e-9, "got {}", sim);
    }
}
