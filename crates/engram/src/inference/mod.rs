//! Embedding and generation client
//!
//! `Embedder` and `Summarizer` are the seams to the inference service.
//! `InferenceClient` puts a timeout and retry budget around both and is the
//! only handle the ingestion, compaction and retrieval engines see.

pub mod local;
pub mod prompts;
pub mod remote;
pub mod retry;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::config::{EmbeddingProvider, InferenceConfig};
use crate::error::{EngramError, Result};

pub use local::LocalEmbedder;
pub use remote::RemoteInference;
pub use retry::RetryPolicy;

/// Produces a vector for a piece of text
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn name(&self) -> &'static str;
}

/// Condenses an ordered transcript into a single summary
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, texts: &[String], max_tokens: usize) -> Result<String>;

    async fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str;
}

/// Resilient handle over an embedder and a summarizer
pub struct InferenceClient {
    embedder: Arc<dyn Embedder>,
    summarizer: Arc<dyn Summarizer>,
    embed_policy: RetryPolicy,
    summarize_policy: RetryPolicy,
    dimension: Option<usize>,
}

/// Result of probing the inference backends
#[derive(Debug, Clone, Serialize)]
pub struct InferenceHealth {
    pub embedder: &'static str,
    pub summarizer: &'static str,
    pub summarizer_available: bool,
}

impl InferenceClient {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        summarizer: Arc<dyn Summarizer>,
        embed_policy: RetryPolicy,
        summarize_policy: RetryPolicy,
    ) -> Self {
        Self {
            embedder,
            summarizer,
            embed_policy,
            summarize_policy,
            dimension: None,
        }
    }

    /// Reject vectors whose width differs from `dimension`
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    /// Wire the backends named in config
    pub fn from_config(config: &InferenceConfig) -> Result<Self> {
        let remote = Arc::new(RemoteInference::new(config)?);
        let embedder: Arc<dyn Embedder> = match config.embedding_provider {
            EmbeddingProvider::Remote => remote.clone(),
            EmbeddingProvider::Local => {
                tracing::info!("Initializing local embedding model (this may take a moment on first run)...");
                Arc::new(LocalEmbedder::new(&config.embedding_model)?)
            }
        };

        Ok(Self::new(
            embedder,
            remote,
            RetryPolicy::embedding(config),
            RetryPolicy::summarization(config),
        )
        .with_dimension(config.embedding_dimension))
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self
            .embed_policy
            .run("embedding", || self.embedder.embed(text))
            .await?;

        if let Some(expected) = self.dimension {
            if vector.len() != expected {
                return Err(EngramError::Fatal(format!(
                    "embedder '{}' returned {} dimensions, expected {expected}",
                    self.embedder.name(),
                    vector.len()
                )));
            }
        }
        Ok(vector)
    }

    pub async fn summarize(&self, texts: &[String], max_tokens: usize) -> Result<String> {
        self.summarize_policy
            .run("summarization", || self.summarizer.summarize(texts, max_tokens))
            .await
    }

    pub async fn health(&self) -> InferenceHealth {
        InferenceHealth {
            embedder: self.embedder.name(),
            summarizer: self.summarizer.name(),
            summarizer_available: self.summarizer.is_available().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EchoSummarizer, MockEmbedder};
    use std::time::Duration;

    fn client(dimension: usize) -> InferenceClient {
        let policy = RetryPolicy::new(Duration::from_secs(1), 0, Duration::from_millis(1));
        InferenceClient::new(
            Arc::new(MockEmbedder::new(dimension)),
            Arc::new(EchoSummarizer::new()),
            policy.clone(),
            policy,
        )
    }

    #[tokio::test]
    async fn test_dimension_check() {
        assert_eq!(client(16).with_dimension(16).embed("tea").await.unwrap().len(), 16);

        let err = client(16).with_dimension(32).embed("tea").await.unwrap_err();
        assert!(matches!(err, EngramError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_health_reports_backends() {
        let health = client(8).health().await;
        assert_eq!(health.embedder, "mock");
        assert_eq!(health.summarizer, "echo");
        assert!(health.summarizer_available);
    }
}
