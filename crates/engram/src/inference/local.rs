use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use crate::error::{EngramError, Result};
use crate::inference::Embedder;

/// Dimension of the default multilingual-e5-small model
pub const LOCAL_EMBEDDING_DIMENSION: usize = 384;

/// In-process embeddings through fastembed (ONNX runtime).
///
/// The model needs `&mut` access, so it sits behind a mutex and every call
/// runs on the blocking pool.
pub struct LocalEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
}

impl LocalEmbedder {
    /// Load the model named in config; downloads weights on first use.
    pub fn new(model_name: &str) -> Result<Self> {
        let model = match model_name {
            "multilingual-e5-small" | "" => EmbeddingModel::MultilingualE5Small,
            "all-minilm-l6-v2" => EmbeddingModel::AllMiniLML6V2,
            "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
            other => {
                return Err(EngramError::Config(format!(
                    "Unsupported local embedding model '{other}'"
                )));
            }
        };

        let model = TextEmbedding::try_new(InitOptions::new(model))
            .map_err(|e| EngramError::Fatal(format!("Failed to load embedding model: {e}")))?;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
        })
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = Arc::clone(&self.model);
        let text = text.to_string();

        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| EngramError::Fatal("Embedding model mutex poisoned".to_string()))?;
            let embeddings = model
                .embed(vec![text], None)
                .map_err(|e| EngramError::ContentRejected(format!("Embedding failed: {e}")))?;
            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| EngramError::Fatal("No embedding returned".to_string()))
        })
        .await
        .map_err(|e| EngramError::Fatal(format!("Embedding task failed: {e}")))?
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(all(test, feature = "ml-tests"))]
mod tests {
    use super::*;
    use crate::storage::memory::cosine_similarity;

    #[tokio::test]
    async fn test_embed_returns_correct_dimension() {
        let embedder = LocalEmbedder::new("multilingual-e5-small").expect("Failed to load model");
        let embedding = embedder.embed("Hello, world!").await.expect("Failed to embed");
        assert_eq!(embedding.len(), LOCAL_EMBEDDING_DIMENSION);
    }

    #[tokio::test]
    async fn test_similar_texts_have_high_similarity() {
        let embedder = LocalEmbedder::new("multilingual-e5-small").expect("Failed to load model");

        let tea = embedder.embed("I like tea").await.unwrap();
        let drink = embedder.embed("My favourite drink is tea").await.unwrap();
        let job = embedder.embed("Quantum computing revolutionizes cryptography").await.unwrap();

        assert!(cosine_similarity(&tea, &drink) > cosine_similarity(&tea, &job));
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_unknown_model_is_config_error() {
        let err = LocalEmbedder::new("not-a-model").err().unwrap();
        assert!(matches!(err, EngramError::Config(_)));
    }
}
