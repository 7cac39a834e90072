//! # Embeddings
//!
//! Text → vector, memoized per model.
//!
//! - [`Embedder`] is the model seam. [`SentenceEmbedder`] is the shipped
//!   implementation: a BERT sentence-transformer run with Candle (pure Rust),
//!   mean-pooled and L2-normalized.
//! - [`EmbeddingService`] owns a registry of embedders keyed by model id and one
//!   bounded LRU cache per model. Identical `(text, model)` pairs return the
//!   identical vector without touching the model again.
//!
//! Encoding is CPU-bound, so the service runs it on tokio's blocking pool.
//!
//! ```no_run
//! use std::sync::Arc;
//! use helpdesk_resolver::embedding::{EmbeddingService, SentenceEmbedder};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let model = SentenceEmbedder::load("sentence-transformers/all-MiniLM-L6-v2", "main")?;
//! let mut service = EmbeddingService::new(1024);
//! service.register(Arc::new(model));
//! let v = service
//!     .embed("касса не включается", "sentence-transformers/all-MiniLM-L6-v2")
//!     .await?;
//! assert_eq!(v.len(), 384);
//! # Ok(()) }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use hf_hub::{Repo, RepoType, api::sync::Api};
use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::error::EmbeddingError;

/// A sentence embedding model.
pub trait Embedder: Send + Sync {
    /// Stable identifier; collections record the model they were built with.
    fn model_id(&self) -> &str;

    /// Length of every vector this model returns.
    fn dimension(&self) -> usize;

    fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Sentence embeddings model using Candle (pure Rust).
pub struct SentenceEmbedder {
    model_id: String,
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dimension: usize,
}

impl SentenceEmbedder {
    /// Download (or reuse the hf-hub cache of) `repo_id` at `revision` and load it on CPU.
    pub fn load(repo_id: &str, revision: &str) -> Result<Self, EmbeddingError> {
        let fail = |message: String| EmbeddingError::Model {
            model_id: repo_id.to_string(),
            message,
        };

        let device = Device::Cpu;
        let repo = Repo::with_revision(repo_id.to_string(), RepoType::Model, revision.to_string());
        let api = Api::new().map_err(|e| fail(e.to_string()))?;
        let api_repo = api.repo(repo);

        let config_filename = api_repo
            .get("config.json")
            .map_err(|e| fail(e.to_string()))?;
        let tokenizer_filename = api_repo
            .get("tokenizer.json")
            .map_err(|e| fail(e.to_string()))?;
        let weights_filename = api_repo
            .get("model.safetensors")
            .map_err(|e| fail(e.to_string()))?;

        let config = std::fs::read_to_string(config_filename).map_err(|e| fail(e.to_string()))?;
        let config: Config = serde_json::from_str(&config).map_err(|e| fail(e.to_string()))?;
        let dimension = config.hidden_size;

        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| fail(format!("failed to load tokenizer: {e}")))?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_filename], DTYPE, &device)
                .map_err(|e| fail(e.to_string()))?
        };
        let model = BertModel::load(vb, &config).map_err(|e| fail(e.to_string()))?;

        info!(model = repo_id, dimension, "sentence embedder loaded");

        Ok(Self {
            model_id: repo_id.to_string(),
            model,
            tokenizer,
            device,
            dimension,
        })
    }

    fn forward(&self, text: &str) -> Result<Vec<f32>, Box<dyn std::error::Error + Send + Sync>> {
        let tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| format!("tokenization error: {e}"))?;

        let token_ids = Tensor::new(tokens.get_ids(), &self.device)?.unsqueeze(0)?;
        let token_type_ids = Tensor::new(tokens.get_type_ids(), &self.device)?.unsqueeze(0)?;

        let output = self.model.forward(&token_ids, &token_type_ids, None)?;
        let pooled = self.mean_pooling(&output, tokens.get_attention_mask())?;
        let normalized = Self::normalize(&pooled)?;

        Ok(normalized.to_vec1::<f32>()?)
    }

    /// Mean over token embeddings `[1, seq, hidden]`, ignoring padding.
    fn mean_pooling(&self, embeddings: &Tensor, attention_mask: &[u32]) -> candle_core::Result<Tensor> {
        let mask = Tensor::new(attention_mask, &self.device)?
            .to_dtype(DType::F32)?
            .unsqueeze(0)?
            .unsqueeze(2)?;

        let sum = embeddings.broadcast_mul(&mask)?.sum(1)?;
        let count = mask.sum(1)?.clamp(1f32, f32::INFINITY)?;
        sum.broadcast_div(&count)?.squeeze(0)
    }

    fn normalize(tensor: &Tensor) -> candle_core::Result<Tensor> {
        let norm = tensor.sqr()?.sum_all()?.sqrt()?;
        tensor.broadcast_div(&norm)
    }
}

impl Embedder for SentenceEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.forward(text).map_err(|e| EmbeddingError::Model {
            model_id: self.model_id.clone(),
            message: e.to_string(),
        })
    }
}

/// Per-model LRU of text → vector.
struct ModelCache {
    embedder: Arc<dyn Embedder>,
    vectors: Mutex<LinkedHashMap<String, Arc<Vec<f32>>>>,
}

/// Embedder registry plus one bounded cache per model.
pub struct EmbeddingService {
    models: HashMap<String, ModelCache>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingService {
    /// `capacity` bounds each model's cache separately.
    pub fn new(capacity: usize) -> Self {
        Self {
            models: HashMap::new(),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Register an embedder under its own model id, replacing any previous one.
    pub fn register(&mut self, embedder: Arc<dyn Embedder>) {
        let model_id = embedder.model_id().to_string();
        self.models.insert(
            model_id,
            ModelCache {
                embedder,
                vectors: Mutex::new(LinkedHashMap::new()),
            },
        );
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.register(embedder);
        self
    }

    fn model(&self, model_id: &str) -> Result<&ModelCache, EmbeddingError> {
        self.models
            .get(model_id)
            .ok_or_else(|| EmbeddingError::UnknownModel {
                model_id: model_id.to_string(),
            })
    }

    pub fn dimension(&self, model_id: &str) -> Result<usize, EmbeddingError> {
        Ok(self.model(model_id)?.embedder.dimension())
    }

    /// Embed one text, serving repeats from the model's LRU.
    pub async fn embed(&self, text: &str, model_id: &str) -> Result<Arc<Vec<f32>>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let model = self.model(model_id)?;

        if let Some(vector) = model.vectors.lock().get_refresh(text) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(vector));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let embedder = Arc::clone(&model.embedder);
        let owned = text.to_string();
        let vector = tokio::task::spawn_blocking(move || embedder.encode(&owned))
            .await
            .map_err(|e| EmbeddingError::Worker(e.to_string()))??;
        check_dimension(model.embedder.as_ref(), &vector)?;

        let vector = Arc::new(vector);
        let mut vectors = model.vectors.lock();
        vectors.insert(text.to_string(), Arc::clone(&vector));
        while vectors.len() > self.capacity {
            vectors.pop_front();
        }
        debug!(model = model_id, cached = vectors.len(), "embedding computed");

        Ok(vector)
    }

    /// Embed many texts in one blocking job, in parallel, bypassing the cache.
    ///
    /// Used for rebuilding collections, where the keys would only churn the
    /// query cache. Fails as a whole if any single text fails.
    pub async fn embed_batch(
        &self,
        texts: Vec<String>,
        model_id: &str,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let embedder = Arc::clone(&self.model(model_id)?.embedder);

        tokio::task::spawn_blocking(move || {
            texts
                .par_iter()
                .map(|text| {
                    let vector = embedder.encode(text)?;
                    check_dimension(embedder.as_ref(), &vector)?;
                    Ok(vector)
                })
                .collect::<Result<Vec<_>, EmbeddingError>>()
        })
        .await
        .map_err(|e| EmbeddingError::Worker(e.to_string()))?
    }

    /// Cache hits and misses across all models.
    pub fn cache_counts(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn cached_len(&self, model_id: &str) -> usize {
        self.models
            .get(model_id)
            .map_or(0, |model| model.vectors.lock().len())
    }
}

fn check_dimension(embedder: &dyn Embedder, vector: &[f32]) -> Result<(), EmbeddingError> {
    if vector.len() != embedder.dimension() {
        return Err(EmbeddingError::InvalidDimension {
            model_id: embedder.model_id().to_string(),
            expected: embedder.dimension(),
            actual: vector.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Deterministic bag-of-characters embedder with a call counter.
    pub(crate) struct CharEmbedder {
        pub id: String,
        pub dim: usize,
        pub calls: AtomicUsize,
    }

    impl CharEmbedder {
        pub fn new(id: &str, dim: usize) -> Self {
            Self {
                id: id.to_string(),
                dim,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Embedder for CharEmbedder {
        fn model_id(&self) -> &str {
            &self.id
        }

        fn dimension(&self) -> usize {
            self.dim
        }

        fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut v = vec![0.0; self.dim];
            for c in text.chars() {
                v[c as usize % self.dim] += 1.0;
            }
            Ok(v)
        }
    }

    struct BrokenEmbedder;

    impl Embedder for BrokenEmbedder {
        fn model_id(&self) -> &str {
            "broken"
        }

        fn dimension(&self) -> usize {
            4
        }

        fn encode(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::Model {
                model_id: "broken".into(),
                message: "weights missing".into(),
            })
        }
    }

    struct WrongSizeEmbedder;

    impl Embedder for WrongSizeEmbedder {
        fn model_id(&self) -> &str {
            "wrong"
        }

        fn dimension(&self) -> usize {
            4
        }

        fn encode(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![1.0; 3])
        }
    }

    #[tokio::test]
    async fn test_repeat_served_from_cache() {
        let model = Arc::new(CharEmbedder::new("chars", 8));
        let service = EmbeddingService::new(16).with_embedder(model.clone());

        let a = service.embed("касса", "chars").await.unwrap();
        let b = service.embed("касса", "chars").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.cache_counts(), (1, 1));
    }

    #[tokio::test]
    async fn test_cache_is_per_model() {
        let small = Arc::new(CharEmbedder::new("small", 4));
        let large = Arc::new(CharEmbedder::new("large", 16));
        let service = EmbeddingService::new(16)
            .with_embedder(small.clone())
            .with_embedder(large.clone());

        let a = service.embed("текст", "small").await.unwrap();
        let b = service.embed("текст", "large").await.unwrap();
        assert_eq!(a.len(), 4);
        assert_eq!(b.len(), 16);
        assert_eq!(small.calls.load(Ordering::SeqCst), 1);
        assert_eq!(large.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lru_bound() {
        let model = Arc::new(CharEmbedder::new("chars", 8));
        let service = EmbeddingService::new(2).with_embedder(model.clone());

        service.embed("a", "chars").await.unwrap();
        service.embed("b", "chars").await.unwrap();
        service.embed("a", "chars").await.unwrap(); // refresh a
        service.embed("c", "chars").await.unwrap(); // evicts b
        assert_eq!(service.cached_len("chars"), 2);

        service.embed("a", "chars").await.unwrap();
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
        service.embed("b", "chars").await.unwrap();
        assert_eq!(model.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_errors_surface() {
        let service = EmbeddingService::new(4)
            .with_embedder(Arc::new(BrokenEmbedder))
            .with_embedder(Arc::new(WrongSizeEmbedder));

        assert!(matches!(
            service.embed("x", "broken").await,
            Err(EmbeddingError::Model { .. })
        ));
        assert!(matches!(
            service.embed("x", "wrong").await,
            Err(EmbeddingError::InvalidDimension {
                expected: 4,
                actual: 3,
                ..
            })
        ));
        assert!(matches!(
            service.embed("x", "missing").await,
            Err(EmbeddingError::UnknownModel { .. })
        ));
        assert!(matches!(
            service.embed("   ", "broken").await,
            Err(EmbeddingError::EmptyInput)
        ));
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let model = Arc::new(CharEmbedder::new("chars", 8));
        let service = EmbeddingService::new(4).with_embedder(model.clone());

        let texts = vec!["a".to_string(), "bb".to_string(), "ccc".to_string()];
        let vectors = service.embed_batch(texts.clone(), "chars").await.unwrap();
        assert_eq!(vectors.len(), 3);
        for (text, vector) in texts.iter().zip(&vectors) {
            assert_eq!(vector, &model.encode(text).unwrap());
        }
        assert_eq!(service.cached_len("chars"), 0);
    }
}
