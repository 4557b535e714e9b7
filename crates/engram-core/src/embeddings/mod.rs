//! Embeddings - external embedder contract, vector math, and the query cache
//!
//! The embedder itself is an external collaborator injected at construction:
//! `text → fixed-length real vector`. The engine only checks dimensions,
//! caches query vectors, and tolerates unavailability by degrading dense
//! ranking.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use sha2::{Digest, Sha256};

// ============================================================================
// ERRORS
// ============================================================================

/// Embedder failure modes surfaced to the engine.
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbedderError {
    /// Provider temporarily unreachable; the engine degrades to lexical-only
    #[error("embedder unavailable: {0}")]
    Unavailable(String),
    /// Provider returned a vector of the wrong length
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

// ============================================================================
// EMBEDDER CONTRACT
// ============================================================================

/// External embedding provider.
///
/// The dimension is fixed at process start and must match the substrate's
/// vector column; `MemoryEngine::connect` checks this once.
pub trait Embedder: Send + Sync {
    /// Vector length produced by this provider.
    fn dimensions(&self) -> usize;

    /// Embed one text blob.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError>;
}

// ============================================================================
// VECTOR MATH
// ============================================================================

/// An embedding vector with its stored byte representation.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub dimensions: usize,
}

impl Embedding {
    pub fn new(vector: Vec<f32>) -> Self {
        let dimensions = vector.len();
        Self { vector, dimensions }
    }

    /// Serialize to little-endian f32 bytes for the BLOB column.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Deserialize from the BLOB column.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let vector: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Some(Self::new(vector))
    }
}

/// Cosine similarity between two vectors. Returns 0.0 on dimension mismatch
/// or zero-norm inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ============================================================================
// QUERY EMBEDDING CACHE
// ============================================================================

/// Bounded LRU cache for query embeddings, keyed by a content hash so
/// repeated queries skip the embedder call.
pub struct EmbeddingCache {
    inner: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn key(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let key = Self::key(text);
        self.inner
            .lock()
            .ok()
            .and_then(|mut cache| cache.get(&key).cloned())
    }

    pub fn put(&self, text: &str, vector: Vec<f32>) {
        let key = Self::key(text);
        if let Ok(mut cache) = self.inner.lock() {
            cache.put(key, vector);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Embed through the cache, recording hits and misses.
///
/// Dimension mismatches are rejected here so a misconfigured provider cannot
/// poison the stored vectors.
pub fn embed_cached(
    embedder: &dyn Embedder,
    cache: &EmbeddingCache,
    expected_dimensions: usize,
    text: &str,
) -> Result<Vec<f32>, EmbedderError> {
    if let Some(vector) = cache.get(text) {
        return Ok(vector);
    }
    let vector = embedder.embed(text)?;
    if vector.len() != expected_dimensions {
        return Err(EmbedderError::DimensionMismatch {
            expected: expected_dimensions,
            got: vector.len(),
        });
    }
    cache.put(text, vector.clone());
    Ok(vector)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingEmbedder {
        calls: std::sync::atomic::AtomicUsize,
    }

    impl Embedder for CountingEmbedder {
        fn dimensions(&self) -> usize {
            4
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let seed = text.len() as f32;
            Ok(vec![seed, seed + 1.0, seed + 2.0, seed + 3.0])
        }
    }

    #[test]
    fn test_embedding_bytes_roundtrip() {
        let embedding = Embedding::new(vec![0.25, -1.5, 3.0]);
        let restored = Embedding::from_bytes(&embedding.to_bytes()).unwrap();
        assert_eq!(restored, embedding);
    }

    #[test]
    fn test_from_bytes_rejects_ragged_input() {
        assert!(Embedding::from_bytes(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &c).abs() < 1e-6);
        // Mismatched lengths and zero vectors degrade to 0.
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_cache_skips_repeat_embeds() {
        let embedder = CountingEmbedder {
            calls: std::sync::atomic::AtomicUsize::new(0),
        };
        let cache = EmbeddingCache::new(10);

        let first = embed_cached(&embedder, &cache, 4, "same query").unwrap();
        let second = embed_cached(&embedder, &cache, 4, "same query").unwrap();
        assert_eq!(first, second);
        assert_eq!(embedder.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let embedder = CountingEmbedder {
            calls: std::sync::atomic::AtomicUsize::new(0),
        };
        let cache = EmbeddingCache::new(10);
        let result = embed_cached(&embedder, &cache, 8, "query");
        assert!(matches!(
            result,
            Err(EmbedderError::DimensionMismatch { expected: 8, got: 4 })
        ));
        // Rejected vectors are not cached.
        assert!(cache.is_empty());
    }
}
