//! Embedding provider seam.
//!
//! The engine treats embedding as a pure function `text -> [f32; D]`. The
//! provider behind the trait may be remote; calls are rate-limited by a
//! semaphore and bounded by a timeout, and a failure surfaces as
//! `EmbeddingUnavailable` without leaving a partial row behind.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding provider failed: {0}")]
    Unavailable(String),
    #[error("embedding call timed out after {0} seconds")]
    Timeout(u64),
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    WrongDimension { expected: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// A provider that maps text to a fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Output dimension of every vector this provider produces.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Deterministic feature-hashing embedder.
///
/// Hashes word and character-trigram features into `dimension` signed
/// buckets and L2-normalises the result. Not a learned model, but stable,
/// dependency-free, and good enough for relevance ordering in tests and
/// local use; production deployments plug a real provider into the trait.
pub struct FeatureHashEmbedder {
    dimension: usize,
}

impl FeatureHashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        let lowered = text.to_lowercase();

        for word in lowered.split(|c: char| !c.is_alphanumeric()) {
            if word.is_empty() {
                continue;
            }
            bump(&mut vector, word.as_bytes());

            let chars: Vec<char> = word.chars().collect();
            for window in chars.windows(3) {
                let gram: String = window.iter().collect();
                bump(&mut vector, gram.as_bytes());
            }
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

/// Add one hashed feature to the accumulator with a deterministic sign.
fn bump(vector: &mut [f32], feature: &[u8]) {
    let hash = fnv1a(feature);
    let bucket = (hash % vector.len() as u64) as usize;
    let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
    vector[bucket] += sign;
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl Embedder for FeatureHashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let dimension = self.dimension;
        let text = text.to_string();
        let this = Self { dimension };
        // Hashing is CPU-bound; keep it off the async workers.
        tokio::task::spawn_blocking(move || Ok(this.embed_sync(&text)))
            .await
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?
    }
}

/// Shared embedding client: one of the three process-wide singletons.
///
/// Wraps the provider with a concurrency semaphore and a timeout so a slow
/// provider cannot stall the write path indefinitely.
pub struct EmbeddingService {
    embedder: Arc<dyn Embedder>,
    semaphore: Arc<Semaphore>,
    timeout_sec: u64,
}

impl EmbeddingService {
    pub fn new(embedder: Arc<dyn Embedder>, concurrency: usize, timeout_sec: u64) -> Self {
        Self {
            embedder,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            timeout_sec,
        }
    }

    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    /// Embed text, enforcing dimension, concurrency, and deadline.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| EmbeddingError::Unavailable("embedding service closed".to_string()))?;

        let vector = tokio::time::timeout(
            Duration::from_secs(self.timeout_sec),
            self.embedder.embed(text),
        )
        .await
        .map_err(|_| EmbeddingError::Timeout(self.timeout_sec))??;

        if vector.len() != self.embedder.dimension() {
            return Err(EmbeddingError::WrongDimension {
                expected: self.embedder.dimension(),
                got: vector.len(),
            });
        }
        Ok(vector)
    }
}
