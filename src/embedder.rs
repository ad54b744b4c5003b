//! Embedding model adapters.
//!
//! The engine only depends on two narrow contracts: a bi-encoder that maps a
//! batch of strings to fixed-dimension unit-norm vectors, and a
//! cross-encoder that scores (query, passage) pairs jointly. Both are backed
//! by fastembed's ONNX models, lazily initialized behind a Mutex so the
//! first request (or an explicit warm-up) pays the load cost exactly once.

use fastembed::{
    EmbeddingModel, RerankInitOptions, RerankerModel, TextEmbedding, TextInitOptions, TextRerank,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use tracing::info;

use crate::error::{TemoaError, TemoaResult};

/// Default bi-encoder. Small, fast on CPU, solid retrieval quality for
/// personal-note scale corpora.
pub const DEFAULT_MODEL_ID: &str = "all-minilm-l6-v2";

/// Cross-encoder used by the re-ranking stage.
pub const RERANKER_ID: &str = "bge-reranker-base";

/// A registry entry mapping a stable model id to its fastembed model and
/// embedding dimension. The id is part of the on-disk store path, so it must
/// never change for a given model.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub id: &'static str,
    pub dimension: usize,
    pub model: EmbeddingModel,
}

/// Models selectable via `TEMOA_MODEL`, surfaced by `GET /models`.
pub fn model_registry() -> Vec<ModelSpec> {
    vec![
        ModelSpec {
            id: "all-minilm-l6-v2",
            dimension: 384,
            model: EmbeddingModel::AllMiniLML6V2,
        },
        ModelSpec {
            id: "bge-small-en-v1.5",
            dimension: 384,
            model: EmbeddingModel::BGESmallENV15,
        },
        ModelSpec {
            id: "bge-base-en-v1.5",
            dimension: 768,
            model: EmbeddingModel::BGEBaseENV15,
        },
    ]
}

pub fn lookup_model(id: &str) -> Option<ModelSpec> {
    model_registry().into_iter().find(|m| m.id == id)
}

fn model_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("temoa").join("models"))
        .unwrap_or_else(|| PathBuf::from(".temoa-cache/models"))
}

/// Bi-encoder contract: one unit-norm vector of `dimension()` per input.
/// Implementations are called from `spawn_blocking` contexts; they may block.
pub trait EmbeddingEngine: Send + Sync {
    fn id(&self) -> &str;
    fn dimension(&self) -> usize;
    fn embed(&self, texts: &[String]) -> TemoaResult<Vec<Vec<f32>>>;

    /// Force model initialization ahead of the first query.
    fn warm(&self) -> TemoaResult<()> {
        self.embed(&["warm-up".to_string()]).map(|_| ())
    }
}

/// Cross-encoder contract: a relevance score per passage, in input order.
pub trait CrossEncoder: Send + Sync {
    fn score(&self, query: &str, passages: &[String]) -> TemoaResult<Vec<f32>>;
}

// ---------------------------------------------------------------------------
// fastembed bi-encoder
// ---------------------------------------------------------------------------

pub struct FastembedEngine {
    spec: ModelSpec,
    model: Mutex<Option<TextEmbedding>>,
}

impl FastembedEngine {
    pub fn new(spec: ModelSpec) -> Self {
        Self {
            spec,
            model: Mutex::new(None),
        }
    }

    fn with_model<R>(
        &self,
        f: impl FnOnce(&mut TextEmbedding) -> TemoaResult<R>,
    ) -> TemoaResult<R> {
        let mut guard = self.model.lock();
        if guard.is_none() {
            info!(model = self.spec.id, dim = self.spec.dimension, "loading embedding model");
            let options = TextInitOptions::new(self.spec.model.clone())
                .with_cache_dir(model_cache_dir());
            let model = TextEmbedding::try_new(options).map_err(|e| {
                TemoaError::Search(format!("failed to load embedding model {}: {}", self.spec.id, e))
            })?;
            *guard = Some(model);
        }
        let model = guard
            .as_mut()
            .ok_or_else(|| TemoaError::Search("embedding model not initialized".into()))?;
        f(model)
    }
}

impl EmbeddingEngine for FastembedEngine {
    fn id(&self) -> &str {
        self.spec.id
    }

    fn dimension(&self) -> usize {
        self.spec.dimension
    }

    fn embed(&self, texts: &[String]) -> TemoaResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let docs: Vec<String> = texts.to_vec();
        let mut vectors = self.with_model(|model| {
            model
                .embed(docs, None)
                .map_err(|e| TemoaError::Search(format!("embedding failed: {}", e)))
        })?;

        for v in &mut vectors {
            if v.len() != self.spec.dimension {
                return Err(TemoaError::Search(format!(
                    "model {} returned dimension {} (expected {})",
                    self.spec.id,
                    v.len(),
                    self.spec.dimension
                )));
            }
            normalize(v);
        }
        Ok(vectors)
    }
}

/// L2-normalize in place. Zero vectors are left untouched so the dot product
/// treats them as matching nothing.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

// ---------------------------------------------------------------------------
// fastembed cross-encoder
// ---------------------------------------------------------------------------

pub struct FastembedReranker {
    model: Mutex<Option<TextRerank>>,
}

impl FastembedReranker {
    pub fn new() -> Self {
        Self {
            model: Mutex::new(None),
        }
    }
}

impl Default for FastembedReranker {
    fn default() -> Self {
        Self::new()
    }
}

impl CrossEncoder for FastembedReranker {
    fn score(&self, query: &str, passages: &[String]) -> TemoaResult<Vec<f32>> {
        if passages.is_empty() {
            return Ok(vec![]);
        }
        let mut guard = self.model.lock();
        if guard.is_none() {
            info!(model = RERANKER_ID, "loading cross-encoder model");
            let options = RerankInitOptions::new(RerankerModel::BGERerankerBase)
                .with_cache_dir(model_cache_dir());
            let model = TextRerank::try_new(options).map_err(|e| {
                TemoaError::Search(format!("failed to load cross-encoder: {}", e))
            })?;
            *guard = Some(model);
        }
        let model = guard
            .as_mut()
            .ok_or_else(|| TemoaError::Search("cross-encoder not initialized".into()))?;

        let docs: Vec<&str> = passages.iter().map(|p| p.as_str()).collect();
        let ranked = model
            .rerank(query, docs, false, None)
            .map_err(|e| TemoaError::Search(format!("re-ranking failed: {}", e)))?;

        // fastembed returns results ordered by score; restore input order.
        let mut scores = vec![0.0f32; passages.len()];
        for r in ranked {
            if let Some(slot) = scores.get_mut(r.index) {
                *slot = r.score;
            }
        }
        Ok(scores)
    }
}

// ---------------------------------------------------------------------------
// Deterministic stub for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod stub {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Bag-of-words hash embedder. Each token lands in a hash bucket; the
    /// vector is the normalized bucket histogram, so cosine similarity
    /// reflects token overlap. Tokens in the `oov` set are dropped, which
    /// models a bi-encoder that has no representation for a rare keyword; a
    /// text whose tokens are all OOV embeds to the fixed "unknown" direction
    /// (bucket zero).
    pub struct StubEmbedder {
        dim: usize,
        oov: HashSet<String>,
        calls: Arc<AtomicUsize>,
    }

    impl StubEmbedder {
        pub fn new(dim: usize) -> Self {
            Self {
                dim,
                oov: HashSet::new(),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn with_oov(mut self, words: &[&str]) -> Self {
            self.oov = words.iter().map(|w| w.to_string()).collect();
            self
        }

        /// Shared invocation counter; clones survive moving the embedder
        /// into a pipeline.
        pub fn call_counter(&self) -> Arc<AtomicUsize> {
            self.calls.clone()
        }

        pub fn bucket(&self, token: &str) -> usize {
            token.bytes().map(|b| b as usize).sum::<usize>() % self.dim
        }

        fn embed_one(&self, text: &str) -> Vec<f32> {
            let mut v = vec![0.0f32; self.dim];
            let mut any = false;
            for token in text
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
            {
                let token = token.to_ascii_lowercase();
                if self.oov.contains(&token) {
                    continue;
                }
                v[self.bucket(&token)] += 1.0;
                any = true;
            }
            if !any {
                v[0] = 1.0;
            }
            normalize(&mut v);
            v
        }
    }

    impl EmbeddingEngine for StubEmbedder {
        fn id(&self) -> &str {
            "stub"
        }

        fn dimension(&self) -> usize {
            self.dim
        }

        fn embed(&self, texts: &[String]) -> TemoaResult<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| self.embed_one(t)).collect())
        }
    }

    /// Cross-encoder stub: token overlap plus a large bonus when the whole
    /// query appears as a phrase, which is the joint-scoring advantage a
    /// real cross-encoder has over the bi-encoder.
    pub struct StubReranker;

    impl CrossEncoder for StubReranker {
        fn score(&self, query: &str, passages: &[String]) -> TemoaResult<Vec<f32>> {
            let lower_query = query.to_ascii_lowercase();
            let terms: Vec<&str> = lower_query.split_whitespace().collect();
            Ok(passages
                .iter()
                .map(|p| {
                    let lower = p.to_ascii_lowercase();
                    let overlap = terms.iter().filter(|t| lower.contains(**t)).count() as f32;
                    let phrase = if lower.contains(&lower_query) { 10.0 } else { 0.0 };
                    overlap + phrase
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::stub::StubEmbedder;
    use super::*;

    #[test]
    fn stub_vectors_are_unit_norm() {
        let e = StubEmbedder::new(16);
        let out = e.embed(&["hello world".to_string()]).unwrap();
        let norm: f32 = out[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn token_overlap_drives_similarity() {
        let e = StubEmbedder::new(64);
        let out = e
            .embed(&[
                "rust search engine".to_string(),
                "rust search engine".to_string(),
                "completely different words".to_string(),
            ])
            .unwrap();
        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(dot(&out[0], &out[1]) > 0.99);
        assert!(dot(&out[0], &out[2]) < 0.9);
    }

    #[test]
    fn oov_tokens_are_dropped() {
        let e = StubEmbedder::new(16).with_oov(&["zebra"]);
        let out = e.embed(&["zebra".to_string()]).unwrap();
        // All tokens OOV: the unknown direction is bucket zero.
        assert!((out[0][0] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn registry_has_default() {
        assert!(lookup_model(DEFAULT_MODEL_ID).is_some());
        assert!(lookup_model("no-such-model").is_none());
    }
}
