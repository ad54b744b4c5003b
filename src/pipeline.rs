//! The per-vault query pipeline.
//!
//! A `Pipeline` owns one vault's dense store, lexical index, reader cache
//! and model handles. Queries run the stage graph in a fixed order:
//! expansion → prefilter → retrieval → fusion → filters → chunk dedup →
//! re-ranking → time boost → truncation. Each stage writes its contribution
//! to a dedicated score field and the ordering key at every point is
//! explicit.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, CANDIDATE_POOL, ChangeDetection, ChunkConfig, RRF_K};
use crate::dense::{DenseStore, StoreData, dense_search};
use crate::embedder::{CrossEncoder, EmbeddingEngine};
use crate::error::{TemoaError, TemoaResult};
use crate::filters::FilterSet;
use crate::indexer::{IndexReport, Indexer};
use crate::lexical::Bm25Index;
use crate::profiles::{ExpandMode, Profile, RetrievalMode};
use crate::vault::{Frontmatter, VaultReader};

/// Cap on the number of candidates handed to the cross-encoder.
const RERANK_POOL: usize = 100;

/// Multiplier ceiling for the time-decay boost.
const TIME_MAX_BOOST: f32 = 0.2;

/// Result excerpts are capped here; chunk slices always fit, whole-body
/// rows are trimmed on a char boundary.
const EXCERPT_MAX_CHARS: usize = 1500;

/// Documents retrieved for query expansion, and terms appended.
const EXPAND_DOCS: usize = 5;
const EXPAND_TERMS: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub relative_path: String,
    pub title: String,
    pub excerpt: String,
    pub frontmatter: Frontmatter,
    pub tags: Vec<String>,
    pub similarity_score: f32,
    pub bm25_score: f32,
    pub rrf_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_encoder_score: Option<f32>,
    pub final_score: f32,
    /// Retrieval stages that surfaced this result.
    pub source: Vec<&'static str>,
    pub chunk_index: usize,
}

/// Stage toggles assembled from a profile plus request-level overrides.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub retrieval: RetrievalMode,
    pub rerank: bool,
    pub expand: ExpandMode,
    pub time_half_life_days: Option<f32>,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StageToggles {
    pub hybrid: Option<bool>,
    pub rerank: Option<bool>,
    pub expand: Option<bool>,
    pub time_boost: Option<bool>,
    pub limit: Option<usize>,
}

impl QueryOptions {
    pub fn from_profile(profile: &Profile, toggles: StageToggles) -> Self {
        let retrieval = match toggles.hybrid {
            Some(true) => RetrievalMode::Hybrid,
            Some(false) if profile.retrieval == RetrievalMode::Hybrid => RetrievalMode::DenseOnly,
            _ => profile.retrieval,
        };
        let expand = match toggles.expand {
            Some(true) => ExpandMode::Always,
            Some(false) => ExpandMode::Off,
            None => profile.expand,
        };
        let time_half_life_days = match toggles.time_boost {
            Some(false) => None,
            Some(true) => profile.time_half_life_days.or(Some(90.0)),
            None => profile.time_half_life_days,
        };
        let limit = toggles
            .limit
            .unwrap_or(profile.limit)
            .clamp(1, crate::config::MAX_RESULT_LIMIT);
        Self {
            retrieval,
            rerank: toggles.rerank.unwrap_or(profile.rerank),
            expand,
            time_half_life_days,
            limit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub chunking: ChunkConfig,
    pub chunking_enabled: bool,
    pub change_detection: ChangeDetection,
    pub embed_batch_size: usize,
    pub expand_timeout: Duration,
    pub rerank_timeout: Duration,
    pub exclude_patterns: Vec<String>,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig, chunking_enabled: bool) -> Self {
        Self {
            chunking: config.chunking,
            chunking_enabled,
            change_detection: config.change_detection,
            embed_batch_size: config.embed_batch_size,
            expand_timeout: Duration::from_millis(config.expand_timeout_ms),
            rerank_timeout: Duration::from_millis(config.rerank_timeout_ms),
            exclude_patterns: config.exclude_patterns.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VaultStats {
    pub file_count: usize,
    pub embedding_count: usize,
    pub tag_count: usize,
    pub directory_count: usize,
    pub model_id: String,
    pub dimension: usize,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct Pipeline {
    name: String,
    reader: VaultReader,
    store: DenseStore,
    embedder: Arc<dyn EmbeddingEngine>,
    reranker: Option<Arc<dyn CrossEncoder>>,
    settings: PipelineSettings,
    canonical_root: PathBuf,
    data: StoreData,
    lexical: Bm25Index,
}

/// One retrieval candidate flowing through the stages. Scores accumulate in
/// dedicated fields; `order` is the explicit ordering key at each point.
struct Candidate {
    row: usize,
    similarity: f32,
    bm25: f32,
    rrf: f32,
    cross: Option<f32>,
    order: f32,
    sources: Vec<&'static str>,
}

impl Pipeline {
    /// Instantiate the runtime for one vault: load the persisted store
    /// (degrading to empty if it is corrupt), build the lexical index from
    /// the stored metadata, and warm the embedding model.
    pub fn open(
        name: &str,
        root: &Path,
        embedder: Arc<dyn EmbeddingEngine>,
        reranker: Option<Arc<dyn CrossEncoder>>,
        settings: PipelineSettings,
    ) -> TemoaResult<Self> {
        let store = DenseStore::new(root, embedder.id(), embedder.dimension());
        let data = match store.load() {
            Ok(Some(data)) => data,
            Ok(None) => empty_store_data(embedder.id(), embedder.dimension(), store.vault_path()),
            Err(e) => {
                warn!(vault = name, error = %e, "store unreadable, opening empty");
                empty_store_data(embedder.id(), embedder.dimension(), store.vault_path())
            }
        };
        let lexical = Bm25Index::build(&data.metadata);
        let canonical_root =
            dunce::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());

        embedder.warm()?;
        info!(
            vault = name,
            rows = data.vectors.len(),
            files = data.manifest.file_tracking.len(),
            model = embedder.id(),
            "pipeline ready"
        );

        Ok(Self {
            name: name.to_string(),
            reader: VaultReader::with_excludes(root.to_path_buf(), &settings.exclude_patterns),
            store,
            embedder,
            reranker,
            settings,
            canonical_root,
            data,
            lexical,
        })
    }

    pub fn file_count(&self) -> usize {
        self.data.manifest.file_tracking.len()
    }

    pub fn stats(&self) -> VaultStats {
        let tags: HashSet<&str> = self
            .data
            .metadata
            .iter()
            .flat_map(|m| m.tags.iter().map(|t| t.as_str()))
            .collect();
        let dirs: HashSet<&str> = self
            .data
            .manifest
            .file_tracking
            .keys()
            .map(|p| {
                Path::new(p.as_str())
                    .parent()
                    .and_then(|d| d.to_str())
                    .unwrap_or("")
            })
            .collect();
        VaultStats {
            file_count: self.data.manifest.file_tracking.len(),
            embedding_count: self.data.vectors.len(),
            tag_count: tags.len(),
            directory_count: dirs.len(),
            model_id: self.data.manifest.model_info.id.clone(),
            dimension: self.data.manifest.model_info.dimension,
            created_at: if self.data.vectors.is_empty() {
                None
            } else {
                Some(self.data.manifest.created_at)
            },
        }
    }

    /// Rebuild or refresh the index and swap the new store in. Callers hold
    /// the vault's exclusive lock; concurrent searches wait on it.
    pub fn reindex(&mut self, force: bool) -> TemoaResult<IndexReport> {
        let indexer = Indexer {
            reader: &self.reader,
            store: &self.store,
            embedder: self.embedder.as_ref(),
            chunking: self.settings.chunking,
            chunking_enabled: self.settings.chunking_enabled,
            change_detection: self.settings.change_detection,
            batch_size: self.settings.embed_batch_size,
        };
        let (data, report) = indexer.run(Some(&self.data), force)?;
        self.lexical = Bm25Index::build(&data.metadata);
        self.data = data;
        Ok(report)
    }

    /// Run the full query stage graph.
    pub async fn search(
        &self,
        raw_query: &str,
        opts: &QueryOptions,
        filters: &FilterSet,
    ) -> TemoaResult<Vec<SearchResult>> {
        let query = raw_query.trim();
        if query.is_empty() || self.data.metadata.is_empty() {
            return Ok(vec![]);
        }

        // Stage 1 — optional query expansion.
        let query = self.maybe_expand(query, opts).await;

        // Stage 2 — file prefilter from inclusive predicates.
        let whitelist = filters.whitelist(&self.data.metadata);
        if let Some(w) = &whitelist {
            if w.is_empty() {
                return Ok(vec![]);
            }
        }

        // Stage 3 — primary retrieval.
        let pool = CANDIDATE_POOL.max(opts.limit);
        let dense_hits = if opts.retrieval != RetrievalMode::Bm25Only {
            let vector = self.embed_query(query.clone()).await?;
            Some(dense_search(
                &self.data.vectors,
                &self.data.metadata,
                &vector,
                pool,
                whitelist.as_ref(),
            ))
        } else {
            None
        };
        let bm25_hits = if opts.retrieval != RetrievalMode::DenseOnly {
            Some(self.lexical.search(&query, pool, whitelist.as_ref()))
        } else {
            None
        };

        // Stage 4 — reciprocal rank fusion (hybrid only).
        let mut candidates = fuse(dense_hits, bm25_hits, opts.retrieval);

        // Stage 5 — result-level filters.
        candidates.retain(|c| filters.admits(&self.data.metadata[c.row]));

        // Stage 6 — collapse chunks to their best-scoring row per file.
        candidates = dedup_chunks(candidates, &self.data);

        // Stage 7 — cross-encoder re-ranking.
        if opts.rerank && candidates.len() > 1 {
            self.rerank(&query, &mut candidates).await;
        }

        // Stage 8 — time-decay boost over the current ordering score.
        if let Some(half_life) = opts.time_half_life_days {
            for c in candidates.iter_mut() {
                let base = c.cross.unwrap_or(c.order);
                c.order = base * self.time_boost_factor(
                    &self.data.metadata[c.row].relative_path,
                    half_life,
                );
            }
            candidates.sort_by(|a, b| {
                b.order
                    .partial_cmp(&a.order)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        // Stage 9 — truncation and serialization-safe scores.
        candidates.truncate(opts.limit);
        Ok(candidates
            .into_iter()
            .map(|c| self.to_result(c))
            .collect())
    }

    async fn embed_query(&self, query: String) -> TemoaResult<Vec<f32>> {
        let embedder = self.embedder.clone();
        let mut vectors = tokio::task::spawn_blocking(move || embedder.embed(&[query]))
            .await
            .map_err(|e| TemoaError::Search(format!("embedding task failed: {}", e)))??;
        vectors
            .pop()
            .ok_or_else(|| TemoaError::Search("embedder returned no vector".to_string()))
    }

    /// Stage 1. Short queries are widened with the strongest terms from a
    /// small dense probe; any failure or timeout falls back to the raw
    /// query.
    async fn maybe_expand(&self, query: &str, opts: &QueryOptions) -> String {
        let trigger = match opts.expand {
            ExpandMode::Off => false,
            ExpandMode::Auto => query.split_whitespace().count() < 3,
            ExpandMode::Always => true,
        };
        if !trigger {
            return query.to_string();
        }

        let attempt = async {
            let vector = self.embed_query(query.to_string()).await.ok()?;
            let hits = dense_search(
                &self.data.vectors,
                &self.data.metadata,
                &vector,
                EXPAND_DOCS,
                None,
            );
            if hits.is_empty() {
                return None;
            }
            let texts: Vec<&str> = hits
                .iter()
                .map(|(row, _)| self.data.metadata[*row].text.as_str())
                .collect();
            let terms = expansion_terms(query, &texts);
            if terms.is_empty() {
                None
            } else {
                Some(format!("{} {}", query, terms.join(" ")))
            }
        };

        match tokio::time::timeout(self.settings.expand_timeout, attempt).await {
            Ok(Some(expanded)) => {
                debug!(vault = %self.name, original = query, expanded = %expanded, "query expanded");
                expanded
            }
            Ok(None) => {
                debug!(vault = %self.name, query, "expansion produced nothing, using raw query");
                query.to_string()
            }
            Err(_) => {
                warn!(vault = %self.name, query, "expansion timed out, using raw query");
                query.to_string()
            }
        }
    }

    /// Stage 7. Scores up to RERANK_POOL non-empty passages; on timeout or
    /// model failure the prior ordering stands.
    async fn rerank(&self, query: &str, candidates: &mut Vec<Candidate>) {
        let Some(reranker) = &self.reranker else {
            return;
        };

        let mut slots: Vec<usize> = Vec::new();
        let mut passages: Vec<String> = Vec::new();
        for (i, c) in candidates.iter().enumerate() {
            if passages.len() >= RERANK_POOL {
                break;
            }
            let text = &self.data.metadata[c.row].text;
            if text.trim().is_empty() {
                continue;
            }
            slots.push(i);
            passages.push(text.clone());
        }
        if passages.is_empty() {
            return;
        }

        let reranker = reranker.clone();
        let query_owned = query.to_string();
        let task =
            tokio::task::spawn_blocking(move || reranker.score(&query_owned, &passages));
        let scores = match tokio::time::timeout(self.settings.rerank_timeout, task).await {
            Ok(Ok(Ok(scores))) => scores,
            Ok(Ok(Err(e))) => {
                warn!(vault = %self.name, error = %e, "re-ranking failed, keeping prior order");
                return;
            }
            Ok(Err(e)) => {
                warn!(vault = %self.name, error = %e, "re-ranking task died, keeping prior order");
                return;
            }
            Err(_) => {
                warn!(vault = %self.name, "re-ranking timed out, keeping prior order");
                return;
            }
        };

        for (slot, score) in slots.into_iter().zip(scores) {
            candidates[slot].cross = Some(score);
            candidates[slot].order = score;
        }
        // Scored candidates above unscored ones, each group keeping a
        // deterministic order.
        candidates.sort_by(|a, b| match (a.cross, b.cross) {
            (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(std::cmp::Ordering::Equal),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
    }

    /// Stage 8 helper. Reads the file's mtime only after proving the
    /// resolved path stays inside the vault; anything else leaves the score
    /// unboosted.
    fn time_boost_factor(&self, relative_path: &str, half_life_days: f32) -> f32 {
        let candidate = self.canonical_root.join(relative_path);
        let resolved = match dunce::canonicalize(&candidate) {
            Ok(p) => p,
            Err(_) => return 1.0,
        };
        if !resolved.starts_with(&self.canonical_root) {
            warn!(
                vault = %self.name,
                path = relative_path,
                "path escapes vault root, skipping time boost"
            );
            return 1.0;
        }
        let age_days = std::fs::metadata(&resolved)
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| std::time::SystemTime::now().duration_since(t).ok())
            .map(|d| d.as_secs_f32() / 86_400.0)
            .unwrap_or(f32::INFINITY);
        decay_boost(age_days, half_life_days)
    }

    fn to_result(&self, c: Candidate) -> SearchResult {
        let meta = &self.data.metadata[c.row];
        SearchResult {
            relative_path: meta.relative_path.clone(),
            title: meta.title.clone(),
            excerpt: excerpt_of(&meta.text),
            frontmatter: meta.frontmatter.clone(),
            tags: meta.tags.clone(),
            similarity_score: finite(c.similarity),
            bm25_score: finite(c.bm25),
            rrf_score: finite(c.rrf),
            cross_encoder_score: c.cross.map(finite),
            final_score: finite(c.order),
            source: c.sources,
            chunk_index: meta.chunk_index,
        }
    }
}

fn empty_store_data(model_id: &str, dimension: usize, vault_path: &str) -> StoreData {
    StoreData {
        vectors: vec![],
        metadata: vec![],
        manifest: crate::dense::Manifest {
            model_info: crate::dense::ModelInfo {
                id: model_id.to_string(),
                dimension,
            },
            created_at: chrono::Utc::now(),
            num_embeddings: 0,
            embedding_dim: dimension,
            vault_path: vault_path.to_string(),
            file_tracking: Default::default(),
        },
    }
}

/// Stage 4. Hybrid rankings combine by reciprocal rank; single-ranker modes
/// order by that ranker's native score.
fn fuse(
    dense_hits: Option<Vec<(usize, f32)>>,
    bm25_hits: Option<Vec<(usize, f32)>>,
    mode: RetrievalMode,
) -> Vec<Candidate> {
    let mut by_row: HashMap<usize, Candidate> = HashMap::new();

    if let Some(hits) = &dense_hits {
        for (rank, &(row, score)) in hits.iter().enumerate() {
            let c = by_row.entry(row).or_insert_with(|| Candidate {
                row,
                similarity: 0.0,
                bm25: 0.0,
                rrf: 0.0,
                cross: None,
                order: 0.0,
                sources: vec![],
            });
            c.similarity = score;
            c.rrf += 1.0 / (RRF_K + (rank + 1) as f32);
            c.sources.push("dense");
        }
    }
    if let Some(hits) = &bm25_hits {
        for (rank, &(row, score)) in hits.iter().enumerate() {
            let c = by_row.entry(row).or_insert_with(|| Candidate {
                row,
                similarity: 0.0,
                bm25: 0.0,
                rrf: 0.0,
                cross: None,
                order: 0.0,
                sources: vec![],
            });
            c.bm25 = score;
            c.rrf += 1.0 / (RRF_K + (rank + 1) as f32);
            c.sources.push("bm25");
        }
    }

    let mut candidates: Vec<Candidate> = by_row.into_values().collect();
    for c in candidates.iter_mut() {
        c.order = match mode {
            RetrievalMode::Hybrid => c.rrf,
            RetrievalMode::DenseOnly => c.similarity,
            RetrievalMode::Bm25Only => c.bm25,
        };
    }
    candidates.sort_by(|a, b| {
        b.order
            .partial_cmp(&a.order)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.row.cmp(&b.row))
    });
    candidates
}

/// Stage 6. One result per file: the best-scoring chunk wins and keeps its
/// excerpt.
fn dedup_chunks(candidates: Vec<Candidate>, data: &StoreData) -> Vec<Candidate> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = Vec::with_capacity(candidates.len());
    // Candidates arrive ordered best-first, so the first row per path wins.
    for c in candidates {
        let path = data.metadata[c.row].relative_path.as_str();
        if seen.insert(path) {
            out.push(c);
        }
    }
    out
}

/// TF-IDF over the ad-hoc probe corpus: the strongest non-stopword terms
/// not already present in the query.
pub(crate) fn expansion_terms(query: &str, docs: &[&str]) -> Vec<String> {
    let query_tokens: HashSet<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
        .collect();

    let n_docs = docs.len() as f32;
    let mut tf: HashMap<String, f32> = HashMap::new();
    let mut df: HashMap<String, f32> = HashMap::new();
    for doc in docs {
        let mut in_doc: HashSet<String> = HashSet::new();
        for token in doc
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= 3)
            .map(|t| t.to_ascii_lowercase())
        {
            if is_stopword(&token) || query_tokens.contains(&token) {
                continue;
            }
            if token.chars().all(|c| c.is_numeric()) {
                continue;
            }
            *tf.entry(token.clone()).or_insert(0.0) += 1.0;
            in_doc.insert(token);
        }
        for token in in_doc {
            *df.entry(token).or_insert(0.0) += 1.0;
        }
    }

    let mut weighted: Vec<(String, f32)> = tf
        .into_iter()
        .map(|(term, freq)| {
            let d = df.get(&term).copied().unwrap_or(1.0);
            let weight = freq * ((n_docs + 1.0) / d).ln();
            (term, weight)
        })
        .collect();
    weighted.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    weighted
        .into_iter()
        .take(EXPAND_TERMS)
        .map(|(term, _)| term)
        .collect()
}

fn is_stopword(token: &str) -> bool {
    const STOPWORDS: &[&str] = &[
        "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "her", "was",
        "one", "our", "out", "day", "get", "has", "him", "his", "how", "its", "new", "now",
        "old", "see", "two", "way", "who", "did", "yes", "this", "that", "with", "have",
        "from", "they", "will", "what", "when", "where", "which", "while", "about", "there",
        "their", "would", "could", "should", "been", "being", "into", "more", "some", "than",
        "then", "them", "these", "those", "very", "just", "also", "over", "such", "only",
    ];
    STOPWORDS.contains(&token)
}

fn decay_boost(age_days: f32, half_life_days: f32) -> f32 {
    if !age_days.is_finite() || half_life_days <= 0.0 {
        return 1.0;
    }
    1.0 + TIME_MAX_BOOST * 0.5f32.powf(age_days / half_life_days)
}

fn excerpt_of(text: &str) -> String {
    if text.chars().count() <= EXCERPT_MAX_CHARS {
        return text.to_string();
    }
    text.chars().take(EXCERPT_MAX_CHARS).collect()
}

/// JSON output must be JSON-safe: non-finite scores become 0.
fn finite(x: f32) -> f32 {
    if x.is_finite() { x } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::stub::{StubEmbedder, StubReranker};
    use crate::profiles;

    fn settings() -> PipelineSettings {
        PipelineSettings {
            chunking: ChunkConfig::default(),
            chunking_enabled: true,
            change_detection: ChangeDetection::Hash,
            embed_batch_size: 8,
            expand_timeout: Duration::from_millis(500),
            rerank_timeout: Duration::from_millis(1000),
            exclude_patterns: vec![],
        }
    }

    fn opts(profile_id: &str) -> QueryOptions {
        QueryOptions::from_profile(&profiles::resolve(Some(profile_id)), StageToggles::default())
    }

    fn open_pipeline(
        vault: &std::path::Path,
        embedder: StubEmbedder,
        reranker: Option<Arc<dyn CrossEncoder>>,
    ) -> Pipeline {
        let mut p = Pipeline::open(
            "test",
            vault,
            Arc::new(embedder),
            reranker,
            settings(),
        )
        .unwrap();
        p.reindex(false).unwrap();
        p
    }

    #[tokio::test]
    async fn empty_query_returns_empty_without_model_calls() {
        let vault = tempfile::tempdir().unwrap();
        std::fs::write(vault.path().join("a.md"), "some text").unwrap();
        let embedder = StubEmbedder::new(16);
        let calls = embedder.call_counter();
        let pipeline = open_pipeline(vault.path(), embedder, None);
        let calls_after_index = calls.load(std::sync::atomic::Ordering::SeqCst);

        let results = pipeline
            .search("   ", &opts("default"), &FilterSet::default())
            .await
            .unwrap();
        assert!(results.is_empty());
        assert_eq!(
            calls.load(std::sync::atomic::Ordering::SeqCst),
            calls_after_index
        );
    }

    #[tokio::test]
    async fn dense_search_finds_token_overlap() {
        let vault = tempfile::tempdir().unwrap();
        std::fs::write(vault.path().join("walk.md"), "morning walk in the park").unwrap();
        std::fs::write(vault.path().join("code.md"), "refactoring rust modules").unwrap();
        let pipeline = open_pipeline(vault.path(), StubEmbedder::new(64), None);

        let results = pipeline
            .search("morning walk", &opts("repos"), &FilterSet::default())
            .await
            .unwrap();
        assert_eq!(results[0].relative_path, "walk.md");
        assert!(results[0].similarity_score > 0.0);
        assert!(results[0].source.contains(&"dense"));
    }

    #[tokio::test]
    async fn hybrid_recovers_keyword_only_match() {
        let vault = tempfile::tempdir().unwrap();
        // The bi-encoder stub has no representation for "workout": dense
        // retrieval ranks every filler doc above the target, but BM25 puts
        // the target first and fusion carries it into the top results.
        let embedder = StubEmbedder::new(4).with_oov(&["workout"]);
        let filler_word = ["alpha", "beta", "gamma", "delta", "epsilon", "zeta"]
            .iter()
            .find(|w| embedder.bucket(w) == 0)
            .expect("a filler word hashing to the unknown bucket");
        for i in 0..12 {
            std::fs::write(
                vault.path().join(format!("filler{:02}.md", i)),
                format!("{} notes about general topics", filler_word),
            )
            .unwrap();
        }
        std::fs::write(vault.path().join("target.md"), "workout good walk").unwrap();
        let pipeline = open_pipeline(vault.path(), embedder, None);

        let mut dense_only = opts("repos");
        dense_only.limit = 10;
        let results = pipeline
            .search("workout", &dense_only, &FilterSet::default())
            .await
            .unwrap();
        assert!(
            !results.iter().any(|r| r.relative_path == "target.md"),
            "dense-only should miss the keyword document"
        );

        let mut hybrid = opts("recent");
        hybrid.limit = 10;
        hybrid.time_half_life_days = None;
        hybrid.expand = ExpandMode::Off;
        let results = pipeline
            .search("workout", &hybrid, &FilterSet::default())
            .await
            .unwrap();
        let target = results
            .iter()
            .find(|r| r.relative_path == "target.md")
            .expect("hybrid should recover the keyword document");
        assert!(target.bm25_score > 0.0);
        assert!(target.source.contains(&"bm25"));
    }

    #[tokio::test]
    async fn chunked_document_collapses_to_one_result() {
        let vault = tempfile::tempdir().unwrap();
        let body = "archery practice notes with detail.\n\n".repeat(280); // ~10k chars
        std::fs::write(vault.path().join("long.md"), &body).unwrap();
        let pipeline = open_pipeline(vault.path(), StubEmbedder::new(64), None);
        assert!(pipeline.data.vectors.len() > 10);

        let results = pipeline
            .search("archery practice", &opts("recent"), &FilterSet::default())
            .await
            .unwrap();
        let matching: Vec<_> = results
            .iter()
            .filter(|r| r.relative_path == "long.md")
            .collect();
        assert_eq!(matching.len(), 1);
        // The excerpt is exactly one of the indexed chunks.
        assert!(
            pipeline
                .data
                .metadata
                .iter()
                .any(|m| m.text == matching[0].excerpt)
        );
    }

    #[tokio::test]
    async fn status_filter_drops_inactive_by_default() {
        let vault = tempfile::tempdir().unwrap();
        std::fs::write(
            vault.path().join("live.md"),
            "shared topic words here",
        )
        .unwrap();
        std::fs::write(
            vault.path().join("dead.md"),
            "---\nstatus: hidden\n---\nshared topic words here",
        )
        .unwrap();
        let pipeline = open_pipeline(vault.path(), StubEmbedder::new(64), None);

        let results = pipeline
            .search("shared topic", &opts("recent"), &FilterSet::default())
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.relative_path != "dead.md"));

        let explicit = FilterSet {
            statuses: Some(vec![crate::vault::DocStatus::Hidden]),
            ..Default::default()
        };
        let results = pipeline
            .search("shared topic", &opts("recent"), &explicit)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].relative_path, "dead.md");
    }

    #[tokio::test]
    async fn inclusive_filters_prefilter_retrieval() {
        let vault = tempfile::tempdir().unwrap();
        std::fs::create_dir(vault.path().join("daily")).unwrap();
        std::fs::write(vault.path().join("daily/in.md"), "topic words").unwrap();
        std::fs::write(vault.path().join("out.md"), "topic words").unwrap();
        let pipeline = open_pipeline(vault.path(), StubEmbedder::new(64), None);

        let filters = FilterSet {
            include_paths: vec!["daily/".into()],
            ..Default::default()
        };
        let results = pipeline
            .search("topic", &opts("recent"), &filters)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].relative_path, "daily/in.md");
    }

    #[tokio::test]
    async fn reranker_overrides_prior_ordering() {
        let vault = tempfile::tempdir().unwrap();
        // `weak.md` dominates both retrievers on raw token statistics, but
        // only `strong.md` contains the query as a phrase, which the
        // cross-encoder rewards.
        std::fs::write(
            vault.path().join("weak.md"),
            "composting things composting stuff composting items basics galore",
        )
        .unwrap();
        std::fs::write(
            vault.path().join("strong.md"),
            "garden layout and composting basics notes",
        )
        .unwrap();
        let pipeline = open_pipeline(
            vault.path(),
            StubEmbedder::new(64),
            Some(Arc::new(StubReranker)),
        );

        let mut o = opts("default");
        o.time_half_life_days = None;
        o.expand = ExpandMode::Off;
        o.rerank = false;
        let without = pipeline
            .search("composting basics", &o, &FilterSet::default())
            .await
            .unwrap();
        assert_eq!(without[0].relative_path, "weak.md");

        o.rerank = true;
        let results = pipeline
            .search("composting basics", &o, &FilterSet::default())
            .await
            .unwrap();
        assert_eq!(results[0].relative_path, "strong.md");
        assert!(results[0].cross_encoder_score.unwrap() > 0.0);
        assert_eq!(
            results[0].final_score,
            results[0].cross_encoder_score.unwrap()
        );
    }

    #[test]
    fn expansion_terms_surface_corpus_vocabulary() {
        let docs = [
            "machine learning models need training data",
            "neural networks and machine learning",
            "deep learning is a branch of machine learning",
            "model evaluation and learning curves",
            "training neural models with gradient descent",
        ];
        let terms = expansion_terms("ai", &docs);
        assert_eq!(terms.len(), 3);
        assert!(
            terms.iter().any(|t| ["learning", "machine", "neural", "model", "models", "training"]
                .contains(&t.as_str())),
            "terms were {:?}",
            terms
        );
    }

    #[test]
    fn expansion_skips_query_tokens_and_stopwords() {
        let docs = ["the the the workout workout plan", "workout plan for the week"];
        let terms = expansion_terms("workout", &docs);
        assert!(!terms.contains(&"workout".to_string()));
        assert!(!terms.contains(&"the".to_string()));
    }

    #[tokio::test]
    async fn short_query_is_expanded_when_enabled() {
        let vault = tempfile::tempdir().unwrap();
        for (name, body) in [
            ("a.md", "machine learning models need training data"),
            ("b.md", "neural networks and machine learning"),
            ("c.md", "deep learning is a branch of machine learning"),
        ] {
            std::fs::write(vault.path().join(name), body).unwrap();
        }
        let pipeline = open_pipeline(vault.path(), StubEmbedder::new(64), None);

        // Expansion is observable through retrieval: the raw query shares no
        // tokens with the corpus, the expanded one does.
        let mut off = opts("recent");
        off.expand = ExpandMode::Off;
        off.time_half_life_days = None;
        let results = pipeline
            .search("ai", &off, &FilterSet::default())
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.bm25_score == 0.0));

        let mut on = off.clone();
        on.expand = ExpandMode::Auto;
        let results = pipeline
            .search("ai", &on, &FilterSet::default())
            .await
            .unwrap();
        assert!(
            results.iter().any(|r| r.bm25_score > 0.0),
            "expanded query should produce lexical hits"
        );
    }

    #[test]
    fn fusion_sums_reciprocal_ranks() {
        let dense = vec![(0, 0.9), (1, 0.5)];
        let bm25 = vec![(1, 3.0), (2, 1.0)];
        let fused = fuse(Some(dense), Some(bm25), RetrievalMode::Hybrid);
        let row1 = fused.iter().find(|c| c.row == 1).unwrap();
        let expected = 1.0 / (RRF_K + 2.0) + 1.0 / (RRF_K + 1.0);
        assert!((row1.rrf - expected).abs() < 1e-6);
        assert_eq!(row1.sources, vec!["dense", "bm25"]);
        // Row present in both rankers outranks single-source rows.
        assert_eq!(fused[0].row, 1);
    }

    #[test]
    fn decay_boost_shape() {
        assert!((decay_boost(0.0, 90.0) - 1.2).abs() < 1e-6);
        assert!((decay_boost(90.0, 90.0) - 1.1).abs() < 1e-6);
        assert!(decay_boost(900.0, 90.0) < 1.001);
        assert_eq!(decay_boost(f32::INFINITY, 90.0), 1.0);
    }

    #[test]
    fn time_boost_rejects_paths_outside_vault() {
        let vault = tempfile::tempdir().unwrap();
        std::fs::write(vault.path().join("a.md"), "text").unwrap();
        let pipeline = open_pipeline(vault.path(), StubEmbedder::new(16), None);
        assert_eq!(
            pipeline.time_boost_factor("../../etc/passwd", 90.0),
            1.0
        );
        assert!(pipeline.time_boost_factor("a.md", 90.0) > 1.0);
    }

    #[test]
    fn non_finite_scores_are_sanitized() {
        assert_eq!(finite(f32::NAN), 0.0);
        assert_eq!(finite(f32::INFINITY), 0.0);
        assert_eq!(finite(0.25), 0.25);
    }

    #[test]
    fn option_overrides_win_over_profile() {
        let profile = profiles::resolve(Some("default"));
        let o = QueryOptions::from_profile(
            &profile,
            StageToggles {
                hybrid: Some(false),
                rerank: Some(false),
                expand: Some(false),
                time_boost: Some(false),
                limit: Some(5),
            },
        );
        assert_eq!(o.retrieval, RetrievalMode::DenseOnly);
        assert!(!o.rerank);
        assert_eq!(o.expand, ExpandMode::Off);
        assert!(o.time_half_life_days.is_none());
        assert_eq!(o.limit, 5);
    }
}
