//! LRU cache of per-vault pipelines.
//!
//! Model loading and index reads are expensive, so one `Pipeline` is kept
//! per (vault, model) key, shared behind an RwLock: searches take the read
//! side, reindex takes the write side, and the registry list itself is
//! guarded by its own mutex so eviction and insertion are serialized.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::{AppConfig, VaultEntry};
use crate::embedder::{
    CrossEncoder, EmbeddingEngine, FastembedEngine, FastembedReranker, lookup_model,
};
use crate::error::{TemoaError, TemoaResult};
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::profiles;

pub type SharedPipeline = Arc<RwLock<Pipeline>>;

#[derive(Clone, PartialEq, Eq)]
struct RegistryKey {
    vault_path: PathBuf,
    model_id: String,
}

type EmbedderFactory =
    Box<dyn Fn(&str) -> TemoaResult<Arc<dyn EmbeddingEngine>> + Send + Sync>;

pub struct VaultRegistry {
    config: AppConfig,
    capacity: usize,
    /// MRU order: least recently used at the front.
    entries: tokio::sync::Mutex<Vec<(RegistryKey, SharedPipeline)>>,
    /// One embedding engine per model id, shared across vaults.
    embedders: dashmap::DashMap<String, Arc<dyn EmbeddingEngine>>,
    reranker: Option<Arc<dyn CrossEncoder>>,
    factory: EmbedderFactory,
}

impl VaultRegistry {
    pub fn new(config: AppConfig) -> Self {
        let reranker: Option<Arc<dyn CrossEncoder>> = if config.enable_reranker {
            Some(Arc::new(FastembedReranker::new()))
        } else {
            None
        };
        Self {
            capacity: config.cache_capacity.max(1),
            config,
            entries: tokio::sync::Mutex::new(Vec::new()),
            embedders: dashmap::DashMap::new(),
            reranker,
            factory: Box::new(|model_id| {
                let spec = lookup_model(model_id).ok_or_else(|| {
                    TemoaError::Config(format!("unknown embedding model: {}", model_id))
                })?;
                Ok(Arc::new(FastembedEngine::new(spec)) as Arc<dyn EmbeddingEngine>)
            }),
        }
    }

    #[cfg(test)]
    pub fn with_factory(
        config: AppConfig,
        reranker: Option<Arc<dyn CrossEncoder>>,
        factory: EmbedderFactory,
    ) -> Self {
        Self {
            capacity: config.cache_capacity.max(1),
            config,
            entries: tokio::sync::Mutex::new(Vec::new()),
            embedders: dashmap::DashMap::new(),
            reranker,
            factory,
        }
    }

    fn embedder_for(&self, model_id: &str) -> TemoaResult<Arc<dyn EmbeddingEngine>> {
        if let Some(e) = self.embedders.get(model_id) {
            return Ok(e.value().clone());
        }
        let engine = (self.factory)(model_id)?;
        self.embedders.insert(model_id.to_string(), engine.clone());
        Ok(engine)
    }

    /// Look up or instantiate the pipeline for a vault. Hits move the entry
    /// to the most-recently-used end; misses construct off the async thread
    /// and may evict the least recently used entry.
    pub async fn get(&self, vault: &VaultEntry) -> TemoaResult<SharedPipeline> {
        let vault_path = dunce::canonicalize(&vault.root).map_err(|_| {
            TemoaError::VaultRead(format!(
                "vault root missing: {}",
                vault.root.display()
            ))
        })?;
        let key = RegistryKey {
            vault_path,
            model_id: self.config.model_id.clone(),
        };

        {
            let mut entries = self.entries.lock().await;
            if let Some(pos) = entries.iter().position(|(k, _)| *k == key) {
                let entry = entries.remove(pos);
                let pipeline = entry.1.clone();
                entries.push(entry);
                return Ok(pipeline);
            }
        }

        // Miss: build without holding the registry lock. Store load and
        // model warm-up both block.
        let embedder = self.embedder_for(&key.model_id)?;
        let reranker = self.reranker.clone();
        let settings =
            PipelineSettings::from_config(&self.config, profiles::resolve(None).chunking);
        let name = vault.name.clone();
        let root = vault.root.clone();
        let pipeline = tokio::task::spawn_blocking(move || {
            Pipeline::open(&name, &root, embedder, reranker, settings)
        })
        .await
        .map_err(|e| TemoaError::Search(format!("pipeline construction failed: {}", e)))??;
        let pipeline = Arc::new(RwLock::new(pipeline));

        let mut entries = self.entries.lock().await;
        // Another request may have built the same pipeline meanwhile.
        if let Some(pos) = entries.iter().position(|(k, _)| *k == key) {
            let entry = entries.remove(pos);
            let existing = entry.1.clone();
            entries.push(entry);
            return Ok(existing);
        }
        while entries.len() >= self.capacity {
            let (evicted, _) = entries.remove(0);
            info!(
                vault = %evicted.vault_path.display(),
                model = %evicted.model_id,
                "evicting least recently used pipeline"
            );
        }
        entries.push((key, pipeline.clone()));
        Ok(pipeline)
    }

    /// Total files indexed across cached pipelines, for `/health`.
    pub async fn files_indexed(&self) -> usize {
        let entries = self.entries.lock().await;
        let mut total = 0;
        for (_, pipeline) in entries.iter() {
            if let Ok(p) = pipeline.try_read() {
                total += p.file_count();
            }
        }
        total
    }

    pub async fn cached_count(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::stub::StubEmbedder;
    use std::path::Path;

    fn test_config(capacity: usize, vaults: Vec<VaultEntry>) -> AppConfig {
        AppConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            vaults,
            model_id: "stub".to_string(),
            enable_reranker: false,
            cache_capacity: capacity,
            chunking: crate::config::ChunkConfig::default(),
            change_detection: crate::config::ChangeDetection::Hash,
            exclude_patterns: vec![],
            cors_origins: vec![],
            search_rate_per_min: 1000,
            reindex_rate_per_min: 1000,
            query_deadline_ms: 2000,
            expand_timeout_ms: 500,
            rerank_timeout_ms: 1000,
            embed_batch_size: 8,
        }
    }

    fn registry(capacity: usize, vaults: Vec<VaultEntry>) -> VaultRegistry {
        VaultRegistry::with_factory(
            test_config(capacity, vaults),
            None,
            Box::new(|_| Ok(Arc::new(StubEmbedder::new(16)) as Arc<dyn EmbeddingEngine>)),
        )
    }

    fn entry(name: &str, root: &Path) -> VaultEntry {
        VaultEntry {
            name: name.to_string(),
            root: root.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn hit_returns_same_pipeline() {
        let vault = tempfile::tempdir().unwrap();
        std::fs::write(vault.path().join("a.md"), "text").unwrap();
        let reg = registry(3, vec![]);
        let e = entry("v", vault.path());

        let p1 = reg.get(&e).await.unwrap();
        let p2 = reg.get(&e).await.unwrap();
        assert!(Arc::ptr_eq(&p1, &p2));
        assert_eq!(reg.cached_count().await, 1);
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let v1 = tempfile::tempdir().unwrap();
        let v2 = tempfile::tempdir().unwrap();
        let v3 = tempfile::tempdir().unwrap();
        let reg = registry(2, vec![]);

        let p1 = reg.get(&entry("v1", v1.path())).await.unwrap();
        let _p2 = reg.get(&entry("v2", v2.path())).await.unwrap();

        // Touch v1 so v2 becomes the LRU, then insert v3.
        let _ = reg.get(&entry("v1", v1.path())).await.unwrap();
        let _p3 = reg.get(&entry("v3", v3.path())).await.unwrap();
        assert_eq!(reg.cached_count().await, 2);

        // v1 is still the cached instance; v2 was evicted and would be
        // rebuilt fresh.
        let p1_again = reg.get(&entry("v1", v1.path())).await.unwrap();
        assert!(Arc::ptr_eq(&p1, &p1_again));
    }

    #[tokio::test]
    async fn missing_vault_root_fails() {
        let reg = registry(2, vec![]);
        let err = reg
            .get(&entry("ghost", Path::new("/nonexistent/vault")))
            .await;
        assert!(matches!(err, Err(TemoaError::VaultRead(_))));
    }

    #[tokio::test]
    async fn reindex_then_search_sees_new_store() {
        let vault = tempfile::tempdir().unwrap();
        std::fs::write(vault.path().join("a.md"), "alpha content").unwrap();
        let reg = registry(2, vec![]);
        let shared = reg.get(&entry("v", vault.path())).await.unwrap();

        {
            let mut p = shared.write().await;
            let report = p.reindex(false).unwrap();
            assert_eq!(report.new, 1);
        }
        {
            let p = shared.read().await;
            assert_eq!(p.file_count(), 1);
            let results = p
                .search(
                    "alpha",
                    &crate::pipeline::QueryOptions::from_profile(
                        &profiles::resolve(Some("keywords")),
                        Default::default(),
                    ),
                    &crate::filters::FilterSet::default(),
                )
                .await
                .unwrap();
            assert_eq!(results.len(), 1);
        }
    }
}
