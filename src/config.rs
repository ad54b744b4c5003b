use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Maximum allowed length for search queries (characters).
pub const MAX_SEARCH_QUERY_LENGTH: usize = 1000;

/// Hard ceiling on the per-request result limit.
pub const MAX_RESULT_LIMIT: usize = 200;

/// Candidate pool fetched from each retriever before fusion.
/// Retrieval always asks for `max(CANDIDATE_POOL, requested_limit)` so that
/// fusion and re-ranking have enough material to work with.
pub const CANDIDATE_POOL: usize = 100;

/// Reciprocal rank fusion constant. The standard k=60 keeps the fused score
/// scale-invariant across the dense and lexical rankers.
pub const RRF_K: f32 = 60.0;

/// Directory names never descended into during a vault walk, in addition to
/// any directory whose name starts with `.`.
pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".obsidian",
    ".trash",
    ".temoa",
    "node_modules",
];

/// Check whether a directory name is on the canonical exclusion list.
pub fn is_excluded_directory(name: &str) -> bool {
    name.starts_with('.') || EXCLUDED_DIRS.contains(&name)
}

/// How file changes are detected between index cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeDetection {
    /// Compare filesystem modification times (default, cheap).
    Mtime,
    /// Compare SHA-256 content hashes. Hardening mode for vaults synced by
    /// tools that do not preserve mtimes.
    Hash,
}

/// Chunking knobs, configurable per deployment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Bodies at or under this many characters are indexed whole.
    pub threshold: usize,
    /// Nominal window size for longer bodies.
    pub chunk_size: usize,
    /// Overlap carried between adjacent windows.
    pub chunk_overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            threshold: 4000,
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

/// A configured vault: a short name clients use in requests, mapped to the
/// directory that is its identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultEntry {
    pub name: String,
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub listen_addr: String,
    /// Named vaults, keyed by the `vault=` request parameter. The entry
    /// named `default` (or the first entry) is used when the parameter is
    /// omitted.
    pub vaults: Vec<VaultEntry>,
    /// Embedding model id; must be one of the registry ids in `embedder`.
    pub model_id: String,
    /// Whether the cross-encoder is loaded at all. Disabling it turns the
    /// re-rank stage into a no-op regardless of profile.
    pub enable_reranker: bool,
    /// VaultRegistry LRU capacity.
    pub cache_capacity: usize,
    pub chunking: ChunkConfig,
    pub change_detection: ChangeDetection,
    /// Extra exclusion globs applied to relative paths during vault walks,
    /// on top of the canonical dot-directory skips.
    pub exclude_patterns: Vec<String>,
    /// Allowed CORS origins. Never defaults to a wildcard.
    pub cors_origins: Vec<String>,
    /// Sliding-window rate limits: requests per minute per client.
    pub search_rate_per_min: u32,
    pub reindex_rate_per_min: u32,
    /// Whole-query deadline in milliseconds.
    pub query_deadline_ms: u64,
    /// Optional-stage budgets in milliseconds.
    pub expand_timeout_ms: u64,
    pub rerank_timeout_ms: u64,
    /// Embedding batch size for index builds.
    pub embed_batch_size: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("TEMOA_PORT").unwrap_or_else(|_| "8978".to_string());

        Self {
            listen_addr: format!("127.0.0.1:{}", port),
            vaults: parse_vault_table(),
            model_id: std::env::var("TEMOA_MODEL")
                .unwrap_or_else(|_| crate::embedder::DEFAULT_MODEL_ID.to_string()),
            enable_reranker: std::env::var("TEMOA_RERANKER")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("off"))
                .unwrap_or(true),
            cache_capacity: env_parse("TEMOA_CACHE_CAPACITY", 3),
            chunking: ChunkConfig {
                threshold: env_parse("TEMOA_CHUNK_THRESHOLD", 4000),
                chunk_size: env_parse("TEMOA_CHUNK_SIZE", 1000),
                chunk_overlap: env_parse("TEMOA_CHUNK_OVERLAP", 200),
            },
            change_detection: match std::env::var("TEMOA_CHANGE_DETECTION").as_deref() {
                Ok("hash") => ChangeDetection::Hash,
                _ => ChangeDetection::Mtime,
            },
            exclude_patterns: std::env::var("TEMOA_EXCLUDE_PATTERNS")
                .map(|s| {
                    s.split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            cors_origins: parse_cors_origins(),
            search_rate_per_min: env_parse("TEMOA_SEARCH_RATE", 120),
            reindex_rate_per_min: env_parse("TEMOA_REINDEX_RATE", 6),
            query_deadline_ms: env_parse("TEMOA_QUERY_DEADLINE_MS", 2000),
            expand_timeout_ms: env_parse("TEMOA_EXPAND_TIMEOUT_MS", 500),
            rerank_timeout_ms: env_parse("TEMOA_RERANK_TIMEOUT_MS", 1000),
            embed_batch_size: env_parse("TEMOA_EMBED_BATCH_SIZE", 32),
        }
    }

    /// Resolve a request's `vault=` parameter to a configured entry.
    pub fn vault(&self, name: Option<&str>) -> Option<&VaultEntry> {
        match name {
            Some(n) => self.vaults.iter().find(|v| v.name == n),
            None => self
                .vaults
                .iter()
                .find(|v| v.name == "default")
                .or_else(|| self.vaults.first()),
        }
    }

    /// Snapshot suitable for `GET /config` — structural settings only, no
    /// filesystem details beyond the vault names.
    pub fn public_snapshot(&self) -> serde_json::Value {
        let vault_names: Vec<&str> = self.vaults.iter().map(|v| v.name.as_str()).collect();
        serde_json::json!({
            "model_id": self.model_id,
            "reranker_enabled": self.enable_reranker,
            "cache_capacity": self.cache_capacity,
            "chunking": self.chunking,
            "change_detection": self.change_detection,
            "vaults": vault_names,
            "query_deadline_ms": self.query_deadline_ms,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// `TEMOA_VAULTS` holds `name=path` pairs separated by `;` or `,`.
/// `TEMOA_VAULT` is shorthand for a single vault named `default`.
fn parse_vault_table() -> Vec<VaultEntry> {
    let mut table: BTreeMap<String, PathBuf> = BTreeMap::new();

    if let Ok(spec) = std::env::var("TEMOA_VAULTS") {
        for pair in spec.split([';', ',']).filter(|p| !p.trim().is_empty()) {
            if let Some((name, path)) = pair.split_once('=') {
                table.insert(name.trim().to_string(), PathBuf::from(path.trim()));
            }
        }
    }

    if let Ok(path) = std::env::var("TEMOA_VAULT") {
        table
            .entry("default".to_string())
            .or_insert_with(|| PathBuf::from(path));
    }

    table
        .into_iter()
        .map(|(name, root)| VaultEntry { name, root })
        .collect()
}

/// CORS origins from `TEMOA_CORS_ORIGINS` (comma separated). A wildcard
/// default would expose the private-network service to any web page, so the
/// fallback is loopback origins only.
fn parse_cors_origins() -> Vec<String> {
    match std::env::var("TEMOA_CORS_ORIGINS") {
        Ok(spec) => spec
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => vec![
            "http://localhost:8978".to_string(),
            "http://127.0.0.1:8978".to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excluded_directories() {
        assert!(is_excluded_directory(".obsidian"));
        assert!(is_excluded_directory(".hidden"));
        assert!(is_excluded_directory("node_modules"));
        assert!(!is_excluded_directory("notes"));
    }

    #[test]
    fn default_chunk_config() {
        let c = ChunkConfig::default();
        assert_eq!(c.threshold, 4000);
        assert_eq!(c.chunk_size, 1000);
        assert_eq!(c.chunk_overlap, 200);
    }
}
