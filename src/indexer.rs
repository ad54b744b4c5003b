//! Full and incremental index builds.
//!
//! The incremental path detects changed files against the manifest's
//! tracking table, embeds only new and modified content, and merges it into
//! the existing matrix in a fixed order: deletions (descending positions),
//! then appends in one contiguous block. Modified files are handled as
//! delete-plus-append. The tracking table is rebuilt from the final
//! metadata, so positions are always fresh.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::chunker::chunk_body;
use crate::config::{ChangeDetection, ChunkConfig};
use crate::dense::{ChunkMeta, DenseStore, FileTrack, FileTracking, StoreData};
use crate::embedder::EmbeddingEngine;
use crate::error::TemoaResult;
use crate::vault::{Document, VaultReader};

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    pub new: usize,
    pub modified: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub total: usize,
    pub duration_ms: u64,
}

pub struct Indexer<'a> {
    pub reader: &'a VaultReader,
    pub store: &'a DenseStore,
    pub embedder: &'a dyn EmbeddingEngine,
    pub chunking: ChunkConfig,
    pub chunking_enabled: bool,
    pub change_detection: ChangeDetection,
    pub batch_size: usize,
}

impl Indexer<'_> {
    /// Build or refresh the store. Returns the data to swap into the
    /// runtime; the store on disk has already been written unless the run
    /// short-circuited on an empty change set.
    pub fn run(
        &self,
        existing: Option<&StoreData>,
        force: bool,
    ) -> TemoaResult<(StoreData, IndexReport)> {
        let start = Instant::now();
        let docs = self.reader.read_vault()?;

        let existing = if force { None } else { existing };
        let existing = existing.filter(|data| self.reusable(data));

        let (data, mut report) = match existing {
            Some(data) => self.incremental(data, &docs)?,
            None => self.full_build(&docs)?,
        };

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            vault = %self.store.vault_path(),
            new = report.new,
            modified = report.modified,
            deleted = report.deleted,
            unchanged = report.unchanged,
            rows = data.vectors.len(),
            duration_ms = report.duration_ms,
            "index build complete"
        );
        Ok((data, report))
    }

    /// An existing store can seed an incremental build only if it was built
    /// by the current model and its internal lengths still agree.
    fn reusable(&self, data: &StoreData) -> bool {
        if data.manifest.model_info.id != self.embedder.id() {
            info!(
                store_model = %data.manifest.model_info.id,
                current_model = %self.embedder.id(),
                "model changed, forcing full rebuild"
            );
            return false;
        }
        let tracked: usize = data
            .manifest
            .file_tracking
            .values()
            .map(|t| t.positions.len())
            .sum();
        if data.vectors.len() != data.metadata.len() || tracked != data.vectors.len() {
            warn!("store invariants violated, forcing full rebuild");
            return false;
        }
        true
    }

    fn full_build(&self, docs: &[Arc<Document>]) -> TemoaResult<(StoreData, IndexReport)> {
        let mut metadata: Vec<ChunkMeta> = Vec::new();
        for doc in docs {
            metadata.extend(self.units_for(doc));
        }
        let vectors = self.embed_units(&metadata)?;
        let tracking = self.tracking_from(&metadata, docs);

        let manifest = self.store.save(&vectors, &metadata, tracking)?;
        let report = IndexReport {
            new: docs.len(),
            total: docs.len(),
            ..Default::default()
        };
        Ok((
            StoreData {
                vectors,
                metadata,
                manifest,
            },
            report,
        ))
    }

    fn incremental(
        &self,
        existing: &StoreData,
        docs: &[Arc<Document>],
    ) -> TemoaResult<(StoreData, IndexReport)> {
        let tracking = &existing.manifest.file_tracking;
        let by_path: HashMap<&str, &Arc<Document>> = docs
            .iter()
            .map(|d| (d.relative_path.as_str(), d))
            .collect();

        let mut new_paths: Vec<&Arc<Document>> = Vec::new();
        let mut modified_paths: Vec<&Arc<Document>> = Vec::new();
        for doc in docs {
            match tracking.get(&doc.relative_path) {
                None => new_paths.push(doc),
                Some(track) => {
                    if self.is_modified(doc, track) {
                        modified_paths.push(doc);
                    }
                }
            }
        }
        let deleted_paths: Vec<&String> = tracking
            .keys()
            .filter(|p| !by_path.contains_key(p.as_str()))
            .collect();

        let report = IndexReport {
            new: new_paths.len(),
            modified: modified_paths.len(),
            deleted: deleted_paths.len(),
            unchanged: docs.len() - new_paths.len() - modified_paths.len(),
            total: docs.len(),
            ..Default::default()
        };

        // Empty change set: hand the caller back the current data untouched.
        if new_paths.is_empty() && modified_paths.is_empty() && deleted_paths.is_empty() {
            info!(vault = %self.store.vault_path(), total = docs.len(), "index up to date");
            return Ok((existing.clone(), report));
        }

        // Units and embeddings for everything that must be (re-)embedded.
        let mut fresh_meta: Vec<ChunkMeta> = Vec::new();
        for doc in new_paths.iter().chain(modified_paths.iter()) {
            fresh_meta.extend(self.units_for(doc));
        }
        let fresh_vectors = self.embed_units(&fresh_meta)?;

        // Step 1 — delete. Rows owned by deleted files, plus rows of
        // modified files (their replacements are appended below). Descending
        // order keeps the remaining indices valid while removing.
        let mut doomed: Vec<usize> = Vec::new();
        for path in &deleted_paths {
            doomed.extend(&tracking[path.as_str()].positions);
        }
        for doc in &modified_paths {
            doomed.extend(&tracking[doc.relative_path.as_str()].positions);
        }
        doomed.sort_unstable_by(|a, b| b.cmp(a));

        let mut vectors = existing.vectors.clone();
        let mut metadata = existing.metadata.clone();
        for pos in doomed {
            vectors.remove(pos);
            metadata.remove(pos);
        }

        // Step 2 — append new and re-embedded rows as one contiguous block.
        vectors.extend(fresh_vectors);
        metadata.extend(fresh_meta);

        // Rebuild the tracking table from the final metadata.
        let tracking = self.tracking_from(&metadata, docs);
        let manifest = self.store.save(&vectors, &metadata, tracking)?;

        Ok((
            StoreData {
                vectors,
                metadata,
                manifest,
            },
            report,
        ))
    }

    fn is_modified(&self, doc: &Document, track: &FileTrack) -> bool {
        match self.change_detection {
            ChangeDetection::Mtime => track.modified_epoch != doc.mtime_epoch,
            ChangeDetection::Hash => match &track.content_hash {
                Some(hash) => *hash != content_hash(doc),
                None => track.modified_epoch != doc.mtime_epoch,
            },
        }
    }

    /// Split a document into indexable units. Chunking applies only above
    /// the threshold and when enabled for this vault.
    fn units_for(&self, doc: &Document) -> Vec<ChunkMeta> {
        let cfg = if self.chunking_enabled {
            self.chunking
        } else {
            // Chunking off: one unit regardless of length.
            ChunkConfig {
                threshold: usize::MAX,
                ..self.chunking
            }
        };
        let chunks = chunk_body(&doc.body, &cfg);
        let count = chunks.len();
        chunks
            .into_iter()
            .map(|chunk| ChunkMeta {
                relative_path: doc.relative_path.clone(),
                title: doc.title.clone(),
                text: chunk.text,
                tags: doc.tags.clone(),
                frontmatter: doc.frontmatter.clone(),
                created: doc.created,
                modified: doc.modified,
                content_length: doc.content_length,
                status: doc.status,
                doc_type: doc.doc_type.clone(),
                chunk_index: chunk.ordinal,
                chunk_count: count,
                start: chunk.start,
                end: chunk.end,
            })
            .collect()
    }

    fn embed_units(&self, units: &[ChunkMeta]) -> TemoaResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(units.len());
        let texts: Vec<String> = units.iter().map(|u| u.text.clone()).collect();
        for batch in texts.chunks(self.batch_size.max(1)) {
            vectors.extend(self.embedder.embed(batch)?);
        }
        Ok(vectors)
    }

    /// Group final row positions by file and stamp each entry with the
    /// document's current change-detection keys. Files whose body produced
    /// no units are still tracked so they are not re-detected every cycle.
    fn tracking_from(&self, metadata: &[ChunkMeta], docs: &[Arc<Document>]) -> FileTracking {
        let mut tracking: FileTracking = BTreeMap::new();

        for doc in docs {
            let hash = match self.change_detection {
                ChangeDetection::Hash => Some(content_hash(doc)),
                ChangeDetection::Mtime => None,
            };
            tracking.insert(
                doc.relative_path.clone(),
                FileTrack {
                    modified_epoch: doc.mtime_epoch,
                    content_hash: hash,
                    positions: Vec::new(),
                },
            );
        }
        // A row may belong to a file no longer in the vault only if the
        // merge above is wrong; grouping from metadata surfaces that via the
        // save-time invariant check.
        for (pos, meta) in metadata.iter().enumerate() {
            tracking
                .entry(meta.relative_path.clone())
                .or_insert_with(|| FileTrack {
                    modified_epoch: 0,
                    content_hash: None,
                    positions: Vec::new(),
                })
                .positions
                .push(pos);
        }
        tracking
    }
}

/// Content hash for the hash change-detection mode: frontmatter and body
/// together, so a metadata-only edit still triggers re-indexing.
fn content_hash(doc: &Document) -> String {
    let mut hasher = Sha256::new();
    if let Ok(fm) = serde_json::to_string(&doc.frontmatter) {
        hasher.update(fm.as_bytes());
    }
    hasher.update(doc.body.as_bytes());
    format!("{:x}", hasher.finalize())
}
