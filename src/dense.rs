//! Persistent dense store: a contiguous unit-norm embedding matrix
//! (`embeddings.npy`), a parallel metadata list (`metadata.json`), and a
//! manifest with the per-file tracking table (`index.json`), all living
//! under `<vault>/.temoa/<model-id>/`.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{TemoaError, TemoaResult};
use crate::vault::{DocStatus, Frontmatter};

pub const MATRIX_FILE: &str = "embeddings.npy";
pub const METADATA_FILE: &str = "metadata.json";
pub const MANIFEST_FILE: &str = "index.json";

/// Per-row metadata, parallel to the embedding matrix. Carries everything a
/// search result needs so query-time stages never re-open vault files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub relative_path: String,
    pub title: String,
    /// The indexed text slice; doubles as the result excerpt, the lexical
    /// index source, and the re-ranking passage.
    pub text: String,
    pub tags: Vec<String>,
    pub frontmatter: Frontmatter,
    pub created: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
    pub content_length: usize,
    pub status: DocStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    /// Zero-based ordinal within the parent document (0 for whole-body rows).
    pub chunk_index: usize,
    /// Total units the parent document was split into.
    pub chunk_count: usize,
    /// Character offsets of this slice within the parent body.
    pub start: usize,
    pub end: usize,
}

/// Tracking entry for one vault file: the change-detection key and the
/// matrix rows the file currently owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTrack {
    pub modified_epoch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub positions: Vec<usize>,
}

pub type FileTracking = BTreeMap<String, FileTrack>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub dimension: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub model_info: ModelInfo,
    pub created_at: DateTime<Utc>,
    pub num_embeddings: usize,
    pub embedding_dim: usize,
    /// Absolute vault path at build time; the cross-vault overwrite guard.
    pub vault_path: String,
    pub file_tracking: FileTracking,
}

/// Everything `load()` returns: matrix rows, parallel metadata, manifest.
#[derive(Debug, Clone)]
pub struct StoreData {
    pub vectors: Vec<Vec<f32>>,
    pub metadata: Vec<ChunkMeta>,
    pub manifest: Manifest,
}

pub struct DenseStore {
    dir: PathBuf,
    /// Canonical absolute vault path, the store's identity.
    vault_path: String,
    model_id: String,
    dimension: usize,
}

impl DenseStore {
    pub fn new(vault_root: &Path, model_id: &str, dimension: usize) -> Self {
        let vault_path = dunce::canonicalize(vault_root)
            .unwrap_or_else(|_| vault_root.to_path_buf())
            .to_string_lossy()
            .to_string();
        Self {
            dir: vault_root.join(".temoa").join(model_id),
            vault_path,
            model_id: model_id.to_string(),
            dimension,
        }
    }

    pub fn vault_path(&self) -> &str {
        &self.vault_path
    }

    pub fn exists(&self) -> bool {
        self.dir.join(MANIFEST_FILE).exists()
    }

    /// Remove all store files. The explicit destruction path for a forced
    /// full rebuild.
    pub fn clear(&self) -> TemoaResult<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }

    /// Load the store. A missing manifest is an empty store (`Ok(None)`);
    /// a manifest that disagrees with the matrix is an `Index` error.
    pub fn load(&self) -> TemoaResult<Option<StoreData>> {
        let manifest_path = self.dir.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Ok(None);
        }

        let manifest: Manifest = serde_json::from_str(&std::fs::read_to_string(&manifest_path)?)?;

        let matrix_path = self.dir.join(MATRIX_FILE);
        if !matrix_path.exists() {
            return Err(TemoaError::Index(format!(
                "manifest present but matrix missing: {}",
                matrix_path.display()
            )));
        }
        let (vectors, dim) = read_npy(&matrix_path)?;

        let metadata: Vec<ChunkMeta> =
            serde_json::from_str(&std::fs::read_to_string(self.dir.join(METADATA_FILE))?)?;

        if vectors.len() != manifest.num_embeddings
            || dim != manifest.embedding_dim
            || metadata.len() != vectors.len()
        {
            return Err(TemoaError::Index(format!(
                "store inconsistent: matrix {}x{}, manifest {}x{}, metadata {}",
                vectors.len(),
                dim,
                manifest.num_embeddings,
                manifest.embedding_dim,
                metadata.len()
            )));
        }

        let tracked: usize = manifest
            .file_tracking
            .values()
            .map(|t| t.positions.len())
            .sum();
        if tracked != vectors.len() {
            return Err(TemoaError::Index(format!(
                "tracking table covers {} rows but matrix has {}",
                tracked,
                vectors.len()
            )));
        }

        Ok(Some(StoreData {
            vectors,
            metadata,
            manifest,
        }))
    }

    /// Atomically persist matrix + metadata + manifest: everything is
    /// written into a fresh temp directory, then renamed into place with the
    /// manifest last, so a crash never leaves a readable-but-wrong store.
    pub fn save(
        &self,
        vectors: &[Vec<f32>],
        metadata: &[ChunkMeta],
        tracking: FileTracking,
    ) -> TemoaResult<Manifest> {
        self.check_invariants(vectors, metadata, &tracking)?;
        self.check_vault_identity()?;

        std::fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join(format!("tmp-{}", std::process::id()));
        if tmp.exists() {
            std::fs::remove_dir_all(&tmp)?;
        }
        std::fs::create_dir_all(&tmp)?;

        let manifest = Manifest {
            model_info: ModelInfo {
                id: self.model_id.clone(),
                dimension: self.dimension,
            },
            created_at: Utc::now(),
            num_embeddings: vectors.len(),
            embedding_dim: self.dimension,
            vault_path: self.vault_path.clone(),
            file_tracking: tracking,
        };

        write_npy(&tmp.join(MATRIX_FILE), vectors, self.dimension)?;
        std::fs::write(tmp.join(METADATA_FILE), serde_json::to_string(metadata)?)?;
        std::fs::write(tmp.join(MANIFEST_FILE), serde_json::to_string(&manifest)?)?;

        std::fs::rename(tmp.join(MATRIX_FILE), self.dir.join(MATRIX_FILE))?;
        std::fs::rename(tmp.join(METADATA_FILE), self.dir.join(METADATA_FILE))?;
        std::fs::rename(tmp.join(MANIFEST_FILE), self.dir.join(MANIFEST_FILE))?;
        std::fs::remove_dir_all(&tmp).ok();

        info!(
            vault = %self.vault_path,
            model = %self.model_id,
            rows = vectors.len(),
            "dense store saved"
        );
        Ok(manifest)
    }

    fn check_invariants(
        &self,
        vectors: &[Vec<f32>],
        metadata: &[ChunkMeta],
        tracking: &FileTracking,
    ) -> TemoaResult<()> {
        if vectors.len() != metadata.len() {
            return Err(TemoaError::Index(format!(
                "refusing save: {} vectors vs {} metadata rows",
                vectors.len(),
                metadata.len()
            )));
        }
        let tracked: usize = tracking.values().map(|t| t.positions.len()).sum();
        if tracked != vectors.len() {
            return Err(TemoaError::Index(format!(
                "refusing save: tracking covers {} rows, matrix has {}",
                tracked,
                vectors.len()
            )));
        }
        for (path, track) in tracking {
            for &pos in &track.positions {
                match metadata.get(pos) {
                    Some(meta) if meta.relative_path == *path => {}
                    _ => {
                        return Err(TemoaError::Index(format!(
                            "refusing save: tracking for {} points at row {} owned by another file",
                            path, pos
                        )));
                    }
                }
            }
        }
        for (i, v) in vectors.iter().enumerate() {
            if v.len() != self.dimension {
                return Err(TemoaError::Index(format!(
                    "refusing save: row {} has dimension {} (expected {})",
                    i,
                    v.len(),
                    self.dimension
                )));
            }
        }
        Ok(())
    }

    /// Refuse to overwrite a store that was built for a different vault.
    fn check_vault_identity(&self) -> TemoaResult<()> {
        let manifest_path = self.dir.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Ok(());
        }
        let existing: Manifest = match std::fs::read_to_string(&manifest_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
        {
            Some(m) => m,
            None => {
                warn!(path = %manifest_path.display(), "unreadable manifest, allowing overwrite");
                return Ok(());
            }
        };
        if existing.vault_path != self.vault_path {
            return Err(TemoaError::Index(format!(
                "store belongs to vault {} but current vault is {}; refusing overwrite",
                existing.vault_path, self.vault_path
            )));
        }
        Ok(())
    }
}

/// Exact top-k retrieval by dot product. The matrix is unit-norm, so the dot
/// product is cosine similarity. `whitelist` restricts candidates to rows
/// whose file is in the set.
pub fn dense_search(
    vectors: &[Vec<f32>],
    metadata: &[ChunkMeta],
    query: &[f32],
    k: usize,
    whitelist: Option<&HashSet<String>>,
) -> Vec<(usize, f32)> {
    let mut scored: Vec<(usize, f32)> = vectors
        .par_iter()
        .enumerate()
        .filter(|(i, _)| {
            whitelist.is_none_or(|w| w.contains(metadata[*i].relative_path.as_str()))
        })
        .map(|(i, row)| {
            let dot: f32 = row.iter().zip(query).map(|(a, b)| a * b).sum();
            (i, dot)
        })
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    scored
}

// ---------------------------------------------------------------------------
// Minimal .npy v1.0 reader/writer for a little-endian f32 matrix
// ---------------------------------------------------------------------------

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

fn write_npy(path: &Path, rows: &[Vec<f32>], dim: usize) -> TemoaResult<()> {
    let mut header = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({}, {}), }}",
        rows.len(),
        dim
    );
    // Pad so that magic + version + length field + header is 64-aligned,
    // terminated by a newline as the format requires.
    let unpadded = NPY_MAGIC.len() + 2 + 2 + header.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    header.push_str(&" ".repeat(padding));
    header.push('\n');

    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    file.write_all(NPY_MAGIC)?;
    file.write_all(&[0x01, 0x00])?;
    file.write_all(&(header.len() as u16).to_le_bytes())?;
    file.write_all(header.as_bytes())?;
    for row in rows {
        for &x in row {
            file.write_all(&x.to_le_bytes())?;
        }
    }
    file.flush()?;
    Ok(())
}

fn read_npy(path: &Path) -> TemoaResult<(Vec<Vec<f32>>, usize)> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);

    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    if &magic[..6] != NPY_MAGIC {
        return Err(TemoaError::Index(format!(
            "not an npy file: {}",
            path.display()
        )));
    }
    let header_len = match magic[6] {
        1 => {
            let mut len = [0u8; 2];
            file.read_exact(&mut len)?;
            u16::from_le_bytes(len) as usize
        }
        2 => {
            let mut len = [0u8; 4];
            file.read_exact(&mut len)?;
            u32::from_le_bytes(len) as usize
        }
        v => {
            return Err(TemoaError::Index(format!(
                "unsupported npy version {}.{}",
                v, magic[7]
            )));
        }
    };

    let mut header = vec![0u8; header_len];
    file.read_exact(&mut header)?;
    let header = String::from_utf8_lossy(&header);

    if !header.contains("'<f4'") || header.contains("'fortran_order': True") {
        return Err(TemoaError::Index(format!(
            "unsupported npy layout: {}",
            header.trim()
        )));
    }

    static SHAPE_RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(r"'shape':\s*\((\d+),\s*(\d+)\s*\)").unwrap()
    });
    let caps = SHAPE_RE.captures(&header).ok_or_else(|| {
        TemoaError::Index(format!("npy header missing 2-d shape: {}", header.trim()))
    })?;
    let n: usize = caps[1].parse().map_err(|_| {
        TemoaError::Index("npy shape overflow".to_string())
    })?;
    let dim: usize = caps[2].parse().map_err(|_| {
        TemoaError::Index("npy shape overflow".to_string())
    })?;

    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    if data.len() != n * dim * 4 {
        return Err(TemoaError::Index(format!(
            "npy payload is {} bytes, expected {} ({}x{} f32)",
            data.len(),
            n * dim * 4,
            n,
            dim
        )));
    }

    let mut rows = Vec::with_capacity(n);
    for r in 0..n {
        let mut row = Vec::with_capacity(dim);
        for c in 0..dim {
            let off = (r * dim + c) * 4;
            row.push(f32::from_le_bytes([
                data[off],
                data[off + 1],
                data[off + 2],
                data[off + 3],
            ]));
        }
        rows.push(row);
    }
    Ok((rows, dim))
}
