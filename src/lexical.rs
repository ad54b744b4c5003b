//! In-memory BM25 index with tag-field boosting.
//!
//! Rebuilt from scratch on every index cycle from the stored metadata —
//! rebuild is cheap next to embedding, and it keeps the postings trivially
//! consistent with the dense store.

use std::collections::{HashMap, HashSet};

use crate::dense::ChunkMeta;

const K1: f32 = 1.5;
const B: f32 = 0.75;

/// Weight of the tag-match bonus, applied as `λ · idf(term)` per matching
/// query term.
const TAG_BOOST: f32 = 1.5;

pub struct Bm25Index {
    /// term → (row, term frequency) postings, rows ascending.
    postings: HashMap<String, Vec<(u32, u32)>>,
    doc_len: Vec<u32>,
    avg_len: f32,
    /// Relative path per row, for whitelist filtering.
    paths: Vec<String>,
    /// Exact tag token → rows carrying that tag.
    tag_exact: HashMap<String, Vec<u32>>,
    /// Per-row tag lists, only consulted by the substring fallback.
    doc_tags: Vec<Vec<String>>,
}

impl Bm25Index {
    pub fn build(metadata: &[ChunkMeta]) -> Self {
        let mut postings: HashMap<String, Vec<(u32, u32)>> = HashMap::new();
        let mut doc_len = Vec::with_capacity(metadata.len());
        let mut paths = Vec::with_capacity(metadata.len());
        let mut tag_exact: HashMap<String, Vec<u32>> = HashMap::new();
        let mut doc_tags = Vec::with_capacity(metadata.len());

        for (row, meta) in metadata.iter().enumerate() {
            let row = row as u32;
            let mut counts: HashMap<String, u32> = HashMap::new();
            let mut len = 0u32;
            for token in tokenize(&meta.text) {
                *counts.entry(token).or_insert(0) += 1;
                len += 1;
            }
            doc_len.push(len);
            for (term, tf) in counts {
                postings.entry(term).or_default().push((row, tf));
            }

            for tag in &meta.tags {
                tag_exact.entry(tag.clone()).or_default().push(row);
            }
            doc_tags.push(meta.tags.clone());
            paths.push(meta.relative_path.clone());
        }

        let avg_len = if doc_len.is_empty() {
            0.0
        } else {
            doc_len.iter().sum::<u32>() as f32 / doc_len.len() as f32
        };

        Self {
            postings,
            doc_len,
            avg_len,
            paths,
            tag_exact,
            doc_tags,
        }
    }

    /// Rank rows for a query. An empty-after-tokenization query returns no
    /// results rather than an error.
    pub fn search(
        &self,
        query: &str,
        k: usize,
        whitelist: Option<&HashSet<String>>,
    ) -> Vec<(usize, f32)> {
        let terms = tokenize(query).collect::<Vec<_>>();
        if terms.is_empty() || self.doc_len.is_empty() {
            return vec![];
        }

        let n = self.doc_len.len() as f32;
        let mut scores: HashMap<u32, f32> = HashMap::new();

        for term in &terms {
            if let Some(list) = self.postings.get(term) {
                let idf = idf(n, list.len() as f32);
                for &(row, tf) in list {
                    let tf = tf as f32;
                    let norm = 1.0 - B + B * (self.doc_len[row as usize] as f32 / self.avg_len);
                    let score = idf * (tf * (K1 + 1.0)) / (tf + K1 * norm);
                    *scores.entry(row).or_insert(0.0) += score;
                }
            }
        }

        // Tag boosting is two-tier: exact token-set intersection first, and
        // only a query with no exact tag hit at all falls through to the
        // quadratic substring pass.
        let mut any_exact = false;
        for term in &terms {
            if let Some(rows) = self.tag_exact.get(term) {
                any_exact = true;
                let bonus = TAG_BOOST * self.term_idf(term);
                for &row in rows {
                    *scores.entry(row).or_insert(0.0) += bonus;
                }
            }
        }
        if !any_exact {
            for term in &terms {
                let bonus = TAG_BOOST * self.term_idf(term);
                for (row, tags) in self.doc_tags.iter().enumerate() {
                    if tags
                        .iter()
                        .any(|tag| tag.contains(term.as_str()) || term.contains(tag.as_str()))
                    {
                        *scores.entry(row as u32).or_insert(0.0) += bonus;
                    }
                }
            }
        }

        let mut ranked: Vec<(usize, f32)> = scores
            .into_iter()
            .map(|(row, score)| (row as usize, score))
            .filter(|(row, _)| {
                whitelist.is_none_or(|w| w.contains(self.paths[*row].as_str()))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(k);
        ranked
    }

    fn term_idf(&self, term: &str) -> f32 {
        let df = self.postings.get(term).map(|l| l.len()).unwrap_or(0) as f32;
        idf(self.doc_len.len() as f32, df)
    }
}

fn idf(n: f32, df: f32) -> f32 {
    (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
}

/// Lowercased alphanumeric tokens.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
}
