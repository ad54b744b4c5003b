//! Result-level filter predicates over frontmatter, tags, types, paths and
//! status. Inclusive tag/path/property filters also drive the retrieval
//! prefilter (the whitelist handed to the dense and lexical searches);
//! exclusions apply only after retrieval.

use std::collections::HashSet;

use crate::dense::ChunkMeta;
use crate::error::{TemoaError, TemoaResult};
use crate::vault::DocStatus;

#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    /// Any listed tag present.
    pub include_tags: Vec<String>,
    /// Any listed tag present → dropped.
    pub exclude_tags: Vec<String>,
    pub include_types: Vec<String>,
    pub exclude_types: Vec<String>,
    /// Relative-path prefixes.
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    /// Every listed (key, value) present.
    pub include_props: Vec<(String, String)>,
    /// Any listed (key, value) present → dropped.
    pub exclude_props: Vec<(String, String)>,
    /// Statuses to admit. `None` means the default policy: active only.
    pub statuses: Option<Vec<DocStatus>>,
}

impl FilterSet {
    pub fn is_empty(&self) -> bool {
        self.include_tags.is_empty()
            && self.exclude_tags.is_empty()
            && self.include_types.is_empty()
            && self.exclude_types.is_empty()
            && self.include_paths.is_empty()
            && self.exclude_paths.is_empty()
            && self.include_props.is_empty()
            && self.exclude_props.is_empty()
            && self.statuses.is_none()
    }

    /// Whether any prefilter-eligible inclusive predicate is present
    /// (type inclusion is post-retrieval only).
    pub fn has_inclusive(&self) -> bool {
        !self.include_tags.is_empty()
            || !self.include_paths.is_empty()
            || !self.include_props.is_empty()
    }

    /// Build the retrieval whitelist: the set of relative paths whose
    /// metadata satisfies every inclusive tag/path/property predicate.
    /// Returns `None` when there is nothing to prefilter on.
    pub fn whitelist(&self, metadata: &[ChunkMeta]) -> Option<HashSet<String>> {
        if !self.has_inclusive() {
            return None;
        }
        let mut paths = HashSet::new();
        for meta in metadata {
            if self.matches_inclusive(meta) {
                paths.insert(meta.relative_path.clone());
            }
        }
        Some(paths)
    }

    fn matches_inclusive(&self, meta: &ChunkMeta) -> bool {
        if !self.include_tags.is_empty()
            && !self.include_tags.iter().any(|t| meta.tags.contains(t))
        {
            return false;
        }
        if !self.include_paths.is_empty()
            && !self
                .include_paths
                .iter()
                .any(|p| meta.relative_path.starts_with(p.as_str()))
        {
            return false;
        }
        for (key, value) in &self.include_props {
            match meta.frontmatter.get(key) {
                Some(v) if v.matches(value) => {}
                _ => return false,
            }
        }
        true
    }

    /// The full post-retrieval predicate: status policy, inclusive checks,
    /// then exclusions.
    pub fn admits(&self, meta: &ChunkMeta) -> bool {
        match &self.statuses {
            None => {
                if meta.status != DocStatus::Active {
                    return false;
                }
            }
            Some(allowed) => {
                if !allowed.contains(&meta.status) {
                    return false;
                }
            }
        }

        if !self.matches_inclusive(meta) {
            return false;
        }
        if !self.include_types.is_empty() {
            match &meta.doc_type {
                Some(t) if self.include_types.contains(t) => {}
                _ => return false,
            }
        }

        if self.exclude_tags.iter().any(|t| meta.tags.contains(t)) {
            return false;
        }
        if let Some(t) = &meta.doc_type {
            if self.exclude_types.contains(t) {
                return false;
            }
        }
        if self
            .exclude_paths
            .iter()
            .any(|p| meta.relative_path.starts_with(p.as_str()))
        {
            return false;
        }
        for (key, value) in &self.exclude_props {
            if let Some(v) = meta.frontmatter.get(key) {
                if v.matches(value) {
                    return false;
                }
            }
        }
        true
    }
}

/// Comma-separated list parameter.
pub fn parse_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

/// `key:value` pairs, comma separated.
pub fn parse_props(raw: Option<&str>) -> TemoaResult<Vec<(String, String)>> {
    let mut props = Vec::new();
    let Some(raw) = raw else {
        return Ok(props);
    };
    for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let (key, value) = pair.split_once(':').ok_or_else(|| {
            TemoaError::Config(format!(
                "property filter '{}' must be key:value",
                pair.trim()
            ))
        })?;
        props.push((key.trim().to_string(), value.trim().to_string()));
    }
    Ok(props)
}

pub fn parse_statuses(raw: Option<&str>) -> Option<Vec<DocStatus>> {
    let raw = raw?;
    let statuses: Vec<DocStatus> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(DocStatus::parse)
        .collect();
    if statuses.is_empty() {
        None
    } else {
        Some(statuses)
    }
}
