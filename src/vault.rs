use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use dashmap::DashMap;
use ignore::WalkBuilder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use crate::error::{TemoaError, TemoaResult};

/// A frontmatter scalar or list. Filter predicates operate on this tagged
/// representation; YAML mappings nested deeper than one level are flattened
/// to their string form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// String form used by predicate matching: `status=active`,
    /// `rating=5`, `draft=true` all compare against this.
    pub fn as_match_str(&self) -> String {
        match self {
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Num(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            FieldValue::Str(s) => s.clone(),
            FieldValue::List(items) => items
                .iter()
                .map(|v| v.as_match_str())
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// Whether any scalar inside this value equals `wanted` (lists match on
    /// membership, scalars on equality).
    pub fn matches(&self, wanted: &str) -> bool {
        match self {
            FieldValue::List(items) => items.iter().any(|v| v.matches(wanted)),
            other => other.as_match_str() == wanted,
        }
    }

    fn from_yaml(value: &serde_yaml::Value) -> Option<FieldValue> {
        match value {
            serde_yaml::Value::Bool(b) => Some(FieldValue::Bool(*b)),
            serde_yaml::Value::Number(n) => n.as_f64().map(FieldValue::Num),
            serde_yaml::Value::String(s) => Some(FieldValue::Str(s.clone())),
            serde_yaml::Value::Sequence(seq) => Some(FieldValue::List(
                seq.iter().filter_map(FieldValue::from_yaml).collect(),
            )),
            serde_yaml::Value::Null => None,
            // Nested mappings and tagged values collapse to their debug-free
            // string form so predicates can still see them.
            other => serde_yaml::to_string(other)
                .ok()
                .map(|s| FieldValue::Str(s.trim().to_string())),
        }
    }
}

pub type Frontmatter = BTreeMap<String, FieldValue>;

/// Document lifecycle state, from the frontmatter `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    #[default]
    Active,
    Inactive,
    Hidden,
}

impl DocStatus {
    pub fn parse(s: &str) -> DocStatus {
        match s.trim().to_ascii_lowercase().as_str() {
            "inactive" => DocStatus::Inactive,
            "hidden" => DocStatus::Hidden,
            _ => DocStatus::Active,
        }
    }
}

/// A Markdown file read from a vault.
#[derive(Debug, Clone)]
pub struct Document {
    /// Identity within the vault, with forward slashes.
    pub relative_path: String,
    pub title: String,
    pub body: String,
    pub frontmatter: Frontmatter,
    /// Union of frontmatter `tags` and inline hashtags, lowercased.
    pub tags: Vec<String>,
    pub created: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
    /// Filesystem mtime in epoch seconds, the change-detection key.
    pub mtime_epoch: u64,
    pub content_length: usize,
    pub status: DocStatus,
    pub doc_type: Option<String>,
}

enum CacheEntry {
    Doc(Arc<Document>),
    /// Unreadable at this mtime; retried only when the mtime moves.
    Tombstone,
}

/// Reads Markdown files under a vault root. Per-file results are cached by
/// (path, mtime); the cache only grows and entries are replaced atomically,
/// so concurrent reads of the same path are safe.
pub struct VaultReader {
    root: PathBuf,
    cache: DashMap<PathBuf, (u64, CacheEntry)>,
    excludes: Option<globset::GlobSet>,
}

impl VaultReader {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            cache: DashMap::new(),
            excludes: None,
        }
    }

    /// Reader with user-configured exclusion globs, matched against
    /// relative paths. Invalid patterns are dropped with a warning.
    pub fn with_excludes(root: PathBuf, patterns: &[String]) -> Self {
        let mut builder = globset::GlobSetBuilder::new();
        let mut any = false;
        for pattern in patterns {
            match globset::Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                    any = true;
                }
                Err(e) => warn!(pattern = %pattern, error = %e, "ignoring invalid exclude glob"),
            }
        }
        let excludes = if any { builder.build().ok() } else { None };
        Self {
            root,
            cache: DashMap::new(),
            excludes,
        }
    }

    /// Enumerate every Markdown document under the vault root in stable
    /// lexicographic order. Fails only if the root itself is missing; a file
    /// that cannot be read is logged and skipped.
    pub fn read_vault(&self) -> TemoaResult<Vec<Arc<Document>>> {
        if !self.root.is_dir() {
            return Err(TemoaError::VaultRead(format!(
                "vault root missing or not a directory: {}",
                self.root.display()
            )));
        }

        let mut paths: Vec<PathBuf> = WalkBuilder::new(&self.root)
            .hidden(false)
            .git_ignore(true)
            .max_depth(Some(20))
            .filter_entry(|entry| {
                // The root itself is always descended into, whatever its name.
                if entry.depth() == 0 {
                    return true;
                }
                let name = entry.file_name().to_string_lossy();
                !(entry.file_type().is_some_and(|ft| ft.is_dir())
                    && crate::config::is_excluded_directory(&name))
            })
            .build()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()))
            .filter(|e| {
                e.path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
            })
            .filter(|e| match &self.excludes {
                Some(set) => !set.is_match(relative_of(&self.root, e.path())),
                None => true,
            })
            .map(|e| e.into_path())
            .collect();

        paths.sort_by_cached_key(|p| relative_of(&self.root, p));

        let mut docs = Vec::with_capacity(paths.len());
        for path in paths {
            match self.read_file(&path) {
                Ok(Some(doc)) => docs.push(doc),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable file"),
            }
        }
        Ok(docs)
    }

    /// Read one file, cached by (path, mtime). `Ok(None)` is the tombstone
    /// for a file that exists but cannot be parsed as UTF-8 text.
    pub fn read_file(&self, path: &Path) -> TemoaResult<Option<Arc<Document>>> {
        let meta = std::fs::metadata(path)?;
        let mtime = epoch_secs(meta.modified().ok());

        if let Some(entry) = self.cache.get(path) {
            if entry.0 == mtime {
                return Ok(match &entry.1 {
                    CacheEntry::Doc(doc) => Some(doc.clone()),
                    CacheEntry::Tombstone => None,
                });
            }
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "file unreadable, caching tombstone");
                self.cache
                    .insert(path.to_path_buf(), (mtime, CacheEntry::Tombstone));
                return Ok(None);
            }
        };

        let doc = Arc::new(parse_document(
            &relative_of(&self.root, path),
            &content,
            mtime,
        ));
        self.cache
            .insert(path.to_path_buf(), (mtime, CacheEntry::Doc(doc.clone())));
        Ok(Some(doc))
    }
}

fn relative_of(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn epoch_secs(t: Option<std::time::SystemTime>) -> u64 {
    t.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Split content into (frontmatter mapping, body). Frontmatter is recognized
/// only when the first line is exactly `---`; the block ends at the next
/// `\n---\n`. A missing terminator means no frontmatter, never an error.
pub fn split_frontmatter(content: &str) -> (Frontmatter, &str) {
    let rest = if let Some(r) = content.strip_prefix("---\n") {
        r
    } else if let Some(r) = content.strip_prefix("---\r\n") {
        r
    } else {
        return (Frontmatter::new(), content);
    };

    let end = rest.find("\n---\n").map(|i| (i, i + 5)).or_else(|| {
        rest.find("\n---\r\n")
            .map(|i| (i, i + 6))
            .or_else(|| rest.strip_suffix("\n---").map(|_| (rest.len() - 4, rest.len())))
    });

    let Some((fm_end, body_start)) = end else {
        return (Frontmatter::new(), content);
    };

    let fm_text = &rest[..fm_end];
    let body = &rest[body_start..];

    let fm = match serde_yaml::from_str::<serde_yaml::Value>(fm_text) {
        Ok(serde_yaml::Value::Mapping(map)) => map
            .iter()
            .filter_map(|(k, v)| {
                let key = k.as_str()?.to_string();
                FieldValue::from_yaml(v).map(|fv| (key, fv))
            })
            .collect(),
        Ok(_) => Frontmatter::new(),
        Err(e) => {
            debug!(error = %e, "malformed frontmatter, treating as empty");
            Frontmatter::new()
        }
    };

    (fm, body)
}

static INLINE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[\s(])#([A-Za-z][A-Za-z0-9_/-]*)").unwrap());

fn parse_document(relative_path: &str, content: &str, mtime_epoch: u64) -> Document {
    let (frontmatter, body) = split_frontmatter(content);
    let body = body.to_string();

    let title = match frontmatter.get("title") {
        Some(FieldValue::Str(t)) if !t.trim().is_empty() => t.trim().to_string(),
        _ => Path::new(relative_path)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| relative_path.to_string()),
    };

    let mut tags: Vec<String> = Vec::new();
    match frontmatter.get("tags") {
        Some(FieldValue::List(items)) => {
            for item in items {
                if let FieldValue::Str(s) = item {
                    push_tag(&mut tags, s);
                }
            }
        }
        Some(FieldValue::Str(s)) => {
            for part in s.split([',', ' ']) {
                push_tag(&mut tags, part);
            }
        }
        _ => {}
    }
    for cap in INLINE_TAG.captures_iter(&body) {
        push_tag(&mut tags, &cap[1]);
    }

    let created = frontmatter
        .get("created")
        .or_else(|| frontmatter.get("date"))
        .and_then(field_as_date);
    let modified = frontmatter
        .get("modified")
        .or_else(|| frontmatter.get("updated"))
        .and_then(field_as_date)
        .unwrap_or_else(|| {
            Utc.timestamp_opt(mtime_epoch as i64, 0)
                .single()
                .unwrap_or_else(Utc::now)
        });

    let status = match frontmatter.get("status") {
        Some(FieldValue::Str(s)) => DocStatus::parse(s),
        _ => DocStatus::Active,
    };

    let doc_type = match frontmatter.get("type") {
        Some(FieldValue::Str(t)) if !t.trim().is_empty() => Some(t.trim().to_string()),
        _ => None,
    };

    let content_length = body.chars().count();

    Document {
        relative_path: relative_path.to_string(),
        title,
        body,
        frontmatter,
        tags,
        created,
        modified,
        mtime_epoch,
        content_length,
        status,
        doc_type,
    }
}

fn push_tag(tags: &mut Vec<String>, raw: &str) {
    let tag = raw.trim().trim_start_matches('#').to_ascii_lowercase();
    if !tag.is_empty() && !tags.contains(&tag) {
        tags.push(tag);
    }
}

fn field_as_date(value: &FieldValue) -> Option<DateTime<Utc>> {
    let s = match value {
        FieldValue::Str(s) => s.trim(),
        _ => return None,
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontmatter_parsed_and_body_split() {
        let content = "---\ntitle: My Note\ntags:\n  - alpha\n  - Beta\nstatus: inactive\ntype: journal\ncreated: 2024-03-01\n---\nBody text with #gamma inline.\n";
        let doc = parse_document("notes/my-note.md", content, 1_700_000_000);
        assert_eq!(doc.title, "My Note");
        assert_eq!(doc.tags, vec!["alpha", "beta", "gamma"]);
        assert_eq!(doc.status, DocStatus::Inactive);
        assert_eq!(doc.doc_type.as_deref(), Some("journal"));
        assert!(doc.body.starts_with("Body text"));
        assert!(doc.created.is_some());
    }

    #[test]
    fn missing_frontmatter_is_tolerated() {
        let content = "Just a plain note.\n";
        let (fm, body) = split_frontmatter(content);
        assert!(fm.is_empty());
        assert_eq!(body, content);
    }

    #[test]
    fn unterminated_frontmatter_is_tolerated() {
        let content = "---\ntitle: broken\nno terminator here";
        let (fm, body) = split_frontmatter(content);
        assert!(fm.is_empty());
        assert_eq!(body, content);
    }

    #[test]
    fn frontmatter_requires_first_line_delimiter() {
        let content = "\n---\ntitle: not frontmatter\n---\nbody";
        let (fm, _) = split_frontmatter(content);
        assert!(fm.is_empty());
    }

    #[test]
    fn title_falls_back_to_file_stem() {
        let doc = parse_document("daily/2024-06-01.md", "no frontmatter", 0);
        assert_eq!(doc.title, "2024-06-01");
    }

    #[test]
    fn heading_hash_is_not_a_tag() {
        let doc = parse_document("a.md", "# Heading\n\ntext #real-tag more", 0);
        assert_eq!(doc.tags, vec!["real-tag"]);
    }

    #[test]
    fn field_value_matching() {
        let v = FieldValue::List(vec![
            FieldValue::Str("rust".into()),
            FieldValue::Str("search".into()),
        ]);
        assert!(v.matches("rust"));
        assert!(!v.matches("python"));
        assert!(FieldValue::Num(5.0).matches("5"));
        assert!(FieldValue::Bool(true).matches("true"));
    }

    #[test]
    fn read_vault_orders_and_skips_excluded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.md"), "beta").unwrap();
        std::fs::write(dir.path().join("a.md"), "alpha").unwrap();
        std::fs::create_dir(dir.path().join(".obsidian")).unwrap();
        std::fs::write(dir.path().join(".obsidian").join("c.md"), "hidden").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not markdown").unwrap();

        let reader = VaultReader::new(dir.path().to_path_buf());
        let docs = reader.read_vault().unwrap();
        let paths: Vec<&str> = docs.iter().map(|d| d.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a.md", "b.md"]);
    }

    #[test]
    fn exclude_globs_filter_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("templates")).unwrap();
        std::fs::write(dir.path().join("templates").join("t.md"), "template").unwrap();
        std::fs::write(dir.path().join("note.md"), "real note").unwrap();

        let reader = VaultReader::with_excludes(
            dir.path().to_path_buf(),
            &["templates/**".to_string()],
        );
        let docs = reader.read_vault().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].relative_path, "note.md");
    }

    #[test]
    fn read_vault_missing_root_fails() {
        let reader = VaultReader::new(PathBuf::from("/nonexistent/vault/root"));
        assert!(matches!(
            reader.read_vault(),
            Err(TemoaError::VaultRead(_))
        ));
    }

    #[test]
    fn read_file_is_cached_by_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.md");
        std::fs::write(&path, "first").unwrap();

        let reader = VaultReader::new(dir.path().to_path_buf());
        let d1 = reader.read_file(&path).unwrap().unwrap();
        let d2 = reader.read_file(&path).unwrap().unwrap();
        assert!(Arc::ptr_eq(&d1, &d2));
    }
}
