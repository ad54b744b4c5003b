//! Named bundles of pipeline parameters. Profiles are immutable; a request
//! picks one by id and may override individual toggles with query
//! parameters.

use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetrievalMode {
    Hybrid,
    DenseOnly,
    Bm25Only,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpandMode {
    Off,
    /// Expand only short queries (fewer than three words).
    Auto,
    /// Expand every query.
    Always,
}

#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub id: &'static str,
    pub retrieval: RetrievalMode,
    pub rerank: bool,
    /// Index-time chunking default for vaults bound to this profile.
    pub chunking: bool,
    /// `None` disables the time-decay boost.
    pub time_half_life_days: Option<f32>,
    pub expand: ExpandMode,
    pub limit: usize,
}

pub fn builtin_profiles() -> Vec<Profile> {
    vec![
        Profile {
            id: "default",
            retrieval: RetrievalMode::Hybrid,
            rerank: true,
            chunking: true,
            time_half_life_days: Some(90.0),
            expand: ExpandMode::Auto,
            limit: 10,
        },
        Profile {
            id: "repos",
            retrieval: RetrievalMode::DenseOnly,
            rerank: true,
            chunking: false,
            time_half_life_days: None,
            expand: ExpandMode::Off,
            limit: 10,
        },
        Profile {
            id: "recent",
            retrieval: RetrievalMode::Hybrid,
            rerank: false,
            chunking: true,
            time_half_life_days: Some(14.0),
            expand: ExpandMode::Auto,
            limit: 20,
        },
        Profile {
            id: "deep",
            retrieval: RetrievalMode::Hybrid,
            rerank: true,
            chunking: true,
            time_half_life_days: Some(180.0),
            expand: ExpandMode::Always,
            limit: 25,
        },
        Profile {
            id: "keywords",
            retrieval: RetrievalMode::Bm25Only,
            rerank: false,
            chunking: false,
            time_half_life_days: None,
            expand: ExpandMode::Off,
            limit: 10,
        },
    ]
}

/// Resolve a profile id. An unrecognized id falls back to `default`, which
/// is always the first entry of the table.
pub fn resolve(id: Option<&str>) -> Profile {
    let mut profiles = builtin_profiles();
    let pos = match id {
        None => 0,
        Some(name) => match profiles.iter().position(|p| p.id == name) {
            Some(pos) => pos,
            None => {
                warn!(profile = name, "unknown profile, falling back to default");
                0
            }
        },
    };
    profiles.swap_remove(pos)
}
