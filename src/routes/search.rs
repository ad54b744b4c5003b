use axum::{
    Json,
    extract::{ConnectInfo, Query, State},
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Instant;

use crate::config::MAX_SEARCH_QUERY_LENGTH;
use crate::error::{TemoaError, TemoaResult};
use crate::filters::{FilterSet, parse_list, parse_props, parse_statuses};
use crate::indexer::IndexReport;
use crate::pipeline::{QueryOptions, SearchResult, StageToggles, VaultStats};
use crate::profiles;
use crate::ratelimit::EndpointClass;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    pub limit: Option<usize>,
    pub profile: Option<String>,
    pub hybrid: Option<bool>,
    pub rerank: Option<bool>,
    pub expand: Option<bool>,
    pub time_boost: Option<bool>,
    pub include_tags: Option<String>,
    pub exclude_tags: Option<String>,
    pub include_types: Option<String>,
    pub exclude_types: Option<String>,
    pub include_paths: Option<String>,
    pub exclude_paths: Option<String>,
    pub include_props: Option<String>,
    pub exclude_props: Option<String>,
    pub status: Option<String>,
    pub vault: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub count: usize,
    pub query_time_ms: u64,
}

pub async fn search(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<SearchParams>,
) -> TemoaResult<Json<SearchResponse>> {
    state
        .rate_limiter
        .check(&addr.ip().to_string(), EndpointClass::Search)?;

    let query = params.q.clone().unwrap_or_default();
    if query.len() > MAX_SEARCH_QUERY_LENGTH {
        return Err(TemoaError::Config(format!(
            "query too long ({} chars, max {})",
            query.len(),
            MAX_SEARCH_QUERY_LENGTH
        )));
    }

    let vault = state
        .config
        .vault(params.vault.as_deref())
        .cloned()
        .ok_or_else(|| {
            TemoaError::VaultNotFound(params.vault.clone().unwrap_or_else(|| "default".into()))
        })?;

    // An empty query is a valid request with an empty answer; it must not
    // instantiate a pipeline or touch the model.
    if query.trim().is_empty() {
        return Ok(Json(SearchResponse {
            results: vec![],
            count: 0,
            query_time_ms: 0,
        }));
    }

    let profile = profiles::resolve(params.profile.as_deref());
    let opts = QueryOptions::from_profile(
        &profile,
        StageToggles {
            hybrid: params.hybrid,
            rerank: params.rerank,
            expand: params.expand,
            time_boost: params.time_boost,
            limit: params.limit,
        },
    );
    let filters = FilterSet {
        include_tags: parse_list(params.include_tags.as_deref()),
        exclude_tags: parse_list(params.exclude_tags.as_deref()),
        include_types: parse_list(params.include_types.as_deref()),
        exclude_types: parse_list(params.exclude_types.as_deref()),
        include_paths: parse_list(params.include_paths.as_deref()),
        exclude_paths: parse_list(params.exclude_paths.as_deref()),
        include_props: parse_props(params.include_props.as_deref())?,
        exclude_props: parse_props(params.exclude_props.as_deref())?,
        statuses: parse_statuses(params.status.as_deref()),
    };

    let pipeline = state.registry.get(&vault).await?;
    let guard = pipeline.read().await;

    let started = Instant::now();
    let deadline = std::time::Duration::from_millis(state.config.query_deadline_ms);
    let results = tokio::time::timeout(deadline, guard.search(&query, &opts, &filters))
        .await
        .map_err(|_| TemoaError::Timeout("search".to_string()))??;

    Ok(Json(SearchResponse {
        count: results.len(),
        results,
        query_time_ms: started.elapsed().as_millis() as u64,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReindexParams {
    pub force: Option<bool>,
    pub vault: Option<String>,
}

pub async fn reindex(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ReindexParams>,
) -> TemoaResult<Json<IndexReport>> {
    state
        .rate_limiter
        .check(&addr.ip().to_string(), EndpointClass::Reindex)?;

    let vault = state
        .config
        .vault(params.vault.as_deref())
        .cloned()
        .ok_or_else(|| {
            TemoaError::VaultNotFound(params.vault.clone().unwrap_or_else(|| "default".into()))
        })?;
    let force = params.force.unwrap_or(false);

    let pipeline = state.registry.get(&vault).await?;
    // Exclusive lock: searches started before this wait on the read side
    // and see either the old or the new store, never a mix.
    let mut guard = pipeline.write().await;
    let report = tokio::task::block_in_place(|| guard.reindex(force))?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    pub vault: Option<String>,
}

pub async fn stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> TemoaResult<Json<VaultStats>> {
    let vault = state
        .config
        .vault(params.vault.as_deref())
        .cloned()
        .ok_or_else(|| {
            TemoaError::VaultNotFound(params.vault.clone().unwrap_or_else(|| "default".into()))
        })?;
    let pipeline = state.registry.get(&vault).await?;
    let guard = pipeline.read().await;
    Ok(Json(guard.stats()))
}
