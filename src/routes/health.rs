use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let files_indexed = state.registry.files_indexed().await;
    let vaults_cached = state.registry.cached_count().await;
    Json(json!({
        "status": "ok",
        "service": "temoa",
        "version": env!("CARGO_PKG_VERSION"),
        "model": state.config.model_id,
        "files_indexed": files_indexed,
        "vaults_cached": vaults_cached,
        "uptime_s": state.started_at.elapsed().as_secs(),
    }))
}
