use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::embedder::{DEFAULT_MODEL_ID, model_registry};
use crate::profiles::{Profile, builtin_profiles};
use crate::state::AppState;

pub async fn vaults(State(state): State<AppState>) -> Json<Value> {
    let vaults: Vec<Value> = state
        .config
        .vaults
        .iter()
        .map(|v| {
            json!({
                "name": v.name,
                "root": v.root.to_string_lossy(),
            })
        })
        .collect();
    Json(json!({ "vaults": vaults }))
}

pub async fn profiles() -> Json<Vec<Profile>> {
    Json(builtin_profiles())
}

pub async fn models(State(state): State<AppState>) -> Json<Value> {
    let models: Vec<Value> = model_registry()
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "dimension": m.dimension,
                "active": m.id == state.config.model_id,
                "default": m.id == DEFAULT_MODEL_ID,
            })
        })
        .collect();
    Json(json!({ "models": models }))
}

pub async fn config(State(state): State<AppState>) -> Json<Value> {
    Json(state.config.public_snapshot())
}
