use axum::{
    Router,
    http::HeaderValue,
    routing::{get, post},
};
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::routes;
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    let cors = build_cors(&state.config.cors_origins);

    Router::new()
        .route("/search", get(routes::search::search))
        .route("/reindex", post(routes::search::reindex))
        .route("/stats", get(routes::search::stats))
        .route("/health", get(routes::health::health))
        .route("/vaults", get(routes::meta::vaults))
        .route("/profiles", get(routes::meta::profiles))
        .route("/models", get(routes::meta::models))
        .route("/config", get(routes::meta::config))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

/// CORS from the configured origin whitelist. There is deliberately no
/// wildcard fallback; an unparseable origin is dropped with a warning.
fn build_cors(origins: &[String]) -> CorsLayer {
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}
