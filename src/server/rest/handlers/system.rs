use axum::{
    extract::State,
    response::{Html, IntoResponse, Response},
    Extension, Json,
};
use serde_json::{json, Map};
use std::sync::Arc;

use crate::server::views::ViewEngine;
use crate::shared::models::AppState;

/// Render the index view when there is one, a JSON banner otherwise.
pub async fn index(
    State(state): State<Arc<AppState>>,
    Extension(views): Extension<Arc<ViewEngine>>,
) -> Response {
    let config = &state.config;
    let mut context = Map::new();
    context.insert("title".to_string(), json!(config.documentation.title));
    context.insert("version".to_string(), json!(env!("CARGO_PKG_VERSION")));
    context.insert("models".to_string(), json!(state.registry.names().join(", ")));

    match views.render(&config.views.index, &context) {
        Some(html) => Html(html).into_response(),
        None => Json(json!({
            "name": config.logging.service_name,
            "version": env!("CARGO_PKG_VERSION"),
        }))
        .into_response(),
    }
}

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(json!({
            "status": "healthy",
            "store": state.store.backend(),
        }))
        .into_response(),
        Err(e) => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "store": state.store.backend(),
                "message": e.to_string(),
            })),
        )
            .into_response(),
    }
}

pub async fn version() -> Json<serde_json::Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "api": "v1"
    }))
}
