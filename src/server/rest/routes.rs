use axum::{
    routing::{get, patch, post},
    Router,
};
use std::sync::Arc;
use tracing::info;

use crate::server::app::{AppServer, Stage};
use crate::server::rest::handlers;
use crate::shared::models::AppState;

pub fn create_router() -> Router<Arc<AppState>> {
    let system_routes = Router::new()
        .route("/", get(handlers::system::index))
        .route("/health", get(handlers::system::health))
        .route("/version", get(handlers::system::version));

    let record_routes = Router::new()
        .route(
            "/records/{model}",
            get(handlers::records::list_records).post(handlers::records::create_record),
        )
        .route("/records/{model}/query", post(handlers::records::query_records))
        .route(
            "/records/{model}/populate",
            post(handlers::records::populate_records),
        )
        .route(
            "/records/{model}/aggregate",
            post(handlers::records::aggregate_records),
        )
        .route(
            "/records/{model}/{id}",
            patch(handlers::records::update_record).delete(handlers::records::delete_record),
        );

    system_routes.nest("/api/v1", record_routes)
}

/// Step d: mount the system endpoints and the record API.
pub fn set_default_routes(server: &mut AppServer) -> anyhow::Result<()> {
    server.expect_next(Stage::DefaultRoutes)?;
    server.merge(create_router());
    info!(
        "Record API mounted at /api/v1/records for {:?}",
        server.state().registry.names()
    );
    server.advance(Stage::DefaultRoutes)?;
    Ok(())
}
