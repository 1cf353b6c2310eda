use std::sync::Arc;

use anyhow::Result;
use axum::{response::Html, routing::get, Extension, Json, Router};
use tracing::info;
use utoipa::OpenApi;

use crate::server::app::{AppServer, Stage};
use crate::server::plugins::DOCUMENTATION_PLUGIN;
use crate::server::rest::error::ErrorDto;
use crate::server::rest::handlers::records::{
    self, AggregateRequest, PopulateRequest, QueryRequest, RecordDto, RecordInput, RecordListDto,
    UpdateRecordRequest,
};
use crate::shared::config::DocumentationConfig;

#[derive(OpenApi)]
#[openapi(
    paths(
        records::list_records,
        records::create_record,
        records::query_records,
        records::populate_records,
        records::aggregate_records,
        records::update_record,
        records::delete_record,
    ),
    components(schemas(
        RecordInput,
        UpdateRecordRequest,
        QueryRequest,
        PopulateRequest,
        AggregateRequest,
        RecordDto,
        RecordListDto,
        ErrorDto,
    )),
    tags((name = "records", description = "Generic record access for every registered model"))
)]
pub struct ApiDoc;

/// OpenAPI document with the configured title and version.
pub fn openapi(config: &DocumentationConfig) -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();
    doc.info.title = config.title.clone();
    doc.info.version = config.version.clone();
    doc
}

fn render_index(doc: &utoipa::openapi::OpenApi) -> String {
    let items: String = doc
        .paths
        .paths
        .keys()
        .map(|path| format!("<li><code>{path}</code></li>"))
        .collect();
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{title}</title></head>\n<body>\n<h1>{title} {version}</h1>\n<p><a href=\"/documentation/openapi.json\">openapi.json</a></p>\n<ul>{items}</ul>\n</body>\n</html>\n",
        title = doc.info.title,
        version = doc.info.version,
    )
}

/// Step f: serve the API documentation. Needs the documentation plugin.
pub fn add_docs_routes(server: &mut AppServer) -> Result<()> {
    server.expect_next(Stage::DocsRoutes)?;
    server.require_plugin(Stage::DocsRoutes, DOCUMENTATION_PLUGIN)?;

    let doc = Arc::new(openapi(&server.state().config.documentation));
    server.merge(
        Router::new()
            .route("/documentation", get(docs_index))
            .route("/documentation/openapi.json", get(openapi_json)),
    );
    server.decorate(move |router| router.layer(Extension(doc)));

    info!("API documentation mounted at /documentation");
    server.advance(Stage::DocsRoutes)?;
    Ok(())
}

async fn docs_index(Extension(doc): Extension<Arc<utoipa::openapi::OpenApi>>) -> Html<String> {
    Html(render_index(&doc))
}

async fn openapi_json(
    Extension(doc): Extension<Arc<utoipa::openapi::OpenApi>>,
) -> Json<utoipa::openapi::OpenApi> {
    Json(doc.as_ref().clone())
}
