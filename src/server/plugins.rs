use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use axum::http::HeaderValue;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::server::app::{AppServer, Stage};
use crate::shared::config::AppConfig;

pub const TRACE_PLUGIN: &str = "trace";
pub const CORS_PLUGIN: &str = "cors";
pub const STATIC_FILES_PLUGIN: &str = "static-files";
pub const DOCUMENTATION_PLUGIN: &str = "documentation";

/// Extension registered on the server before any route exists.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    async fn register(&self, server: &mut AppServer) -> Result<()>;
}

/// HTTP request tracing through `tower-http`.
pub struct TracePlugin;

#[async_trait]
impl Plugin for TracePlugin {
    fn name(&self) -> &'static str {
        TRACE_PLUGIN
    }

    async fn register(&self, server: &mut AppServer) -> Result<()> {
        server.decorate(|router| router.layer(TraceLayer::new_for_http()));
        Ok(())
    }
}

pub struct CorsPlugin {
    allowed_origins: Vec<String>,
}

impl CorsPlugin {
    pub fn new(allowed_origins: Vec<String>) -> Self {
        Self { allowed_origins }
    }

    fn layer(&self) -> Option<CorsLayer> {
        if self.allowed_origins.is_empty() {
            return None;
        }
        if self.allowed_origins.iter().any(|origin| origin == "*") {
            return Some(CorsLayer::permissive());
        }
        let origins: Vec<HeaderValue> = self
            .allowed_origins
            .iter()
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin: {}", origin);
                    None
                }
            })
            .collect();
        Some(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any),
        )
    }
}

#[async_trait]
impl Plugin for CorsPlugin {
    fn name(&self) -> &'static str {
        CORS_PLUGIN
    }

    async fn register(&self, server: &mut AppServer) -> Result<()> {
        match self.layer() {
            Some(layer) => {
                info!("CORS enabled for {:?}", self.allowed_origins);
                server.decorate(move |router| router.layer(layer));
            }
            None => info!("CORS disabled: no allowed origins configured"),
        }
        Ok(())
    }
}

/// Serves files under the public directory for unmatched paths.
pub struct StaticFilesPlugin {
    dir: Option<PathBuf>,
}

impl StaticFilesPlugin {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl Plugin for StaticFilesPlugin {
    fn name(&self) -> &'static str {
        STATIC_FILES_PLUGIN
    }

    async fn register(&self, server: &mut AppServer) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let dir = server.resolve_path(dir);
        if !tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
            warn!("Public directory {} does not exist, not serving static files", dir.display());
            return Ok(());
        }
        info!("Serving static files from {}", dir.display());
        server.decorate(move |router| router.fallback_service(ServeDir::new(dir)));
        Ok(())
    }
}

/// Marks the API documentation as available; the routes are added later.
pub struct DocumentationPlugin;

#[async_trait]
impl Plugin for DocumentationPlugin {
    fn name(&self) -> &'static str {
        DOCUMENTATION_PLUGIN
    }

    async fn register(&self, _server: &mut AppServer) -> Result<()> {
        Ok(())
    }
}

pub fn default_plugins(config: &AppConfig) -> Vec<Box<dyn Plugin>> {
    vec![
        Box::new(StaticFilesPlugin::new(config.public_dir.clone())),
        Box::new(TracePlugin),
        Box::new(CorsPlugin::new(config.cors.allowed_origins.clone())),
        Box::new(DocumentationPlugin),
    ]
}

/// Step b: register every plugin, in order, each one finishing before the
/// next starts.
pub async fn register_plugins(server: &mut AppServer, plugins: &[Box<dyn Plugin>]) -> Result<()> {
    server.expect_next(Stage::PluginsRegistered)?;

    for plugin in plugins {
        plugin.register(server).await?;
        server.add_plugin_name(plugin.name());
        info!("Plugin '{}' registered", plugin.name());
    }

    server.advance(Stage::PluginsRegistered)?;
    Ok(())
}
