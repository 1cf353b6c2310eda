use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::shared::models::ModelDefinition;
use crate::shared::store::Document;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Root folder used to resolve relative paths (views, public files).
    #[serde(default)]
    pub app_root: Option<PathBuf>,
    #[serde(default)]
    pub views: ViewsConfig,
    #[serde(default)]
    pub public_dir: Option<PathBuf>,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub sso: Option<SsoConfig>,
    #[serde(default)]
    pub documentation: DocumentationConfig,
    #[serde(default)]
    pub models: Vec<ModelDefinition>,
    /// Records inserted by the seeding bootstrap hook, keyed by model name.
    #[serde(default)]
    pub seed: BTreeMap<String, Vec<Document>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            service_name: default_service_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewsConfig {
    #[serde(default = "default_views_dir")]
    pub dir: PathBuf,
    /// Template rendered for `GET /`, when present.
    #[serde(default = "default_index_view")]
    pub index: String,
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self {
            dir: default_views_dir(),
            index: default_index_view(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CorsConfig {
    /// Allowed origins; `["*"]` allows any origin. Empty disables CORS.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SsoConfig {
    pub authorize_url: String,
    pub client_id: String,
    /// Secret shared with the identity provider (HS256) for callback tokens.
    pub shared_secret: String,
    /// Secret used to sign the application session token.
    pub session_secret: String,
    #[serde(default = "default_session_hours")]
    pub session_hours: i64,
    /// Public base URL of this server, used to build the callback URL.
    #[serde(default)]
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentationConfig {
    #[serde(default = "default_docs_title")]
    pub title: String,
    #[serde(default = "default_docs_version")]
    pub version: String,
}

impl Default for DocumentationConfig {
    fn default() -> Self {
        Self {
            title: default_docs_title(),
            version: default_docs_version(),
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config at {}: {}", path.display(), e))?;
        let mut config: AppConfig = serde_json::from_str(&data)
            .map_err(|e| anyhow!("Failed to parse config JSON at {}: {}", path.display(), e))?;
        config.normalize();
        Ok(config)
    }

    /// Load from `path` when given, otherwise from the resolved default
    /// location. A missing default file yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = path {
            return Ok((Self::load_from_path(path)?, Some(path.to_path_buf())));
        }
        let path = resolve_config_path();
        if path.exists() {
            let config = Self::load_from_path(&path)?;
            Ok((config, Some(path)))
        } else {
            let mut config = Self::default();
            config.normalize();
            Ok((config, None))
        }
    }

    pub fn normalize(&mut self) {
        self.server.host = self.server.host.trim().to_string();
        if self.server.host.is_empty() {
            self.server.host = default_host();
        }

        self.database.url = self.database.url.trim().to_string();
        if self.database.url.is_empty() {
            self.database.url = default_database_url();
        }

        self.logging.dir = self.logging.dir.trim().to_string();
        if self.logging.dir.is_empty() {
            self.logging.dir = default_log_dir();
        }
        self.logging.service_name = self.logging.service_name.trim().to_string();
        if self.logging.service_name.is_empty() {
            self.logging.service_name = default_service_name();
        }

        self.views.index = self.views.index.trim().to_string();
        if self.views.index.is_empty() {
            self.views.index = default_index_view();
        }

        self.cors.allowed_origins = self
            .cors
            .allowed_origins
            .iter()
            .map(|origin| origin.trim().trim_end_matches('/').to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        if let Some(sso) = self.sso.as_mut() {
            sso.authorize_url = sso.authorize_url.trim().to_string();
            sso.client_id = sso.client_id.trim().to_string();
            sso.public_url = sso
                .public_url
                .as_ref()
                .map(|url| url.trim().trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty());
            if sso.session_hours <= 0 {
                sso.session_hours = default_session_hours();
            }
        }

        if self.documentation.title.trim().is_empty() {
            self.documentation.title = default_docs_title();
        }
    }

    /// Resolve a possibly relative path against the application root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match &self.app_root {
            Some(root) => root.join(path),
            None => path.to_path_buf(),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_database_url() -> String {
    "memory://".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_service_name() -> String {
    "docserve".to_string()
}

fn default_views_dir() -> PathBuf {
    PathBuf::from("views")
}

fn default_index_view() -> String {
    "index".to_string()
}

fn default_session_hours() -> i64 {
    24
}

fn default_docs_title() -> String {
    "docserve API".to_string()
}

fn default_docs_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

pub fn resolve_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("DOCSERVE_CONFIG_PATH") {
        return expand_path(path);
    }

    default_config_path()
}

fn expand_path(input: String) -> PathBuf {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(input)
}

fn default_config_path() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".docserve")
        .join("docserve.json")
}

fn home_dir() -> Option<PathBuf> {
    if cfg!(windows) {
        std::env::var_os("USERPROFILE").map(PathBuf::from)
    } else {
        std::env::var_os("HOME").map(PathBuf::from)
    }
}
