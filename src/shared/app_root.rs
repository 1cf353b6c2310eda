use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing::{info, warn};

use crate::shared::config::AppConfig;

static APP_ROOT: OnceCell<PathBuf> = OnceCell::new();

/// Record the application root folder for the whole process.
///
/// Order of precedence: `DOCSERVE_APP_ROOT`, the configured `app_root`, the
/// current working directory. The first call wins; later calls return the
/// value already stored.
pub fn set_global_app_root(config: &AppConfig) -> &'static Path {
    let root = APP_ROOT.get_or_init(|| {
        let root = std::env::var_os("DOCSERVE_APP_ROOT")
            .map(PathBuf::from)
            .or_else(|| config.app_root.clone())
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        info!("Application root set to {}", root.display());
        root
    });
    if let Some(configured) = &config.app_root {
        if configured != root {
            warn!(
                "Application root already set to {}, ignoring {}",
                root.display(),
                configured.display()
            );
        }
    }
    root.as_path()
}

/// The application root, if [`set_global_app_root`] has run.
pub fn app_root() -> Option<&'static Path> {
    APP_ROOT.get().map(PathBuf::as_path)
}
