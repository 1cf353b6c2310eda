use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::server::app::{start_server, AppServer, ListeningServer};
use crate::server::docs::add_docs_routes;
use crate::server::hooks::{bootstrap, default_hooks, BootstrapHook};
use crate::server::plugins::{default_plugins, register_plugins, Plugin};
use crate::server::rest::{attach_logger_on_events, set_default_routes};
use crate::server::socket::SocketManager;
use crate::server::sso::SsoManager;
use crate::server::supervisor::{run_supervised, Supervisor};
use crate::server::views::add_views;
use crate::shared::app_root::set_global_app_root;
use crate::shared::config::AppConfig;
use crate::shared::logging::init_service_logging;
use crate::shared::models::AppState;
use crate::shared::init_database;

/// Plugins and bootstrap hooks handed to [`init_server`].
pub struct InitOptions {
    pub plugins: Vec<Box<dyn Plugin>>,
    pub hooks: Vec<Box<dyn BootstrapHook>>,
}

impl InitOptions {
    pub fn defaults(config: &AppConfig) -> Self {
        Self {
            plugins: default_plugins(config),
            hooks: default_hooks(),
        }
    }
}

/// Step a.
pub fn create_server(state: Arc<AppState>) -> AppServer {
    info!("Building server...");
    AppServer::new(state)
}

/// Run steps a through j strictly in order. Returns once the listener is
/// bound; call [`ListeningServer::serve`] to handle requests.
pub async fn init_server(state: AppState, options: InitOptions) -> Result<ListeningServer> {
    let mut server = create_server(Arc::new(state));
    register_plugins(&mut server, &options.plugins).await?;
    add_views(&mut server)?;
    set_default_routes(&mut server)?;
    SsoManager::create_route(&mut server)?;
    add_docs_routes(&mut server)?;
    bootstrap(&mut server, &options.hooks).await?;
    SocketManager::connect_socket(&mut server)?;
    attach_logger_on_events(&mut server)?;
    start_server(server).await
}

fn pid_file() -> PathBuf {
    std::env::temp_dir().join("docserve.pid")
}

/// Bring the whole service up and run it until Ctrl-C or the first
/// unhandled failure.
pub async fn start_my_server(config: AppConfig) -> Result<()> {
    let _ = init_service_logging(&config.logging.dir, &config.logging.service_name)?;

    let pid = process::id();
    let pid_file = pid_file();
    if let Err(e) = fs::write(&pid_file, pid.to_string()) {
        warn!("Could not write PID file: {}", e);
    }

    info!(
        r#"
     _
  __| | ___   ___ ___  ___ _ ____   _____
 / _` |/ _ \ / __/ __|/ _ \ '__\ \ / / _ \
| (_| | (_) | (__\__ \  __/ |   \ V /  __/
 \__,_|\___/ \___|___/\___|_|    \_/ \___|

Starting docserve...
PID: {}
"#,
        pid
    );

    let result = run(config).await;

    let _ = fs::remove_file(&pid_file);
    result
}

async fn run(config: AppConfig) -> Result<()> {
    let config = Arc::new(config);

    info!("Connecting to document store...");
    let state = init_database(config.clone()).await?;

    set_global_app_root(&config);

    let (supervisor, failures) = Supervisor::new();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        info!("Shutting down docserve...");
        let _ = shutdown_tx.send(true);
    })
    .map_err(|e| anyhow!("Could not install Ctrl-C handler: {e}"))?;

    let server = init_server(state, InitOptions::defaults(&config)).await?;

    let http = supervisor.spawn("http-server", server.serve(wait_for_shutdown(shutdown_rx)));

    run_supervised(failures, async move {
        http.await
            .map_err(|e| anyhow!("HTTP server task aborted: {e}"))
    })
    .await
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
