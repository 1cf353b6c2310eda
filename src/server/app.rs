use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

use crate::server::socket::SocketHub;
use crate::shared::app_root::app_root;
use crate::shared::models::AppState;

/// Steps of server initialisation, in the only order they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Created,
    PluginsRegistered,
    ViewsConfigured,
    DefaultRoutes,
    SsoRoutes,
    DocsRoutes,
    Bootstrapped,
    SocketAttached,
    LoggerAttached,
    Listening,
}

impl Stage {
    pub const ORDER: [Stage; 10] = [
        Stage::Created,
        Stage::PluginsRegistered,
        Stage::ViewsConfigured,
        Stage::DefaultRoutes,
        Stage::SsoRoutes,
        Stage::DocsRoutes,
        Stage::Bootstrapped,
        Stage::SocketAttached,
        Stage::LoggerAttached,
        Stage::Listening,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Created => "create_server",
            Stage::PluginsRegistered => "register_plugins",
            Stage::ViewsConfigured => "add_views",
            Stage::DefaultRoutes => "set_default_routes",
            Stage::SsoRoutes => "sso_routes",
            Stage::DocsRoutes => "add_docs_routes",
            Stage::Bootstrapped => "bootstrap",
            Stage::SocketAttached => "connect_socket",
            Stage::LoggerAttached => "attach_logger_on_events",
            Stage::Listening => "start_server",
        }
    }

    pub fn previous(self) -> Option<Stage> {
        let index = Stage::ORDER.iter().position(|s| *s == self)?;
        index.checked_sub(1).map(|i| Stage::ORDER[i])
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum BootstrapError {
    #[error("Step '{step}' must run after '{expected}', but the last completed step is '{last}'")]
    OutOfOrder {
        step: &'static str,
        expected: &'static str,
        last: &'static str,
    },
    #[error("Step '{step}' requires the '{plugin}' plugin to be registered")]
    MissingPlugin {
        step: &'static str,
        plugin: &'static str,
    },
}

type Decorator = Box<dyn FnOnce(Router) -> Router + Send>;

/// A server under construction.
///
/// Routes are collected against the shared [`AppState`]; layers and
/// extensions are queued as decorators and applied, in registration order,
/// when the router is finalised.
pub struct AppServer {
    state: Arc<AppState>,
    router: Router<Arc<AppState>>,
    decorators: Vec<Decorator>,
    plugins: Vec<&'static str>,
    stages: Vec<Stage>,
    socket_hub: SocketHub,
}

impl AppServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            router: Router::new(),
            decorators: Vec::new(),
            plugins: Vec::new(),
            stages: vec![Stage::Created],
            socket_hub: SocketHub::new(),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn socket_hub(&self) -> &SocketHub {
        &self.socket_hub
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn last_stage(&self) -> Stage {
        self.stages.last().copied().unwrap_or(Stage::Created)
    }

    pub fn plugins(&self) -> &[&'static str] {
        &self.plugins
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| *p == name)
    }

    pub(crate) fn add_plugin_name(&mut self, name: &'static str) {
        if !self.has_plugin(name) {
            self.plugins.push(name);
        }
    }

    /// Fail unless `stage` is the step that comes right after the last one.
    pub fn expect_next(&self, stage: Stage) -> Result<(), BootstrapError> {
        let last = self.last_stage();
        match stage.previous() {
            Some(expected) if expected == last => Ok(()),
            expected => Err(BootstrapError::OutOfOrder {
                step: stage.name(),
                expected: expected.map(Stage::name).unwrap_or("nothing"),
                last: last.name(),
            }),
        }
    }

    /// Record `stage` as completed.
    pub fn advance(&mut self, stage: Stage) -> Result<(), BootstrapError> {
        self.expect_next(stage)?;
        self.stages.push(stage);
        info!("Server step '{}' completed", stage.name());
        Ok(())
    }

    pub fn require_plugin(&self, stage: Stage, plugin: &'static str) -> Result<(), BootstrapError> {
        if self.has_plugin(plugin) {
            Ok(())
        } else {
            Err(BootstrapError::MissingPlugin {
                step: stage.name(),
                plugin,
            })
        }
    }

    pub fn merge(&mut self, routes: Router<Arc<AppState>>) {
        let router = std::mem::take(&mut self.router);
        self.router = router.merge(routes);
    }

    pub fn decorate<F>(&mut self, decorator: F)
    where
        F: FnOnce(Router) -> Router + Send + 'static,
    {
        self.decorators.push(Box::new(decorator));
    }

    /// Resolve a configured path against the application root.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() || self.state.config.app_root.is_some() {
            return self.state.config.resolve(path);
        }
        match app_root() {
            Some(root) => root.join(path),
            None => path.to_path_buf(),
        }
    }

    pub fn into_router(self) -> Router {
        let mut router = self.router.with_state(self.state);
        for decorator in self.decorators {
            router = decorator(router);
        }
        router
    }
}

/// A server whose listener is bound and accepting connections.
pub struct ListeningServer {
    listener: TcpListener,
    router: Router,
    local_addr: SocketAddr,
    stages: Vec<Stage>,
    socket_hub: SocketHub,
}

impl ListeningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn socket_hub(&self) -> SocketHub {
        self.socket_hub.clone()
    }

    /// Serve requests until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("Server on {} stopped", self.local_addr);
        Ok(())
    }
}

/// Step j: bind the listener. Always the last step recorded.
pub async fn start_server(mut server: AppServer) -> Result<ListeningServer> {
    server.expect_next(Stage::Listening)?;

    let bind_addr = server.state.config.bind_addr();
    info!("Binding to: {}", bind_addr);
    let listener = TcpListener::bind(&bind_addr).await?;
    let local_addr = listener.local_addr()?;
    server.advance(Stage::Listening)?;

    info!("Server started successfully!");
    info!("Listening on http://{}", local_addr);
    info!("Ready to accept requests...");

    let stages = server.stages.clone();
    let socket_hub = server.socket_hub.clone();
    let router = server.into_router();
    Ok(ListeningServer {
        listener,
        router,
        local_addr,
        stages,
        socket_hub,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::test_state;

    #[test]
    fn test_stage_previous() {
        assert_eq!(Stage::Created.previous(), None);
        assert_eq!(Stage::PluginsRegistered.previous(), Some(Stage::Created));
        assert_eq!(Stage::Listening.previous(), Some(Stage::LoggerAttached));
    }

    #[test]
    fn test_advance_enforces_order() {
        let mut server = AppServer::new(test_state());
        assert_eq!(server.stages(), &[Stage::Created]);

        let err = server.advance(Stage::DefaultRoutes).unwrap_err();
        assert_eq!(
            err,
            BootstrapError::OutOfOrder {
                step: "set_default_routes",
                expected: "add_views",
                last: "create_server",
            }
        );

        server.advance(Stage::PluginsRegistered).unwrap();
        assert!(server.advance(Stage::PluginsRegistered).is_err());
        assert!(server.advance(Stage::Created).is_err());
        assert_eq!(server.last_stage(), Stage::PluginsRegistered);
    }

    #[test]
    fn test_require_plugin() {
        let mut server = AppServer::new(test_state());
        assert_eq!(
            server.require_plugin(Stage::DocsRoutes, "documentation"),
            Err(BootstrapError::MissingPlugin {
                step: "add_docs_routes",
                plugin: "documentation",
            })
        );
        server.add_plugin_name("documentation");
        server.add_plugin_name("documentation");
        assert_eq!(server.plugins(), &["documentation"]);
        assert!(server.require_plugin(Stage::DocsRoutes, "documentation").is_ok());
    }

    #[tokio::test]
    async fn test_start_server_refuses_to_skip_steps() {
        let server = AppServer::new(test_state());
        let err = start_server(server).await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::OutOfOrder { step: "start_server", .. })
        ));
    }
}
