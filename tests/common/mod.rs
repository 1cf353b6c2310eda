#![allow(dead_code)]

use docserve::server::{init_server, InitOptions};
use docserve::shared::config::AppConfig;
use docserve::shared::init_database;
use serde_json::Value;
use std::sync::Arc;

/// Build a config listening on an OS-assigned port with an in-memory store.
pub fn test_config(overrides: Value) -> AppConfig {
    let mut config: AppConfig = serde_json::from_value(overrides).unwrap();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.database.url = "memory://".to_string();
    config.normalize();
    config
}

/// Run the full init sequence and serve in the background, returning the
/// base URL.
pub async fn spawn_test_server(config: AppConfig) -> String {
    let options = InitOptions::defaults(&config);
    let state = init_database(Arc::new(config)).await.unwrap();
    let server = init_server(state, options).await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(async move {
        server.serve(std::future::pending()).await.unwrap();
    });
    format!("http://{}", addr)
}
