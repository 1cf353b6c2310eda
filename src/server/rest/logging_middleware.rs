use axum::{extract::Request, http::StatusCode, middleware, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::server::app::{AppServer, Stage};

pub async fn request_logging_middleware(request: Request, next: Next) -> Result<Response, StatusCode> {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start_time = Instant::now();

    debug!(method = %method, path = %uri.path(), "Request received");

    let response = next.run(request).await;
    let duration = start_time.elapsed();
    let status = response.status();

    if status.is_server_error() {
        error!(
            method = %method,
            path = %uri.path(),
            status = status.as_u16(),
            duration_ms = %duration.as_millis(),
            "Request failed"
        );
    } else if status.is_client_error() {
        warn!(
            method = %method,
            path = %uri.path(),
            status = status.as_u16(),
            duration_ms = %duration.as_millis(),
            "Handled request"
        );
    } else {
        info!(
            method = %method,
            path = %uri.path(),
            status = status.as_u16(),
            duration_ms = %duration.as_millis(),
            "Handled request"
        );
    }

    Ok(response)
}

/// Step i: log every request and its outcome.
pub fn attach_logger_on_events(server: &mut AppServer) -> anyhow::Result<()> {
    server.expect_next(Stage::LoggerAttached)?;
    server.decorate(|router| router.layer(middleware::from_fn(request_logging_middleware)));
    server.advance(Stage::LoggerAttached)?;
    Ok(())
}
