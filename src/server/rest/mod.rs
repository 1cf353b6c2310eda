pub mod error;
pub mod handlers;
pub mod logging_middleware;
pub mod routes;

pub use logging_middleware::attach_logger_on_events;
pub use routes::{create_router, set_default_routes};
