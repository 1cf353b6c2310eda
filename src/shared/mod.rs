pub mod app_root;
pub mod config;
pub mod database;
pub mod logging;
pub mod models;
pub mod store;

pub use database::{connect_database, init_database};
pub use models::AppState;
