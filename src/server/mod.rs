pub mod app;
pub mod bootstrap;
pub mod docs;
pub mod hooks;
pub mod plugins;
pub mod rest;
pub mod socket;
pub mod sso;
pub mod supervisor;
pub mod views;

pub use app::{AppServer, BootstrapError, ListeningServer, Stage};
pub use bootstrap::{create_server, init_server, start_my_server, InitOptions};
pub use supervisor::{run_supervised, terminate, FailureWatch, Supervisor};
