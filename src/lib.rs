pub mod server;
pub mod services;
pub mod shared;
