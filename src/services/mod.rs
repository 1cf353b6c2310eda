pub mod generic_service;

pub use generic_service::{GenericService, ServiceError};
