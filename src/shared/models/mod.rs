use std::sync::Arc;

use thiserror::Error;

use crate::shared::config::AppConfig;
use crate::shared::store::DocumentStore;

pub mod model;
pub mod registry;

pub use model::{Model, PopulatePath, QueryOptions, UpdateOptions};
pub use registry::{ModelDefinition, ModelRegistry, RegistryError};

// Document store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database connection error: {0}")]
    Connection(sqlx::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Duplicate key: {0}")]
    Duplicate(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    #[error("Invalid collection name: {0}")]
    InvalidCollection(String),
    #[error("Unsupported database url: {0}")]
    UnsupportedBackend(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        // MySQL unique constraint violation (error code 1062)
        if let sqlx::Error::Database(db_err) = &err {
            let duplicate_code = db_err
                .code()
                .is_some_and(|code| code == "23000" || code == "1062");
            if duplicate_code || db_err.is_unique_violation() {
                return StoreError::Duplicate(db_err.message().to_string());
            }
        }
        StoreError::Connection(err)
    }
}

// Application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub registry: Arc<ModelRegistry>,
    pub config: Arc<AppConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::error::Error as StdError;

    use sqlx::error::{DatabaseError, ErrorKind};

    #[derive(Debug, Error)]
    #[error("{message}")]
    struct MockDbError {
        message: String,
        code: Option<&'static str>,
        unique: bool,
    }

    impl DatabaseError for MockDbError {
        fn message(&self) -> &str {
            &self.message
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::Borrowed)
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            if self.unique {
                ErrorKind::UniqueViolation
            } else {
                ErrorKind::Other
            }
        }
    }

    fn db_error(code: Option<&'static str>, unique: bool) -> sqlx::Error {
        sqlx::Error::Database(Box::new(MockDbError {
            message: "Duplicate entry 'a' for key 'doc_id'".to_string(),
            code,
            unique,
        }))
    }

    #[test]
    fn test_duplicate_key_errors_map_to_duplicate() {
        for err in [
            db_error(Some("23000"), false),
            db_error(Some("1062"), false),
            db_error(None, true),
        ] {
            match StoreError::from(err) {
                StoreError::Duplicate(message) => assert!(message.contains("Duplicate entry")),
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_other_sqlx_errors_are_connection_errors() {
        assert!(matches!(
            StoreError::from(db_error(Some("42S02"), false)),
            StoreError::Connection(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolTimedOut),
            StoreError::Connection(_)
        ));
    }
}
