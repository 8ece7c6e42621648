//! Error types shared by the storage, configuration and model layers

use thiserror::Error;

/// Errors raised by `recommdo-core`
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {message}")]
    ConfigurationError {
        message: String,
        key: Option<String>,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{0} already exists")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid project transition: {0}")]
    InvalidTransition(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether retrying the same operation later could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Database(sqlx::Error::Database(db_err)) => db_err
                .code()
                .is_some_and(|code| is_transient_sqlstate(&code)),
            CoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            CoreError::Storage(_) => true,
            _ => false,
        }
    }
}

/// SQLSTATE classes a server reports for conditions that clear on their
/// own: connection exceptions (08), transaction rollbacks such as
/// serialization failures and deadlocks (40), insufficient resources (53)
/// and operator intervention such as an admin shutdown (57)
pub fn is_transient_sqlstate(code: &str) -> bool {
    matches!(code.get(..2), Some("08" | "40" | "53" | "57"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = CoreError::not_found("project", "abc");
        assert_eq!(err.to_string(), "project not found: abc");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = CoreError::Database(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
    }

    #[test]
    fn test_protocol_error_is_transient() {
        let err = CoreError::Database(sqlx::Error::Protocol("unexpected EOF".to_string()));
        assert!(err.is_transient());
    }

    #[test]
    fn test_sqlstate_classification() {
        for code in ["40P01", "40001", "57P01", "53300", "08006"] {
            assert!(is_transient_sqlstate(code), "{code} should be transient");
        }
        for code in ["23505", "42P01", "22P02", "0"] {
            assert!(!is_transient_sqlstate(code), "{code} should be terminal");
        }
    }
}
