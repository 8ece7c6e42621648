//! Query errors with stable numeric codes

use recommdo_core::{CoreError, PageOutOfRange};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Not allowed to access project {0}")]
    Forbidden(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Project {0} has no results yet")]
    ProjectNotReady(String),

    #[error("Item {item_id} not found in project {project_id}")]
    ItemNotFound { project_id: String, item_id: i64 },

    #[error(transparent)]
    InvalidPage(#[from] PageOutOfRange),

    #[error("Not enough data to compute statistics")]
    InsufficientData,

    #[error(transparent)]
    Store(#[from] CoreError),
}

impl QueryError {
    /// Stable code reported to clients
    pub fn code(&self) -> u16 {
        match self {
            QueryError::Forbidden(_) => 51,
            QueryError::InvalidIdentifier(_) => 53,
            QueryError::ProjectNotFound(_) => 201,
            QueryError::ProjectNotReady(_) => 202,
            QueryError::ItemNotFound { .. } => 203,
            QueryError::InvalidPage(_) => 300,
            QueryError::InsufficientData => 301,
            QueryError::Store(_) => 500,
        }
    }
}

pub type QueryResult<T> = std::result::Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(QueryError::Forbidden("p".into()).code(), 51);
        assert_eq!(
            QueryError::InvalidPage(PageOutOfRange {
                requested: 4,
                page_amount: 3
            })
            .code(),
            300
        );
        assert_eq!(QueryError::InsufficientData.code(), 301);
        assert_eq!(
            QueryError::Store(CoreError::Storage("down".into())).code(),
            500
        );
    }
}
