//! Pipeline error types

use recommdo_core::{CoreError, FileKind};
use thiserror::Error;

use crate::jobs::QueueError;

/// Errors raised while importing or analyzing a project
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Required {} stream is missing", .stream.as_str())]
    MissingRequiredFile { stream: FileKind },

    #[error("Invalid column mapping: {0}")]
    InvalidColumnMapping(String),

    #[error("Malformed identifier '{value}' in column '{column}' at line {line}")]
    MalformedIdentifier {
        line: u64,
        column: String,
        value: String,
    },

    #[error("No interaction matched a catalog item")]
    EmptyInteractionSet,

    #[error("Training failed: {0}")]
    Training(String),

    #[error(transparent)]
    Store(#[from] CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Shard task failed: {0}")]
    ShardJoin(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl PipelineError {
    /// Terminal errors fail the same way on every attempt and are
    /// dead-lettered without a retry.
    pub fn is_terminal(&self) -> bool {
        match self {
            PipelineError::MissingRequiredFile { .. }
            | PipelineError::InvalidColumnMapping(_)
            | PipelineError::MalformedIdentifier { .. }
            | PipelineError::EmptyInteractionSet
            | PipelineError::Training(_)
            | PipelineError::Csv(_) => true,
            PipelineError::Store(err) => !err.is_transient(),
            PipelineError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            PipelineError::ShardJoin(_) | PipelineError::Queue(_) => false,
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
