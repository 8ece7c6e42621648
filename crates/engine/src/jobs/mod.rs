//! Background jobs
//!
//! Import and analysis runs are dispatched through a [`JobQueue`] and
//! executed by a [`JobWorker`]. Delivery is at-least-once: a job is only
//! acknowledged after it succeeded, was re-enqueued for a retry, or was
//! moved to the dead-letter stream.

mod memory;
mod queue;
mod worker;

pub use memory::InMemoryJobQueue;
pub use queue::{Delivery, JobQueue, QueueError, QueueStats, RedisJobQueue};
pub use worker::{JobHandler, JobOutcome, JobWorker, WorkerConfig};

use recommdo_core::Project;
use serde::{Deserialize, Serialize};

use crate::dataset::InteractionDataset;
use crate::ingestion::ColumnMapping;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Persist purchases, then analyze
    ImportAndAnalyze,
    /// Recompute recommendations from already imported data
    Analyze,
}

/// Queue lane. High-priority jobs are always drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
        }
    }
}

impl JobKind {
    /// Re-analysis requests jump ahead of imports
    pub fn default_priority(&self) -> Priority {
        match self {
            JobKind::ImportAndAnalyze => Priority::Normal,
            JobKind::Analyze => Priority::High,
        }
    }
}

/// Serialized as JSON on the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub kind: JobKind,
    pub project: Project,
    /// Pre-read input streams; `None` makes the worker scan the project's files
    pub dataset: Option<InteractionDataset>,
    pub columns: ColumnMapping,
    /// 1-based delivery attempt
    pub attempt: u32,
}

impl JobPayload {
    pub fn new(kind: JobKind, project: Project, columns: ColumnMapping) -> Self {
        Self {
            kind,
            project,
            dataset: None,
            columns,
            attempt: 1,
        }
    }

    pub fn with_dataset(mut self, dataset: InteractionDataset) -> Self {
        self.dataset = Some(dataset);
        self
    }

    /// Copy for the next delivery attempt
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}
