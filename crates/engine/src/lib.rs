//! Recommdo recommendation engine
//!
//! Turns raw interaction logs into persisted per-user recommendations and
//! serves the results:
//!
//! - `ingestion`: chunked CSV scan into catalog and interaction streams
//! - `matrix`: weighted, encoded sparse interaction matrices
//! - `matrix_factorization`: implicit-feedback ALS behind [`FactorModel`]
//! - `recommendation`: top-N generation with star ratings
//! - `persistence`: sharded concurrent writes and project transitions
//! - `pipeline`: import and analysis runs
//! - `jobs`: Redis Streams queue and the worker loop
//! - `projects`: project creation, re-analysis, access and deletion
//! - `query`: paginated, access-controlled read side

pub mod dataset;
pub mod error;
pub mod index_mapping;
pub mod ingestion;
pub mod jobs;
pub mod matrix;
pub mod matrix_factorization;
pub mod persistence;
pub mod pipeline;
pub mod projects;
pub mod query;
pub mod recommendation;
pub mod weighting;

// Re-export key types
pub use dataset::{CatalogRow, InteractionCount, InteractionDataset};
pub use error::{PipelineError, PipelineResult};
pub use index_mapping::IndexMapping;
pub use ingestion::{CatalogColumns, ColumnMapping, IngestionPreprocessor, InteractionColumns};
pub use jobs::{
    InMemoryJobQueue, JobHandler, JobKind, JobOutcome, JobPayload, JobQueue, JobWorker, Priority,
    QueueError, QueueStats, RedisJobQueue, WorkerConfig,
};
pub use matrix::{InteractionMatrix, MatrixBuilder, SparseMatrix, WeightedInteraction};
pub use matrix_factorization::{AlsConfig, AlsModel, AlsTrainer, FactorModel};
pub use persistence::BatchPersistenceCoordinator;
pub use pipeline::{Pipeline, RunSummary};
pub use projects::{CreateProject, ProjectError, ProjectService, UploadedFile};
pub use query::{
    Caller, PageRequest, ProjectStatistics, QueryError, QueryService, RecommendationScope,
    StarCount,
};
pub use recommendation::RecommendationGenerator;
pub use weighting::{interaction_weight, score_rating};
