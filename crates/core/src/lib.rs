//! # Recommdo Core
//!
//! Shared building blocks for the recommdo recommendation pipeline.
//!
//! ## Modules
//!
//! - `models`: projects, catalog items, purchases and recommendations
//! - `store`: storage trait with PostgreSQL and in-memory implementations
//! - `error`: error types and handling
//! - `database`: shared PostgreSQL connection pool
//! - `observability`: structured logging
//! - `config`: configuration loading and validation
//! - `retry`: job retry policy with exponential backoff
//! - `pagination`: page-number pagination, sorting and search

pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod observability;
pub mod pagination;
pub mod retry;
pub mod store;

// Re-export commonly used types
pub use config::{
    load_dotenv, ConfigLoader, DatabaseConfig, PipelineConfig, RedisConfig, ServiceConfig,
};
pub use database::{DatabasePool, PoolStats};
pub use error::CoreError;
pub use models::{
    CatalogItem, FileKind, FileLocation, Project, ProjectState, ProjectTransition, Purchase,
    Recommendation,
};
pub use observability::{init_logging, LogConfig, LogFormat, ObservabilityError};
pub use pagination::{
    page_amount, Page, PageOutOfRange, PageWindow, SearchFilter, SortField, SortOrder, PAGE_SIZE,
};
pub use retry::{retry_with_backoff, RetryDecision, RetryPolicy};
pub use store::{
    InMemoryStore, PostgresStore, PurchaseFilter, PurchaseSort, RatingCounts,
    RecommendationFilter, RecommendationSort, Store,
};

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
