//! Catalog metadata items

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One item of a project's catalog, unique per `(project_id, meta_id)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CatalogItem {
    pub project_id: Uuid,
    pub meta_id: i64,
    pub name: Option<String>,
    /// Extra catalog columns, keyed by header
    pub payload: Option<serde_json::Value>,
}

impl CatalogItem {
    pub fn new(project_id: Uuid, meta_id: i64) -> Self {
        Self {
            project_id,
            meta_id,
            name: None,
            payload: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}
