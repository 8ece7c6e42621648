//! Rows produced by the ingestion scan and consumed by the matrix builder

use serde::{Deserialize, Serialize};

/// One catalog row as read from the catalog file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRow {
    pub meta_id: i64,
    pub name: Option<String>,
    pub payload: Option<serde_json::Value>,
}

impl CatalogRow {
    pub fn new(meta_id: i64) -> Self {
        Self {
            meta_id,
            name: None,
            payload: None,
        }
    }
}

/// Number of times a user interacted with an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionCount {
    pub user_id: i64,
    pub item_id: i64,
    pub count: u64,
}

impl InteractionCount {
    pub fn new(user_id: i64, item_id: i64, count: u64) -> Self {
        Self {
            user_id,
            item_id,
            count,
        }
    }
}

/// Both input streams of an analysis run. A `None` stream was not uploaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionDataset {
    pub catalog: Option<Vec<CatalogRow>>,
    pub interactions: Option<Vec<InteractionCount>>,
}
