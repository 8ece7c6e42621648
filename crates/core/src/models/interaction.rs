//! Persisted purchases and recommendations

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A deduplicated, weighted interaction between a user and an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Purchase {
    pub id: Uuid,
    pub project_id: Uuid,
    pub user_id: i64,
    pub item_id: i64,
    /// Interaction intensity bucket, 1..=5
    pub weight: i32,
}

impl Purchase {
    pub fn new(project_id: Uuid, user_id: i64, item_id: i64, weight: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            user_id,
            item_id,
            weight,
        }
    }
}

/// A scored item suggestion for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Recommendation {
    pub id: Uuid,
    pub project_id: Uuid,
    pub user_id: i64,
    pub item_id: i64,
    /// Raw model score
    pub score: f32,
    /// Star rating derived from the score, 1..=5
    pub user_item_weight: i32,
}

impl Recommendation {
    pub fn new(project_id: Uuid, user_id: i64, item_id: i64, score: f32, rating: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            user_id,
            item_id,
            score,
            user_item_weight: rating,
        }
    }
}
