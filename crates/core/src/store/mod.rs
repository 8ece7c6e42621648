//! Storage abstraction for projects, catalog items, purchases and
//! recommendations
//!
//! Components receive an `Arc<dyn Store>` instead of reaching for a global
//! connection. [`PostgresStore`] is used in production; [`InMemoryStore`]
//! backs tests and local experiments.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

use crate::error::CoreError;
use crate::models::{CatalogItem, Project, Purchase, Recommendation};
use crate::pagination::{SortField, SortOrder};
use async_trait::async_trait;
use uuid::Uuid;

/// Columns purchases can be ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PurchaseSort {
    #[default]
    UserId,
    ItemId,
    Weight,
}

impl SortField for PurchaseSort {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "user_id" => Some(PurchaseSort::UserId),
            "item_id" | "purchase_id" => Some(PurchaseSort::ItemId),
            "weight" => Some(PurchaseSort::Weight),
            _ => None,
        }
    }
}

impl PurchaseSort {
    pub fn column(&self) -> &'static str {
        match self {
            PurchaseSort::UserId => "user_id",
            PurchaseSort::ItemId => "item_id",
            PurchaseSort::Weight => "weight",
        }
    }
}

/// Columns recommendations can be ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecommendationSort {
    #[default]
    UserId,
    UserItemWeight,
    Score,
    ItemId,
}

impl SortField for RecommendationSort {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "user_id" => Some(RecommendationSort::UserId),
            "user_item_weight" => Some(RecommendationSort::UserItemWeight),
            "score" => Some(RecommendationSort::Score),
            "item_id" => Some(RecommendationSort::ItemId),
            _ => None,
        }
    }
}

impl RecommendationSort {
    pub fn column(&self) -> &'static str {
        match self {
            RecommendationSort::UserId => "user_id",
            RecommendationSort::UserItemWeight => "user_item_weight",
            RecommendationSort::Score => "score",
            RecommendationSort::ItemId => "item_id",
        }
    }
}

/// Row filter for purchase queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurchaseFilter {
    pub project_id: Uuid,
    pub user_id: Option<i64>,
    /// Matches rows whose user id or item id equals the value
    pub search: Option<i64>,
}

impl PurchaseFilter {
    pub fn project(project_id: Uuid) -> Self {
        Self {
            project_id,
            user_id: None,
            search: None,
        }
    }

    pub fn matches(&self, purchase: &Purchase) -> bool {
        purchase.project_id == self.project_id
            && self.user_id.map_or(true, |u| purchase.user_id == u)
            && self
                .search
                .map_or(true, |s| purchase.user_id == s || purchase.item_id == s)
    }
}

/// Row filter for recommendation queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecommendationFilter {
    pub project_id: Uuid,
    pub user_id: Option<i64>,
    pub item_id: Option<i64>,
    /// Star rating (`user_item_weight`)
    pub stars: Option<i32>,
    /// Matches rows whose user id or item id equals the value
    pub search: Option<i64>,
}

impl RecommendationFilter {
    pub fn project(project_id: Uuid) -> Self {
        Self {
            project_id,
            user_id: None,
            item_id: None,
            stars: None,
            search: None,
        }
    }

    pub fn matches(&self, rec: &Recommendation) -> bool {
        rec.project_id == self.project_id
            && self.user_id.map_or(true, |u| rec.user_id == u)
            && self.item_id.map_or(true, |i| rec.item_id == i)
            && self.stars.map_or(true, |s| rec.user_item_weight == s)
            && self
                .search
                .map_or(true, |s| rec.user_id == s || rec.item_id == s)
    }
}

/// Number of recommendations per star rating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RatingCounts {
    /// `counts[0]` holds 1-star rows, `counts[4]` 5-star rows
    pub counts: [u64; 5],
}

impl RatingCounts {
    pub fn add(&mut self, rating: i32, count: u64) {
        if (1..=5).contains(&rating) {
            self.counts[(rating - 1) as usize] += count;
        }
    }

    pub fn get(&self, rating: i32) -> u64 {
        if (1..=5).contains(&rating) {
            self.counts[(rating - 1) as usize]
        } else {
            0
        }
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new project. Fails with `Conflict` if the name is taken.
    async fn insert_project(&self, project: &Project) -> Result<(), CoreError>;

    /// Overwrite flags, files and allowed users of an existing project
    async fn save_project(&self, project: &Project) -> Result<(), CoreError>;

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, CoreError>;

    async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>, CoreError>;

    async fn list_projects(&self) -> Result<Vec<Project>, CoreError>;

    /// Insert or update catalog items keyed on `(project_id, meta_id)`
    async fn upsert_catalog(&self, items: &[CatalogItem]) -> Result<u64, CoreError>;

    async fn list_catalog(&self, project_id: Uuid) -> Result<Vec<CatalogItem>, CoreError>;

    async fn get_catalog_item(
        &self,
        project_id: Uuid,
        meta_id: i64,
    ) -> Result<Option<CatalogItem>, CoreError>;

    /// Insert or update purchases keyed on `(project_id, user_id, item_id)`
    async fn upsert_purchases(&self, purchases: &[Purchase]) -> Result<u64, CoreError>;

    async fn count_purchases(&self, filter: &PurchaseFilter) -> Result<u64, CoreError>;

    /// `limit: None` returns every row from `offset`
    async fn find_purchases(
        &self,
        filter: &PurchaseFilter,
        sort: SortOrder<PurchaseSort>,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Vec<Purchase>, CoreError>;

    async fn insert_recommendations(
        &self,
        recommendations: &[Recommendation],
    ) -> Result<u64, CoreError>;

    /// Remove every recommendation of a project
    async fn delete_recommendations(&self, project_id: Uuid) -> Result<u64, CoreError>;

    async fn count_recommendations(&self, filter: &RecommendationFilter)
        -> Result<u64, CoreError>;

    /// `limit: None` returns every row from `offset`
    async fn find_recommendations(
        &self,
        filter: &RecommendationFilter,
        sort: SortOrder<RecommendationSort>,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Vec<Recommendation>, CoreError>;

    /// Recommendation counts per star rating, optionally for one item
    async fn rating_counts(
        &self,
        project_id: Uuid,
        item_id: Option<i64>,
    ) -> Result<RatingCounts, CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purchase_sort_aliases() {
        assert_eq!(PurchaseSort::parse("purchase_id"), Some(PurchaseSort::ItemId));
        assert_eq!(PurchaseSort::parse("id"), None);
    }

    #[test]
    fn test_purchase_filter_search_matches_either_id() {
        let project_id = Uuid::new_v4();
        let purchase = Purchase::new(project_id, 7, 42, 3);

        let mut filter = PurchaseFilter::project(project_id);
        filter.search = Some(42);
        assert!(filter.matches(&purchase));

        filter.search = Some(7);
        assert!(filter.matches(&purchase));

        filter.search = Some(8);
        assert!(!filter.matches(&purchase));
    }

    #[test]
    fn test_recommendation_filter_stars() {
        let project_id = Uuid::new_v4();
        let rec = Recommendation::new(project_id, 1, 2, 0.5, 4);

        let mut filter = RecommendationFilter::project(project_id);
        filter.stars = Some(4);
        assert!(filter.matches(&rec));
        filter.stars = Some(5);
        assert!(!filter.matches(&rec));
    }

    #[test]
    fn test_rating_counts() {
        let mut counts = RatingCounts::default();
        counts.add(5, 2);
        counts.add(3, 3);
        counts.add(9, 1);
        assert_eq!(counts.get(5), 2);
        assert_eq!(counts.get(3), 3);
        assert_eq!(counts.total(), 5);
    }
}
