//! In-memory [`Store`] implementation for tests and local runs.
//!
//! Everything lives in `HashMap`s behind `std::sync::RwLock`. Filters and
//! ordering mirror the SQL of [`PostgresStore`](super::PostgresStore).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    PurchaseFilter, PurchaseSort, RatingCounts, RecommendationFilter, RecommendationSort, Store,
};
use crate::error::CoreError;
use crate::models::{CatalogItem, Project, Purchase, Recommendation};
use crate::pagination::SortOrder;

/// In-memory store
pub struct InMemoryStore {
    projects: RwLock<HashMap<Uuid, Project>>,
    catalog: RwLock<HashMap<(Uuid, i64), CatalogItem>>,
    purchases: RwLock<HashMap<(Uuid, i64, i64), Purchase>>,
    recommendations: RwLock<Vec<Recommendation>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            projects: RwLock::new(HashMap::new()),
            catalog: RwLock::new(HashMap::new()),
            purchases: RwLock::new(HashMap::new()),
            recommendations: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, CoreError> {
    lock.read()
        .map_err(|_| CoreError::Storage("store lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, CoreError> {
    lock.write()
        .map_err(|_| CoreError::Storage("store lock poisoned".to_string()))
}

fn directed(ordering: Ordering, descending: bool) -> Ordering {
    if descending {
        ordering.reverse()
    } else {
        ordering
    }
}

fn page<T>(rows: Vec<T>, offset: u64, limit: Option<u64>) -> Vec<T> {
    let rows = rows.into_iter().skip(offset as usize);
    match limit {
        Some(limit) => rows.take(limit as usize).collect(),
        None => rows.collect(),
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_project(&self, project: &Project) -> Result<(), CoreError> {
        let mut projects = write(&self.projects)?;
        if projects.values().any(|p| p.name == project.name) {
            return Err(CoreError::Conflict(format!("project '{}'", project.name)));
        }
        projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn save_project(&self, project: &Project) -> Result<(), CoreError> {
        let mut projects = write(&self.projects)?;
        match projects.get_mut(&project.id) {
            Some(existing) => {
                *existing = project.clone();
                Ok(())
            }
            None => Err(CoreError::not_found("project", project.id)),
        }
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, CoreError> {
        Ok(read(&self.projects)?.get(&id).cloned())
    }

    async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>, CoreError> {
        Ok(read(&self.projects)?
            .values()
            .find(|p| p.name == name)
            .cloned())
    }

    async fn list_projects(&self) -> Result<Vec<Project>, CoreError> {
        let mut projects: Vec<Project> = read(&self.projects)?.values().cloned().collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(projects)
    }

    async fn upsert_catalog(&self, items: &[CatalogItem]) -> Result<u64, CoreError> {
        let mut catalog = write(&self.catalog)?;
        for item in items {
            catalog.insert((item.project_id, item.meta_id), item.clone());
        }
        Ok(items.len() as u64)
    }

    async fn list_catalog(&self, project_id: Uuid) -> Result<Vec<CatalogItem>, CoreError> {
        let mut items: Vec<CatalogItem> = read(&self.catalog)?
            .values()
            .filter(|item| item.project_id == project_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.meta_id);
        Ok(items)
    }

    async fn get_catalog_item(
        &self,
        project_id: Uuid,
        meta_id: i64,
    ) -> Result<Option<CatalogItem>, CoreError> {
        Ok(read(&self.catalog)?.get(&(project_id, meta_id)).cloned())
    }

    async fn upsert_purchases(&self, purchases: &[Purchase]) -> Result<u64, CoreError> {
        let mut stored = write(&self.purchases)?;
        for purchase in purchases {
            let key = (purchase.project_id, purchase.user_id, purchase.item_id);
            stored
                .entry(key)
                .and_modify(|existing| existing.weight = purchase.weight)
                .or_insert_with(|| purchase.clone());
        }
        Ok(purchases.len() as u64)
    }

    async fn count_purchases(&self, filter: &PurchaseFilter) -> Result<u64, CoreError> {
        Ok(read(&self.purchases)?
            .values()
            .filter(|p| filter.matches(p))
            .count() as u64)
    }

    async fn find_purchases(
        &self,
        filter: &PurchaseFilter,
        sort: SortOrder<PurchaseSort>,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Vec<Purchase>, CoreError> {
        let mut rows: Vec<Purchase> = read(&self.purchases)?
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();

        rows.sort_by(|a, b| {
            let ordering = match sort.field {
                PurchaseSort::UserId => a.user_id.cmp(&b.user_id),
                PurchaseSort::ItemId => a.item_id.cmp(&b.item_id),
                PurchaseSort::Weight => a.weight.cmp(&b.weight),
            };
            directed(ordering, sort.descending).then(a.id.cmp(&b.id))
        });

        Ok(page(rows, offset, limit))
    }

    async fn insert_recommendations(
        &self,
        recommendations: &[Recommendation],
    ) -> Result<u64, CoreError> {
        write(&self.recommendations)?.extend_from_slice(recommendations);
        Ok(recommendations.len() as u64)
    }

    async fn delete_recommendations(&self, project_id: Uuid) -> Result<u64, CoreError> {
        let mut stored = write(&self.recommendations)?;
        let before = stored.len();
        stored.retain(|r| r.project_id != project_id);
        Ok((before - stored.len()) as u64)
    }

    async fn count_recommendations(
        &self,
        filter: &RecommendationFilter,
    ) -> Result<u64, CoreError> {
        Ok(read(&self.recommendations)?
            .iter()
            .filter(|r| filter.matches(r))
            .count() as u64)
    }

    async fn find_recommendations(
        &self,
        filter: &RecommendationFilter,
        sort: SortOrder<RecommendationSort>,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Vec<Recommendation>, CoreError> {
        let mut rows: Vec<Recommendation> = read(&self.recommendations)?
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        rows.sort_by(|a, b| {
            let ordering = match sort.field {
                RecommendationSort::UserId => a.user_id.cmp(&b.user_id),
                RecommendationSort::UserItemWeight => a.user_item_weight.cmp(&b.user_item_weight),
                RecommendationSort::Score => a.score.total_cmp(&b.score),
                RecommendationSort::ItemId => a.item_id.cmp(&b.item_id),
            };
            directed(ordering, sort.descending).then(a.id.cmp(&b.id))
        });

        Ok(page(rows, offset, limit))
    }

    async fn rating_counts(
        &self,
        project_id: Uuid,
        item_id: Option<i64>,
    ) -> Result<RatingCounts, CoreError> {
        let mut counts = RatingCounts::default();
        for rec in read(&self.recommendations)?.iter() {
            if rec.project_id == project_id && item_id.map_or(true, |i| rec.item_id == i) {
                counts.add(rec.user_item_weight, 1);
            }
        }
        Ok(counts)
    }
}
