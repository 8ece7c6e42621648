//! Read side: paginated, access-controlled views over a project's results
//!
//! Every method takes the already-authenticated [`Caller`]. Staff see every
//! project, deleted ones included. Other callers only see live projects they
//! were granted access to, and only once the data they ask for exists:
//! purchases after import, recommendations and statistics after analysis.

mod error;

pub use error::{QueryError, QueryResult};

use std::sync::Arc;

use recommdo_core::{
    CatalogItem, Page, PageWindow, Project, Purchase, PurchaseFilter, PurchaseSort,
    Recommendation, RecommendationFilter, RecommendationSort, SearchFilter, SortOrder, Store,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Identity and role of whoever issues a query or mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: Uuid,
    pub is_staff: bool,
}

impl Caller {
    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id,
            is_staff: false,
        }
    }

    pub fn staff(user_id: Uuid) -> Self {
        Self {
            user_id,
            is_staff: true,
        }
    }
}

/// Page number, search input and ordering of a list query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// 1-based; values below 1 select the first page
    pub page: i64,
    pub search: Option<String>,
    /// `field` or `-field` for descending order
    pub order_by: Option<String>,
}

impl PageRequest {
    pub fn page(page: i64) -> Self {
        Self {
            page,
            ..Self::default()
        }
    }

    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }
}

/// Extra filters of a recommendation list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendationScope {
    pub item_id: Option<i64>,
    pub stars: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StarCount {
    pub stars: i32,
    pub count: u64,
    /// Fraction of all counted recommendations, `0.0..=1.0`
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectStatistics {
    pub project_id: Uuid,
    /// Set when the statistics are scoped to one item
    pub item: Option<CatalogItem>,
    pub total: u64,
    /// Star ratings 5 down to 1
    pub stars: Vec<StarCount>,
}

pub struct QueryService {
    store: Arc<dyn Store>,
}

impl QueryService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn project(&self, caller: &Caller, project_id: &str) -> QueryResult<Project> {
        self.visible_project(caller, project_id).await
    }

    /// Projects the caller may see, oldest first
    pub async fn projects(&self, caller: &Caller) -> QueryResult<Vec<Project>> {
        let mut projects: Vec<Project> = self
            .store
            .list_projects()
            .await?
            .into_iter()
            .filter(|p| p.is_visible_to(caller.user_id, caller.is_staff))
            .collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(projects)
    }

    /// Full catalog of a project
    pub async fn all_metadata(
        &self,
        caller: &Caller,
        project_id: &str,
    ) -> QueryResult<Vec<CatalogItem>> {
        let project = self.visible_project(caller, project_id).await?;
        Ok(self.store.list_catalog(project.id).await?)
    }

    pub async fn project_purchases(
        &self,
        caller: &Caller,
        project_id: &str,
        request: &PageRequest,
    ) -> QueryResult<Page<Purchase>> {
        let project = self.visible_project(caller, project_id).await?;
        require_ready(caller, &project, project.imported)?;

        let search = SearchFilter::parse(request.search.as_deref());
        if search == SearchFilter::Unmatchable {
            return Ok(Page::empty());
        }

        let filter = PurchaseFilter {
            search: search.id(),
            ..PurchaseFilter::project(project.id)
        };
        let sort = SortOrder::<PurchaseSort>::parse(request.order_by.as_deref());

        let total = self.store.count_purchases(&filter).await?;
        let window = PageWindow::resolve(request.page, total, search.is_active())?;
        let items = self
            .store
            .find_purchases(&filter, sort, window.offset, Some(window.limit))
            .await?;

        debug!(project_id = %project.id, total, page = window.index + 1, "Purchases page served");
        Ok(Page::new(window, total, items))
    }

    pub async fn project_recommendations(
        &self,
        caller: &Caller,
        project_id: &str,
        request: &PageRequest,
        scope: RecommendationScope,
    ) -> QueryResult<Page<Recommendation>> {
        let project = self.visible_project(caller, project_id).await?;
        require_ready(caller, &project, project.analyzed)?;

        let search = SearchFilter::parse(request.search.as_deref());
        if search == SearchFilter::Unmatchable {
            return Ok(Page::empty());
        }

        let filter = RecommendationFilter {
            item_id: scope.item_id,
            stars: scope.stars,
            search: search.id(),
            ..RecommendationFilter::project(project.id)
        };
        let sort = SortOrder::<RecommendationSort>::parse(request.order_by.as_deref());

        let total = self.store.count_recommendations(&filter).await?;
        let window = PageWindow::resolve(request.page, total, search.is_active())?;
        let items = self
            .store
            .find_recommendations(&filter, sort, window.offset, Some(window.limit))
            .await?;

        debug!(project_id = %project.id, total, page = window.index + 1, "Recommendations page served");
        Ok(Page::new(window, total, items))
    }

    /// Every purchase of one user, by item id
    pub async fn user_purchases(
        &self,
        caller: &Caller,
        project_id: &str,
        user_id: i64,
    ) -> QueryResult<Vec<Purchase>> {
        let project = self.visible_project(caller, project_id).await?;
        require_ready(caller, &project, project.imported)?;

        let filter = PurchaseFilter {
            user_id: Some(user_id),
            ..PurchaseFilter::project(project.id)
        };
        let sort = SortOrder {
            field: PurchaseSort::ItemId,
            descending: false,
        };
        Ok(self.store.find_purchases(&filter, sort, 0, None).await?)
    }

    /// Every recommendation of one user, best score first
    pub async fn user_recommendations(
        &self,
        caller: &Caller,
        project_id: &str,
        user_id: i64,
    ) -> QueryResult<Vec<Recommendation>> {
        let project = self.visible_project(caller, project_id).await?;
        require_ready(caller, &project, project.analyzed)?;

        let filter = RecommendationFilter {
            user_id: Some(user_id),
            ..RecommendationFilter::project(project.id)
        };
        let sort = SortOrder {
            field: RecommendationSort::Score,
            descending: true,
        };
        Ok(self
            .store
            .find_recommendations(&filter, sort, 0, None)
            .await?)
    }

    /// Recommendation counts per star rating, optionally for one item
    pub async fn project_statistics(
        &self,
        caller: &Caller,
        project_id: &str,
        item_id: Option<i64>,
    ) -> QueryResult<ProjectStatistics> {
        let project = self.visible_project(caller, project_id).await?;
        require_ready(caller, &project, project.analyzed)?;

        let item = match item_id {
            Some(item_id) => Some(
                self.store
                    .get_catalog_item(project.id, item_id)
                    .await?
                    .ok_or_else(|| QueryError::ItemNotFound {
                        project_id: project.id.to_string(),
                        item_id,
                    })?,
            ),
            None => None,
        };

        let counts = self.store.rating_counts(project.id, item_id).await?;
        let total = counts.total();
        if total == 0 {
            return Err(QueryError::InsufficientData);
        }

        let stars = (1..=5)
            .rev()
            .map(|stars| {
                let count = counts.get(stars);
                StarCount {
                    stars,
                    count,
                    percentage: count as f64 / total as f64,
                }
            })
            .collect();

        Ok(ProjectStatistics {
            project_id: project.id,
            item,
            total,
            stars,
        })
    }

    async fn visible_project(&self, caller: &Caller, project_id: &str) -> QueryResult<Project> {
        let id = parse_project_id(project_id)?;
        let project = self
            .store
            .get_project(id)
            .await?
            .ok_or_else(|| QueryError::ProjectNotFound(project_id.to_string()))?;

        if !project.is_visible_to(caller.user_id, caller.is_staff) {
            return Err(QueryError::Forbidden(project_id.to_string()));
        }
        Ok(project)
    }
}

/// Parse a project identifier sent by a client
pub fn parse_project_id(raw: &str) -> QueryResult<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| QueryError::InvalidIdentifier(raw.to_string()))
}

fn require_ready(caller: &Caller, project: &Project, ready: bool) -> QueryResult<()> {
    if ready || caller.is_staff {
        Ok(())
    } else {
        Err(QueryError::ProjectNotReady(project.id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_project_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_project_id(&id.to_string()).unwrap(), id);
        assert_eq!(parse_project_id("abc").unwrap_err().code(), 53);
    }

    #[test]
    fn test_not_ready_only_for_regular_users() {
        let project = Project::new("p");
        assert!(require_ready(&Caller::staff(Uuid::new_v4()), &project, false).is_ok());

        let err = require_ready(&Caller::user(Uuid::new_v4()), &project, false).unwrap_err();
        assert_eq!(err.code(), 202);
    }

    #[test]
    fn test_page_request_builder() {
        let request = PageRequest::page(2).search("7").order_by("-score");
        assert_eq!(request.page, 2);
        assert_eq!(request.search.as_deref(), Some("7"));
        assert_eq!(request.order_by.as_deref(), Some("-score"));
    }
}
