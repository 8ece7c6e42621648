//! PostgreSQL implementation of [`Store`]
//!
//! Bulk writes go through `QueryBuilder::push_values` in batches that stay
//! under the bind-parameter limit. Ordering columns come from the
//! `PurchaseSort` / `RecommendationSort` allow-lists, never from raw input.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{
    PurchaseFilter, PurchaseSort, RatingCounts, RecommendationFilter, RecommendationSort, Store,
};
use crate::error::CoreError;
use crate::models::{CatalogItem, FileKind, FileLocation, Project, Purchase, Recommendation};
use crate::pagination::SortOrder;

/// Rows per multi-value INSERT
const WRITE_BATCH: usize = 5_000;

pub struct PostgresStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: Uuid,
    name: String,
    imported: bool,
    analyzed: bool,
    deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn hydrate(&self, row: ProjectRow) -> Result<Project, CoreError> {
        let files: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT name, location, kind FROM project_files WHERE project_id = $1 ORDER BY position",
        )
        .bind(row.id)
        .fetch_all(&self.pool)
        .await?;

        let allowed_users: Vec<Uuid> = sqlx::query_scalar(
            "SELECT user_id FROM project_allowed_users WHERE project_id = $1",
        )
        .bind(row.id)
        .fetch_all(&self.pool)
        .await?;

        let files = files
            .into_iter()
            .map(|(name, location, kind)| {
                let kind = FileKind::parse(&kind)
                    .ok_or_else(|| CoreError::Storage(format!("unknown file kind '{}'", kind)))?;
                Ok(FileLocation {
                    name,
                    location,
                    kind,
                })
            })
            .collect::<Result<Vec<_>, CoreError>>()?;

        Ok(Project {
            id: row.id,
            name: row.name,
            imported: row.imported,
            analyzed: row.analyzed,
            deleted: row.deleted,
            files,
            allowed_users: allowed_users.into_iter().collect(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    async fn write_children(
        tx: &mut Transaction<'_, Postgres>,
        project: &Project,
    ) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM project_files WHERE project_id = $1")
            .bind(project.id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM project_allowed_users WHERE project_id = $1")
            .bind(project.id)
            .execute(&mut **tx)
            .await?;

        if !project.files.is_empty() {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO project_files (project_id, position, name, location, kind) ",
            );
            qb.push_values(project.files.iter().enumerate(), |mut b, (position, file)| {
                b.push_bind(project.id)
                    .push_bind(position as i32)
                    .push_bind(&file.name)
                    .push_bind(&file.location)
                    .push_bind(file.kind.as_str());
            });
            qb.build().execute(&mut **tx).await?;
        }

        if !project.allowed_users.is_empty() {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO project_allowed_users (project_id, user_id) ",
            );
            qb.push_values(project.allowed_users.iter(), |mut b, user_id| {
                b.push_bind(project.id).push_bind(*user_id);
            });
            qb.build().execute(&mut **tx).await?;
        }

        Ok(())
    }
}

fn push_purchase_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &PurchaseFilter) {
    qb.push(" WHERE project_id = ").push_bind(filter.project_id);
    if let Some(user_id) = filter.user_id {
        qb.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(search) = filter.search {
        qb.push(" AND (user_id = ")
            .push_bind(search)
            .push(" OR item_id = ")
            .push_bind(search)
            .push(")");
    }
}

fn push_recommendation_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &RecommendationFilter) {
    qb.push(" WHERE project_id = ").push_bind(filter.project_id);
    if let Some(user_id) = filter.user_id {
        qb.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(item_id) = filter.item_id {
        qb.push(" AND item_id = ").push_bind(item_id);
    }
    if let Some(stars) = filter.stars {
        qb.push(" AND user_item_weight = ").push_bind(stars);
    }
    if let Some(search) = filter.search {
        qb.push(" AND (user_id = ")
            .push_bind(search)
            .push(" OR item_id = ")
            .push_bind(search)
            .push(")");
    }
}

fn push_window(
    qb: &mut QueryBuilder<'_, Postgres>,
    column: &'static str,
    descending: bool,
    offset: u64,
    limit: Option<u64>,
) {
    qb.push(" ORDER BY ")
        .push(column)
        .push(if descending { " DESC" } else { " ASC" })
        .push(", id ASC");
    qb.push(" OFFSET ").push_bind(offset as i64);
    if let Some(limit) = limit {
        qb.push(" LIMIT ").push_bind(limit as i64);
    }
}

#[async_trait]
impl Store for PostgresStore {
    #[instrument(skip(self, project), fields(project_id = %project.id))]
    async fn insert_project(&self, project: &Project) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO projects (id, name, imported, analyzed, deleted, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(project.id)
        .bind(&project.name)
        .bind(project.imported)
        .bind(project.analyzed)
        .bind(project.deleted)
        .bind(project.created_at)
        .bind(project.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(sqlx::Error::Database(db_err)) = &inserted {
            if db_err.is_unique_violation() {
                return Err(CoreError::Conflict(format!("project '{}'", project.name)));
            }
        }
        inserted?;

        Self::write_children(&mut tx, project).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, project), fields(project_id = %project.id))]
    async fn save_project(&self, project: &Project) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE projects
            SET name = $2, imported = $3, analyzed = $4, deleted = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(project.id)
        .bind(&project.name)
        .bind(project.imported)
        .bind(project.analyzed)
        .bind(project.deleted)
        .bind(project.updated_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("project", project.id));
        }

        Self::write_children(&mut tx, project).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, CoreError> {
        let row: Option<ProjectRow> = sqlx::query_as(
            "SELECT id, name, imported, analyzed, deleted, created_at, updated_at FROM projects WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>, CoreError> {
        let row: Option<ProjectRow> = sqlx::query_as(
            "SELECT id, name, imported, analyzed, deleted, created_at, updated_at FROM projects WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn list_projects(&self) -> Result<Vec<Project>, CoreError> {
        let rows: Vec<ProjectRow> = sqlx::query_as(
            "SELECT id, name, imported, analyzed, deleted, created_at, updated_at FROM projects ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut projects = Vec::with_capacity(rows.len());
        for row in rows {
            projects.push(self.hydrate(row).await?);
        }
        Ok(projects)
    }

    #[instrument(skip(self, items), fields(count = items.len()))]
    async fn upsert_catalog(&self, items: &[CatalogItem]) -> Result<u64, CoreError> {
        let mut written = 0;
        for batch in items.chunks(WRITE_BATCH) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO catalog_items (project_id, meta_id, name, payload) ",
            );
            qb.push_values(batch, |mut b, item| {
                b.push_bind(item.project_id)
                    .push_bind(item.meta_id)
                    .push_bind(&item.name)
                    .push_bind(&item.payload);
            });
            qb.push(
                " ON CONFLICT (project_id, meta_id) DO UPDATE SET name = EXCLUDED.name, payload = EXCLUDED.payload",
            );
            written += qb.build().execute(&self.pool).await?.rows_affected();
        }
        debug!(written, "Catalog items upserted");
        Ok(written)
    }

    async fn list_catalog(&self, project_id: Uuid) -> Result<Vec<CatalogItem>, CoreError> {
        let items = sqlx::query_as::<_, CatalogItem>(
            "SELECT project_id, meta_id, name, payload FROM catalog_items WHERE project_id = $1 ORDER BY meta_id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn get_catalog_item(
        &self,
        project_id: Uuid,
        meta_id: i64,
    ) -> Result<Option<CatalogItem>, CoreError> {
        let item = sqlx::query_as::<_, CatalogItem>(
            "SELECT project_id, meta_id, name, payload FROM catalog_items WHERE project_id = $1 AND meta_id = $2",
        )
        .bind(project_id)
        .bind(meta_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(item)
    }

    #[instrument(skip(self, purchases), fields(count = purchases.len()))]
    async fn upsert_purchases(&self, purchases: &[Purchase]) -> Result<u64, CoreError> {
        let mut written = 0;
        for batch in purchases.chunks(WRITE_BATCH) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO purchases (id, project_id, user_id, item_id, weight) ",
            );
            qb.push_values(batch, |mut b, p| {
                b.push_bind(p.id)
                    .push_bind(p.project_id)
                    .push_bind(p.user_id)
                    .push_bind(p.item_id)
                    .push_bind(p.weight);
            });
            qb.push(
                " ON CONFLICT (project_id, user_id, item_id) DO UPDATE SET weight = EXCLUDED.weight",
            );
            written += qb.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(written)
    }

    async fn count_purchases(&self, filter: &PurchaseFilter) -> Result<u64, CoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM purchases");
        push_purchase_filter(&mut qb, filter);
        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn find_purchases(
        &self,
        filter: &PurchaseFilter,
        sort: SortOrder<PurchaseSort>,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Vec<Purchase>, CoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT id, project_id, user_id, item_id, weight FROM purchases",
        );
        push_purchase_filter(&mut qb, filter);
        push_window(&mut qb, sort.field.column(), sort.descending, offset, limit);

        let rows = qb.build_query_as::<Purchase>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    #[instrument(skip(self, recommendations), fields(count = recommendations.len()))]
    async fn insert_recommendations(
        &self,
        recommendations: &[Recommendation],
    ) -> Result<u64, CoreError> {
        let mut written = 0;
        for batch in recommendations.chunks(WRITE_BATCH) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO recommendations (id, project_id, user_id, item_id, score, user_item_weight) ",
            );
            qb.push_values(batch, |mut b, r| {
                b.push_bind(r.id)
                    .push_bind(r.project_id)
                    .push_bind(r.user_id)
                    .push_bind(r.item_id)
                    .push_bind(r.score)
                    .push_bind(r.user_item_weight);
            });
            written += qb.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(written)
    }

    #[instrument(skip(self))]
    async fn delete_recommendations(&self, project_id: Uuid) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM recommendations WHERE project_id = $1")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_recommendations(
        &self,
        filter: &RecommendationFilter,
    ) -> Result<u64, CoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM recommendations");
        push_recommendation_filter(&mut qb, filter);
        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn find_recommendations(
        &self,
        filter: &RecommendationFilter,
        sort: SortOrder<RecommendationSort>,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Vec<Recommendation>, CoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT id, project_id, user_id, item_id, score, user_item_weight FROM recommendations",
        );
        push_recommendation_filter(&mut qb, filter);
        push_window(&mut qb, sort.field.column(), sort.descending, offset, limit);

        let rows = qb
            .build_query_as::<Recommendation>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn rating_counts(
        &self,
        project_id: Uuid,
        item_id: Option<i64>,
    ) -> Result<RatingCounts, CoreError> {
        let rows: Vec<(i32, i64)> = sqlx::query_as(
            r#"
            SELECT user_item_weight, COUNT(*)
            FROM recommendations
            WHERE project_id = $1 AND ($2::BIGINT IS NULL OR item_id = $2)
            GROUP BY user_item_weight
            "#,
        )
        .bind(project_id)
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = RatingCounts::default();
        for (rating, count) in rows {
            counts.add(rating, count as u64);
        }
        Ok(counts)
    }
}
