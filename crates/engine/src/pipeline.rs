//! Pipeline orchestration
//!
//! An import run goes through every stage:
//!
//! ```text
//! scan -> build matrix -> persist purchases (imported)
//!      -> delete old recommendations -> train -> generate
//!      -> persist recommendations (analyzed)
//! ```
//!
//! An analysis run skips purchase persistence and requires the project to be
//! imported already. Either run clears `analyzed` before deleting the old
//! recommendations, so the flag is only set while a complete set exists.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use recommdo_core::{CoreError, PipelineConfig, Project, Purchase, Store};
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::dataset::InteractionDataset;
use crate::error::{PipelineError, PipelineResult};
use crate::ingestion::{ColumnMapping, IngestionPreprocessor};
use crate::jobs::{JobHandler, JobKind, JobPayload};
use crate::matrix::{InteractionMatrix, MatrixBuilder};
use crate::matrix_factorization::{AlsConfig, AlsTrainer};
use crate::persistence::BatchPersistenceCoordinator;
use crate::recommendation::RecommendationGenerator;

/// What a run wrote
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub project_id: Uuid,
    pub users: usize,
    pub items: usize,
    pub purchases_written: u64,
    pub recommendations_written: u64,
    pub elapsed_ms: u64,
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    preprocessor: IngestionPreprocessor,
    als: AlsConfig,
    generator: RecommendationGenerator,
    coordinator: BatchPersistenceCoordinator,
}

impl Pipeline {
    pub fn new(store: Arc<dyn Store>, config: &PipelineConfig) -> Self {
        Self {
            preprocessor: IngestionPreprocessor::from_config(config),
            als: AlsConfig::from(config),
            generator: RecommendationGenerator::new(config.top_n),
            coordinator: BatchPersistenceCoordinator::new(store.clone(), config.max_shards),
            store,
        }
    }

    /// Replace the trainer settings
    pub fn with_als(mut self, als: AlsConfig) -> Self {
        self.als = als;
        self
    }

    pub fn preprocessor(&self) -> &IngestionPreprocessor {
        &self.preprocessor
    }

    /// Persist purchases, then analyze
    #[instrument(skip(self, dataset, columns), fields(project_id = %project_id))]
    pub async fn import_and_analyze(
        &self,
        project_id: Uuid,
        dataset: Option<InteractionDataset>,
        columns: &ColumnMapping,
    ) -> PipelineResult<RunSummary> {
        let started = Instant::now();
        let mut project = self.load(project_id).await?;

        let dataset = match dataset {
            Some(dataset) => dataset,
            None => self.scan(&project, columns).await?,
        };
        let matrix = build_matrix(dataset).await?;

        let purchases: Vec<Purchase> = matrix
            .interactions
            .iter()
            .map(|i| Purchase::new(project.id, i.user_id, i.item_id, i.weight))
            .collect();
        let purchases_written = self
            .coordinator
            .persist_purchases(&mut project, purchases)
            .await?;

        let mut summary = self.analyze_matrix(&mut project, matrix).await?;
        summary.purchases_written = purchases_written;
        summary.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            purchases = summary.purchases_written,
            recommendations = summary.recommendations_written,
            elapsed_ms = summary.elapsed_ms,
            "Import and analysis finished"
        );
        Ok(summary)
    }

    /// Recompute recommendations of an imported project
    #[instrument(skip(self, dataset, columns), fields(project_id = %project_id))]
    pub async fn analyze(
        &self,
        project_id: Uuid,
        dataset: Option<InteractionDataset>,
        columns: &ColumnMapping,
    ) -> PipelineResult<RunSummary> {
        let started = Instant::now();
        let mut project = self.load(project_id).await?;
        if !project.imported {
            return Err(CoreError::InvalidTransition(format!(
                "project {} cannot be analyzed before import",
                project.id
            ))
            .into());
        }

        let dataset = match dataset {
            Some(dataset) => dataset,
            None => self.scan(&project, columns).await?,
        };
        let matrix = build_matrix(dataset).await?;

        let mut summary = self.analyze_matrix(&mut project, matrix).await?;
        summary.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            recommendations = summary.recommendations_written,
            elapsed_ms = summary.elapsed_ms,
            "Analysis finished"
        );
        Ok(summary)
    }

    async fn analyze_matrix(
        &self,
        project: &mut Project,
        matrix: InteractionMatrix,
    ) -> PipelineResult<RunSummary> {
        // `analyzed` is only set while a complete recommendation set exists
        if project.analyzed {
            project.begin_reanalysis()?;
            self.store.save_project(project).await?;
        }

        let removed = self.store.delete_recommendations(project.id).await?;
        if removed > 0 {
            info!(removed, "Previous recommendations deleted");
        }

        let trainer = AlsTrainer::new(self.als.clone());
        let (matrix, model) = tokio::task::spawn_blocking(move || {
            let model = trainer.fit(&matrix.item_user);
            (matrix, model)
        })
        .await
        .map_err(|e| PipelineError::Training(format!("trainer task failed: {e}")))?;
        let model = model?;

        let recommendations = self.generator.generate(
            project.id,
            &model,
            &matrix.user_item,
            &matrix.users,
            &matrix.items,
        );
        let recommendations_written = self
            .coordinator
            .persist_recommendations(project, recommendations)
            .await?;

        Ok(RunSummary {
            project_id: project.id,
            users: matrix.users.len(),
            items: matrix.items.len(),
            purchases_written: 0,
            recommendations_written,
            elapsed_ms: 0,
        })
    }

    async fn load(&self, project_id: Uuid) -> PipelineResult<Project> {
        self.store
            .get_project(project_id)
            .await?
            .ok_or_else(|| CoreError::not_found("project", project_id).into())
    }

    async fn scan(
        &self,
        project: &Project,
        columns: &ColumnMapping,
    ) -> PipelineResult<InteractionDataset> {
        let preprocessor = self.preprocessor.clone();
        let project = project.clone();
        let columns = columns.clone();

        tokio::task::spawn_blocking(move || preprocessor.scan(&project, &columns))
            .await
            .map_err(|e| PipelineError::ShardJoin(format!("scan task failed: {e}")))?
    }
}

async fn build_matrix(dataset: InteractionDataset) -> PipelineResult<InteractionMatrix> {
    tokio::task::spawn_blocking(move || {
        MatrixBuilder::build(dataset.catalog.as_deref(), dataset.interactions.as_deref())
    })
    .await
    .map_err(|e| PipelineError::ShardJoin(format!("matrix task failed: {e}")))?
}

#[async_trait]
impl JobHandler for Pipeline {
    async fn handle(&self, job: &JobPayload) -> Result<(), PipelineError> {
        let project_id = job.project.id;

        if let Some(current) = self.store.get_project(project_id).await? {
            if current.deleted {
                warn!(project_id = %project_id, "Project deleted, skipping job");
                return Ok(());
            }
        }

        match job.kind {
            JobKind::ImportAndAnalyze => {
                self.import_and_analyze(project_id, job.dataset.clone(), &job.columns)
                    .await?;
            }
            JobKind::Analyze => {
                self.analyze(project_id, job.dataset.clone(), &job.columns)
                    .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{CatalogRow, InteractionCount};
    use crate::ingestion::{CatalogColumns, InteractionColumns};
    use recommdo_core::{
        InMemoryStore, PurchaseFilter, PurchaseSort, Recommendation, RecommendationFilter,
        SortOrder,
    };

    fn columns() -> ColumnMapping {
        ColumnMapping {
            catalog: CatalogColumns {
                file_name: "meta.csv".to_string(),
                id_header: "id".to_string(),
                name_header: None,
                payload_headers: Vec::new(),
            },
            interactions: InteractionColumns {
                file_name: "subs.csv".to_string(),
                user_id_header: "user".to_string(),
                item_id_header: "item".to_string(),
                started_at_header: None,
                ended_at_header: None,
            },
        }
    }

    fn small_als() -> AlsConfig {
        AlsConfig {
            factors: 4,
            iterations: 5,
            ..AlsConfig::default()
        }
    }

    fn dataset() -> InteractionDataset {
        InteractionDataset {
            catalog: Some(vec![CatalogRow::new(1), CatalogRow::new(2)]),
            interactions: Some(vec![
                InteractionCount::new(10, 1, 2),
                InteractionCount::new(10, 2, 1),
                InteractionCount::new(20, 1, 5),
            ]),
        }
    }

    async fn setup() -> (Arc<InMemoryStore>, Pipeline, Project) {
        let store = Arc::new(InMemoryStore::new());
        let project = Project::new("pipeline-test");
        store.insert_project(&project).await.unwrap();
        let pipeline =
            Pipeline::new(store.clone(), &PipelineConfig::default()).with_als(small_als());
        (store, pipeline, project)
    }

    #[tokio::test]
    async fn test_import_marks_project_imported_and_analyzed() {
        let (store, pipeline, project) = setup().await;

        let summary = pipeline
            .import_and_analyze(project.id, Some(dataset()), &columns())
            .await
            .unwrap();

        assert_eq!(summary.purchases_written, 3);
        assert_eq!(summary.users, 2);
        assert_eq!(summary.items, 2);
        assert_eq!(summary.recommendations_written, 4);

        let saved = store.get_project(project.id).await.unwrap().unwrap();
        assert!(saved.imported);
        assert!(saved.analyzed);

        let purchases = store
            .find_purchases(
                &PurchaseFilter::project(project.id),
                SortOrder::<PurchaseSort>::default(),
                0,
                None,
            )
            .await
            .unwrap();
        assert_eq!(purchases.len(), 3);
    }

    #[tokio::test]
    async fn test_analyze_requires_import() {
        let (_, pipeline, project) = setup().await;

        let err = pipeline
            .analyze(project.id, Some(dataset()), &columns())
            .await
            .unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_missing_catalog_fails_before_writing() {
        let (store, pipeline, project) = setup().await;

        let dataset = InteractionDataset {
            catalog: None,
            ..dataset()
        };
        let err = pipeline
            .import_and_analyze(project.id, Some(dataset), &columns())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::MissingRequiredFile { .. }));
        let saved = store.get_project(project.id).await.unwrap().unwrap();
        assert!(!saved.imported);
    }

    #[tokio::test]
    async fn test_deleted_project_job_is_skipped() {
        let (store, pipeline, mut project) = setup().await;
        project.mark_deleted();
        store.save_project(&project).await.unwrap();

        let job = JobPayload::new(JobKind::ImportAndAnalyze, project.clone(), columns())
            .with_dataset(dataset());
        pipeline.handle(&job).await.unwrap();

        let saved = store.get_project(project.id).await.unwrap().unwrap();
        assert!(!saved.imported);
    }

    #[tokio::test]
    async fn test_repeated_runs_do_not_accumulate_recommendations() {
        let (store, pipeline, project) = setup().await;
        let recs = RecommendationFilter::project(project.id);

        pipeline
            .import_and_analyze(project.id, Some(dataset()), &columns())
            .await
            .unwrap();
        let first = store.count_recommendations(&recs).await.unwrap();
        assert_eq!(first, 4);

        // Analysis jobs straight on an analyzed project, twice
        for _ in 0..2 {
            pipeline
                .analyze(project.id, Some(dataset()), &columns())
                .await
                .unwrap();
            assert_eq!(store.count_recommendations(&recs).await.unwrap(), first);
        }

        // A redelivered import job
        let job = JobPayload::new(JobKind::ImportAndAnalyze, project.clone(), columns())
            .with_dataset(dataset());
        pipeline.handle(&job).await.unwrap();
        assert_eq!(store.count_recommendations(&recs).await.unwrap(), first);
        assert_eq!(
            store
                .count_purchases(&PurchaseFilter::project(project.id))
                .await
                .unwrap(),
            3
        );

        let saved = store.get_project(project.id).await.unwrap().unwrap();
        assert!(saved.analyzed);
    }

    #[tokio::test]
    async fn test_failed_rerun_clears_analyzed() {
        let (store, _, mut project) = setup().await;
        project.mark_imported();
        project.mark_analyzed().unwrap();
        store.save_project(&project).await.unwrap();
        store
            .insert_recommendations(&[Recommendation::new(project.id, 10, 1, 0.8, 4)])
            .await
            .unwrap();

        let failing = Pipeline::new(store.clone(), &PipelineConfig::default()).with_als(AlsConfig {
            factors: 8,
            regularization: 0.0,
            ..small_als()
        });
        let err = failing
            .analyze(project.id, Some(dataset()), &columns())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Training(_)));

        let saved = store.get_project(project.id).await.unwrap().unwrap();
        assert!(saved.imported);
        assert!(!saved.analyzed);
        assert_eq!(
            store
                .count_recommendations(&RecommendationFilter::project(project.id))
                .await
                .unwrap(),
            0
        );
    }
}
