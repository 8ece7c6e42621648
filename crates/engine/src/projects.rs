//! Project mutations
//!
//! Creating a project registers its uploaded files, ingests the catalog and
//! dispatches an import job. Re-analysis clears the previous results and
//! dispatches a high-priority analysis job. Both return as soon as the job is
//! queued.

use std::sync::Arc;

use recommdo_core::{CatalogItem, CoreError, FileKind, FileLocation, Project, Store};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::dataset::InteractionDataset;
use crate::error::PipelineError;
use crate::ingestion::{ColumnMapping, IngestionPreprocessor};
use crate::jobs::{JobKind, JobPayload, JobQueue, QueueError};
use crate::query::{parse_project_id, Caller, QueryError};

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("Missing or invalid request field: {0}")]
    InvalidRequest(String),

    #[error("Not allowed to modify project {0}")]
    Forbidden(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Project {0} already exists")]
    AlreadyExists(String),

    #[error("Project not found: {0}")]
    NotFound(String),

    #[error("Project {0} cannot be re-analyzed before its import finished")]
    NotImported(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] CoreError),
}

impl ProjectError {
    /// Stable code reported to clients
    pub fn code(&self) -> u16 {
        match self {
            ProjectError::InvalidRequest(_) => 50,
            ProjectError::Forbidden(_) => 51,
            ProjectError::InvalidIdentifier(_) => 53,
            ProjectError::AlreadyExists(_) => 200,
            ProjectError::NotFound(_) => 201,
            ProjectError::NotImported(_) => 202,
            ProjectError::Pipeline(_) => 400,
            ProjectError::Queue(_) | ProjectError::Store(_) => 500,
        }
    }
}

impl From<QueryError> for ProjectError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::InvalidIdentifier(id) => ProjectError::InvalidIdentifier(id),
            QueryError::Forbidden(id) => ProjectError::Forbidden(id),
            QueryError::ProjectNotFound(id) => ProjectError::NotFound(id),
            QueryError::Store(e) => ProjectError::Store(e),
            other => ProjectError::InvalidRequest(other.to_string()),
        }
    }
}

pub type ProjectResult<T> = std::result::Result<T, ProjectError>;

/// A file already stored under the upload root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    /// Original file name, matched against the column mapping
    pub name: String,
    /// Storage path relative to the upload root
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProject {
    pub name: String,
    pub files: Vec<UploadedFile>,
    pub columns: ColumnMapping,
}

pub struct ProjectService {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    preprocessor: IngestionPreprocessor,
}

impl ProjectService {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        preprocessor: IngestionPreprocessor,
    ) -> Self {
        Self {
            store,
            queue,
            preprocessor,
        }
    }

    /// Register a project, ingest its catalog and queue the import.
    ///
    /// A non-staff creator is granted access to the new project. No job is
    /// queued when no interaction file was uploaded.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_project(
        &self,
        caller: &Caller,
        request: CreateProject,
    ) -> ProjectResult<Project> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(ProjectError::InvalidRequest("project name".to_string()));
        }
        if request.files.is_empty() {
            return Err(ProjectError::InvalidRequest("files".to_string()));
        }
        request.columns.validate()?;

        if self.store.find_project_by_name(name).await?.is_some() {
            return Err(ProjectError::AlreadyExists(name.to_string()));
        }

        let mut project = Project::new(name);
        for file in &request.files {
            match request.columns.classify(&file.name) {
                Some(kind) => {
                    project = project.with_file(FileLocation {
                        name: file.name.clone(),
                        location: file.location.clone(),
                        kind,
                    })
                }
                None => warn!(file = %file.name, "Uploaded file matches no mapped file, ignoring"),
            }
        }
        if !caller.is_staff {
            project.allowed_users.insert(caller.user_id);
        }

        let dataset = self.scan(&project, &request.columns).await?;

        match self.store.insert_project(&project).await {
            Ok(()) => {}
            Err(CoreError::Conflict(_)) => return Err(ProjectError::AlreadyExists(name.to_string())),
            Err(e) => return Err(e.into()),
        }

        if let Some(catalog) = &dataset.catalog {
            let items: Vec<CatalogItem> = catalog
                .iter()
                .map(|row| CatalogItem {
                    project_id: project.id,
                    meta_id: row.meta_id,
                    name: row.name.clone(),
                    payload: row.payload.clone(),
                })
                .collect();
            let written = self.store.upsert_catalog(&items).await?;
            info!(project_id = %project.id, written, "Catalog ingested");
        }

        if dataset.interactions.is_some() {
            let kind = JobKind::ImportAndAnalyze;
            let job = JobPayload::new(kind, project.clone(), request.columns).with_dataset(dataset);
            let message_id = self.queue.enqueue(&job, kind.default_priority()).await?;
            info!(project_id = %project.id, message_id = %message_id, "Import job queued");
        } else {
            warn!(project_id = %project.id, "No interaction file uploaded, import not queued");
        }

        Ok(project)
    }

    /// Clear previous recommendations and queue a new analysis run
    #[instrument(skip(self, caller, columns))]
    pub async fn reanalyze(
        &self,
        caller: &Caller,
        project_id: &str,
        columns: ColumnMapping,
    ) -> ProjectResult<()> {
        columns.validate()?;
        let mut project = self.member_project(caller, project_id).await?;

        if !project.imported {
            return Err(ProjectError::NotImported(project.id.to_string()));
        }
        project.begin_reanalysis()?;
        self.store.save_project(&project).await?;

        let removed = self.store.delete_recommendations(project.id).await?;

        let kind = JobKind::Analyze;
        let job = JobPayload::new(kind, project.clone(), columns);
        let message_id = self.queue.enqueue(&job, kind.default_priority()).await?;
        info!(project_id = %project.id, removed, message_id = %message_id, "Analysis job queued");

        Ok(())
    }

    /// Replace the set of users allowed to see the project
    pub async fn set_allowed_users(
        &self,
        caller: &Caller,
        project_id: &str,
        users: Vec<Uuid>,
    ) -> ProjectResult<Project> {
        let mut project = self.member_project(caller, project_id).await?;

        project.set_allowed_users(users);
        self.store.save_project(&project).await?;
        info!(project_id = %project.id, users = project.allowed_users.len(), "Allowed users updated");

        Ok(project)
    }

    /// Hide the project from regular users; staff only
    pub async fn delete_project(&self, caller: &Caller, project_id: &str) -> ProjectResult<()> {
        if !caller.is_staff {
            return Err(ProjectError::Forbidden(project_id.to_string()));
        }
        let mut project = self.load(project_id).await?;

        project.mark_deleted();
        self.store.save_project(&project).await?;
        info!(project_id = %project.id, "Project deleted");

        Ok(())
    }

    async fn load(&self, project_id: &str) -> ProjectResult<Project> {
        let id = parse_project_id(project_id)?;
        self.store
            .get_project(id)
            .await?
            .ok_or_else(|| ProjectError::NotFound(project_id.to_string()))
    }

    /// Staff, or a user in the project's allowed users
    async fn member_project(&self, caller: &Caller, project_id: &str) -> ProjectResult<Project> {
        let project = self.load(project_id).await?;
        if !project.is_visible_to(caller.user_id, caller.is_staff) {
            return Err(ProjectError::Forbidden(project_id.to_string()));
        }
        Ok(project)
    }

    async fn scan(
        &self,
        project: &Project,
        columns: &ColumnMapping,
    ) -> ProjectResult<InteractionDataset> {
        if project.file(FileKind::Catalog).is_none() && project.file(FileKind::Interactions).is_none()
        {
            return Ok(InteractionDataset::default());
        }

        let preprocessor = self.preprocessor.clone();
        let project = project.clone();
        let columns = columns.clone();

        let dataset = tokio::task::spawn_blocking(move || preprocessor.scan(&project, &columns))
            .await
            .map_err(|e| PipelineError::ShardJoin(format!("scan task failed: {e}")))??;
        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(ProjectError::AlreadyExists("p".into()).code(), 200);
        assert_eq!(ProjectError::NotFound("p".into()).code(), 201);
        assert_eq!(ProjectError::Forbidden("p".into()).code(), 51);
        assert_eq!(
            ProjectError::from(QueryError::InvalidIdentifier("x".into())).code(),
            53
        );
    }
}
