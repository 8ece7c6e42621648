//! End-to-end runs: project creation, job dispatch, worker, pipeline and
//! the read side, all on the in-memory store and queue.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use recommdo_core::{
    InMemoryStore, PipelineConfig, ProjectState, PurchaseFilter, RecommendationFilter,
    RetryPolicy, Store,
};
use recommdo_engine::{
    AlsConfig, Caller, CatalogColumns, ColumnMapping, CreateProject, InMemoryJobQueue,
    IngestionPreprocessor, InteractionColumns, JobKind, JobOutcome, JobWorker, PageRequest,
    Pipeline, Priority, ProjectService, QueryService, UploadedFile, WorkerConfig,
};
use tempfile::TempDir;
use uuid::Uuid;

struct Harness {
    _dir: TempDir,
    store: Arc<InMemoryStore>,
    queue: Arc<InMemoryJobQueue>,
    projects: ProjectService,
    queries: QueryService,
    worker: JobWorker,
}

fn columns() -> ColumnMapping {
    ColumnMapping {
        catalog: CatalogColumns {
            file_name: "meta.csv".to_string(),
            id_header: "id".to_string(),
            name_header: Some("title".to_string()),
            payload_headers: vec!["genre".to_string()],
        },
        interactions: InteractionColumns {
            file_name: "subscriptions.csv".to_string(),
            user_id_header: "user_id".to_string(),
            item_id_header: "meta_id".to_string(),
            started_at_header: Some("start".to_string()),
            ended_at_header: None,
        },
    }
}

fn write_fixtures(root: &Path) {
    fs::write(
        root.join("meta.csv"),
        "id,title,genre\n10,Alpha,drama\n20,Beta,comedy\n",
    )
    .unwrap();

    // (1,10) x2, (1,20) x1, (2,10) x5 and one row with an unknown item
    fs::write(
        root.join("subscriptions.csv"),
        "user_id,meta_id,start\n1,10,2021-03-01\n1,20,2021-03-02\n2,10,2021-03-03\n1,10,2021-03-04\n2,10,2021-03-05\n2,10,2021-03-06\n2,99,2021-03-07\n2,10,2021-03-08\n2,10,2021-03-09\n",
    )
    .unwrap();
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    write_fixtures(dir.path());

    let config = PipelineConfig {
        upload_root: dir.path().to_path_buf(),
        chunk_size: 3,
        ..PipelineConfig::default()
    };

    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(InMemoryJobQueue::new());

    let pipeline = Pipeline::new(store.clone(), &config).with_als(AlsConfig {
        factors: 4,
        iterations: 6,
        ..AlsConfig::default()
    });
    let worker = JobWorker::new(
        queue.clone(),
        Arc::new(pipeline),
        WorkerConfig {
            consumer: "test-worker".to_string(),
            retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            reclaim_idle: Duration::from_secs(300),
            heartbeat: Duration::from_secs(100),
            idle_sleep: Duration::from_millis(1),
        },
    );

    Harness {
        projects: ProjectService::new(
            store.clone(),
            queue.clone(),
            IngestionPreprocessor::from_config(&config),
        ),
        queries: QueryService::new(store.clone()),
        _dir: dir,
        store,
        queue,
        worker,
    }
}

fn create_request(name: &str) -> CreateProject {
    CreateProject {
        name: name.to_string(),
        files: vec![
            UploadedFile {
                name: "meta.csv".to_string(),
                location: "meta.csv".to_string(),
            },
            UploadedFile {
                name: "subscriptions.csv".to_string(),
                location: "subscriptions.csv".to_string(),
            },
        ],
        columns: columns(),
    }
}

#[tokio::test]
async fn test_import_and_analyze_end_to_end() {
    let h = harness();
    let owner = Caller::user(Uuid::new_v4());

    let project = h
        .projects
        .create_project(&owner, create_request("shop"))
        .await
        .unwrap();
    assert!(project.allowed_users.contains(&owner.user_id));
    assert_eq!(project.files.len(), 2);

    let catalog = h.store.list_catalog(project.id).await.unwrap();
    assert_eq!(catalog.len(), 2);
    assert_eq!(catalog[0].name.as_deref(), Some("Alpha"));

    let queued = h.queue.queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].0, Priority::Normal);
    assert_eq!(queued[0].1.kind, JobKind::ImportAndAnalyze);

    assert_eq!(
        h.worker.poll_once().await.unwrap(),
        Some(JobOutcome::Completed)
    );

    let saved = h.store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(saved.state(), ProjectState::Analyzed);

    let id = project.id.to_string();
    let purchases = h
        .queries
        .project_purchases(&owner, &id, &PageRequest::page(1))
        .await
        .unwrap();
    assert_eq!(purchases.total_entries, 3);
    let weight = |user: i64, item: i64| {
        purchases
            .items
            .iter()
            .find(|p| p.user_id == user && p.item_id == item)
            .map(|p| p.weight)
    };
    assert_eq!(weight(1, 10), Some(2));
    assert_eq!(weight(1, 20), Some(1));
    assert_eq!(weight(2, 10), Some(3));

    for user in [1, 2] {
        let recs = h
            .queries
            .user_recommendations(&owner, &id, user)
            .await
            .unwrap();
        assert!(!recs.is_empty());
        assert!(recs.iter().all(|r| (1..=5).contains(&r.user_item_weight)));
    }
}

#[tokio::test]
async fn test_reanalysis_replaces_recommendations() {
    let h = harness();
    let staff = Caller::staff(Uuid::new_v4());

    let project = h
        .projects
        .create_project(&staff, create_request("rerun"))
        .await
        .unwrap();
    assert!(project.allowed_users.is_empty());
    h.worker.poll_once().await.unwrap();

    let recs = RecommendationFilter::project(project.id);
    let before = h.store.count_recommendations(&recs).await.unwrap();
    assert_eq!(before, 4);

    let id = project.id.to_string();
    h.projects.reanalyze(&staff, &id, columns()).await.unwrap();

    let queued = h.queue.queued();
    assert_eq!(queued[0].0, Priority::High);
    assert_eq!(queued[0].1.kind, JobKind::Analyze);
    assert!(queued[0].1.dataset.is_none());

    let pending = h.store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(pending.state(), ProjectState::Imported);
    assert_eq!(h.store.count_recommendations(&recs).await.unwrap(), 0);

    assert_eq!(
        h.worker.poll_once().await.unwrap(),
        Some(JobOutcome::Completed)
    );

    assert_eq!(h.store.count_recommendations(&recs).await.unwrap(), before);
    assert_eq!(
        h.store
            .count_purchases(&PurchaseFilter::project(project.id))
            .await
            .unwrap(),
        3
    );
    let saved = h.store.get_project(project.id).await.unwrap().unwrap();
    assert!(saved.analyzed);
}

#[tokio::test]
async fn test_duplicate_project_name_rejected() {
    let h = harness();
    let staff = Caller::staff(Uuid::new_v4());

    h.projects
        .create_project(&staff, create_request("dup"))
        .await
        .unwrap();
    let err = h
        .projects
        .create_project(&staff, create_request("dup"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), 200);
}

#[tokio::test]
async fn test_project_without_interactions_is_not_queued() {
    let h = harness();
    let staff = Caller::staff(Uuid::new_v4());

    let mut request = create_request("catalog-only");
    request.files.truncate(1);

    let project = h.projects.create_project(&staff, request).await.unwrap();
    assert!(h.queue.queued().is_empty());
    assert_eq!(h.store.list_catalog(project.id).await.unwrap().len(), 2);

    let err = h
        .projects
        .reanalyze(&staff, &project.id.to_string(), columns())
        .await
        .unwrap_err();
    assert_eq!(err.code(), 202);
}

#[tokio::test]
async fn test_membership_rules_for_mutations() {
    let h = harness();
    let owner = Caller::user(Uuid::new_v4());
    let stranger = Caller::user(Uuid::new_v4());
    let staff = Caller::staff(Uuid::new_v4());

    let project = h
        .projects
        .create_project(&owner, create_request("members"))
        .await
        .unwrap();
    let id = project.id.to_string();

    let err = h
        .projects
        .set_allowed_users(&stranger, &id, vec![stranger.user_id])
        .await
        .unwrap_err();
    assert_eq!(err.code(), 51);

    let updated = h
        .projects
        .set_allowed_users(&owner, &id, vec![owner.user_id, stranger.user_id])
        .await
        .unwrap();
    assert_eq!(updated.allowed_users.len(), 2);

    assert_eq!(
        h.projects.delete_project(&owner, &id).await.unwrap_err().code(),
        51
    );
    h.projects.delete_project(&staff, &id).await.unwrap();

    // Deleted projects disappear for members but stay visible to staff
    assert_eq!(h.queries.project(&owner, &id).await.unwrap_err().code(), 51);
    assert!(h.queries.project(&staff, &id).await.unwrap().deleted);

    // The queued import is skipped once the project is deleted
    assert_eq!(
        h.worker.poll_once().await.unwrap(),
        Some(JobOutcome::Completed)
    );
    let saved = h.store.get_project(project.id).await.unwrap().unwrap();
    assert!(!saved.imported);
}

#[tokio::test]
async fn test_malformed_identifier_rejected_at_creation() {
    let h = harness();
    let staff = Caller::staff(Uuid::new_v4());

    fs::write(
        h._dir.path().join("broken.csv"),
        "user_id,meta_id,start\n1,10,2021-03-01\nabc,20,2021-03-02\n",
    )
    .unwrap();

    let mut request = create_request("broken");
    request.columns.interactions.file_name = "broken.csv".to_string();
    request.files[1] = UploadedFile {
        name: "broken.csv".to_string(),
        location: "broken.csv".to_string(),
    };

    let err = h
        .projects
        .create_project(&staff, request)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("abc"));
    assert!(h.queue.queued().is_empty());
}
