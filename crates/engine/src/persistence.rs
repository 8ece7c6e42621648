//! Sharded batch writes
//!
//! A batch is split into at most `max_shards` contiguous shards whose sizes
//! differ by at most one. Each shard is written by its own task; the
//! coordinator waits for all of them, then applies the project transition
//! and saves the project once.
//!
//! The first failing shard aborts the tasks still in flight. Shards that
//! already committed stay committed. The final project save is retried on
//! transient store errors.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use recommdo_core::{
    retry_with_backoff, CoreError, Project, ProjectTransition, Purchase, Recommendation,
    RetryPolicy, Store,
};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument};

use crate::error::{PipelineError, PipelineResult};

/// 8 shards for 8+ rows, 2 for 2..8 rows, otherwise 1; never above
/// `max_shards`
pub fn shard_count(len: usize, max_shards: usize) -> usize {
    let count = if len >= 8 {
        8
    } else if len >= 2 {
        2
    } else {
        1
    };
    count.min(max_shards.max(1))
}

/// Split into `shards` contiguous parts; the first `len % shards` parts
/// carry one extra row.
pub fn split_even<T>(items: Vec<T>, shards: usize) -> Vec<Vec<T>> {
    let shards = shards.max(1);
    let base = items.len() / shards;
    let extra = items.len() % shards;

    let mut parts = Vec::with_capacity(shards);
    let mut rest = items.into_iter();
    for shard in 0..shards {
        let size = base + usize::from(shard < extra);
        parts.push(rest.by_ref().take(size).collect());
    }
    parts
}

/// Write every shard concurrently and return the total rows written
pub async fn fan_out<T, F, Fut>(items: Vec<T>, max_shards: usize, write: F) -> PipelineResult<u64>
where
    T: Send + 'static,
    F: Fn(Vec<T>) -> Fut,
    Fut: Future<Output = Result<u64, CoreError>> + Send + 'static,
{
    let shards = shard_count(items.len(), max_shards);
    let mut tasks = JoinSet::new();

    for shard in split_even(items, shards) {
        if shard.is_empty() {
            continue;
        }
        tasks.spawn(write(shard));
    }

    let mut written = 0;
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(result) => result.map_err(PipelineError::from),
            Err(e) => Err(PipelineError::ShardJoin(e.to_string())),
        };

        match result {
            Ok(rows) => {
                written += rows;
                debug!(rows, "Shard committed");
            }
            Err(e) => {
                tasks.abort_all();
                return Err(e);
            }
        }
    }

    Ok(written)
}

/// Persists a run's output and moves the project to its next state
pub struct BatchPersistenceCoordinator {
    store: Arc<dyn Store>,
    max_shards: usize,
    save_retry: RetryPolicy,
}

impl BatchPersistenceCoordinator {
    pub fn new(store: Arc<dyn Store>, max_shards: usize) -> Self {
        Self {
            store,
            max_shards,
            save_retry: RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1)),
        }
    }

    /// Replace the retry policy of the final project save
    pub fn with_save_retry(mut self, policy: RetryPolicy) -> Self {
        self.save_retry = policy;
        self
    }

    /// Upsert purchases, then mark the project imported
    #[instrument(skip(self, project, purchases), fields(project_id = %project.id, rows = purchases.len()))]
    pub async fn persist_purchases(
        &self,
        project: &mut Project,
        purchases: Vec<Purchase>,
    ) -> PipelineResult<u64> {
        let store = self.store.clone();
        let written = fan_out(purchases, self.max_shards, move |shard| {
            let store = store.clone();
            async move { store.upsert_purchases(&shard).await }
        })
        .await?;

        self.finish(project, ProjectTransition::Imported).await?;
        info!(written, "Purchases persisted");
        Ok(written)
    }

    /// Insert recommendations, then mark the project analyzed
    #[instrument(skip(self, project, recommendations), fields(project_id = %project.id, rows = recommendations.len()))]
    pub async fn persist_recommendations(
        &self,
        project: &mut Project,
        recommendations: Vec<Recommendation>,
    ) -> PipelineResult<u64> {
        let store = self.store.clone();
        let written = fan_out(recommendations, self.max_shards, move |shard| {
            let store = store.clone();
            async move { store.insert_recommendations(&shard).await }
        })
        .await?;

        self.finish(project, ProjectTransition::Analyzed).await?;
        info!(written, "Recommendations persisted");
        Ok(written)
    }

    async fn finish(&self, project: &mut Project, transition: ProjectTransition) -> PipelineResult<()> {
        transition.apply(project)?;

        let snapshot: &Project = project;
        retry_with_backoff(
            || self.store.save_project(snapshot),
            &self.save_retry,
            CoreError::is_transient,
        )
        .await?;
        Ok(())
    }
}
