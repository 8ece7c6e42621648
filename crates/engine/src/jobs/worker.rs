//! Job worker loop
//!
//! Pulls one job at a time, runs it and settles the delivery:
//!
//! - success: acknowledge
//! - transient failure with attempts left: re-enqueue as the next attempt
//!   after the backoff delay, then acknowledge
//! - terminal failure or attempts exhausted: dead-letter
//!
//! While a job runs its delivery is touched every `heartbeat`, so only
//! deliveries abandoned by a crashed worker go idle. Those are periodically
//! reclaimed and count as a failed attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use recommdo_core::{PipelineConfig, RetryDecision, RetryPolicy};
use tokio::sync::watch;
use tokio::time::{interval, sleep, Instant};
use tracing::{error, info, instrument, warn};

use super::queue::{Delivery, JobQueue, QueueError};
use super::JobPayload;
use crate::error::PipelineError;

/// Executes one job
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobPayload) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consumer name inside the queue's consumer group
    pub consumer: String,
    pub retry: RetryPolicy,
    /// Pending deliveries older than this are reclaimed
    pub reclaim_idle: Duration,
    /// Interval at which a running job's delivery is touched; must stay
    /// below `reclaim_idle`
    pub heartbeat: Duration,
    /// Sleep between polls of an empty queue
    pub idle_sleep: Duration,
}

impl WorkerConfig {
    pub fn new(consumer: impl Into<String>, pipeline: &PipelineConfig) -> Self {
        Self {
            consumer: consumer.into(),
            retry: RetryPolicy::with_max_attempts(pipeline.max_attempts),
            reclaim_idle: pipeline.reclaim_idle,
            heartbeat: pipeline.reclaim_idle / 3,
            idle_sleep: Duration::from_millis(500),
        }
    }
}

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retried,
    DeadLettered,
}

pub struct JobWorker {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
}

impl JobWorker {
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    /// Run until `shutdown` flips to `true`. A job in progress is always
    /// finished before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(consumer = %self.config.consumer, "Job worker started");
        let mut last_reclaim: Option<Instant> = None;

        while !*shutdown.borrow() {
            let reclaim_due =
                last_reclaim.map_or(true, |at| at.elapsed() >= self.config.reclaim_idle);
            if reclaim_due {
                if let Err(e) = self.recover_stale().await {
                    warn!(error = %e, "Failed to reclaim stale jobs");
                }
                last_reclaim = Some(Instant::now());
            }

            let idle = match self.poll_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(error = %e, "Job queue unavailable");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = sleep(self.config.idle_sleep) => {}
                }
            }
        }

        info!(consumer = %self.config.consumer, "Job worker stopped");
    }

    /// Process at most one job. `None` means the queue was empty.
    pub async fn poll_once(&self) -> Result<Option<JobOutcome>, QueueError> {
        match self.queue.dequeue(&self.config.consumer).await? {
            Some(delivery) => self.process(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    #[instrument(
        skip(self, delivery),
        fields(
            message_id = %delivery.message_id,
            project_id = %delivery.job.project.id,
            kind = ?delivery.job.kind,
            attempt = delivery.job.attempt
        )
    )]
    async fn process(&self, delivery: Delivery) -> Result<JobOutcome, QueueError> {
        info!("Job started");
        let started = Instant::now();

        match self.run_with_heartbeat(&delivery).await {
            Ok(()) => {
                self.queue.ack(&delivery).await?;
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "Job completed");
                Ok(JobOutcome::Completed)
            }
            Err(e) => {
                let retryable = !e.is_terminal();
                self.settle_failure(&delivery, &e.to_string(), retryable)
                    .await
            }
        }
    }

    async fn run_with_heartbeat(&self, delivery: &Delivery) -> Result<(), PipelineError> {
        let mut handle = self.handler.handle(&delivery.job);
        let mut beat = interval(self.config.heartbeat.max(Duration::from_millis(1)));
        beat.tick().await;

        loop {
            tokio::select! {
                result = &mut handle => return result,
                _ = beat.tick() => {
                    if let Err(e) = self.queue.touch(delivery, &self.config.consumer).await {
                        warn!(error = %e, "Failed to extend job lease");
                    }
                }
            }
        }
    }

    async fn settle_failure(
        &self,
        delivery: &Delivery,
        reason: &str,
        retryable: bool,
    ) -> Result<JobOutcome, QueueError> {
        match self.config.retry.decide(delivery.job.attempt, retryable) {
            RetryDecision::Retry(delay) => {
                warn!(
                    error = reason,
                    attempt = delivery.job.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Job failed, retrying"
                );
                sleep(delay).await;
                self.queue
                    .enqueue(&delivery.job.next_attempt(), delivery.priority)
                    .await?;
                self.queue.ack(delivery).await?;
                Ok(JobOutcome::Retried)
            }
            RetryDecision::GiveUp => {
                error!(
                    error = reason,
                    attempt = delivery.job.attempt,
                    terminal = !retryable,
                    "Job failed, moving to dead-letter stream"
                );
                self.queue.dead_letter(delivery, reason).await?;
                Ok(JobOutcome::DeadLettered)
            }
        }
    }

    /// Reclaim deliveries abandoned by other workers; each counts as a
    /// failed attempt
    pub async fn recover_stale(&self) -> Result<usize, QueueError> {
        let stale = self
            .queue
            .reclaim(&self.config.consumer, self.config.reclaim_idle)
            .await?;

        for delivery in &stale {
            warn!(
                message_id = %delivery.message_id,
                project_id = %delivery.job.project.id,
                "Recovering job abandoned by a worker"
            );
            self.settle_failure(delivery, "abandoned by worker", true)
                .await?;
        }

        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::{CatalogColumns, ColumnMapping, InteractionColumns};
    use crate::jobs::{InMemoryJobQueue, JobKind, Priority};
    use recommdo_core::{FileKind, Project};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn job() -> JobPayload {
        JobPayload::new(
            JobKind::ImportAndAnalyze,
            Project::new("worker-test"),
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
            },
        )
    }

    /// Fails the first `failures` calls with the given error
    struct Flaky {
        failures: u32,
        terminal: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, _job: &JobPayload) -> Result<(), PipelineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                if self.terminal {
                    Err(PipelineError::MissingRequiredFile {
                        stream: FileKind::Interactions,
                    })
                } else {
                    Err(PipelineError::ShardJoin("connection reset".to_string()))
                }
            } else {
                Ok(())
            }
        }
    }

    fn worker(queue: Arc<InMemoryJobQueue>, handler: Arc<Flaky>) -> JobWorker {
        let config = WorkerConfig {
            consumer: "test".to_string(),
            retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
            reclaim_idle: Duration::ZERO,
            heartbeat: Duration::from_millis(1),
            idle_sleep: Duration::from_millis(1),
        };
        JobWorker::new(queue, handler, config)
    }

    fn flaky(failures: u32, terminal: bool) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures,
            terminal,
            calls: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn test_success_is_acknowledged() {
        let queue = Arc::new(InMemoryJobQueue::new());
        queue.enqueue(&job(), Priority::Normal).await.unwrap();

        let worker = worker(queue.clone(), flaky(0, false));
        assert_eq!(worker.poll_once().await.unwrap(), Some(JobOutcome::Completed));
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(worker.poll_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_until_success() {
        let queue = Arc::new(InMemoryJobQueue::new());
        queue.enqueue(&job(), Priority::Normal).await.unwrap();

        let handler = flaky(2, false);
        let worker = worker(queue.clone(), handler.clone());

        assert_eq!(worker.poll_once().await.unwrap(), Some(JobOutcome::Retried));
        let queued = queue.queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].1.attempt, 2);

        assert_eq!(worker.poll_once().await.unwrap(), Some(JobOutcome::Retried));
        assert_eq!(worker.poll_once().await.unwrap(), Some(JobOutcome::Completed));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_attempts_exhausted_dead_letters() {
        let queue = Arc::new(InMemoryJobQueue::new());
        queue.enqueue(&job(), Priority::High).await.unwrap();

        let worker = worker(queue.clone(), flaky(10, false));
        assert_eq!(worker.poll_once().await.unwrap(), Some(JobOutcome::Retried));
        assert_eq!(worker.poll_once().await.unwrap(), Some(JobOutcome::Retried));
        assert_eq!(
            worker.poll_once().await.unwrap(),
            Some(JobOutcome::DeadLettered)
        );

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0.attempt, 3);
    }

    #[tokio::test]
    async fn test_terminal_failure_skips_retries() {
        let queue = Arc::new(InMemoryJobQueue::new());
        queue.enqueue(&job(), Priority::Normal).await.unwrap();

        let handler = flaky(1, true);
        let worker = worker(queue.clone(), handler.clone());

        assert_eq!(
            worker.poll_once().await.unwrap(),
            Some(JobOutcome::DeadLettered)
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(queue.dead_letters()[0].1.contains("interactions"));
    }

    #[tokio::test]
    async fn test_abandoned_job_is_recovered() {
        let queue = Arc::new(InMemoryJobQueue::new());
        queue.enqueue(&job(), Priority::Normal).await.unwrap();

        // A worker took the job and died before acknowledging it
        queue.dequeue("crashed").await.unwrap().unwrap();
        assert_eq!(queue.pending_count(), 1);

        let worker = worker(queue.clone(), flaky(0, false));
        assert_eq!(worker.recover_stale().await.unwrap(), 1);
        assert_eq!(queue.pending_count(), 0);

        assert_eq!(worker.poll_once().await.unwrap(), Some(JobOutcome::Completed));
    }

    /// Takes longer than the reclaim idle time
    struct Slow {
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for Slow {
        async fn handle(&self, _job: &JobPayload) -> Result<(), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(200)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_running_job_is_not_reclaimed() {
        let queue = Arc::new(InMemoryJobQueue::new());
        queue.enqueue(&job(), Priority::Normal).await.unwrap();

        let handler = Arc::new(Slow {
            calls: AtomicU32::new(0),
        });
        let config = |consumer: &str| WorkerConfig {
            consumer: consumer.to_string(),
            retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
            reclaim_idle: Duration::from_millis(60),
            heartbeat: Duration::from_millis(10),
            idle_sleep: Duration::from_millis(1),
        };
        let busy = Arc::new(JobWorker::new(queue.clone(), handler.clone(), config("busy")));
        let other = JobWorker::new(queue.clone(), handler.clone(), config("other"));

        let running = {
            let busy = busy.clone();
            tokio::spawn(async move { busy.poll_once().await })
        };

        sleep(Duration::from_millis(150)).await;
        assert_eq!(other.recover_stale().await.unwrap(), 0);
        assert_eq!(queue.pending_count(), 1);

        assert_eq!(
            running.await.unwrap().unwrap(),
            Some(JobOutcome::Completed)
        );
        assert_eq!(other.poll_once().await.unwrap(), None);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let worker = worker(queue, flaky(0, false));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { worker.run(rx).await });
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
