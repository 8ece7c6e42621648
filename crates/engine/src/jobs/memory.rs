//! In-process [`JobQueue`] for tests and single-process runs
//!
//! Keeps the Redis semantics that matter to the worker: high priority is
//! drained first, a dequeued job stays pending until acknowledged and a
//! touched delivery starts its idle time over.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::queue::{Delivery, JobQueue, QueueError, QueueStats};
use super::{JobPayload, Priority};

struct Pending {
    delivery: Delivery,
    delivered_at: Instant,
}

#[derive(Default)]
struct State {
    next_id: u64,
    high: VecDeque<Delivery>,
    normal: VecDeque<Delivery>,
    pending: HashMap<String, Pending>,
    dead_letter: Vec<(JobPayload, String)>,
}

#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<State>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Jobs waiting in either lane, high priority first
    pub fn queued(&self) -> Vec<(Priority, JobPayload)> {
        let state = self.lock();
        state
            .high
            .iter()
            .chain(state.normal.iter())
            .map(|d| (d.priority, d.job.clone()))
            .collect()
    }

    /// Dead-lettered jobs with their error
    pub fn dead_letters(&self) -> Vec<(JobPayload, String)> {
        self.lock().dead_letter.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: &JobPayload, priority: Priority) -> Result<String, QueueError> {
        let mut state = self.lock();
        state.next_id += 1;
        let message_id = format!("{}-0", state.next_id);

        let delivery = Delivery {
            message_id: message_id.clone(),
            priority,
            job: job.clone(),
        };
        match priority {
            Priority::High => state.high.push_back(delivery),
            Priority::Normal => state.normal.push_back(delivery),
        }

        Ok(message_id)
    }

    async fn dequeue(&self, _consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.lock();
        let next = match state.high.pop_front() {
            Some(delivery) => Some(delivery),
            None => state.normal.pop_front(),
        };

        if let Some(delivery) = &next {
            state.pending.insert(
                delivery.message_id.clone(),
                Pending {
                    delivery: delivery.clone(),
                    delivered_at: Instant::now(),
                },
            );
        }

        Ok(next)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.lock().pending.remove(&delivery.message_id);
        Ok(())
    }

    async fn touch(&self, delivery: &Delivery, _consumer: &str) -> Result<(), QueueError> {
        if let Some(pending) = self.lock().pending.get_mut(&delivery.message_id) {
            pending.delivered_at = Instant::now();
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.pending.remove(&delivery.message_id);
        state
            .dead_letter
            .push((delivery.job.clone(), error.to_string()));
        Ok(())
    }

    async fn reclaim(&self, _consumer: &str, min_idle: Duration) -> Result<Vec<Delivery>, QueueError> {
        let mut state = self.lock();
        let now = Instant::now();

        let mut recovered = Vec::new();
        for pending in state.pending.values_mut() {
            if now.duration_since(pending.delivered_at) >= min_idle {
                pending.delivered_at = now;
                recovered.push(pending.delivery.clone());
            }
        }
        recovered.sort_by(|a, b| a.message_id.cmp(&b.message_id));

        Ok(recovered)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.lock();
        Ok(QueueStats {
            high: state.high.len() as u64,
            normal: state.normal.len() as u64,
            in_flight: state.pending.len() as u64,
            dead_letter: state.dead_letter.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::{CatalogColumns, ColumnMapping, InteractionColumns};
    use crate::jobs::JobKind;
    use recommdo_core::Project;

    fn job() -> JobPayload {
        JobPayload::new(
            JobKind::Analyze,
            Project::new("memory-queue"),
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

    #[tokio::test]
    async fn test_stats_track_depth() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(&job(), Priority::High).await.unwrap();
        queue.enqueue(&job(), Priority::Normal).await.unwrap();

        let delivery = queue.dequeue("w").await.unwrap().unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.high, stats.normal, stats.in_flight), (0, 1, 1));

        queue.ack(&delivery).await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.high, stats.normal, stats.in_flight), (0, 1, 0));
    }

    #[tokio::test]
    async fn test_touch_restarts_idle_time() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(&job(), Priority::Normal).await.unwrap();
        let delivery = queue.dequeue("busy").await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        queue.touch(&delivery, "busy").await.unwrap();

        let recovered = queue
            .reclaim("rescuer", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(recovered.is_empty());
        assert_eq!(queue.pending_count(), 1);
    }
}
