//! Persistent delivery queue.
//!
//! Tasks live in the `delivery_tasks` table. A consumer claims a task with a
//! lease; a task whose consumer disappeared becomes claimable again once the
//! lease lapses, until its attempts run out.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::error::DatabaseError;
use crate::store::{Database, DeliveryTask, NewDeliveryTask};

/// What the dispatcher hands to the queue.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub thread_id: Uuid,
    pub message_id: Uuid,
    pub local_path: String,
    pub original_name: String,
    pub caption: Option<String>,
    pub mime: Option<String>,
}

pub struct DeliveryQueue {
    db: Arc<dyn Database>,
    config: DeliveryConfig,
    wake: Notify,
}

impl DeliveryQueue {
    pub fn new(db: Arc<dyn Database>, config: DeliveryConfig) -> Self {
        Self {
            db,
            config,
            wake: Notify::new(),
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Persist a job and wake one idle consumer.
    pub async fn enqueue(&self, job: DeliveryJob) -> Result<Uuid, DatabaseError> {
        let id = self
            .db
            .enqueue_delivery(&NewDeliveryTask {
                thread_id: job.thread_id,
                message_id: job.message_id,
                local_path: job.local_path,
                original_name: job.original_name,
                caption: job.caption,
                mime: job.mime,
                max_attempts: self.config.max_attempts,
            })
            .await?;
        debug!(task_id = %id, message_id = %job.message_id, "Delivery queued");
        self.wake.notify_one();
        Ok(id)
    }

    /// Claim the next ready task under a fresh lease.
    pub async fn claim(&self) -> Result<Option<DeliveryTask>, DatabaseError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.config.lease())
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        self.db.claim_delivery(now, now + lease).await
    }

    /// Sleep until a job is enqueued or `idle` passes.
    pub async fn wait(&self, idle: Duration) {
        let _ = tokio::time::timeout(idle, self.wake.notified()).await;
    }

    /// Wake every waiting consumer (used on shutdown).
    pub fn wake_all(&self) {
        self.wake.notify_waiters();
    }

    pub async fn complete(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.db.complete_delivery(id).await
    }

    /// Put a task back for a later attempt.
    pub async fn retry(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        let backoff = chrono::Duration::from_std(self.config.retry_backoff)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));
        self.db.retry_delivery(id, error, Utc::now() + backoff).await
    }

    pub async fn bury(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        self.db.bury_delivery(id, error).await
    }

    /// Bury tasks abandoned by their consumers with no attempts left.
    pub async fn reap_expired(&self) -> Result<Vec<DeliveryTask>, DatabaseError> {
        self.db.reap_expired_deliveries(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LibSqlBackend, TaskStatus};

    fn job() -> DeliveryJob {
        DeliveryJob {
            thread_id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
            local_path: "/tmp/tg_x.png".into(),
            original_name: "x.png".into(),
            caption: Some("look".into()),
            mime: Some("image/png".into()),
        }
    }

    #[tokio::test]
    async fn enqueue_then_claim_once() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = DeliveryQueue::new(Arc::clone(&db), DeliveryConfig::default());

        let id = queue.enqueue(job()).await.unwrap();
        let task = queue.claim().await.unwrap().unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.max_attempts, DeliveryConfig::default().max_attempts);
        assert_eq!(task.caption.as_deref(), Some("look"));
        assert!(queue.claim().await.unwrap().is_none());

        queue.complete(id).await.unwrap();
        assert_eq!(
            db.get_delivery(id).await.unwrap().unwrap().status,
            TaskStatus::Done
        );
    }

    #[tokio::test]
    async fn retry_waits_for_backoff() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = DeliveryQueue::new(Arc::clone(&db), DeliveryConfig::default());

        let id = queue.enqueue(job()).await.unwrap();
        queue.claim().await.unwrap().unwrap();
        queue.retry(id, "database busy").await.unwrap();

        // Default backoff is seconds away.
        assert!(queue.claim().await.unwrap().is_none());
        let task = db.get_delivery(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.last_error.as_deref(), Some("database busy"));
    }

    #[tokio::test]
    async fn enqueue_wakes_waiter() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = Arc::new(DeliveryQueue::new(db, DeliveryConfig::default()));

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let started = std::time::Instant::now();
                queue.wait(Duration::from_secs(30)).await;
                started.elapsed()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(job()).await.unwrap();

        let waited = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(waited < Duration::from_secs(5));
    }
}
