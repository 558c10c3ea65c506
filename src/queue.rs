//! Single-flight queue in front of the fragile enrichment API.
//!
//! Items move `pending -> processing -> completed | failed` and never go back.
//! The queue does not retry; the consumer in `worker` owns that policy.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{
    CleanupReport, NewQueueItem, QueueItem, QueueStatus, QueueStatusCounts, RequestKind,
};
use crate::store::Store;

/// Terminal items older than these are removed by `cleanup`.
pub const COMPLETED_RETENTION_DAYS: i64 = 7;
pub const FAILED_RETENTION_DAYS: i64 = 30;

#[derive(Clone)]
pub struct RequestQueue {
    store: Arc<dyn Store>,
}

impl RequestQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Enqueues a request, or returns the item already in flight for the
    /// same (account, kind, identifying payload field).
    ///
    /// # Returns
    ///
    /// * `(item, true)` when a new item was created, `(existing, false)` otherwise.
    pub async fn enqueue(
        &self,
        account_id: Uuid,
        kind: RequestKind,
        payload: Value,
        priority: i32,
        lead_id: Option<Uuid>,
    ) -> Result<(QueueItem, bool), AppError> {
        let dedup_key = kind.dedup_key(&payload).ok_or_else(|| {
            AppError::BadRequest(format!(
                "{} request payload must carry a cnpj",
                kind.as_str()
            ))
        })?;

        let (item, is_new) = self
            .store
            .insert_or_get_active(NewQueueItem {
                account_id,
                lead_id,
                kind,
                dedup_key,
                payload,
                priority,
            })
            .await?;

        if is_new {
            tracing::info!(
                "Enqueued {} request {} (key {}, priority {})",
                kind.as_str(),
                item.id,
                item.dedup_key,
                priority
            );
        } else {
            tracing::debug!(
                "Reusing in-flight {} request {} for key {}",
                kind.as_str(),
                item.id,
                item.dedup_key
            );
        }

        Ok((item, is_new))
    }

    /// Claims the next pending item for processing.
    pub async fn claim_next(&self) -> Result<Option<QueueItem>, AppError> {
        let item = self.store.claim_next().await?;
        if let Some(ref item) = item {
            tracing::info!(
                "Claimed {} request {} (key {})",
                item.kind.as_str(),
                item.id,
                item.dedup_key
            );
        }
        Ok(item)
    }

    pub async fn complete(&self, item_id: Uuid, result: Value) -> Result<QueueItem, AppError> {
        self.store
            .finish_item(item_id, QueueStatus::Completed, Some(result), None)
            .await?
            .ok_or_else(|| AppError::Conflict(format!("queue item {} is not active", item_id)))
    }

    pub async fn fail(&self, item_id: Uuid, error: &str) -> Result<QueueItem, AppError> {
        tracing::warn!("Queue item {} failed: {}", item_id, error);
        self.store
            .finish_item(item_id, QueueStatus::Failed, None, Some(error.to_string()))
            .await?
            .ok_or_else(|| AppError::Conflict(format!("queue item {} is not active", item_id)))
    }

    /// Item lookup scoped to its owner.
    pub async fn get_for_account(
        &self,
        item_id: Uuid,
        account_id: Uuid,
    ) -> Result<Option<QueueItem>, AppError> {
        Ok(self
            .store
            .get_item(item_id)
            .await?
            .filter(|item| item.account_id == account_id))
    }

    /// Polls until the item completes, fails, or `timeout` elapses.
    ///
    /// Returns the result payload only for a completed item. Timing out does
    /// not cancel the item; it keeps running in the consumer.
    pub async fn wait_for_result(
        &self,
        item_id: Uuid,
        account_id: Uuid,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Option<Value>, AppError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.get_for_account(item_id, account_id).await? {
                None => return Ok(None),
                Some(item) => match item.status {
                    QueueStatus::Completed => return Ok(item.result),
                    QueueStatus::Failed => return Ok(None),
                    QueueStatus::Pending | QueueStatus::Processing => {}
                },
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::debug!("Gave up waiting for queue item {}", item_id);
                return Ok(None);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Pending/processing counts across the whole queue.
    pub async fn queue_status(&self) -> Result<QueueStatusCounts, AppError> {
        self.store.queue_counts(None).await
    }

    /// Active items owned by `account_id`.
    pub async fn user_queue_count(&self, account_id: Uuid) -> Result<QueueStatusCounts, AppError> {
        self.store.queue_counts(Some(account_id)).await
    }

    /// Deletes completed items older than 7 days and failed items older than 30.
    pub async fn cleanup(&self) -> Result<CleanupReport, AppError> {
        let now = Utc::now();
        let completed_deleted = self
            .store
            .delete_finished_before(
                QueueStatus::Completed,
                now - chrono::Duration::days(COMPLETED_RETENTION_DAYS),
            )
            .await?;
        let failed_deleted = self
            .store
            .delete_finished_before(
                QueueStatus::Failed,
                now - chrono::Duration::days(FAILED_RETENTION_DAYS),
            )
            .await?;

        if completed_deleted + failed_deleted > 0 {
            tracing::info!(
                "Queue cleanup removed {} completed and {} failed items",
                completed_deleted,
                failed_deleted
            );
        }

        Ok(CleanupReport {
            completed_deleted,
            failed_deleted,
        })
    }
}
