//! The single consumer of the request queue.
//!
//! Claims one item at a time, performs the external call and records the
//! outcome. An expired partners session triggers exactly one credential
//! refresh and one retry for the item; anything else fails the item.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::credentials::CredentialProvider;
use crate::errors::{AppError, EnrichmentError};
use crate::models::{QueueItem, RequestKind};
use crate::queue::RequestQueue;
use crate::services::{EnrichmentFetcher, RegistryLookup};
use crate::store::{lookup_miss, Store};

/// Enrichment key holding ownership records.
pub const PARTNERS_KEY: &str = "socios_qsa";
/// Enrichment key holding the public registry profile.
pub const REGISTRY_KEY: &str = "registry";

#[derive(Clone)]
pub struct QueueWorker {
    store: Arc<dyn Store>,
    queue: RequestQueue,
    fetcher: Arc<dyn EnrichmentFetcher>,
    registry: Arc<dyn RegistryLookup>,
    credentials: Arc<dyn CredentialProvider>,
    poll_interval: Duration,
    item_delay: Duration,
}

impl QueueWorker {
    pub fn new(
        store: Arc<dyn Store>,
        fetcher: Arc<dyn EnrichmentFetcher>,
        registry: Arc<dyn RegistryLookup>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            queue: RequestQueue::new(store.clone()),
            store,
            fetcher,
            registry,
            credentials,
            poll_interval: Duration::from_secs(5),
            item_delay: Duration::from_secs(1),
        }
    }

    /// Idle sleep when nothing is pending.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Pause between consecutive items, to stay gentle on the upstream.
    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = delay;
        self
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// Claims and processes one item.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(item))` - The item in its terminal state.
    /// * `Ok(None)` - Nothing was pending.
    pub async fn process_next(&self) -> Result<Option<QueueItem>, AppError> {
        let Some(item) = self.queue.claim_next().await? else {
            return Ok(None);
        };

        let finished = match self.perform(&item).await {
            Ok(result) => match self.store_result(&item, &result).await {
                Ok(()) => self.queue.complete(item.id, result).await?,
                Err(e) => {
                    self.queue
                        .fail(item.id, &format!("could not store result: {}", e))
                        .await?
                }
            },
            Err(message) => self.queue.fail(item.id, &message).await?,
        };

        tracing::info!(
            "Queue item {} finished as {:?}",
            finished.id,
            finished.status
        );
        Ok(Some(finished))
    }

    async fn perform(&self, item: &QueueItem) -> Result<Value, String> {
        match item.kind {
            RequestKind::Partners => self.fetch_partners(&item.dedup_key).await,
            RequestKind::CompanyProfile => match self.registry.fetch_company(&item.dedup_key).await
            {
                Ok(Some(profile)) => Ok(profile),
                Ok(None) => Ok(lookup_miss()),
                Err(e) => Err(e.to_string()),
            },
        }
    }

    async fn fetch_partners(&self, cnpj: &str) -> Result<Value, String> {
        let mut refreshed = false;
        loop {
            let attempt = match self.credentials.get().await {
                Ok(Some(credentials)) => self.fetcher.fetch_partners(cnpj, &credentials).await,
                Ok(None) => Err(EnrichmentError::MissingCredentials),
                Err(e) => return Err(format!("credential store unreadable: {}", e)),
            };

            match attempt {
                Ok(raw) => return Ok(normalize_partners(raw)),
                Err(EnrichmentError::AuthExpired | EnrichmentError::MissingCredentials)
                    if !refreshed =>
                {
                    refreshed = true;
                    tracing::warn!("Partners session rejected for {}, refreshing once", cnpj);
                    if let Err(e) = self.credentials.refresh().await {
                        return Err(format!("session refresh failed: {}", e));
                    }
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }

    /// Merges a result into the lead it was requested for.
    async fn store_result(&self, item: &QueueItem, result: &Value) -> Result<(), AppError> {
        let patch = match item.kind {
            RequestKind::Partners => json!({ PARTNERS_KEY: result }),
            RequestKind::CompanyProfile => json!({ REGISTRY_KEY: result }),
        };

        let lead_id = match item.lead_id {
            Some(id) => Some(id),
            None => self
                .store
                .find_lead_by_business_id(&item.dedup_key)
                .await?
                .map(|lead| lead.id),
        };
        let Some(lead_id) = lead_id else {
            tracing::debug!("Queue item {} has no lead to enrich", item.id);
            return Ok(());
        };

        if self.store.merge_lead_enrichment(lead_id, &patch).await?.is_none() {
            tracing::warn!("Lead {} vanished before queue item {} finished", lead_id, item.id);
        }
        Ok(())
    }

    /// Processes items until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "Queue worker started (poll every {:?})",
            self.poll_interval
        );

        while !*shutdown.borrow() {
            let pause = match self.process_next().await {
                Ok(Some(_)) => self.item_delay,
                Ok(None) => self.poll_interval,
                Err(e) => {
                    tracing::error!("Queue worker error: {}", e);
                    self.poll_interval
                }
            };
            if wait_or_shutdown(&mut shutdown, pause).await {
                break;
            }
        }

        tracing::info!("Queue worker stopped");
    }
}

/// Puts partner records in the `{"socios": [...]}` shape.
pub fn normalize_partners(raw: Value) -> Value {
    match raw {
        Value::Array(items) => json!({ "socios": items }),
        Value::Object(map) if map.contains_key("socios") => Value::Object(map),
        Value::Object(map) if map.is_empty() => json!({ "socios": [] }),
        Value::Object(map) => json!({ "socios": [Value::Object(map)] }),
        _ => json!({ "socios": [] }),
    }
}

/// Sleeps for `duration`. Returns true when shutdown was requested meanwhile.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    let changed = tokio::select! {
        _ = tokio::time::sleep(duration) => return false,
        changed = shutdown.changed() => changed,
    };
    changed.is_err() || *shutdown.borrow()
}

/// Runs queue cleanup every `interval` until shutdown.
pub async fn run_cleanup_loop(
    queue: RequestQueue,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if wait_or_shutdown(&mut shutdown, interval).await {
            break;
        }
        if let Err(e) = queue.cleanup().await {
            tracing::error!("Queue cleanup failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partners_are_normalized() {
        assert_eq!(
            normalize_partners(json!([{"NOME": "JOAO"}])),
            json!({"socios": [{"NOME": "JOAO"}]})
        );
        assert_eq!(
            normalize_partners(json!({"socios": []})),
            json!({"socios": []})
        );
        assert_eq!(
            normalize_partners(json!({"NOME": "MARIA"})),
            json!({"socios": [{"NOME": "MARIA"}]})
        );
        assert_eq!(normalize_partners(json!(null)), json!({"socios": []}));
        assert_eq!(normalize_partners(json!({})), json!({"socios": []}));
    }
}
