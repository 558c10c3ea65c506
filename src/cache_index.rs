//! Permanent (niche, location) index over the global lead store.
//!
//! Entries never expire. `lead_count` is a heuristic for whether the cache
//! path is worth trying and never gates charging.

use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::CacheIndexEntry;
use crate::store::Store;

#[derive(Clone)]
pub struct CacheIndex {
    store: Arc<dyn Store>,
}

impl CacheIndex {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn find(
        &self,
        niche_key: &str,
        location_key: &str,
    ) -> Result<Option<CacheIndexEntry>, AppError> {
        self.store.find_cache_entry(niche_key, location_key).await
    }

    /// Idempotent lookup-or-create. Does not touch the count.
    pub async fn get_or_create_cache_entry(
        &self,
        niche_key: &str,
        location_key: &str,
    ) -> Result<CacheIndexEntry, AppError> {
        self.store
            .insert_or_get_cache_entry(niche_key, location_key)
            .await
    }

    /// Indexes leads under `entry`. Leads already indexed elsewhere keep their entry.
    pub async fn associate(&self, entry: &CacheIndexEntry, lead_ids: &[Uuid]) -> Result<u64, AppError> {
        self.store.associate_leads(entry.id, lead_ids).await
    }

    /// Recomputes and persists the number of leads indexed under `entry`.
    pub async fn refresh_count(&self, entry: &CacheIndexEntry) -> Result<CacheIndexEntry, AppError> {
        let refreshed = self
            .store
            .refresh_cache_count(entry.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("cache entry {} not found", entry.id)))?;

        tracing::debug!(
            "Cache entry '{}' / '{}' now indexes {} lead(s)",
            refreshed.niche_key,
            refreshed.location_key,
            refreshed.lead_count
        );
        Ok(refreshed)
    }
}
