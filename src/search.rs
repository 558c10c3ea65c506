//! Search orchestration.
//!
//! A search is created already `processing` and runs detached from the
//! request that created it. It first serves leads from the cache index,
//! then falls back to a live maps search for whatever is still missing,
//! charging one credit per newly granted lead. A failed debit stops the
//! search; fewer leads than requested is still a completed search.

use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache_index::CacheIndex;
use crate::config::Config;
use crate::documents::{normalize_br_phone, normalize_cnpj, normalize_cpf};
use crate::errors::{AppError, LedgerError};
use crate::leads::{sanitize_for_account, LeadTracker, UnlockOutcome};
use crate::ledger::Ledger;
use crate::models::*;
use crate::normalize::{normalize_location, normalize_niche};
use crate::queue::RequestQueue;
use crate::services::{IdentifierResolver, MapsSearch, RegistryLookup};
use crate::store::Store;

pub const MAX_QUANTITY: i32 = 500;

/// Partner lookups for a single company jump ahead of search traffic.
const LOOKUP_PRIORITY: i32 = 1;

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    /// An account is re-offered (and re-charged for) a lead after this long.
    pub retention: chrono::Duration,
    pub page_size: u32,
    pub max_pages: u32,
    /// Queue partner and registry lookups for delivered leads.
    pub enqueue_enrichment: bool,
    pub lookup_wait: Duration,
    pub lookup_poll: Duration,
    pub unlock_cost: i64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            retention: chrono::Duration::days(30),
            page_size: 10,
            max_pages: 5,
            enqueue_enrichment: true,
            lookup_wait: Duration::from_secs(30),
            lookup_poll: Duration::from_secs(1),
            unlock_cost: 1,
        }
    }
}

impl SearchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retention: config.retention_window(),
            page_size: config.search_page_size,
            max_pages: config.search_max_pages,
            lookup_wait: Duration::from_secs(config.lookup_wait_secs),
            unlock_cost: config.unlock_cost,
            ..Self::default()
        }
    }
}

/// Running tally of one search. Survives a failed run so the final record
/// still reports the credits that were spent.
#[derive(Debug, Default)]
struct SearchProgress {
    delivered: Vec<Lead>,
    delivered_ids: HashSet<Uuid>,
    touched: Vec<Uuid>,
    credits_used: i64,
    from_cache: usize,
    from_live: usize,
    places_seen: usize,
    pages_fetched: u32,
    skipped_unresolved: usize,
    skipped_already_seen: usize,
    enrichment_enqueued: usize,
    out_of_credits: bool,
    live_search_error: Option<String>,
    cache_entry: Option<Uuid>,
}

impl SearchProgress {
    fn outcome(&self, search: &SearchRequest, error: Option<String>) -> SearchOutcome {
        let leads: Vec<Value> = self
            .delivered
            .iter()
            .map(|l| json!({"id": l.id, "name": l.name, "business_id": l.business_id}))
            .collect();

        SearchOutcome {
            results_count: self.delivered.len() as i32,
            credits_used: self.credits_used,
            summary: json!({
                "query": live_query(search),
                "requested": search.quantity,
                "from_cache": self.from_cache,
                "from_live": self.from_live,
                "places_seen": self.places_seen,
                "pages_fetched": self.pages_fetched,
                "skipped_unresolved": self.skipped_unresolved,
                "skipped_already_seen": self.skipped_already_seen,
                "enrichment_enqueued": self.enrichment_enqueued,
                "stopped_insufficient_credits": self.out_of_credits,
                "live_search_error": self.live_search_error,
                "cache_entry_id": self.cache_entry,
                "leads": leads,
            }),
            error,
        }
    }
}

enum Charge {
    Delivered,
    AlreadySeen,
    OutOfCredits,
}

fn live_query(search: &SearchRequest) -> String {
    format!("{} em {}", search.niche.trim(), search.location.trim())
}

/// Best-effort display name from a registry record.
pub fn registry_name(record: &Value) -> Option<String> {
    let record = match record {
        Value::Array(items) => items.first()?,
        other => other,
    };
    let map = record.as_object()?;
    ["razao_social", "nome_fantasia", "nome", "name"]
        .iter()
        .find_map(|wanted| {
            map.iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(wanted))
                .and_then(|(_, v)| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
}

#[derive(Clone)]
pub struct SearchOrchestrator {
    store: Arc<dyn Store>,
    ledger: Ledger,
    leads: LeadTracker,
    cache: CacheIndex,
    queue: RequestQueue,
    maps: Arc<dyn MapsSearch>,
    resolver: Arc<dyn IdentifierResolver>,
    registry: Arc<dyn RegistryLookup>,
    settings: SearchSettings,
}

impl SearchOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        maps: Arc<dyn MapsSearch>,
        resolver: Arc<dyn IdentifierResolver>,
        registry: Arc<dyn RegistryLookup>,
        settings: SearchSettings,
    ) -> Self {
        let ledger = Ledger::new(store.clone());
        Self {
            leads: LeadTracker::new(store.clone(), ledger.clone()),
            cache: CacheIndex::new(store.clone()),
            queue: RequestQueue::new(store.clone()),
            ledger,
            store,
            maps,
            resolver,
            registry,
            settings,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// Validates the request and records it as `processing`.
    pub async fn create_search(
        &self,
        account_id: Uuid,
        niche: &str,
        location: &str,
        quantity: i32,
    ) -> Result<SearchRequest, AppError> {
        if niche.trim().is_empty() || location.trim().is_empty() {
            return Err(AppError::BadRequest(
                "niche and location are required".to_string(),
            ));
        }
        if !(1..=MAX_QUANTITY).contains(&quantity) {
            return Err(AppError::BadRequest(format!(
                "quantity must be between 1 and {}",
                MAX_QUANTITY
            )));
        }

        self.store
            .insert_search(account_id, niche.trim(), location.trim(), quantity)
            .await
    }

    /// Runs the search on a detached task. There is no cancellation handle.
    pub fn submit(&self, search: SearchRequest) -> tokio::task::JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let id = search.id;
            if let Err(e) = orchestrator.run(search).await {
                tracing::error!("Could not record the outcome of search {}: {}", id, e);
            }
        })
    }

    /// Executes a search and writes its terminal state.
    ///
    /// Errors and panics inside the run are caught here and mark the search
    /// `failed`; only a failure to persist that final state is returned.
    pub async fn run(&self, search: SearchRequest) -> Result<SearchRequest, AppError> {
        tracing::info!(
            "Search {} started: '{}' in '{}' x{}",
            search.id,
            search.niche,
            search.location,
            search.quantity
        );

        let mut progress = SearchProgress::default();
        let result = AssertUnwindSafe(self.execute(&search, &mut progress))
            .catch_unwind()
            .await;

        let (status, outcome) = match result {
            Ok(Ok(())) => (SearchStatus::Completed, progress.outcome(&search, None)),
            Ok(Err(e)) => {
                tracing::error!("Search {} failed: {}", search.id, e);
                (
                    SearchStatus::Failed,
                    progress.outcome(&search, Some(e.to_string())),
                )
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "search task panicked".to_string());
                tracing::error!("Search {} panicked: {}", search.id, message);
                (
                    SearchStatus::Failed,
                    progress.outcome(&search, Some(format!("internal error: {}", message))),
                )
            }
        };

        let finished = self
            .store
            .finish_search(search.id, status, &outcome)
            .await?
            .ok_or_else(|| {
                AppError::Conflict(format!("search {} already finished", search.id))
            })?;

        tracing::info!(
            "Search {} {:?}: {} lead(s), {} credit(s)",
            finished.id,
            finished.status,
            finished.results_count,
            finished.credits_used
        );
        Ok(finished)
    }

    async fn execute(
        &self,
        search: &SearchRequest,
        progress: &mut SearchProgress,
    ) -> Result<(), AppError> {
        let wanted = search.quantity.max(0) as usize;
        let niche_key = normalize_niche(&search.niche);
        let location_key = normalize_location(&search.location);
        let cache_key = location_key
            .as_deref()
            .filter(|_| !niche_key.is_empty())
            .map(|location| (niche_key.as_str(), location));

        if cache_key.is_none() {
            tracing::debug!(
                "Search {}: '{}' is not a City - ST location, skipping cache",
                search.id,
                search.location
            );
        }

        if let Some((niche, location)) = cache_key {
            self.cache_pass(search, niche, location, wanted, progress)
                .await?;
        }

        if progress.delivered.len() < wanted && !progress.out_of_credits {
            self.live_pass(search, wanted, progress).await?;
        }

        if let Some((niche, location)) = cache_key {
            if !progress.touched.is_empty() {
                let entry = self.cache.get_or_create_cache_entry(niche, location).await?;
                self.cache.associate(&entry, &progress.touched).await?;
                self.cache.refresh_count(&entry).await?;
                progress.cache_entry = Some(entry.id);
            }
        }

        Ok(())
    }

    async fn cache_pass(
        &self,
        search: &SearchRequest,
        niche_key: &str,
        location_key: &str,
        wanted: usize,
        progress: &mut SearchProgress,
    ) -> Result<(), AppError> {
        let Some(entry) = self.cache.find(niche_key, location_key).await? else {
            return Ok(());
        };
        progress.cache_entry = Some(entry.id);
        if entry.lead_count <= 0 {
            return Ok(());
        }

        let candidates = self.store.leads_by_cache_entry(entry.id).await?;
        let unseen = self
            .leads
            .leads_unseen_by(search.account_id, candidates, self.settings.retention)
            .await?;
        tracing::debug!(
            "Search {}: {} cached lead(s) available for '{}' / '{}'",
            search.id,
            unseen.len(),
            niche_key,
            location_key
        );

        for lead in unseen {
            if progress.delivered.len() >= wanted {
                break;
            }
            match self.charge_for_lead(search, &lead, progress).await? {
                Charge::Delivered => progress.from_cache += 1,
                Charge::AlreadySeen => {}
                Charge::OutOfCredits => break,
            }
        }
        Ok(())
    }

    async fn live_pass(
        &self,
        search: &SearchRequest,
        wanted: usize,
        progress: &mut SearchProgress,
    ) -> Result<(), AppError> {
        let query = live_query(search);
        let mut seen_ids: HashSet<String> = progress
            .delivered
            .iter()
            .filter_map(|l| l.business_id.clone())
            .collect();

        'pages: for page in 1..=self.settings.max_pages {
            let places = match self
                .maps
                .search_places(&query, page, self.settings.page_size)
                .await
            {
                Ok(places) => places,
                Err(e) => {
                    tracing::warn!("Search {}: maps search failed on page {}: {}", search.id, page, e);
                    progress.live_search_error = Some(e.to_string());
                    break;
                }
            };
            progress.pages_fetched = page;
            if places.is_empty() {
                break;
            }

            for place in places {
                if progress.delivered.len() >= wanted || progress.out_of_credits {
                    break 'pages;
                }
                progress.places_seen += 1;

                let business_id = match self.resolver.resolve_business_id(&place.name).await {
                    Ok(Some(id)) => id,
                    Ok(None) => {
                        progress.skipped_unresolved += 1;
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("Could not resolve '{}': {}", place.name, e);
                        progress.skipped_unresolved += 1;
                        continue;
                    }
                };
                if !seen_ids.insert(business_id.clone()) {
                    continue;
                }

                let discovered = DiscoveredLead {
                    name: place.name.clone(),
                    address: place.address.clone(),
                    maps_phone: place
                        .phone
                        .as_deref()
                        .map(|p| normalize_br_phone(p).unwrap_or_else(|| p.to_string())),
                    ..DiscoveredLead::default()
                };
                let lead = self.leads.find_or_create_lead(&business_id, &discovered).await?;

                // Leads the account could not pay for stay out of the index.
                match self.charge_for_lead(search, &lead, progress).await? {
                    Charge::Delivered => {
                        progress.touched.push(lead.id);
                        progress.from_live += 1;
                        self.enqueue_enrichment(search.account_id, &lead, progress).await;
                    }
                    Charge::AlreadySeen => {
                        progress.touched.push(lead.id);
                        progress.skipped_already_seen += 1;
                    }
                    Charge::OutOfCredits => break 'pages,
                }
            }

            if progress.delivered.len() >= wanted {
                break;
            }
        }
        Ok(())
    }

    /// Grants the account access to `lead` and debits for a new grant.
    ///
    /// A failed debit reverses the grant and marks the search out of credits.
    async fn charge_for_lead(
        &self,
        search: &SearchRequest,
        lead: &Lead,
        progress: &mut SearchProgress,
    ) -> Result<Charge, AppError> {
        if progress.delivered_ids.contains(&lead.id) {
            return Ok(Charge::AlreadySeen);
        }

        let grant = self
            .leads
            .grant_access(
                search.account_id,
                lead.id,
                Some(search.id),
                Some(self.settings.retention),
            )
            .await?;
        if !grant.is_new {
            return Ok(Charge::AlreadySeen);
        }

        let description = format!("Lead: {}", lead.name);
        match self.ledger.debit(search.account_id, 1, &description).await {
            Ok(_) => {}
            Err(LedgerError::InsufficientCredits { balance, .. }) => {
                tracing::info!(
                    "Search {} stopped: account {} is out of credits (balance {})",
                    search.id,
                    search.account_id,
                    balance
                );
                self.leads.revoke_grant(&grant).await?;
                progress.out_of_credits = true;
                return Ok(Charge::OutOfCredits);
            }
            Err(e) => {
                self.leads.revoke_grant(&grant).await?;
                return Err(e.into());
            }
        }

        progress.credits_used += 1;
        self.store.link_search_lead(search.id, lead.id).await?;
        progress.delivered_ids.insert(lead.id);
        progress.delivered.push(lead.clone());
        Ok(Charge::Delivered)
    }

    /// Queues the lookups a delivered lead is still missing. Never fails the search.
    async fn enqueue_enrichment(&self, account_id: Uuid, lead: &Lead, progress: &mut SearchProgress) {
        if !self.settings.enqueue_enrichment {
            return;
        }
        let Some(cnpj) = lead.business_id.as_deref() else {
            return;
        };

        let mut kinds = Vec::new();
        if lead.enrichment.get("socios_qsa").is_none() {
            kinds.push(RequestKind::Partners);
        }
        if lead.enrichment.get("registry").is_none() {
            kinds.push(RequestKind::CompanyProfile);
        }

        for kind in kinds {
            match self
                .queue
                .enqueue(account_id, kind, json!({"cnpj": cnpj}), 0, Some(lead.id))
                .await
            {
                Ok((_, true)) => progress.enrichment_enqueued += 1,
                Ok((_, false)) => {}
                Err(e) => tracing::warn!(
                    "Could not queue {} lookup for lead {}: {}",
                    kind.as_str(),
                    lead.id,
                    e
                ),
            }
        }
    }

    // ============ Direct lookups ============

    /// Buys the full record of one company by CNPJ.
    ///
    /// Charges one credit for a new access, or the unlock price when the
    /// account already had the lead without its enrichment. Waits a bounded
    /// time for the partners lookup; on timeout the response simply has no
    /// partners yet.
    pub async fn lookup_company(
        &self,
        account_id: Uuid,
        raw_cnpj: &str,
    ) -> Result<CompanyLookupResponse, AppError> {
        let cnpj = normalize_cnpj(raw_cnpj)
            .ok_or_else(|| AppError::BadRequest("CNPJ must have 14 digits".to_string()))?;

        let record = self
            .registry
            .fetch_company(&cnpj)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No registry record for CNPJ {}", cnpj)))?;

        let discovered = DiscoveredLead {
            name: registry_name(&record).unwrap_or_else(|| format!("CNPJ {}", cnpj)),
            enrichment: Some(json!({ "registry": record })),
            ..DiscoveredLead::default()
        };
        let lead = self.leads.find_or_create_lead(&cnpj, &discovered).await?;

        let grant = self
            .leads
            .grant_access(account_id, lead.id, None, Some(self.settings.retention))
            .await?;

        let (access, charged) = if grant.is_new {
            let description = format!("CNPJ lookup: {}", cnpj);
            if let Err(e) = self.ledger.debit(account_id, 1, &description).await {
                self.leads.revoke_grant(&grant).await?;
                return Err(e.into());
            }
            (self.leads.unlock_enrichment(&grant.record).await?, true)
        } else {
            let UnlockOutcome {
                record, charged, ..
            } = self
                .leads
                .purchase_unlock(account_id, &lead, self.settings.unlock_cost)
                .await?;
            (record, charged)
        };

        let mut queue_item_id = None;
        let mut partners_ready = lead.enrichment.get("socios_qsa").is_some();
        if !partners_ready {
            match self
                .queue
                .enqueue(
                    account_id,
                    RequestKind::Partners,
                    json!({"cnpj": cnpj}),
                    LOOKUP_PRIORITY,
                    Some(lead.id),
                )
                .await
            {
                Ok((item, _)) => {
                    queue_item_id = Some(item.id);
                    partners_ready = self
                        .queue
                        .wait_for_result(
                            item.id,
                            account_id,
                            self.settings.lookup_wait,
                            self.settings.lookup_poll,
                        )
                        .await?
                        .is_some();
                }
                Err(e) => tracing::warn!("Could not queue partners lookup for {}: {}", cnpj, e),
            }
        }

        let lead = self
            .store
            .get_lead(lead.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", lead.id)))?;

        Ok(CompanyLookupResponse {
            lead: sanitize_for_account(&lead, Some(&access)),
            charged,
            queue_item_id,
            partners_ready,
        })
    }

    /// Looks up a person by CPF. One credit, charged only when a record exists.
    pub async fn lookup_person(
        &self,
        account_id: Uuid,
        raw_cpf: &str,
    ) -> Result<PersonLookupResponse, AppError> {
        let cpf = normalize_cpf(raw_cpf)
            .ok_or_else(|| AppError::BadRequest("CPF must have 11 digits".to_string()))?;

        let data = self
            .registry
            .fetch_person(&cpf)
            .await?
            .ok_or_else(|| AppError::NotFound("No registry record for this CPF".to_string()))?;

        let balance = self.ledger.debit(account_id, 1, "CPF lookup").await?;

        Ok(PersonLookupResponse { cpf, data, balance })
    }

    /// Reveals the enrichment of a lead the account already has.
    pub async fn unlock_lead(
        &self,
        account_id: Uuid,
        lead_id: Uuid,
    ) -> Result<(LeadView, UnlockOutcome), AppError> {
        let lead = self
            .store
            .get_lead(lead_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", lead_id)))?;

        let outcome = self
            .leads
            .purchase_unlock(account_id, &lead, self.settings.unlock_cost)
            .await?;
        Ok((sanitize_for_account(&lead, Some(&outcome.record)), outcome))
    }

    // ============ Listing ============

    pub async fn get(&self, account_id: Uuid, search_id: Uuid) -> Result<SearchRequest, AppError> {
        self.store
            .get_search(search_id)
            .await?
            .filter(|s| s.account_id == account_id)
            .ok_or_else(|| AppError::NotFound(format!("Search {} not found", search_id)))
    }

    pub async fn list(&self, account_id: Uuid, limit: i64) -> Result<Vec<SearchRequest>, AppError> {
        self.store
            .list_searches(account_id, limit.clamp(1, 100))
            .await
    }

    /// Sanitized views of a search's leads, recomputed on every call so
    /// late enrichment shows up.
    pub async fn search_views(
        &self,
        account_id: Uuid,
        search_id: Uuid,
    ) -> Result<Vec<LeadView>, AppError> {
        let search = self.get(account_id, search_id).await?;
        let leads = self.store.search_leads(search.id).await?;
        self.leads.views_for_account(account_id, &leads).await
    }

    /// Deletes a finished search. Running searches cannot be deleted.
    pub async fn delete(&self, account_id: Uuid, search_id: Uuid) -> Result<(), AppError> {
        let search = self.get(account_id, search_id).await?;
        if !search.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "Search {} is still running",
                search_id
            )));
        }
        if !self.store.delete_search(search_id, account_id).await? {
            return Err(AppError::NotFound(format!("Search {} not found", search_id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_name_prefers_legal_name() {
        let record = json!({"NOME_FANTASIA": "Silva Adv", "RAZAO_SOCIAL": "SILVA ADVOGADOS LTDA"});
        assert_eq!(registry_name(&record).as_deref(), Some("SILVA ADVOGADOS LTDA"));
    }

    #[test]
    fn registry_name_reads_first_array_item() {
        let record = json!([{"nome": "Padaria Central"}]);
        assert_eq!(registry_name(&record).as_deref(), Some("Padaria Central"));
        assert_eq!(registry_name(&json!([])), None);
        assert_eq!(registry_name(&json!({"razao_social": "  "})), None);
    }

    #[test]
    fn settings_follow_config_defaults() {
        let settings = SearchSettings::default();
        assert_eq!(settings.retention, chrono::Duration::days(30));
        assert_eq!(settings.page_size, 10);
        assert_eq!(settings.max_pages, 5);
    }
}
