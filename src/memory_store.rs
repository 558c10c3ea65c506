//! In-process store.
//!
//! Each trait method runs inside one critical section, which gives it the
//! same atomicity the Postgres statements provide. Used by the test suite and
//! for running the service without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::*;
use crate::store::*;

#[derive(Default)]
struct State {
    accounts: HashMap<Uuid, Account>,
    ledger: Vec<LedgerEntry>,
    queue: Vec<QueueItem>,
    leads: HashMap<Uuid, Lead>,
    access: Vec<AccessRecord>,
    cache_entries: Vec<CacheIndexEntry>,
    searches: HashMap<Uuid, SearchRequest>,
    search_leads: Vec<(Uuid, Uuid)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an account holding `credits`, recording the opening balance as a purchase.
    pub async fn seed_account(&self, email: &str, credits: i64) -> Account {
        let now = Utc::now();
        let account = Account {
            id: Uuid::new_v4(),
            external_ref: format!("seed:{}", email),
            email: email.to_string(),
            credits,
            created_at: now,
            updated_at: now,
        };
        let mut state = self.state.lock().await;
        if credits > 0 {
            state.ledger.push(LedgerEntry {
                id: Uuid::new_v4(),
                account_id: account.id,
                amount: credits,
                kind: LedgerKind::Purchase,
                description: "Opening balance".to_string(),
                payment_gateway: None,
                external_payment_id: None,
                created_at: now,
            });
        }
        state.accounts.insert(account.id, account.clone());
        account
    }

    /// All ledger entries of an account, oldest first.
    pub async fn all_entries(&self, account_id: Uuid) -> Vec<LedgerEntry> {
        let state = self.state.lock().await;
        state
            .ledger
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect()
    }

    pub async fn all_access_records(&self, account_id: Uuid) -> Vec<AccessRecord> {
        let state = self.state.lock().await;
        state
            .access
            .iter()
            .filter(|r| r.account_id == account_id)
            .cloned()
            .collect()
    }

    pub async fn lead_count(&self) -> usize {
        self.state.lock().await.leads.len()
    }

    pub async fn all_queue_items(&self) -> Vec<QueueItem> {
        self.state.lock().await.queue.clone()
    }

    /// Moves an access record's charge time into the past.
    pub async fn backdate_access(&self, access_id: Uuid, at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.access.iter_mut().find(|r| r.id == access_id) {
            record.first_accessed_at = at;
            record.last_accessed_at = at;
        }
    }

    /// Moves a queue item's completion time into the past.
    pub async fn backdate_queue_item(&self, item_id: Uuid, at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        if let Some(item) = state.queue.iter_mut().find(|i| i.id == item_id) {
            item.completed_at = Some(at);
        }
    }
}

fn merge_discovered(lead: &mut Lead, discovered: &DiscoveredLead) {
    if lead.name.trim().is_empty() {
        lead.name = discovered.name.clone();
    }
    lead.address = fill_blank(&lead.address, &discovered.address);
    lead.maps_phone = fill_blank(&lead.maps_phone, &discovered.maps_phone);
    lead.owner_person_id = fill_blank(&lead.owner_person_id, &discovered.owner_person_id);
    if let Some(patch) = &discovered.enrichment {
        lead.enrichment = merge_enrichment(&lead.enrichment, patch);
    }
    lead.last_touched_at = Utc::now();
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, AppError> {
        Ok(self.state.lock().await.accounts.get(&id).cloned())
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, AppError> {
        let state = self.state.lock().await;
        let wanted = email.trim().to_lowercase();
        Ok(state
            .accounts
            .values()
            .filter(|a| a.email.to_lowercase() == wanted)
            .min_by_key(|a| a.created_at)
            .cloned())
    }

    async fn get_or_create_account(
        &self,
        external_ref: &str,
        email: &str,
    ) -> Result<Account, AppError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .accounts
            .values()
            .find(|a| a.external_ref == external_ref)
        {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let account = Account {
            id: Uuid::new_v4(),
            external_ref: external_ref.to_string(),
            email: email.to_string(),
            credits: 0,
            created_at: now,
            updated_at: now,
        };
        state.accounts.insert(account.id, account.clone());
        Ok(account)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn apply_debit(
        &self,
        account_id: Uuid,
        amount: i64,
        description: &str,
    ) -> Result<DebitOutcome, AppError> {
        let mut state = self.state.lock().await;
        let Some(account) = state.accounts.get_mut(&account_id) else {
            return Ok(DebitOutcome::AccountMissing);
        };
        if account.credits < amount {
            return Ok(DebitOutcome::Insufficient {
                balance: account.credits,
            });
        }
        account.credits -= amount;
        account.updated_at = Utc::now();
        let balance = account.credits;
        state.ledger.push(LedgerEntry {
            id: Uuid::new_v4(),
            account_id,
            amount: -amount,
            kind: LedgerKind::Usage,
            description: description.to_string(),
            payment_gateway: None,
            external_payment_id: None,
            created_at: Utc::now(),
        });
        Ok(DebitOutcome::Applied { balance })
    }

    async fn apply_credit(
        &self,
        account_id: Uuid,
        amount: i64,
        kind: LedgerKind,
        description: &str,
        payment: Option<&PaymentRef>,
    ) -> Result<CreditOutcome, AppError> {
        let mut state = self.state.lock().await;
        if !state.accounts.contains_key(&account_id) {
            return Ok(CreditOutcome::AccountMissing);
        }
        if let Some(payment) = payment {
            let duplicate = state.ledger.iter().any(|e| {
                e.payment_gateway.as_deref() == Some(payment.gateway.as_str())
                    && e.external_payment_id.as_deref() == Some(payment.external_id.as_str())
            });
            if duplicate {
                return Ok(CreditOutcome::DuplicatePayment);
            }
        }
        let balance = match state.accounts.get_mut(&account_id) {
            Some(account) => {
                account.credits += amount;
                account.updated_at = Utc::now();
                account.credits
            }
            None => return Ok(CreditOutcome::AccountMissing),
        };
        state.ledger.push(LedgerEntry {
            id: Uuid::new_v4(),
            account_id,
            amount,
            kind,
            description: description.to_string(),
            payment_gateway: payment.map(|p| p.gateway.clone()),
            external_payment_id: payment.map(|p| p.external_id.clone()),
            created_at: Utc::now(),
        });
        Ok(CreditOutcome::Applied { balance })
    }

    async fn balance(&self, account_id: Uuid) -> Result<Option<i64>, AppError> {
        Ok(self
            .state
            .lock()
            .await
            .accounts
            .get(&account_id)
            .map(|a| a.credits))
    }

    async fn ledger_entries(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .iter()
            .rev()
            .filter(|e| e.account_id == account_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn payment_entry(&self, payment: &PaymentRef) -> Result<Option<LedgerEntry>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .iter()
            .find(|e| {
                e.payment_gateway.as_deref() == Some(payment.gateway.as_str())
                    && e.external_payment_id.as_deref() == Some(payment.external_id.as_str())
            })
            .cloned())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn insert_or_get_active(
        &self,
        item: NewQueueItem,
    ) -> Result<(QueueItem, bool), AppError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.queue.iter().find(|q| {
            q.account_id == item.account_id
                && q.kind == item.kind
                && q.dedup_key == item.dedup_key
                && q.status.is_active()
        }) {
            return Ok((existing.clone(), false));
        }
        let created = QueueItem {
            id: Uuid::new_v4(),
            account_id: item.account_id,
            lead_id: item.lead_id,
            kind: item.kind,
            dedup_key: item.dedup_key,
            payload: item.payload,
            status: QueueStatus::Pending,
            priority: item.priority,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        state.queue.push(created.clone());
        Ok((created, true))
    }

    async fn claim_next(&self) -> Result<Option<QueueItem>, AppError> {
        let mut state = self.state.lock().await;
        // Vec order is insertion order, which breaks created_at ties.
        let next = state
            .queue
            .iter_mut()
            .enumerate()
            .filter(|(_, q)| q.status == QueueStatus::Pending)
            .min_by(|(ia, a), (ib, b)| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(ia.cmp(ib))
            })
            .map(|(_, q)| q);

        Ok(next.map(|item| {
            item.status = QueueStatus::Processing;
            item.started_at = Some(Utc::now());
            item.clone()
        }))
    }

    async fn finish_item(
        &self,
        id: Uuid,
        status: QueueStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Option<QueueItem>, AppError> {
        let mut state = self.state.lock().await;
        let Some(item) = state
            .queue
            .iter_mut()
            .find(|q| q.id == id && q.status.is_active())
        else {
            return Ok(None);
        };
        item.status = status;
        item.result = result;
        item.error = error;
        item.completed_at = Some(Utc::now());
        Ok(Some(item.clone()))
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<QueueItem>, AppError> {
        let state = self.state.lock().await;
        Ok(state.queue.iter().find(|q| q.id == id).cloned())
    }

    async fn queue_counts(&self, account_id: Option<Uuid>) -> Result<QueueStatusCounts, AppError> {
        let state = self.state.lock().await;
        let scoped = state
            .queue
            .iter()
            .filter(|q| account_id.map_or(true, |id| q.account_id == id));
        let (mut pending, mut processing) = (0, 0);
        for item in scoped {
            match item.status {
                QueueStatus::Pending => pending += 1,
                QueueStatus::Processing => processing += 1,
                _ => {}
            }
        }
        Ok(QueueStatusCounts {
            pending,
            processing,
            total_waiting: pending + processing,
        })
    }

    async fn delete_finished_before(
        &self,
        status: QueueStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut state = self.state.lock().await;
        let before = state.queue.len();
        state.queue.retain(|q| {
            !(q.status == status && q.completed_at.map_or(false, |at| at < cutoff))
        });
        Ok((before - state.queue.len()) as u64)
    }
}

#[async_trait]
impl LeadStore for MemoryStore {
    async fn upsert_lead(
        &self,
        business_id: &str,
        discovered: &DiscoveredLead,
    ) -> Result<Lead, AppError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .leads
            .values_mut()
            .find(|l| l.business_id.as_deref() == Some(business_id))
        {
            merge_discovered(existing, discovered);
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let lead = Lead {
            id: Uuid::new_v4(),
            business_id: Some(business_id.to_string()),
            name: discovered.name.clone(),
            address: discovered.address.clone(),
            maps_phone: discovered.maps_phone.clone(),
            owner_person_id: discovered.owner_person_id.clone(),
            enrichment: merge_enrichment(
                &json!({}),
                discovered.enrichment.as_ref().unwrap_or(&Value::Null),
            ),
            cache_entry_id: None,
            first_seen_at: now,
            last_touched_at: now,
        };
        state.leads.insert(lead.id, lead.clone());
        Ok(lead)
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, AppError> {
        Ok(self.state.lock().await.leads.get(&id).cloned())
    }

    async fn find_lead_by_business_id(&self, business_id: &str) -> Result<Option<Lead>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .leads
            .values()
            .find(|l| l.business_id.as_deref() == Some(business_id))
            .cloned())
    }

    async fn merge_lead_enrichment(
        &self,
        id: Uuid,
        patch: &Value,
    ) -> Result<Option<Lead>, AppError> {
        let mut state = self.state.lock().await;
        Ok(state.leads.get_mut(&id).map(|lead| {
            lead.enrichment = merge_enrichment(&lead.enrichment, patch);
            lead.last_touched_at = Utc::now();
            lead.clone()
        }))
    }

    async fn leads_by_cache_entry(&self, entry_id: Uuid) -> Result<Vec<Lead>, AppError> {
        let state = self.state.lock().await;
        let mut leads: Vec<Lead> = state
            .leads
            .values()
            .filter(|l| l.cache_entry_id == Some(entry_id))
            .cloned()
            .collect();
        leads.sort_by_key(|l| l.first_seen_at);
        Ok(leads)
    }

    async fn associate_leads(&self, entry_id: Uuid, lead_ids: &[Uuid]) -> Result<u64, AppError> {
        let mut state = self.state.lock().await;
        let mut updated = 0;
        for id in lead_ids {
            if let Some(lead) = state.leads.get_mut(id) {
                if lead.cache_entry_id.is_none() {
                    lead.cache_entry_id = Some(entry_id);
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }
}

#[async_trait]
impl AccessStore for MemoryStore {
    async fn insert_or_get_access(
        &self,
        account_id: Uuid,
        lead_id: Uuid,
        search_id: Option<Uuid>,
        renew_before: Option<DateTime<Utc>>,
    ) -> Result<AccessGrant, AppError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .access
            .iter_mut()
            .find(|r| r.account_id == account_id && r.lead_id == lead_id)
        {
            if let Some(cutoff) = renew_before {
                if existing.last_accessed_at < cutoff {
                    let previous = existing.last_accessed_at;
                    existing.last_accessed_at = Utc::now();
                    existing.credits_paid = 1;
                    if search_id.is_some() {
                        existing.search_id = search_id;
                    }
                    return Ok(AccessGrant {
                        record: existing.clone(),
                        is_new: true,
                        renewed_from: Some(previous),
                    });
                }
            }
            return Ok(AccessGrant {
                record: existing.clone(),
                is_new: false,
                renewed_from: None,
            });
        }

        let now = Utc::now();
        let record = AccessRecord {
            id: Uuid::new_v4(),
            account_id,
            lead_id,
            search_id,
            credits_paid: 1,
            first_accessed_at: now,
            last_accessed_at: now,
            enrichment_unlocked_at: None,
        };
        state.access.push(record.clone());
        Ok(AccessGrant {
            record,
            is_new: true,
            renewed_from: None,
        })
    }

    async fn revoke_access(&self, grant: &AccessGrant) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        let Some(pos) = state.access.iter().position(|r| {
            r.id == grant.record.id && r.last_accessed_at == grant.record.last_accessed_at
        }) else {
            return Ok(false);
        };
        match grant.renewed_from {
            None => {
                if state.access[pos].enrichment_unlocked_at.is_some() {
                    return Ok(false);
                }
                state.access.remove(pos);
            }
            Some(previous) => state.access[pos].last_accessed_at = previous,
        }
        Ok(true)
    }

    async fn mark_access_unpaid(&self, access_id: Uuid) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.access.iter_mut().find(|r| r.id == access_id) {
            record.credits_paid = 0;
        }
        Ok(())
    }

    async fn get_access(
        &self,
        account_id: Uuid,
        lead_id: Uuid,
    ) -> Result<Option<AccessRecord>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .access
            .iter()
            .find(|r| r.account_id == account_id && r.lead_id == lead_id)
            .cloned())
    }

    async fn accesses_for_leads(
        &self,
        account_id: Uuid,
        lead_ids: &[Uuid],
    ) -> Result<Vec<AccessRecord>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .access
            .iter()
            .filter(|r| r.account_id == account_id && lead_ids.contains(&r.lead_id))
            .cloned()
            .collect())
    }

    async fn stamp_unlock(&self, access_id: Uuid) -> Result<Option<AccessRecord>, AppError> {
        let mut state = self.state.lock().await;
        Ok(state
            .access
            .iter_mut()
            .find(|r| r.id == access_id && r.enrichment_unlocked_at.is_none())
            .map(|record| {
                record.enrichment_unlocked_at = Some(Utc::now());
                record.clone()
            }))
    }

    async fn clear_unlock(
        &self,
        access_id: Uuid,
        stamped_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        match state
            .access
            .iter_mut()
            .find(|r| r.id == access_id && r.enrichment_unlocked_at == Some(stamped_at))
        {
            Some(record) => {
                record.enrichment_unlocked_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl CacheIndexStore for MemoryStore {
    async fn find_cache_entry(
        &self,
        niche_key: &str,
        location_key: &str,
    ) -> Result<Option<CacheIndexEntry>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .cache_entries
            .iter()
            .find(|e| e.niche_key == niche_key && e.location_key == location_key)
            .cloned())
    }

    async fn insert_or_get_cache_entry(
        &self,
        niche_key: &str,
        location_key: &str,
    ) -> Result<CacheIndexEntry, AppError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .cache_entries
            .iter()
            .find(|e| e.niche_key == niche_key && e.location_key == location_key)
        {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let entry = CacheIndexEntry {
            id: Uuid::new_v4(),
            niche_key: niche_key.to_string(),
            location_key: location_key.to_string(),
            lead_count: 0,
            created_at: now,
            updated_at: now,
        };
        state.cache_entries.push(entry.clone());
        Ok(entry)
    }

    async fn refresh_cache_count(
        &self,
        entry_id: Uuid,
    ) -> Result<Option<CacheIndexEntry>, AppError> {
        let mut state = self.state.lock().await;
        let count = state
            .leads
            .values()
            .filter(|l| l.cache_entry_id == Some(entry_id))
            .count() as i64;
        Ok(state
            .cache_entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .map(|entry| {
                entry.lead_count = count;
                entry.updated_at = Utc::now();
                entry.clone()
            }))
    }
}

#[async_trait]
impl SearchStore for MemoryStore {
    async fn insert_search(
        &self,
        account_id: Uuid,
        niche: &str,
        location: &str,
        quantity: i32,
    ) -> Result<SearchRequest, AppError> {
        let now = Utc::now();
        let search = SearchRequest {
            id: Uuid::new_v4(),
            account_id,
            niche: niche.to_string(),
            location: location.to_string(),
            quantity,
            status: SearchStatus::Processing,
            results_count: 0,
            credits_used: 0,
            summary: json!({}),
            error: None,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
        };
        self.state
            .lock()
            .await
            .searches
            .insert(search.id, search.clone());
        Ok(search)
    }

    async fn get_search(&self, id: Uuid) -> Result<Option<SearchRequest>, AppError> {
        Ok(self.state.lock().await.searches.get(&id).cloned())
    }

    async fn list_searches(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<SearchRequest>, AppError> {
        let state = self.state.lock().await;
        let mut searches: Vec<SearchRequest> = state
            .searches
            .values()
            .filter(|s| s.account_id == account_id)
            .cloned()
            .collect();
        searches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        searches.truncate(limit.max(0) as usize);
        Ok(searches)
    }

    async fn finish_search(
        &self,
        id: Uuid,
        status: SearchStatus,
        outcome: &SearchOutcome,
    ) -> Result<Option<SearchRequest>, AppError> {
        let mut state = self.state.lock().await;
        let Some(search) = state
            .searches
            .get_mut(&id)
            .filter(|s| !s.status.is_terminal())
        else {
            return Ok(None);
        };
        search.status = status;
        search.results_count = outcome.results_count;
        search.credits_used = outcome.credits_used;
        search.summary = outcome.summary.clone();
        search.error = outcome.error.clone();
        search.completed_at = Some(Utc::now());
        Ok(Some(search.clone()))
    }

    async fn link_search_lead(&self, search_id: Uuid, lead_id: Uuid) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if !state.search_leads.contains(&(search_id, lead_id)) {
            state.search_leads.push((search_id, lead_id));
        }
        Ok(())
    }

    async fn search_leads(&self, search_id: Uuid) -> Result<Vec<Lead>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .search_leads
            .iter()
            .filter(|(s, _)| *s == search_id)
            .filter_map(|(_, lead_id)| state.leads.get(lead_id).cloned())
            .collect())
    }

    async fn delete_search(&self, id: Uuid, account_id: Uuid) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        let deletable = state
            .searches
            .get(&id)
            .map_or(false, |s| s.account_id == account_id && s.status.is_terminal());
        if !deletable {
            return Ok(false);
        }
        state.searches.remove(&id);
        state.search_leads.retain(|(s, _)| *s != id);
        for record in state.access.iter_mut().filter(|r| r.search_id == Some(id)) {
            record.search_id = None;
        }
        Ok(true)
    }
}
