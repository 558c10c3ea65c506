//! Storage seams.
//!
//! Every method that guards an invariant performs its check and its mutation
//! as one atomic operation of the backing store: a conditional `UPDATE` or an
//! `INSERT .. ON CONFLICT` in Postgres, a single critical section in memory.
//! Callers never read-then-write across two calls to enforce a rule.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::*;

/// Outcome of a conditional debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    Applied { balance: i64 },
    /// The conditional update matched no row; `balance` is re-read afterwards.
    Insufficient { balance: i64 },
    AccountMissing,
}

/// Outcome of a credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    Applied { balance: i64 },
    /// An entry for the same (gateway, external id) already exists. Nothing changed.
    DuplicatePayment,
    AccountMissing,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, AppError>;

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, AppError>;

    /// Returns the account for `external_ref`, creating it with a zero balance.
    async fn get_or_create_account(
        &self,
        external_ref: &str,
        email: &str,
    ) -> Result<Account, AppError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Decrements the balance only if it stays non-negative, and appends a usage entry.
    async fn apply_debit(
        &self,
        account_id: Uuid,
        amount: i64,
        description: &str,
    ) -> Result<DebitOutcome, AppError>;

    /// Increments the balance and appends an entry of `kind`.
    async fn apply_credit(
        &self,
        account_id: Uuid,
        amount: i64,
        kind: LedgerKind,
        description: &str,
        payment: Option<&PaymentRef>,
    ) -> Result<CreditOutcome, AppError>;

    async fn balance(&self, account_id: Uuid) -> Result<Option<i64>, AppError>;

    /// Newest first.
    async fn ledger_entries(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, AppError>;

    async fn payment_entry(&self, payment: &PaymentRef) -> Result<Option<LedgerEntry>, AppError>;
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Inserts the item unless an active item with the same
    /// (account, kind, dedup key) exists, in which case that one is returned.
    async fn insert_or_get_active(
        &self,
        item: NewQueueItem,
    ) -> Result<(QueueItem, bool), AppError>;

    /// Moves the highest-priority, oldest pending item to processing.
    /// Items locked by another consumer are skipped.
    async fn claim_next(&self) -> Result<Option<QueueItem>, AppError>;

    /// Moves an active item to a terminal status. `None` if it was not active.
    async fn finish_item(
        &self,
        id: Uuid,
        status: QueueStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Option<QueueItem>, AppError>;

    async fn get_item(&self, id: Uuid) -> Result<Option<QueueItem>, AppError>;

    async fn queue_counts(&self, account_id: Option<Uuid>) -> Result<QueueStatusCounts, AppError>;

    /// Deletes items in `status` completed before `cutoff`.
    async fn delete_finished_before(
        &self,
        status: QueueStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, AppError>;
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Creates the lead for `business_id` or merges `discovered` into the existing one.
    /// Populated fields are never replaced; enrichment keys are only added.
    async fn upsert_lead(
        &self,
        business_id: &str,
        discovered: &DiscoveredLead,
    ) -> Result<Lead, AppError>;

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, AppError>;

    async fn find_lead_by_business_id(&self, business_id: &str) -> Result<Option<Lead>, AppError>;

    /// Adds top-level enrichment keys that are missing or empty on the lead.
    async fn merge_lead_enrichment(&self, id: Uuid, patch: &Value)
        -> Result<Option<Lead>, AppError>;

    async fn leads_by_cache_entry(&self, entry_id: Uuid) -> Result<Vec<Lead>, AppError>;

    /// Points unassociated leads at `entry_id`. Leads already indexed keep their entry.
    async fn associate_leads(&self, entry_id: Uuid, lead_ids: &[Uuid]) -> Result<u64, AppError>;
}

#[async_trait]
pub trait AccessStore: Send + Sync {
    /// Creates the (account, lead) record, or returns the existing one.
    ///
    /// With `renew_before`, an existing record last charged before that instant
    /// is renewed and reported as new. Only one concurrent caller can win a renewal.
    async fn insert_or_get_access(
        &self,
        account_id: Uuid,
        lead_id: Uuid,
        search_id: Option<Uuid>,
        renew_before: Option<DateTime<Utc>>,
    ) -> Result<AccessGrant, AppError>;

    /// Undoes a grant whose debit failed. Returns false if the record moved on.
    async fn revoke_access(&self, grant: &AccessGrant) -> Result<bool, AppError>;

    /// Flags a grant that stays honored although it was never paid for.
    async fn mark_access_unpaid(&self, access_id: Uuid) -> Result<(), AppError>;

    async fn get_access(
        &self,
        account_id: Uuid,
        lead_id: Uuid,
    ) -> Result<Option<AccessRecord>, AppError>;

    async fn accesses_for_leads(
        &self,
        account_id: Uuid,
        lead_ids: &[Uuid],
    ) -> Result<Vec<AccessRecord>, AppError>;

    /// Stamps the unlock time if unset. `Some` only for the caller that stamped it.
    async fn stamp_unlock(&self, access_id: Uuid) -> Result<Option<AccessRecord>, AppError>;

    /// Clears an unlock stamp, but only if it is still `stamped_at`.
    async fn clear_unlock(&self, access_id: Uuid, stamped_at: DateTime<Utc>)
        -> Result<bool, AppError>;
}

#[async_trait]
pub trait CacheIndexStore: Send + Sync {
    async fn find_cache_entry(
        &self,
        niche_key: &str,
        location_key: &str,
    ) -> Result<Option<CacheIndexEntry>, AppError>;

    async fn insert_or_get_cache_entry(
        &self,
        niche_key: &str,
        location_key: &str,
    ) -> Result<CacheIndexEntry, AppError>;

    /// Recomputes `lead_count` from the associated leads.
    async fn refresh_cache_count(&self, entry_id: Uuid) -> Result<Option<CacheIndexEntry>, AppError>;
}

#[async_trait]
pub trait SearchStore: Send + Sync {
    /// Creates a search already in `processing`.
    async fn insert_search(
        &self,
        account_id: Uuid,
        niche: &str,
        location: &str,
        quantity: i32,
    ) -> Result<SearchRequest, AppError>;

    async fn get_search(&self, id: Uuid) -> Result<Option<SearchRequest>, AppError>;

    async fn list_searches(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<SearchRequest>, AppError>;

    /// Writes a terminal status. Has no effect on a search that is already terminal.
    async fn finish_search(
        &self,
        id: Uuid,
        status: SearchStatus,
        outcome: &SearchOutcome,
    ) -> Result<Option<SearchRequest>, AppError>;

    async fn link_search_lead(&self, search_id: Uuid, lead_id: Uuid) -> Result<(), AppError>;

    async fn search_leads(&self, search_id: Uuid) -> Result<Vec<Lead>, AppError>;

    /// Deletes a terminal search owned by `account_id`.
    async fn delete_search(&self, id: Uuid, account_id: Uuid) -> Result<bool, AppError>;
}

/// Everything the service persists.
pub trait Store:
    AccountStore + LedgerStore + QueueStore + LeadStore + AccessStore + CacheIndexStore + SearchStore
{
}

impl<T> Store for T where
    T: AccountStore
        + LedgerStore
        + QueueStore
        + LeadStore
        + AccessStore
        + CacheIndexStore
        + SearchStore
{
}

/// Enrichment value recorded when an upstream lookup found nothing.
///
/// Marks the key as looked up so it is not queued again. A later real
/// record replaces it.
pub fn lookup_miss() -> Value {
    serde_json::json!({ "found": false })
}

fn is_lookup_miss(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.len() == 1 && map.get("found") == Some(&Value::Bool(false)),
        _ => false,
    }
}

/// Additive merge of top-level enrichment keys.
///
/// Keys already holding a non-empty value on `existing` are kept; missing,
/// null, empty-string, empty-array and empty-object values are filled from
/// `patch`, and so is a [`lookup_miss`] marker. Non-object inputs are
/// treated as empty.
pub fn merge_enrichment(existing: &Value, patch: &Value) -> Value {
    let mut merged = match existing {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };

    if let Value::Object(incoming) = patch {
        for (key, value) in incoming {
            if is_empty_value(value) {
                continue;
            }
            let keep_existing = merged
                .get(key)
                .map(|v| !is_empty_value(v) && !is_lookup_miss(v))
                .unwrap_or(false);
            if !keep_existing {
                merged.insert(key.clone(), value.clone());
            }
        }
    }

    Value::Object(merged)
}

pub(crate) fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Keeps `current` unless it is empty, then takes a non-empty `candidate`.
pub(crate) fn fill_blank(current: &Option<String>, candidate: &Option<String>) -> Option<String> {
    match current {
        Some(value) if !value.trim().is_empty() => Some(value.clone()),
        _ => candidate
            .as_ref()
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .or_else(|| current.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_never_overwrites_known_keys() {
        let existing = json!({"razao_social": "ACME LTDA", "telefones": []});
        let patch = json!({"razao_social": "", "telefones": ["11999990000"], "emails": ["a@b.com"]});
        let merged = merge_enrichment(&existing, &patch);
        assert_eq!(merged["razao_social"], "ACME LTDA");
        assert_eq!(merged["telefones"], json!(["11999990000"]));
        assert_eq!(merged["emails"], json!(["a@b.com"]));
    }

    #[test]
    fn lookup_miss_is_kept_until_a_record_arrives() {
        let missed = merge_enrichment(&json!({}), &json!({"registry": lookup_miss()}));
        assert_eq!(missed, json!({"registry": {"found": false}}));

        let again = merge_enrichment(&missed, &json!({"registry": lookup_miss()}));
        assert_eq!(again, missed);

        let found = merge_enrichment(&again, &json!({"registry": {"razao_social": "ACME LTDA"}}));
        assert_eq!(found["registry"]["razao_social"], "ACME LTDA");
        assert!(found["registry"].get("found").is_none());
    }

    #[test]
    fn merge_tolerates_non_objects() {
        assert_eq!(merge_enrichment(&json!("junk"), &json!(null)), json!({}));
        assert_eq!(merge_enrichment(&json!(null), &json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn fill_blank_prefers_populated_value() {
        let known = Some("Rua A".to_string());
        assert_eq!(fill_blank(&known, &Some("Rua B".to_string())), known);
        assert_eq!(fill_blank(&None, &Some("Rua B".to_string())).as_deref(), Some("Rua B"));
        assert_eq!(fill_blank(&Some(" ".to_string()), &None).as_deref(), Some(" "));
        assert_eq!(fill_blank(&None, &Some("".to_string())), None);
    }
}
