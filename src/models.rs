use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::documents::digits_only;

// ============ Enumerations ============

/// Kind of balance change recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "ledger_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Purchase,
    Usage,
    Refund,
}

/// Lifecycle of a search request. Records are created directly in `Processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "search_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SearchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SearchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SearchStatus::Completed | SearchStatus::Failed)
    }
}

/// Lifecycle of a queue item: pending -> processing -> completed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "queue_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    /// Active items participate in single-flight de-duplication.
    pub fn is_active(self) -> bool {
        matches!(self, QueueStatus::Pending | QueueStatus::Processing)
    }
}

/// The external call a queue item stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "request_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Ownership records from the session-authenticated partners API.
    Partners,
    /// Public registry profile: phones, emails, registered addresses.
    CompanyProfile,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Partners => "partners",
            RequestKind::CompanyProfile => "company_profile",
        }
    }

    /// Extracts the payload field that identifies the request for de-duplication.
    ///
    /// Both kinds are keyed by the CNPJ, reduced to digits so formatting
    /// differences cannot defeat single-flight.
    pub fn dedup_key(self, payload: &Value) -> Option<String> {
        let raw = payload.get("cnpj")?.as_str()?;
        let digits = digits_only(raw);
        if digits.is_empty() {
            None
        } else {
            Some(digits)
        }
    }
}

// ============ Database Models ============

/// A user's credit-bearing identity.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    /// Identity reference from the external auth system.
    pub external_ref: String,
    pub email: String,
    /// Never negative; mutated only through the ledger.
    pub credits: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable record of one balance change.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    /// Positive for credits, negative for debits.
    pub amount: i64,
    pub kind: LedgerKind,
    pub description: String,
    pub payment_gateway: Option<String>,
    pub external_payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Correlates a credit with the external payment that funded it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentRef {
    pub gateway: String,
    pub external_id: String,
}

/// A globally shared, deduplicated company record.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    /// CNPJ digits. At most one lead exists per non-null value.
    pub business_id: Option<String>,
    pub name: String,
    pub address: Option<String>,
    /// Phone as listed on the maps result.
    pub maps_phone: Option<String>,
    /// CPF of the owner, for person-centric lookups.
    pub owner_person_id: Option<String>,
    /// Opaque enrichment blob. Never leaves the crate without `leads::sanitize_for_account`.
    #[serde(skip_serializing)]
    pub enrichment: Value,
    pub cache_entry_id: Option<Uuid>,
    pub first_seen_at: DateTime<Utc>,
    pub last_touched_at: DateTime<Utc>,
}

/// Fields observed about a company by a search or lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveredLead {
    pub name: String,
    pub address: Option<String>,
    pub maps_phone: Option<String>,
    pub owner_person_id: Option<String>,
    pub enrichment: Option<Value>,
}

/// Paywall join between an account and a lead.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AccessRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub lead_id: Uuid,
    pub search_id: Option<Uuid>,
    /// 1 when paid for, 0 when a debit could not be reconciled.
    pub credits_paid: i32,
    pub first_accessed_at: DateTime<Utc>,
    /// Last time the lead was charged to this account; drives retention reuse.
    pub last_accessed_at: DateTime<Utc>,
    pub enrichment_unlocked_at: Option<DateTime<Utc>>,
}

/// Result of `grant_access`.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub record: AccessRecord,
    /// True when the caller must debit for this grant.
    pub is_new: bool,
    /// Previous charge time when a stale record was renewed.
    pub renewed_from: Option<DateTime<Utc>>,
}

/// One user-initiated search.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SearchRequest {
    pub id: Uuid,
    pub account_id: Uuid,
    pub niche: String,
    pub location: String,
    pub quantity: i32,
    pub status: SearchStatus,
    pub results_count: i32,
    pub credits_used: i64,
    pub summary: Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Final figures written when a search reaches a terminal state.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub results_count: i32,
    pub credits_used: i64,
    pub summary: Value,
    pub error: Option<String>,
}

/// Canonical (niche, location) key and its running lead count.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CacheIndexEntry {
    pub id: Uuid,
    pub niche_key: String,
    pub location_key: String,
    pub lead_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One unit of work against the fragile enrichment API.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub account_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub kind: RequestKind,
    pub dedup_key: String,
    pub payload: Value,
    pub status: QueueStatus,
    pub priority: i32,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub account_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub kind: RequestKind,
    pub dedup_key: String,
    pub payload: Value,
    pub priority: i32,
}

/// Snapshot of the queue as seen by one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub total_waiting: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub completed_deleted: u64,
    pub failed_deleted: u64,
}

// ============ External Data ============

/// A maps-search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Place {
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
}

// ============ API Views & Requests ============

/// What an account is allowed to see of a lead.
#[derive(Debug, Clone, Serialize)]
pub struct LeadView {
    pub id: Uuid,
    pub business_id: Option<String>,
    pub name: String,
    pub address: Option<String>,
    pub maps_phone: Option<String>,
    pub owner_person_id: Option<String>,
    pub enrichment: Value,
    pub enrichment_unlocked: bool,
    pub first_seen_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSearchRequest {
    pub niche: String,
    pub location: String,
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct CompanyLookupRequest {
    pub cnpj: String,
}

#[derive(Debug, Deserialize)]
pub struct PersonLookupRequest {
    pub cpf: String,
}

#[derive(Debug, Serialize)]
pub struct CompanyLookupResponse {
    pub lead: LeadView,
    pub charged: bool,
    /// Partners request that may still complete after the response.
    pub queue_item_id: Option<Uuid>,
    pub partners_ready: bool,
}

#[derive(Debug, Serialize)]
pub struct PersonLookupResponse {
    pub cpf: String,
    pub data: Value,
    pub balance: i64,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub balance: i64,
    pub entries: Vec<LedgerEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}
