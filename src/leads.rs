//! Global lead store and the per-account paywall.
//!
//! Leads are shared by every account. What an account may see of a lead is
//! decided by its `AccessRecord`, and every lead leaving this module goes
//! through [`sanitize_for_account`].

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::documents::digits_only;
use crate::errors::AppError;
use crate::ledger::Ledger;
use crate::models::{AccessGrant, AccessRecord, DiscoveredLead, Lead, LeadView};
use crate::normalize::normalize_niche;
use crate::store::Store;

/// Key fragments that mark contact, address or ownership data.
const SENSITIVE_MARKERS: [&str; 24] = [
    "telefone", "phone", "fone", "celular", "whatsapp", "tel", "fax", "ddd", "email", "mail",
    "endereco", "address", "logradouro", "numero", "bairro", "cep", "complemento", "socio",
    "partner", "qsa", "cpf", "owner", "responsavel", "contato",
];

/// Values carrying this many digits are treated as phone numbers.
const PHONE_MIN_DIGITS: usize = 10;

/// Result of an unlock purchase.
#[derive(Debug, Clone)]
pub struct UnlockOutcome {
    pub record: AccessRecord,
    /// False when the lead was already unlocked.
    pub charged: bool,
    pub balance: Option<i64>,
}

#[derive(Clone)]
pub struct LeadTracker {
    store: Arc<dyn Store>,
    ledger: Ledger,
}

impl LeadTracker {
    pub fn new(store: Arc<dyn Store>, ledger: Ledger) -> Self {
        Self { store, ledger }
    }

    /// Returns the canonical lead for `business_id`, creating it or filling
    /// in blanks from `discovered`.
    ///
    /// Safe under concurrent callers: storage holds a uniqueness constraint on
    /// the identifier and conflicting inserts resolve to the existing row.
    pub async fn find_or_create_lead(
        &self,
        business_id: &str,
        discovered: &DiscoveredLead,
    ) -> Result<Lead, AppError> {
        let business_id = digits_only(business_id);
        if business_id.is_empty() {
            return Err(AppError::BadRequest(
                "business identifier must contain digits".to_string(),
            ));
        }
        self.store.upsert_lead(&business_id, discovered).await
    }

    /// Grants `account_id` access to `lead_id`.
    ///
    /// Idempotent per (account, lead). With `retention`, a record last charged
    /// longer ago than the window is renewed and reported as new, so the
    /// caller charges for it again. The caller debits exactly when
    /// `grant.is_new`.
    pub async fn grant_access(
        &self,
        account_id: Uuid,
        lead_id: Uuid,
        search_id: Option<Uuid>,
        retention: Option<chrono::Duration>,
    ) -> Result<AccessGrant, AppError> {
        let renew_before = retention.map(|window| Utc::now() - window);
        self.store
            .insert_or_get_access(account_id, lead_id, search_id, renew_before)
            .await
    }

    /// Reverses a grant whose debit failed.
    ///
    /// When the record cannot be reverted it stays honored and is flagged
    /// with `credits_paid = 0` for reconciliation.
    pub async fn revoke_grant(&self, grant: &AccessGrant) -> Result<(), AppError> {
        if self.store.revoke_access(grant).await? {
            tracing::debug!(
                "Revoked unpaid access {} to lead {}",
                grant.record.id,
                grant.record.lead_id
            );
            return Ok(());
        }
        tracing::warn!(
            "Access {} to lead {} could not be revoked; keeping it as unpaid",
            grant.record.id,
            grant.record.lead_id
        );
        self.store.mark_access_unpaid(grant.record.id).await
    }

    /// Stamps the enrichment unlock time. Idempotent.
    pub async fn unlock_enrichment(&self, access: &AccessRecord) -> Result<AccessRecord, AppError> {
        if access.enrichment_unlocked_at.is_some() {
            return Ok(access.clone());
        }
        if let Some(stamped) = self.store.stamp_unlock(access.id).await? {
            return Ok(stamped);
        }
        self.store
            .get_access(access.account_id, access.lead_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("access record {} not found", access.id)))
    }

    /// Charges `cost` credits to reveal a lead's enrichment data.
    ///
    /// Requires prior access. Concurrent calls charge at most once: only the
    /// caller that stamps the unlock pays, and a failed debit clears its stamp.
    pub async fn purchase_unlock(
        &self,
        account_id: Uuid,
        lead: &Lead,
        cost: i64,
    ) -> Result<UnlockOutcome, AppError> {
        let access = self
            .store
            .get_access(account_id, lead.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no access to lead {}", lead.id)))?;

        if access.enrichment_unlocked_at.is_some() {
            return Ok(UnlockOutcome {
                record: access,
                charged: false,
                balance: None,
            });
        }

        let Some(stamped) = self.store.stamp_unlock(access.id).await? else {
            // Another request stamped it first.
            let record = self.unlock_enrichment(&access).await?;
            return Ok(UnlockOutcome {
                record,
                charged: false,
                balance: None,
            });
        };

        let description = format!("Unlock: {}", lead.name);
        match self.ledger.debit(account_id, cost, &description).await {
            Ok(balance) => Ok(UnlockOutcome {
                record: stamped,
                charged: true,
                balance: Some(balance),
            }),
            Err(err) => {
                if let Some(stamped_at) = stamped.enrichment_unlocked_at {
                    self.store.clear_unlock(stamped.id, stamped_at).await?;
                }
                Err(err.into())
            }
        }
    }

    /// Filters `candidates` down to leads `account_id` never accessed, or last
    /// accessed longer ago than `retention`.
    ///
    /// Never-seen leads come first in their original order, followed by stale
    /// ones, oldest access first.
    pub async fn leads_unseen_by(
        &self,
        account_id: Uuid,
        candidates: Vec<Lead>,
        retention: chrono::Duration,
    ) -> Result<Vec<Lead>, AppError> {
        let ids: Vec<Uuid> = candidates.iter().map(|l| l.id).collect();
        let seen: HashMap<Uuid, DateTime<Utc>> = self
            .store
            .accesses_for_leads(account_id, &ids)
            .await?
            .into_iter()
            .map(|r| (r.lead_id, r.last_accessed_at))
            .collect();

        let cutoff = Utc::now() - retention;
        let mut never_seen = Vec::new();
        let mut stale = Vec::new();
        for lead in candidates {
            match seen.get(&lead.id) {
                None => never_seen.push(lead),
                Some(at) if *at < cutoff => stale.push((*at, lead)),
                Some(_) => {}
            }
        }
        stale.sort_by_key(|(at, _)| *at);

        never_seen.extend(stale.into_iter().map(|(_, lead)| lead));
        Ok(never_seen)
    }

    /// Sanitized views of `leads` as `account_id` may see them.
    pub async fn views_for_account(
        &self,
        account_id: Uuid,
        leads: &[Lead],
    ) -> Result<Vec<LeadView>, AppError> {
        let ids: Vec<Uuid> = leads.iter().map(|l| l.id).collect();
        let access: HashMap<Uuid, AccessRecord> = self
            .store
            .accesses_for_leads(account_id, &ids)
            .await?
            .into_iter()
            .map(|r| (r.lead_id, r))
            .collect();

        Ok(leads
            .iter()
            .map(|lead| sanitize_for_account(lead, access.get(&lead.id)))
            .collect())
    }
}

/// Builds the view of `lead` that `access` entitles its account to.
///
/// Without an unlock stamp every contact, address and ownership field is
/// removed from the enrichment data, at any depth, and the owner identifier
/// is withheld. Values are screened too: anything shaped like an email or
/// carrying a phone-length run of digits is dropped whatever its key.
/// Malformed enrichment blobs degrade to an empty object.
pub fn sanitize_for_account(lead: &Lead, access: Option<&AccessRecord>) -> LeadView {
    let unlocked = access
        .map(|a| a.enrichment_unlocked_at.is_some())
        .unwrap_or(false);

    let (enrichment, owner_person_id) = if unlocked {
        (lead.enrichment.clone(), lead.owner_person_id.clone())
    } else {
        let stripped = match &lead.enrichment {
            Value::Object(map) => Value::Object(strip_object(map)),
            _ => Value::Object(Map::new()),
        };
        (stripped, None)
    };

    LeadView {
        id: lead.id,
        business_id: lead.business_id.clone(),
        name: lead.name.clone(),
        address: lead.address.clone(),
        maps_phone: lead.maps_phone.clone(),
        owner_person_id,
        enrichment,
        enrichment_unlocked: unlocked,
        first_seen_at: lead.first_seen_at,
    }
}

/// True when a key names contact, address or ownership data.
pub fn is_sensitive_key(key: &str) -> bool {
    let folded: String = normalize_niche(key)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    SENSITIVE_MARKERS.iter().any(|marker| folded.contains(marker))
}

fn strip_object(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter(|(key, _)| !is_sensitive_key(key))
        .filter_map(|(key, value)| strip_value(value).map(|v| (key.clone(), v)))
        .collect()
}

fn strip_value(value: &Value) -> Option<Value> {
    match value {
        Value::Object(map) => Some(Value::Object(strip_object(map))),
        Value::Array(items) => Some(Value::Array(items.iter().filter_map(strip_value).collect())),
        Value::String(s) if looks_like_contact(s) => None,
        Value::Number(n) if looks_like_contact(&n.to_string()) => None,
        other => Some(other.clone()),
    }
}

/// True for email-shaped text or text holding at least a phone's worth of digits.
pub fn looks_like_contact(text: &str) -> bool {
    text.contains('@') || digits_only(text).len() >= PHONE_MIN_DIGITS
}
