//! Postgres implementation of the storage traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::{FromRow, PgPool, Row};
use uuid::Uuid;

use crate::errors::{AppError, ResultExt};
use crate::models::*;
use crate::store::*;

/// Attempts for insert-or-fetch loops that can lose a race twice in a row
/// (the conflicting row disappears between the insert and the fetch).
const CONFLICT_RETRIES: usize = 3;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl AccountStore for PgStore {
    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE lower(email) = lower($1) ORDER BY created_at ASC LIMIT 1",
        )
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn get_or_create_account(
        &self,
        external_ref: &str,
        email: &str,
    ) -> Result<Account, AppError> {
        let inserted = sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (id, external_ref, email)
            VALUES ($1, $2, $3)
            ON CONFLICT (external_ref) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(external_ref)
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .context("creating account")?;

        if let Some(account) = inserted {
            tracing::info!("Created account {} for {}", account.id, external_ref);
            return Ok(account);
        }

        let account =
            sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE external_ref = $1")
                .bind(external_ref)
                .fetch_one(&self.pool)
                .await
                .context("loading account after conflict")?;
        Ok(account)
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn apply_debit(
        &self,
        account_id: Uuid,
        amount: i64,
        description: &str,
    ) -> Result<DebitOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        // Check and decrement in one statement; concurrent debits serialize on the row.
        let balance: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE accounts
            SET credits = credits - $2, updated_at = now()
            WHERE id = $1 AND credits >= $2
            RETURNING credits
            "#,
        )
        .bind(account_id)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(balance) = balance else {
            tx.rollback().await?;
            let current: Option<i64> =
                sqlx::query_scalar("SELECT credits FROM accounts WHERE id = $1")
                    .bind(account_id)
                    .fetch_optional(&self.pool)
                    .await?;
            return Ok(match current {
                Some(balance) => DebitOutcome::Insufficient { balance },
                None => DebitOutcome::AccountMissing,
            });
        };

        sqlx::query(
            r#"
            INSERT INTO ledger_entries (id, account_id, amount, kind, description)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(-amount)
        .bind(LedgerKind::Usage)
        .bind(description)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;

        let balance: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE accounts
            SET credits = credits + $2, updated_at = now()
            WHERE id = $1
            RETURNING credits
            "#,
        )
        .bind(account_id)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(balance) = balance else {
            tx.rollback().await?;
            return Ok(CreditOutcome::AccountMissing);
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO ledger_entries
                (id, account_id, amount, kind, description, payment_gateway, external_payment_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(amount)
        .bind(kind)
        .bind(description)
        .bind(payment.map(|p| p.gateway.as_str()))
        .bind(payment.map(|p| p.external_id.as_str()))
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await?;
                Ok(CreditOutcome::Applied { balance })
            }
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                Ok(CreditOutcome::DuplicatePayment)
            }
            Err(e) => Err(AppError::DatabaseError(e)),
        }
    }

    async fn balance(&self, account_id: Uuid) -> Result<Option<i64>, AppError> {
        let balance = sqlx::query_scalar("SELECT credits FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(balance)
    }

    async fn ledger_entries(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, AppError> {
        let entries = sqlx::query_as::<_, LedgerEntry>(
            "SELECT * FROM ledger_entries WHERE account_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn payment_entry(&self, payment: &PaymentRef) -> Result<Option<LedgerEntry>, AppError> {
        let entry = sqlx::query_as::<_, LedgerEntry>(
            "SELECT * FROM ledger_entries WHERE payment_gateway = $1 AND external_payment_id = $2",
        )
        .bind(&payment.gateway)
        .bind(&payment.external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }
}

#[async_trait]
impl QueueStore for PgStore {
    async fn insert_or_get_active(
        &self,
        item: NewQueueItem,
    ) -> Result<(QueueItem, bool), AppError> {
        for _ in 0..CONFLICT_RETRIES {
            let inserted = sqlx::query_as::<_, QueueItem>(
                r#"
                INSERT INTO queue_items (id, account_id, lead_id, kind, dedup_key, payload, priority)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (account_id, kind, dedup_key)
                    WHERE status IN ('pending', 'processing')
                    DO NOTHING
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(item.account_id)
            .bind(item.lead_id)
            .bind(item.kind)
            .bind(&item.dedup_key)
            .bind(&item.payload)
            .bind(item.priority)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(created) = inserted {
                return Ok((created, true));
            }

            let existing = sqlx::query_as::<_, QueueItem>(
                r#"
                SELECT * FROM queue_items
                WHERE account_id = $1 AND kind = $2 AND dedup_key = $3
                  AND status IN ('pending', 'processing')
                LIMIT 1
                "#,
            )
            .bind(item.account_id)
            .bind(item.kind)
            .bind(&item.dedup_key)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(existing) = existing {
                return Ok((existing, false));
            }
            // The active item finished between the two statements; try again.
        }

        Err(AppError::InternalError(format!(
            "could not enqueue {} request for key {}",
            item.kind.as_str(),
            item.dedup_key
        )))
    }

    async fn claim_next(&self) -> Result<Option<QueueItem>, AppError> {
        let item = sqlx::query_as::<_, QueueItem>(
            r#"
            UPDATE queue_items
            SET status = 'processing', started_at = now()
            WHERE id = (
                SELECT id FROM queue_items
                WHERE status = 'pending'
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("claiming next queue item")?;
        Ok(item)
    }

    async fn finish_item(
        &self,
        id: Uuid,
        status: QueueStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Option<QueueItem>, AppError> {
        let item = sqlx::query_as::<_, QueueItem>(
            r#"
            UPDATE queue_items
            SET status = $2, result = $3, error = $4, completed_at = now()
            WHERE id = $1 AND status IN ('pending', 'processing')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(result)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;
        Ok(item)
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<QueueItem>, AppError> {
        let item = sqlx::query_as::<_, QueueItem>("SELECT * FROM queue_items WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    async fn queue_counts(&self, account_id: Option<Uuid>) -> Result<QueueStatusCounts, AppError> {
        let (pending, processing): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending'),
                COUNT(*) FILTER (WHERE status = 'processing')
            FROM queue_items
            WHERE $1::uuid IS NULL OR account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;

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
        let result =
            sqlx::query("DELETE FROM queue_items WHERE status = $1 AND completed_at < $2")
                .bind(status)
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LeadStore for PgStore {
    async fn upsert_lead(
        &self,
        business_id: &str,
        discovered: &DiscoveredLead,
    ) -> Result<Lead, AppError> {
        // The unique index on business_id makes concurrent discoveries converge
        // on one row; the losing insert turns into a fill-the-blanks update.
        let lead = sqlx::query_as::<_, Lead>(
            r#"
            INSERT INTO leads (id, business_id, name, address, maps_phone, owner_person_id, enrichment)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (business_id) WHERE business_id IS NOT NULL DO UPDATE SET
                name = CASE
                    WHEN btrim(leads.name) = '' THEN EXCLUDED.name
                    ELSE leads.name END,
                address = CASE
                    WHEN COALESCE(btrim(leads.address), '') = ''
                         AND COALESCE(btrim(EXCLUDED.address), '') <> '' THEN EXCLUDED.address
                    ELSE leads.address END,
                maps_phone = CASE
                    WHEN COALESCE(btrim(leads.maps_phone), '') = ''
                         AND COALESCE(btrim(EXCLUDED.maps_phone), '') <> '' THEN EXCLUDED.maps_phone
                    ELSE leads.maps_phone END,
                owner_person_id = CASE
                    WHEN COALESCE(btrim(leads.owner_person_id), '') = ''
                         AND COALESCE(btrim(EXCLUDED.owner_person_id), '') <> '' THEN EXCLUDED.owner_person_id
                    ELSE leads.owner_person_id END,
                last_touched_at = now()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(business_id)
        .bind(&discovered.name)
        .bind(&discovered.address)
        .bind(&discovered.maps_phone)
        .bind(&discovered.owner_person_id)
        .bind(discovered.enrichment.clone().unwrap_or_else(|| json!({})))
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upserting lead {}", business_id))?;

        match &discovered.enrichment {
            Some(patch) if !is_empty_value(patch) => Ok(self
                .merge_lead_enrichment(lead.id, patch)
                .await?
                .unwrap_or(lead)),
            _ => Ok(lead),
        }
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, AppError> {
        let lead = sqlx::query_as::<_, Lead>("SELECT * FROM leads WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(lead)
    }

    async fn find_lead_by_business_id(&self, business_id: &str) -> Result<Option<Lead>, AppError> {
        let lead = sqlx::query_as::<_, Lead>("SELECT * FROM leads WHERE business_id = $1")
            .bind(business_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(lead)
    }

    async fn merge_lead_enrichment(
        &self,
        id: Uuid,
        patch: &Value,
    ) -> Result<Option<Lead>, AppError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<Value> =
            sqlx::query_scalar("SELECT enrichment FROM leads WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(current) = current else {
            tx.rollback().await?;
            return Ok(None);
        };

        let merged = merge_enrichment(&current, patch);
        let lead = sqlx::query_as::<_, Lead>(
            "UPDATE leads SET enrichment = $2, last_touched_at = now() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(merged)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(lead))
    }

    async fn leads_by_cache_entry(&self, entry_id: Uuid) -> Result<Vec<Lead>, AppError> {
        let leads = sqlx::query_as::<_, Lead>(
            "SELECT * FROM leads WHERE cache_entry_id = $1 ORDER BY first_seen_at ASC",
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(leads)
    }

    async fn associate_leads(&self, entry_id: Uuid, lead_ids: &[Uuid]) -> Result<u64, AppError> {
        if lead_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE leads SET cache_entry_id = $1 WHERE id = ANY($2) AND cache_entry_id IS NULL",
        )
        .bind(entry_id)
        .bind(lead_ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AccessStore for PgStore {
    async fn insert_or_get_access(
        &self,
        account_id: Uuid,
        lead_id: Uuid,
        search_id: Option<Uuid>,
        renew_before: Option<DateTime<Utc>>,
    ) -> Result<AccessGrant, AppError> {
        for _ in 0..CONFLICT_RETRIES {
            let inserted = sqlx::query_as::<_, AccessRecord>(
                r#"
                INSERT INTO access_records (id, account_id, lead_id, search_id)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (account_id, lead_id) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(account_id)
            .bind(lead_id)
            .bind(search_id)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(record) = inserted {
                return Ok(AccessGrant {
                    record,
                    is_new: true,
                    renewed_from: None,
                });
            }

            if let Some(cutoff) = renew_before {
                // Row lock plus re-checked predicate: a concurrent renewal sees the
                // fresh timestamp and matches nothing.
                let renewed = sqlx::query(
                    r#"
                    WITH prev AS (
                        SELECT id, last_accessed_at
                        FROM access_records
                        WHERE account_id = $1 AND lead_id = $2 AND last_accessed_at < $3
                        FOR UPDATE
                    )
                    UPDATE access_records a
                    SET last_accessed_at = now(),
                        credits_paid = 1,
                        search_id = COALESCE($4, a.search_id)
                    FROM prev
                    WHERE a.id = prev.id
                    RETURNING a.*, prev.last_accessed_at AS renewed_from
                    "#,
                )
                .bind(account_id)
                .bind(lead_id)
                .bind(cutoff)
                .bind(search_id)
                .fetch_optional(&self.pool)
                .await?;

                if let Some(row) = renewed {
                    let record = AccessRecord::from_row(&row)?;
                    let renewed_from: DateTime<Utc> = row.try_get("renewed_from")?;
                    return Ok(AccessGrant {
                        record,
                        is_new: true,
                        renewed_from: Some(renewed_from),
                    });
                }
            }

            if let Some(record) = self.get_access(account_id, lead_id).await? {
                return Ok(AccessGrant {
                    record,
                    is_new: false,
                    renewed_from: None,
                });
            }
            // Revoked between the insert and the read; try again.
        }

        Err(AppError::InternalError(format!(
            "could not settle access record for account {} lead {}",
            account_id, lead_id
        )))
    }

    async fn revoke_access(&self, grant: &AccessGrant) -> Result<bool, AppError> {
        let result = match grant.renewed_from {
            None => {
                sqlx::query(
                    r#"
                    DELETE FROM access_records
                    WHERE id = $1 AND last_accessed_at = $2 AND enrichment_unlocked_at IS NULL
                    "#,
                )
                .bind(grant.record.id)
                .bind(grant.record.last_accessed_at)
                .execute(&self.pool)
                .await?
            }
            Some(previous) => {
                sqlx::query(
                    r#"
                    UPDATE access_records SET last_accessed_at = $3
                    WHERE id = $1 AND last_accessed_at = $2
                    "#,
                )
                .bind(grant.record.id)
                .bind(grant.record.last_accessed_at)
                .bind(previous)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    async fn mark_access_unpaid(&self, access_id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE access_records SET credits_paid = 0 WHERE id = $1")
            .bind(access_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_access(
        &self,
        account_id: Uuid,
        lead_id: Uuid,
    ) -> Result<Option<AccessRecord>, AppError> {
        let record = sqlx::query_as::<_, AccessRecord>(
            "SELECT * FROM access_records WHERE account_id = $1 AND lead_id = $2",
        )
        .bind(account_id)
        .bind(lead_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn accesses_for_leads(
        &self,
        account_id: Uuid,
        lead_ids: &[Uuid],
    ) -> Result<Vec<AccessRecord>, AppError> {
        if lead_ids.is_empty() {
            return Ok(Vec::new());
        }
        let records = sqlx::query_as::<_, AccessRecord>(
            "SELECT * FROM access_records WHERE account_id = $1 AND lead_id = ANY($2)",
        )
        .bind(account_id)
        .bind(lead_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn stamp_unlock(&self, access_id: Uuid) -> Result<Option<AccessRecord>, AppError> {
        let record = sqlx::query_as::<_, AccessRecord>(
            r#"
            UPDATE access_records SET enrichment_unlocked_at = now()
            WHERE id = $1 AND enrichment_unlocked_at IS NULL
            RETURNING *
            "#,
        )
        .bind(access_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn clear_unlock(
        &self,
        access_id: Uuid,
        stamped_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE access_records SET enrichment_unlocked_at = NULL
            WHERE id = $1 AND enrichment_unlocked_at = $2
            "#,
        )
        .bind(access_id)
        .bind(stamped_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CacheIndexStore for PgStore {
    async fn find_cache_entry(
        &self,
        niche_key: &str,
        location_key: &str,
    ) -> Result<Option<CacheIndexEntry>, AppError> {
        let entry = sqlx::query_as::<_, CacheIndexEntry>(
            "SELECT * FROM cache_entries WHERE niche_key = $1 AND location_key = $2",
        )
        .bind(niche_key)
        .bind(location_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn insert_or_get_cache_entry(
        &self,
        niche_key: &str,
        location_key: &str,
    ) -> Result<CacheIndexEntry, AppError> {
        let inserted = sqlx::query_as::<_, CacheIndexEntry>(
            r#"
            INSERT INTO cache_entries (id, niche_key, location_key)
            VALUES ($1, $2, $3)
            ON CONFLICT (niche_key, location_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(niche_key)
        .bind(location_key)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(entry) => Ok(entry),
            None => self
                .find_cache_entry(niche_key, location_key)
                .await?
                .ok_or_else(|| {
                    AppError::InternalError(format!(
                        "cache entry {} / {} vanished after conflict",
                        niche_key, location_key
                    ))
                }),
        }
    }

    async fn refresh_cache_count(
        &self,
        entry_id: Uuid,
    ) -> Result<Option<CacheIndexEntry>, AppError> {
        let entry = sqlx::query_as::<_, CacheIndexEntry>(
            r#"
            UPDATE cache_entries
            SET lead_count = (SELECT COUNT(*) FROM leads WHERE cache_entry_id = $1),
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }
}

#[async_trait]
impl SearchStore for PgStore {
    async fn insert_search(
        &self,
        account_id: Uuid,
        niche: &str,
        location: &str,
        quantity: i32,
    ) -> Result<SearchRequest, AppError> {
        let search = sqlx::query_as::<_, SearchRequest>(
            r#"
            INSERT INTO search_requests (id, account_id, niche, location, quantity, status, started_at)
            VALUES ($1, $2, $3, $4, $5, $6, now())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(niche)
        .bind(location)
        .bind(quantity)
        .bind(SearchStatus::Processing)
        .fetch_one(&self.pool)
        .await?;
        Ok(search)
    }

    async fn get_search(&self, id: Uuid) -> Result<Option<SearchRequest>, AppError> {
        let search =
            sqlx::query_as::<_, SearchRequest>("SELECT * FROM search_requests WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(search)
    }

    async fn list_searches(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<SearchRequest>, AppError> {
        let searches = sqlx::query_as::<_, SearchRequest>(
            "SELECT * FROM search_requests WHERE account_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(searches)
    }

    async fn finish_search(
        &self,
        id: Uuid,
        status: SearchStatus,
        outcome: &SearchOutcome,
    ) -> Result<Option<SearchRequest>, AppError> {
        let search = sqlx::query_as::<_, SearchRequest>(
            r#"
            UPDATE search_requests
            SET status = $2, results_count = $3, credits_used = $4, summary = $5,
                error = $6, completed_at = now()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(outcome.results_count)
        .bind(outcome.credits_used)
        .bind(&outcome.summary)
        .bind(&outcome.error)
        .fetch_optional(&self.pool)
        .await?;
        Ok(search)
    }

    async fn link_search_lead(&self, search_id: Uuid, lead_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO search_leads (search_id, lead_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(search_id)
        .bind(lead_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn search_leads(&self, search_id: Uuid) -> Result<Vec<Lead>, AppError> {
        let leads = sqlx::query_as::<_, Lead>(
            r#"
            SELECT l.* FROM leads l
            JOIN search_leads sl ON sl.lead_id = l.id
            WHERE sl.search_id = $1
            ORDER BY sl.position ASC
            "#,
        )
        .bind(search_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(leads)
    }

    async fn delete_search(&self, id: Uuid, account_id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM search_requests
            WHERE id = $1 AND account_id = $2 AND status IN ('completed', 'failed')
            "#,
        )
        .bind(id)
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
