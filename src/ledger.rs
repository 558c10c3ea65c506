//! Prepaid credit ledger.
//!
//! Balances change only here, and every change appends exactly one
//! `LedgerEntry`. Debits are conditional updates so concurrent debits can
//! never take an account below zero.

use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{AppError, LedgerError};
use crate::models::{LedgerEntry, LedgerKind, PaymentRef};
use crate::store::{CreditOutcome, DebitOutcome, Store};

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Debits `amount` credits for a usage.
    ///
    /// # Returns
    ///
    /// * `Ok(new_balance)` when the debit applied.
    /// * `Err(LedgerError::InsufficientCredits)` with the balance read after
    ///   the failed conditional update.
    /// * `Err(LedgerError::AccountNotFound)` for a stale account id.
    pub async fn debit(
        &self,
        account_id: Uuid,
        amount: i64,
        description: &str,
    ) -> Result<i64, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        match self
            .store
            .apply_debit(account_id, amount, description)
            .await?
        {
            DebitOutcome::Applied { balance } => {
                tracing::debug!(
                    "Debited {} credit(s) from {}: {} (balance {})",
                    amount,
                    account_id,
                    description,
                    balance
                );
                Ok(balance)
            }
            DebitOutcome::Insufficient { balance } => {
                tracing::info!(
                    "Insufficient credits for {}: available {}, required {}",
                    account_id,
                    balance,
                    amount
                );
                Err(LedgerError::InsufficientCredits {
                    balance,
                    required: amount,
                })
            }
            DebitOutcome::AccountMissing => {
                tracing::error!("Debit against unknown account {}", account_id);
                Err(LedgerError::AccountNotFound(account_id))
            }
        }
    }

    /// Credits `amount` to the account.
    ///
    /// Webhook callers check idempotency by `payment` before calling this;
    /// storage still refuses a second entry for the same payment and that
    /// surfaces as `LedgerError::DuplicatePayment`.
    pub async fn credit(
        &self,
        account_id: Uuid,
        amount: i64,
        kind: LedgerKind,
        description: &str,
        payment: Option<&PaymentRef>,
    ) -> Result<i64, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        if kind == LedgerKind::Usage {
            return Err(LedgerError::InvalidAmount(-amount));
        }

        match self
            .store
            .apply_credit(account_id, amount, kind, description, payment)
            .await?
        {
            CreditOutcome::Applied { balance } => {
                tracing::info!(
                    "Credited {} credit(s) to {} (balance {})",
                    amount,
                    account_id,
                    balance
                );
                Ok(balance)
            }
            CreditOutcome::DuplicatePayment => {
                let payment = payment.cloned().unwrap_or(PaymentRef {
                    gateway: String::new(),
                    external_id: String::new(),
                });
                tracing::warn!(
                    "Refused second credit for payment {}:{}",
                    payment.gateway,
                    payment.external_id
                );
                Err(LedgerError::DuplicatePayment {
                    gateway: payment.gateway,
                    external_id: payment.external_id,
                })
            }
            CreditOutcome::AccountMissing => {
                tracing::error!("Credit against unknown account {}", account_id);
                Err(LedgerError::AccountNotFound(account_id))
            }
        }
    }

    pub async fn balance(&self, account_id: Uuid) -> Result<i64, LedgerError> {
        self.store
            .balance(account_id)
            .await?
            .ok_or(LedgerError::AccountNotFound(account_id))
    }

    pub async fn recent_entries(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, AppError> {
        self.store.ledger_entries(account_id, limit).await
    }

    /// The entry already recorded for an external payment, if any.
    pub async fn find_payment(&self, payment: &PaymentRef) -> Result<Option<LedgerEntry>, AppError> {
        self.store.payment_entry(payment).await
    }
}
