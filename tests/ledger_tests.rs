/// Credit ledger tests against the in-memory store
/// Covers the non-negative balance floor under concurrency, entry/balance consistency
/// and one-credit-per-payment idempotency
use rust_leads_api::errors::LedgerError;
use rust_leads_api::ledger::Ledger;
use rust_leads_api::memory_store::MemoryStore;
use rust_leads_api::models::{LedgerKind, PaymentRef};
use std::sync::Arc;
use uuid::Uuid;

fn ledger_with(store: &Arc<MemoryStore>) -> Ledger {
    Ledger::new(store.clone())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_debits_never_go_negative() {
    let store = Arc::new(MemoryStore::new());
    let account = store.seed_account("ana@example.com", 10).await;
    let ledger = ledger_with(&store);
    let account_id = account.id;

    let mut handles = Vec::new();
    for i in 0..50 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger.debit(account_id, 1, &format!("Lead #{}", i)).await
        }));
    }

    let mut applied = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(balance) => {
                assert!(balance >= 0);
                applied += 1;
            }
            Err(LedgerError::InsufficientCredits { balance, required }) => {
                assert_eq!(balance, 0);
                assert_eq!(required, 1);
                refused += 1;
            }
            Err(other) => panic!("unexpected ledger error: {other:?}"),
        }
    }

    assert_eq!(applied, 10);
    assert_eq!(refused, 40);
    assert_eq!(ledger.balance(account.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_entries_sum_to_balance() {
    let store = Arc::new(MemoryStore::new());
    let account = store.seed_account("bruno@example.com", 5).await;
    let ledger = ledger_with(&store);

    ledger.debit(account.id, 2, "Lead: Padaria").await.unwrap();
    ledger
        .credit(account.id, 100, LedgerKind::Purchase, "Purchase: 100 credits", None)
        .await
        .unwrap();
    ledger.debit(account.id, 1, "Unlock: Padaria").await.unwrap();
    let _ = ledger.debit(account.id, 1_000, "too much").await;

    let entries = store.all_entries(account.id).await;
    let sum: i64 = entries.iter().map(|e| e.amount).sum();
    assert_eq!(sum, ledger.balance(account.id).await.unwrap());
    assert_eq!(sum, 102);
    // The refused debit left no trace.
    assert_eq!(entries.len(), 4);
}

#[tokio::test]
async fn test_failed_debit_reports_current_balance() {
    let store = Arc::new(MemoryStore::new());
    let account = store.seed_account("carla@example.com", 2).await;
    let ledger = ledger_with(&store);

    let err = ledger.debit(account.id, 3, "Lead: Mercado").await.unwrap_err();
    assert_eq!(
        err,
        LedgerError::InsufficientCredits {
            balance: 2,
            required: 3
        }
    );
    assert_eq!(ledger.balance(account.id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_same_payment_is_credited_once() {
    let store = Arc::new(MemoryStore::new());
    let account = store.seed_account("diego@example.com", 0).await;
    let ledger = ledger_with(&store);
    let payment = PaymentRef {
        gateway: "kiwify".to_string(),
        external_id: "order-123".to_string(),
    };

    let first = ledger
        .credit(account.id, 250, LedgerKind::Purchase, "Purchase", Some(&payment))
        .await
        .unwrap();
    assert_eq!(first, 250);

    let second = ledger
        .credit(account.id, 250, LedgerKind::Purchase, "Purchase", Some(&payment))
        .await;
    assert!(matches!(second, Err(LedgerError::DuplicatePayment { .. })));

    assert_eq!(ledger.balance(account.id).await.unwrap(), 250);
    assert_eq!(store.all_entries(account.id).await.len(), 1);
    assert!(ledger.find_payment(&payment).await.unwrap().is_some());
}

#[tokio::test]
async fn test_same_external_id_on_other_gateway_is_distinct() {
    let store = Arc::new(MemoryStore::new());
    let account = store.seed_account("eva@example.com", 0).await;
    let ledger = ledger_with(&store);

    for gateway in ["kiwify", "mercadopago"] {
        let payment = PaymentRef {
            gateway: gateway.to_string(),
            external_id: "42".to_string(),
        };
        ledger
            .credit(account.id, 50, LedgerKind::Purchase, "Purchase", Some(&payment))
            .await
            .unwrap();
    }

    assert_eq!(ledger.balance(account.id).await.unwrap(), 100);
}

#[tokio::test]
async fn test_invalid_amounts_and_unknown_accounts() {
    let store = Arc::new(MemoryStore::new());
    let account = store.seed_account("fabio@example.com", 5).await;
    let ledger = ledger_with(&store);

    assert_eq!(
        ledger.debit(account.id, 0, "nothing").await,
        Err(LedgerError::InvalidAmount(0))
    );
    assert!(matches!(
        ledger.credit(account.id, -5, LedgerKind::Refund, "negative", None).await,
        Err(LedgerError::InvalidAmount(_))
    ));
    assert!(matches!(
        ledger.credit(account.id, 5, LedgerKind::Usage, "usage as credit", None).await,
        Err(LedgerError::InvalidAmount(_))
    ));

    let stranger = Uuid::new_v4();
    assert_eq!(
        ledger.debit(stranger, 1, "ghost").await,
        Err(LedgerError::AccountNotFound(stranger))
    );
    assert_eq!(
        ledger.balance(stranger).await,
        Err(LedgerError::AccountNotFound(stranger))
    );
    assert_eq!(ledger.balance(account.id).await.unwrap(), 5);
}

#[tokio::test]
async fn test_recent_entries_newest_first() {
    let store = Arc::new(MemoryStore::new());
    let account = store.seed_account("gabi@example.com", 3).await;
    let ledger = ledger_with(&store);

    ledger.debit(account.id, 1, "first").await.unwrap();
    ledger.debit(account.id, 1, "second").await.unwrap();

    let entries = ledger.recent_entries(account.id, 2).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].description, "second");
    assert_eq!(entries[1].description, "first");
    assert!(entries.iter().all(|e| e.kind == LedgerKind::Usage && e.amount == -1));
}
