/// Lead store and access tracker tests
/// Deduplicated leads, idempotent grants, retention renewal, unseen filtering
/// and at-most-once unlock charges
use chrono::{Duration as ChronoDuration, Utc};
use rust_leads_api::errors::AppError;
use rust_leads_api::leads::{sanitize_for_account, LeadTracker};
use rust_leads_api::ledger::Ledger;
use rust_leads_api::memory_store::MemoryStore;
use rust_leads_api::models::DiscoveredLead;
use rust_leads_api::store::LeadStore;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn setup() -> (Arc<MemoryStore>, LeadTracker, Ledger) {
    let store = Arc::new(MemoryStore::new());
    let ledger = Ledger::new(store.clone());
    let tracker = LeadTracker::new(store.clone(), ledger.clone());
    (store, tracker, ledger)
}

fn discovered(name: &str) -> DiscoveredLead {
    DiscoveredLead {
        name: name.to_string(),
        ..DiscoveredLead::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_discovery_creates_one_lead() {
    let (store, tracker, _) = setup();

    let mut handles = Vec::new();
    for i in 0..20 {
        let tracker = tracker.clone();
        handles.push(tokio::spawn(async move {
            tracker
                .find_or_create_lead("11.222.333/0001-81", &discovered(&format!("Silva #{}", i)))
                .await
                .unwrap()
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().id);
    }
    ids.dedup();

    assert_eq!(ids.len(), 1);
    assert_eq!(store.lead_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_grants_converge_to_one_record() {
    let (store, tracker, _) = setup();
    let account = store.seed_account("grant@example.com", 0).await;
    let lead = tracker
        .find_or_create_lead("11222333000181", &discovered("Silva"))
        .await
        .unwrap();
    let (account_id, lead_id) = (account.id, lead.id);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let tracker = tracker.clone();
        handles.push(tokio::spawn(async move {
            tracker.grant_access(account_id, lead_id, None, None).await.unwrap()
        }));
    }

    let mut grants = Vec::new();
    for handle in handles {
        grants.push(handle.await.unwrap());
    }

    assert_eq!(grants.iter().filter(|g| g.is_new).count(), 1);
    let records = store.all_access_records(account.id).await;
    assert_eq!(records.len(), 1);
    assert!(grants.iter().all(|g| g.record.id == records[0].id));
}

#[tokio::test]
async fn test_rediscovery_fills_blanks_only() {
    let (_, tracker, _) = setup();

    let first = tracker
        .find_or_create_lead(
            "11222333000181",
            &DiscoveredLead {
                name: "Silva Advogados".to_string(),
                address: Some("Av. Paulista, 1000".to_string()),
                enrichment: Some(json!({"registry": {"razao_social": "SILVA ADV LTDA"}})),
                ..DiscoveredLead::default()
            },
        )
        .await
        .unwrap();

    let second = tracker
        .find_or_create_lead(
            "11222333000181",
            &DiscoveredLead {
                name: "Outro Nome".to_string(),
                address: Some("Rua Errada, 1".to_string()),
                maps_phone: Some("+551130000000".to_string()),
                enrichment: Some(json!({"registry": {}, "socios_qsa": {"socios": []}})),
                ..DiscoveredLead::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.name, "Silva Advogados");
    assert_eq!(second.address.as_deref(), Some("Av. Paulista, 1000"));
    assert_eq!(second.maps_phone.as_deref(), Some("+551130000000"));
    assert_eq!(second.enrichment["registry"]["razao_social"], "SILVA ADV LTDA");
    assert!(second.enrichment.get("socios_qsa").is_some());
}

#[tokio::test]
async fn test_identifier_without_digits_is_rejected() {
    let (_, tracker, _) = setup();
    let result = tracker.find_or_create_lead("n/a", &discovered("Ghost")).await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));
}

#[tokio::test]
async fn test_grant_is_idempotent_inside_retention() {
    let (store, tracker, _) = setup();
    let account = store.seed_account("ana@example.com", 0).await;
    let lead = tracker
        .find_or_create_lead("11222333000181", &discovered("Silva"))
        .await
        .unwrap();

    let retention = Some(ChronoDuration::days(30));
    let first = tracker.grant_access(account.id, lead.id, None, retention).await.unwrap();
    let second = tracker.grant_access(account.id, lead.id, None, retention).await.unwrap();

    assert!(first.is_new);
    assert!(!second.is_new);
    assert_eq!(first.record.id, second.record.id);
    assert_eq!(store.all_access_records(account.id).await.len(), 1);
}

#[tokio::test]
async fn test_stale_grant_is_renewed_once() {
    let (store, tracker, _) = setup();
    let account = store.seed_account("bia@example.com", 0).await;
    let lead = tracker
        .find_or_create_lead("11222333000181", &discovered("Silva"))
        .await
        .unwrap();

    let retention = Some(ChronoDuration::days(30));
    let original = tracker.grant_access(account.id, lead.id, None, retention).await.unwrap();
    let long_ago = Utc::now() - ChronoDuration::days(45);
    store.backdate_access(original.record.id, long_ago).await;

    let renewed = tracker.grant_access(account.id, lead.id, None, retention).await.unwrap();
    assert!(renewed.is_new);
    assert_eq!(renewed.record.id, original.record.id);
    assert_eq!(renewed.renewed_from, Some(long_ago));

    let again = tracker.grant_access(account.id, lead.id, None, retention).await.unwrap();
    assert!(!again.is_new);

    // Without a retention window a record is never renewed.
    store.backdate_access(original.record.id, long_ago).await;
    let no_window = tracker.grant_access(account.id, lead.id, None, None).await.unwrap();
    assert!(!no_window.is_new);
}

#[tokio::test]
async fn test_revoked_renewal_restores_previous_charge_time() {
    let (store, tracker, _) = setup();
    let account = store.seed_account("caio@example.com", 0).await;
    let lead = tracker
        .find_or_create_lead("11222333000181", &discovered("Silva"))
        .await
        .unwrap();

    let retention = Some(ChronoDuration::days(30));
    let original = tracker.grant_access(account.id, lead.id, None, retention).await.unwrap();
    let long_ago = Utc::now() - ChronoDuration::days(45);
    store.backdate_access(original.record.id, long_ago).await;

    let renewed = tracker.grant_access(account.id, lead.id, None, retention).await.unwrap();
    tracker.revoke_grant(&renewed).await.unwrap();

    let records = store.all_access_records(account.id).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].last_accessed_at, long_ago);

    let fresh = tracker
        .find_or_create_lead("22333444000105", &discovered("Souza"))
        .await
        .unwrap();
    let grant = tracker.grant_access(account.id, fresh.id, None, retention).await.unwrap();
    tracker.revoke_grant(&grant).await.unwrap();
    assert_eq!(store.all_access_records(account.id).await.len(), 1);
}

#[tokio::test]
async fn test_leads_unseen_by_orders_never_seen_before_stale() {
    let (store, tracker, _) = setup();
    let account = store.seed_account("duda@example.com", 0).await;

    let mut leads = Vec::new();
    for (i, cnpj) in ["00000000000101", "00000000000202", "00000000000303", "00000000000404"]
        .iter()
        .enumerate()
    {
        leads.push(
            tracker
                .find_or_create_lead(cnpj, &discovered(&format!("Lead {}", i)))
                .await
                .unwrap(),
        );
    }

    // leads[0]: seen recently; leads[1]: stale 40d; leads[2]: stale 60d; leads[3]: never.
    let window = ChronoDuration::days(30);
    tracker.grant_access(account.id, leads[0].id, None, None).await.unwrap();
    let stale_40 = tracker.grant_access(account.id, leads[1].id, None, None).await.unwrap();
    let stale_60 = tracker.grant_access(account.id, leads[2].id, None, None).await.unwrap();
    store
        .backdate_access(stale_40.record.id, Utc::now() - ChronoDuration::days(40))
        .await;
    store
        .backdate_access(stale_60.record.id, Utc::now() - ChronoDuration::days(60))
        .await;

    let unseen = tracker
        .leads_unseen_by(account.id, leads.clone(), window)
        .await
        .unwrap();
    let order: Vec<Uuid> = unseen.iter().map(|l| l.id).collect();
    assert_eq!(order, vec![leads[3].id, leads[2].id, leads[1].id]);

    // Another account has seen nothing.
    let other = store.seed_account("edu@example.com", 0).await;
    let unseen = tracker.leads_unseen_by(other.id, leads, window).await.unwrap();
    assert_eq!(unseen.len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_unlocks_charge_once() {
    let (store, tracker, ledger) = setup();
    let account = store.seed_account("fe@example.com", 5).await;
    let lead = tracker
        .find_or_create_lead("11222333000181", &discovered("Silva"))
        .await
        .unwrap();
    tracker.grant_access(account.id, lead.id, None, None).await.unwrap();
    let account_id = account.id;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let tracker = tracker.clone();
        let lead = lead.clone();
        handles.push(tokio::spawn(async move {
            tracker.purchase_unlock(account_id, &lead, 1).await.unwrap()
        }));
    }

    let mut charged = 0;
    for handle in handles {
        let outcome = handle.await.unwrap();
        assert!(outcome.record.enrichment_unlocked_at.is_some());
        if outcome.charged {
            charged += 1;
        }
    }

    assert_eq!(charged, 1);
    assert_eq!(ledger.balance(account.id).await.unwrap(), 4);
}

#[tokio::test]
async fn test_unlock_requires_access_and_credits() {
    let (store, tracker, _) = setup();
    let account = store.seed_account("gil@example.com", 0).await;
    let lead = tracker
        .find_or_create_lead("11222333000181", &discovered("Silva"))
        .await
        .unwrap();

    assert!(matches!(
        tracker.purchase_unlock(account.id, &lead, 1).await,
        Err(AppError::NotFound(_))
    ));

    tracker.grant_access(account.id, lead.id, None, None).await.unwrap();
    assert!(matches!(
        tracker.purchase_unlock(account.id, &lead, 1).await,
        Err(AppError::InsufficientCredits {
            balance: 0,
            required: 1
        })
    ));

    // The failed purchase left the lead locked.
    let records = store.all_access_records(account.id).await;
    assert!(records[0].enrichment_unlocked_at.is_none());
}

#[tokio::test]
async fn test_views_follow_unlock_state() {
    let (store, tracker, _) = setup();
    let account = store.seed_account("hugo@example.com", 1).await;
    let lead = tracker
        .find_or_create_lead(
            "11222333000181",
            &DiscoveredLead {
                name: "Silva".to_string(),
                enrichment: Some(json!({
                    "registry": {"razao_social": "SILVA LTDA", "telefones": ["1130000000"]}
                })),
                ..DiscoveredLead::default()
            },
        )
        .await
        .unwrap();
    tracker.grant_access(account.id, lead.id, None, None).await.unwrap();

    let views = tracker.views_for_account(account.id, &[lead.clone()]).await.unwrap();
    assert!(!views[0].enrichment_unlocked);
    assert_eq!(views[0].enrichment, json!({"registry": {"razao_social": "SILVA LTDA"}}));

    tracker.purchase_unlock(account.id, &lead, 1).await.unwrap();
    let lead = store.get_lead(lead.id).await.unwrap().unwrap();
    let views = tracker.views_for_account(account.id, &[lead.clone()]).await.unwrap();
    assert!(views[0].enrichment_unlocked);
    assert_eq!(views[0].enrichment["registry"]["telefones"], json!(["1130000000"]));

    // The same lead stays locked for someone who never paid.
    assert!(!sanitize_for_account(&lead, None).enrichment_unlocked);
}
