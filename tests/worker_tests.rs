/// Queue consumer tests with scripted upstream responses
/// Covers the single credential refresh per item, result merging and the run loop
use async_trait::async_trait;
use rust_leads_api::credentials::{CredentialProvider, SessionCredentials};
use rust_leads_api::errors::{AppError, CredentialError, EnrichmentError};
use rust_leads_api::leads::LeadTracker;
use rust_leads_api::ledger::Ledger;
use rust_leads_api::memory_store::MemoryStore;
use rust_leads_api::models::{DiscoveredLead, Lead, QueueStatus, RequestKind};
use rust_leads_api::services::{EnrichmentFetcher, RegistryLookup};
use rust_leads_api::store::LeadStore;
use rust_leads_api::worker::QueueWorker;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

const CNPJ: &str = "11222333000181";

struct ScriptedFetcher {
    responses: Mutex<VecDeque<Result<Value, EnrichmentError>>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    fn new(responses: Vec<Result<Value, EnrichmentError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrichmentFetcher for ScriptedFetcher {
    async fn fetch_partners(
        &self,
        _cnpj: &str,
        credentials: &SessionCredentials,
    ) -> Result<Value, EnrichmentError> {
        assert!(!credentials.is_empty());
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(json!([])))
    }
}

struct CountingCredentials {
    available: bool,
    refresh_fails: bool,
    refreshes: AtomicUsize,
}

impl CountingCredentials {
    fn new(available: bool, refresh_fails: bool) -> Arc<Self> {
        Arc::new(Self {
            available,
            refresh_fails,
            refreshes: AtomicUsize::new(0),
        })
    }

    fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for CountingCredentials {
    async fn get(&self) -> Result<Option<SessionCredentials>, CredentialError> {
        Ok(self.available.then(|| SessionCredentials {
            headers: HashMap::from([("authorization".to_string(), "Bearer t".to_string())]),
        }))
    }

    async fn refresh(&self) -> Result<(), CredentialError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.refresh_fails {
            Err(CredentialError::RefreshFailed("bot exited with status 1".to_string()))
        } else {
            Ok(())
        }
    }
}

struct ProfileRegistry;

#[async_trait]
impl RegistryLookup for ProfileRegistry {
    async fn fetch_company(&self, cnpj: &str) -> Result<Option<Value>, AppError> {
        Ok((cnpj == CNPJ).then(|| json!({"razao_social": "SILVA LTDA", "situacao": "ATIVA"})))
    }

    async fn fetch_person(&self, _cpf: &str) -> Result<Option<Value>, AppError> {
        Ok(None)
    }
}

fn worker(
    store: &Arc<MemoryStore>,
    fetcher: Arc<ScriptedFetcher>,
    credentials: Arc<CountingCredentials>,
) -> QueueWorker {
    QueueWorker::new(store.clone(), fetcher, Arc::new(ProfileRegistry), credentials)
        .with_poll_interval(Duration::from_millis(10))
        .with_item_delay(Duration::from_millis(0))
}

async fn lead(store: &Arc<MemoryStore>, cnpj: &str) -> Lead {
    let tracker = LeadTracker::new(store.clone(), Ledger::new(store.clone()));
    tracker
        .find_or_create_lead(
            cnpj,
            &DiscoveredLead {
                name: "Silva Advogados".to_string(),
                ..DiscoveredLead::default()
            },
        )
        .await
        .unwrap()
}

async fn enqueue(worker: &QueueWorker, kind: RequestKind, cnpj: &str, lead_id: Option<Uuid>) -> Uuid {
    let (item, _) = worker
        .queue()
        .enqueue(Uuid::new_v4(), kind, json!({ "cnpj": cnpj }), 0, lead_id)
        .await
        .unwrap();
    item.id
}

#[tokio::test]
async fn test_partners_result_is_merged_into_lead() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = ScriptedFetcher::new(vec![Ok(json!([{"NOME": "JOAO SILVA"}]))]);
    let credentials = CountingCredentials::new(true, false);
    let worker = worker(&store, fetcher.clone(), credentials.clone());
    let lead = lead(&store, CNPJ).await;
    enqueue(&worker, RequestKind::Partners, CNPJ, Some(lead.id)).await;

    let item = worker.process_next().await.unwrap().unwrap();

    assert_eq!(item.status, QueueStatus::Completed);
    assert_eq!(item.result, Some(json!({"socios": [{"NOME": "JOAO SILVA"}]})));
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(credentials.refreshes(), 0);

    let lead = store.get_lead(lead.id).await.unwrap().unwrap();
    assert_eq!(lead.enrichment["socios_qsa"]["socios"][0]["NOME"], "JOAO SILVA");
}

#[tokio::test]
async fn test_expired_session_is_refreshed_once_then_retried() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = ScriptedFetcher::new(vec![
        Err(EnrichmentError::AuthExpired),
        Ok(json!({"socios": []})),
    ]);
    let credentials = CountingCredentials::new(true, false);
    let worker = worker(&store, fetcher.clone(), credentials.clone());
    enqueue(&worker, RequestKind::Partners, CNPJ, None).await;

    let item = worker.process_next().await.unwrap().unwrap();

    assert_eq!(item.status, QueueStatus::Completed);
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(credentials.refreshes(), 1);
}

#[tokio::test]
async fn test_second_expiry_fails_the_item() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = ScriptedFetcher::new(vec![
        Err(EnrichmentError::AuthExpired),
        Err(EnrichmentError::AuthExpired),
        Ok(json!([])),
    ]);
    let credentials = CountingCredentials::new(true, false);
    let worker = worker(&store, fetcher.clone(), credentials.clone());
    enqueue(&worker, RequestKind::Partners, CNPJ, None).await;

    let item = worker.process_next().await.unwrap().unwrap();

    assert_eq!(item.status, QueueStatus::Failed);
    assert_eq!(item.error.as_deref(), Some("enrichment session expired"));
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(credentials.refreshes(), 1);
}

#[tokio::test]
async fn test_failed_refresh_fails_without_retry() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = ScriptedFetcher::new(vec![Err(EnrichmentError::AuthExpired)]);
    let credentials = CountingCredentials::new(true, true);
    let worker = worker(&store, fetcher.clone(), credentials.clone());
    enqueue(&worker, RequestKind::Partners, CNPJ, None).await;

    let item = worker.process_next().await.unwrap().unwrap();

    assert_eq!(item.status, QueueStatus::Failed);
    assert!(item
        .error
        .unwrap()
        .starts_with("session refresh failed"));
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(credentials.refreshes(), 1);
}

#[tokio::test]
async fn test_missing_credentials_fail_after_one_refresh() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = ScriptedFetcher::new(vec![]);
    let credentials = CountingCredentials::new(false, false);
    let worker = worker(&store, fetcher.clone(), credentials.clone());
    enqueue(&worker, RequestKind::Partners, CNPJ, None).await;

    let item = worker.process_next().await.unwrap().unwrap();

    assert_eq!(item.status, QueueStatus::Failed);
    assert_eq!(item.error.as_deref(), Some("no enrichment credentials available"));
    assert_eq!(fetcher.calls(), 0);
    assert_eq!(credentials.refreshes(), 1);
}

#[tokio::test]
async fn test_upstream_error_fails_without_refresh() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = ScriptedFetcher::new(vec![Err(EnrichmentError::Upstream(
        "partners API returned status 502".to_string(),
    ))]);
    let credentials = CountingCredentials::new(true, false);
    let worker = worker(&store, fetcher.clone(), credentials.clone());
    enqueue(&worker, RequestKind::Partners, CNPJ, None).await;

    let item = worker.process_next().await.unwrap().unwrap();

    assert_eq!(item.status, QueueStatus::Failed);
    assert!(item.error.unwrap().contains("502"));
    assert_eq!(credentials.refreshes(), 0);
}

#[tokio::test]
async fn test_company_profile_is_stored_under_registry() {
    let store = Arc::new(MemoryStore::new());
    let worker = worker(
        &store,
        ScriptedFetcher::new(vec![]),
        CountingCredentials::new(true, false),
    );
    let lead = lead(&store, CNPJ).await;
    // No lead id on the item: the lead is found by its CNPJ.
    enqueue(&worker, RequestKind::CompanyProfile, CNPJ, None).await;

    let item = worker.process_next().await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Completed);

    let lead = store.get_lead(lead.id).await.unwrap().unwrap();
    assert_eq!(lead.enrichment["registry"]["razao_social"], "SILVA LTDA");
}

#[tokio::test]
async fn test_unknown_company_profile_is_recorded_as_miss() {
    let store = Arc::new(MemoryStore::new());
    let worker = worker(
        &store,
        ScriptedFetcher::new(vec![]),
        CountingCredentials::new(true, false),
    );
    let lead = lead(&store, "22333444000105").await;
    enqueue(&worker, RequestKind::CompanyProfile, "22333444000105", Some(lead.id)).await;

    let item = worker.process_next().await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Completed);
    assert_eq!(item.result, Some(json!({"found": false})));

    let lead = store.get_lead(lead.id).await.unwrap().unwrap();
    assert_eq!(lead.enrichment["registry"], json!({"found": false}));
}

#[tokio::test]
async fn test_empty_queue_yields_nothing() {
    let store = Arc::new(MemoryStore::new());
    let worker = worker(
        &store,
        ScriptedFetcher::new(vec![]),
        CountingCredentials::new(true, false),
    );
    assert!(worker.process_next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_run_drains_queue_until_shutdown() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = ScriptedFetcher::new(vec![Ok(json!([])), Ok(json!([]))]);
    let worker = worker(&store, fetcher.clone(), CountingCredentials::new(true, false));
    let first = enqueue(&worker, RequestKind::Partners, "00000000000101", None).await;
    let second = enqueue(&worker, RequestKind::Partners, "00000000000202", None).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = worker.clone();
    let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let items = store.all_queue_items().await;
        let done = items
            .iter()
            .filter(|i| (i.id == first || i.id == second) && i.status == QueueStatus::Completed)
            .count();
        if done == 2 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "queue was not drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert_eq!(fetcher.calls(), 2);
}
