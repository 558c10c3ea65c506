use crate::config::Config;
use crate::errors::AppError;
use crate::models::*;
use crate::payments::{credit_packages, GatewayKind, PaymentProcessor, SettlementOutcome};
use crate::search::SearchOrchestrator;
use crate::store::Store;
use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, HeaderMap, StatusCode},
    Json,
};
use moka::future::Cache;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Persistence for every component.
    pub store: Arc<dyn Store>,
    /// Searches, direct lookups and unlocks.
    pub orchestrator: SearchOrchestrator,
    /// Checkout creation and webhook settlement.
    pub payments: PaymentProcessor,
    /// External identity reference -> account (5 minute TTL).
    pub account_cache: Cache<String, Account>,
}

/// Constant-time string comparison.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Identity asserted by the upstream auth proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityHeaders {
    pub external_ref: String,
    pub email: String,
}

impl IdentityHeaders {
    /// Reads and checks `X-Api-Key`, `X-User-Id` and `X-User-Email`.
    pub fn from_headers(headers: &HeaderMap, api_key: &str) -> Result<Self, AppError> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let presented = header("x-api-key")
            .ok_or_else(|| AppError::Unauthorized("Missing X-Api-Key header".to_string()))?;
        if !constant_time_compare(presented, api_key) {
            tracing::warn!("Invalid API key received");
            return Err(AppError::Unauthorized("Invalid API key".to_string()));
        }

        let external_ref = header("x-user-id")
            .ok_or_else(|| AppError::Unauthorized("Missing X-User-Id header".to_string()))?;
        let email = header("x-user-email")
            .ok_or_else(|| AppError::Unauthorized("Missing X-User-Email header".to_string()))?;

        Ok(Self {
            external_ref: external_ref.to_string(),
            email: email.to_lowercase(),
        })
    }
}

/// The caller's account, created on first sight with a zero balance.
#[derive(Debug, Clone)]
pub struct AuthenticatedAccount(pub Account);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthenticatedAccount {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let identity = IdentityHeaders::from_headers(&parts.headers, &state.config.api_key)?;

        if let Some(account) = state.account_cache.get(&identity.external_ref).await {
            return Ok(Self(account));
        }

        let account = state
            .store
            .get_or_create_account(&identity.external_ref, &identity.email)
            .await?;
        state
            .account_cache
            .insert(identity.external_ref, account.clone())
            .await;
        Ok(Self(account))
    }
}

/// Health check endpoint.
///
/// Returns the service status, version, and health information.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "rust-leads-api",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

// ============ Searches ============

/// POST /api/v1/searches
///
/// Records the search and runs it in the background. The response carries
/// the `processing` record; poll `GET /api/v1/searches/:id` for the outcome.
pub async fn create_search(
    State(state): State<Arc<AppState>>,
    AuthenticatedAccount(account): AuthenticatedAccount,
    Json(payload): Json<CreateSearchRequest>,
) -> Result<(StatusCode, Json<SearchRequest>), AppError> {
    tracing::info!(
        "POST /searches - account {} '{}' in '{}' x{}",
        account.id,
        payload.niche,
        payload.location,
        payload.quantity
    );

    let search = state
        .orchestrator
        .create_search(account.id, &payload.niche, &payload.location, payload.quantity)
        .await?;
    state.orchestrator.submit(search.clone());

    Ok((StatusCode::ACCEPTED, Json(search)))
}

/// GET /api/v1/searches
pub async fn list_searches(
    State(state): State<Arc<AppState>>,
    AuthenticatedAccount(account): AuthenticatedAccount,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SearchRequest>>, AppError> {
    let searches = state
        .orchestrator
        .list(account.id, query.limit.unwrap_or(20))
        .await?;
    Ok(Json(searches))
}

/// GET /api/v1/searches/:id
pub async fn get_search(
    State(state): State<Arc<AppState>>,
    AuthenticatedAccount(account): AuthenticatedAccount,
    Path(id): Path<Uuid>,
) -> Result<Json<SearchRequest>, AppError> {
    Ok(Json(state.orchestrator.get(account.id, id).await?))
}

/// GET /api/v1/searches/:id/leads
///
/// Leads delivered by a search, as the caller may see them now.
pub async fn get_search_leads(
    State(state): State<Arc<AppState>>,
    AuthenticatedAccount(account): AuthenticatedAccount,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<LeadView>>, AppError> {
    Ok(Json(state.orchestrator.search_views(account.id, id).await?))
}

/// DELETE /api/v1/searches/:id
pub async fn delete_search(
    State(state): State<Arc<AppState>>,
    AuthenticatedAccount(account): AuthenticatedAccount,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.orchestrator.delete(account.id, id).await?;
    tracing::info!("Search {} deleted by account {}", id, account.id);
    Ok(StatusCode::NO_CONTENT)
}

// ============ Leads & lookups ============

/// POST /api/v1/leads/:id/unlock
pub async fn unlock_lead(
    State(state): State<Arc<AppState>>,
    AuthenticatedAccount(account): AuthenticatedAccount,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (lead, outcome) = state.orchestrator.unlock_lead(account.id, id).await?;
    Ok(Json(json!({
        "lead": lead,
        "charged": outcome.charged,
        "balance": outcome.balance,
    })))
}

/// POST /api/v1/lookups/cnpj
///
/// May hold the request for up to `LOOKUP_WAIT_SECS` while partners load.
pub async fn lookup_company(
    State(state): State<Arc<AppState>>,
    AuthenticatedAccount(account): AuthenticatedAccount,
    Json(payload): Json<CompanyLookupRequest>,
) -> Result<Json<CompanyLookupResponse>, AppError> {
    tracing::info!("POST /lookups/cnpj - account {}", account.id);
    Ok(Json(
        state
            .orchestrator
            .lookup_company(account.id, &payload.cnpj)
            .await?,
    ))
}

/// POST /api/v1/lookups/cpf
pub async fn lookup_person(
    State(state): State<Arc<AppState>>,
    AuthenticatedAccount(account): AuthenticatedAccount,
    Json(payload): Json<PersonLookupRequest>,
) -> Result<Json<PersonLookupResponse>, AppError> {
    tracing::info!("POST /lookups/cpf - account {}", account.id);
    Ok(Json(
        state
            .orchestrator
            .lookup_person(account.id, &payload.cpf)
            .await?,
    ))
}

// ============ Queue ============

/// GET /api/v1/queue/status
pub async fn queue_status(
    State(state): State<Arc<AppState>>,
    AuthenticatedAccount(account): AuthenticatedAccount,
) -> Result<Json<serde_json::Value>, AppError> {
    let queue = state.orchestrator.queue();
    let overall = queue.queue_status().await?;
    let mine = queue.user_queue_count(account.id).await?;
    Ok(Json(json!({ "queue": overall, "mine": mine })))
}

/// GET /api/v1/queue/items/:id
///
/// Status only. Results reach the caller through sanitized lead views.
pub async fn get_queue_item(
    State(state): State<Arc<AppState>>,
    AuthenticatedAccount(account): AuthenticatedAccount,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let item = state
        .orchestrator
        .queue()
        .get_for_account(id, account.id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Queue item {} not found", id)))?;

    Ok(Json(json!({
        "id": item.id,
        "kind": item.kind,
        "status": item.status,
        "lead_id": item.lead_id,
        "priority": item.priority,
        "has_result": item.result.is_some(),
        "error": item.error,
        "created_at": item.created_at,
        "started_at": item.started_at,
        "completed_at": item.completed_at,
    })))
}

// ============ Credits ============

/// GET /api/v1/credits
pub async fn get_credits(
    State(state): State<Arc<AppState>>,
    AuthenticatedAccount(account): AuthenticatedAccount,
    Query(query): Query<ListQuery>,
) -> Result<Json<BalanceResponse>, AppError> {
    let ledger = state.orchestrator.ledger();
    let balance = ledger.balance(account.id).await?;
    let entries = ledger
        .recent_entries(account.id, query.limit.unwrap_or(20).clamp(1, 100))
        .await?;
    Ok(Json(BalanceResponse { balance, entries }))
}

/// GET /api/v1/credits/packages
pub async fn list_packages() -> Json<serde_json::Value> {
    Json(json!({ "packages": credit_packages() }))
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub package_id: u32,
    pub gateway: GatewayKind,
}

/// POST /api/v1/credits/checkout
pub async fn create_checkout(
    State(state): State<Arc<AppState>>,
    AuthenticatedAccount(account): AuthenticatedAccount,
    Json(payload): Json<CheckoutRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    tracing::info!(
        "POST /credits/checkout - account {} package {} via {}",
        account.id,
        payload.package_id,
        payload.gateway.as_str()
    );
    let charge = state
        .payments
        .checkout(&account, payload.gateway, payload.package_id)
        .await?;
    Ok(Json(json!({ "checkout_url": charge.checkout_url, "reference": charge.reference })))
}

// ============ Webhooks ============

async fn settle(
    state: &AppState,
    kind: GatewayKind,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Json<SettlementOutcome>, AppError> {
    let outcome = state.payments.settle_payment(kind, headers, body).await?;
    tracing::info!("{} webhook settled: {:?}", kind.as_str(), outcome);
    Ok(Json(outcome))
}

/// POST /api/v1/webhooks/kiwify
pub async fn kiwify_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SettlementOutcome>, AppError> {
    settle(&state, GatewayKind::Kiwify, &headers, &body).await
}

/// POST /api/v1/webhooks/mercadopago
pub async fn mercadopago_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SettlementOutcome>, AppError> {
    settle(&state, GatewayKind::MercadoPago, &headers, &body).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn identity_requires_valid_key() {
        let ok = headers(&[
            ("x-api-key", "secret"),
            ("x-user-id", "auth0|123"),
            ("x-user-email", "Ana@Example.com"),
        ]);
        let identity = IdentityHeaders::from_headers(&ok, "secret").unwrap();
        assert_eq!(identity.external_ref, "auth0|123");
        assert_eq!(identity.email, "ana@example.com");

        assert!(matches!(
            IdentityHeaders::from_headers(&ok, "other"),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn identity_rejects_missing_headers() {
        let no_key = headers(&[("x-user-id", "u"), ("x-user-email", "a@b.c")]);
        assert!(IdentityHeaders::from_headers(&no_key, "secret").is_err());

        let no_user = headers(&[("x-api-key", "secret"), ("x-user-email", "a@b.c")]);
        assert!(IdentityHeaders::from_headers(&no_user, "secret").is_err());

        let blank_email = headers(&[
            ("x-api-key", "secret"),
            ("x-user-id", "u"),
            ("x-user-email", "  "),
        ]);
        assert!(IdentityHeaders::from_headers(&blank_email, "secret").is_err());
    }

    #[test]
    fn constant_time_compare_matches_equality() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "abcd"));
    }
}
