//! HTTP clients for the external collaborators.
//!
//! Each capability sits behind a small trait so the orchestrator and the
//! queue consumer can be exercised without the network.

use async_trait::async_trait;
use failsafe::futures::CircuitBreaker;
use moka::future::Cache;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::circuit_breaker::{create_external_api_breaker, ExternalBreaker};
use crate::config::Config;
use crate::credentials::SessionCredentials;
use crate::documents::extract_cnpj;
use crate::errors::{AppError, EnrichmentError};
use crate::models::Place;
use crate::normalize::normalize_niche;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RESOLVER_CACHE_TTL: Duration = Duration::from_secs(86400);

/// Maps search: businesses matching a free-text query.
#[async_trait]
pub trait MapsSearch: Send + Sync {
    /// One page of results. An empty page means there are no more.
    async fn search_places(
        &self,
        query: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Place>, AppError>;
}

/// Resolves a business name to its CNPJ.
#[async_trait]
pub trait IdentifierResolver: Send + Sync {
    async fn resolve_business_id(&self, name: &str) -> Result<Option<String>, AppError>;
}

/// Public registry records.
#[async_trait]
pub trait RegistryLookup: Send + Sync {
    async fn fetch_company(&self, cnpj: &str) -> Result<Option<Value>, AppError>;

    async fn fetch_person(&self, cpf: &str) -> Result<Option<Value>, AppError>;
}

/// Ownership records from the session-authenticated partners API.
#[async_trait]
pub trait EnrichmentFetcher: Send + Sync {
    async fn fetch_partners(
        &self,
        cnpj: &str,
        credentials: &SessionCredentials,
    ) -> Result<Value, EnrichmentError>;
}

fn build_client(service: &str) -> Result<Client, AppError> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| AppError::ExternalApiError(format!("Failed to create {} client: {}", service, e)))
}

fn unwrap_breaker<T>(
    service: &str,
    result: Result<T, failsafe::Error<AppError>>,
) -> Result<T, AppError> {
    match result {
        Ok(value) => Ok(value),
        Err(failsafe::Error::Inner(e)) => Err(e),
        Err(failsafe::Error::Rejected) => {
            tracing::warn!("{} circuit breaker is open, failing fast", service);
            Err(AppError::ExternalApiError(format!(
                "{} temporarily unavailable",
                service
            )))
        }
    }
}

async fn error_body(response: reqwest::Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string())
}

// ============ Serper ============

#[derive(Debug, Deserialize)]
struct SerperPlacesResponse {
    #[serde(default)]
    places: Vec<SerperPlace>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SerperPlace {
    title: Option<String>,
    address: Option<String>,
    phone_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SerperSearchResponse {
    #[serde(default)]
    organic: Vec<SerperOrganic>,
}

#[derive(Debug, Deserialize)]
struct SerperOrganic {
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
}

/// Serper.dev client for maps search and CNPJ discovery.
#[derive(Clone)]
pub struct SerperClient {
    client: Client,
    base_url: String,
    api_key: String,
    breaker: ExternalBreaker,
    /// Normalized name -> CNPJ. Misses are cached too.
    resolved: Cache<String, Option<String>>,
}

impl SerperClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client("Serper")?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            breaker: create_external_api_breaker(),
            resolved: Cache::builder()
                .time_to_live(RESOLVER_CACHE_TTL)
                .max_capacity(50_000)
                .build(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        Self::new(&config.serper_base_url, &config.serper_api_key)
    }

    async fn post(&self, endpoint: &str, body: Value) -> Result<reqwest::Response, AppError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .client
            .post(&url)
            .header("X-API-KEY", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Serper request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = error_body(response).await;
            tracing::error!("Serper /{} returned error {}: {}", endpoint, status, error_text);
            return Err(AppError::ExternalApiError(format!(
                "Serper returned status {}: {}",
                status, error_text
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl MapsSearch for SerperClient {
    async fn search_places(
        &self,
        query: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Place>, AppError> {
        tracing::info!("Searching places for '{}' (page {})", query, page);

        let result = self
            .breaker
            .call(async {
                let response = self
                    .post("places", json!({"q": query, "page": page, "num": page_size}))
                    .await?;
                response.json::<SerperPlacesResponse>().await.map_err(|e| {
                    AppError::ExternalApiError(format!("Failed to parse Serper places: {}", e))
                })
            })
            .await;
        let body = unwrap_breaker("Serper", result)?;

        Ok(body
            .places
            .into_iter()
            .filter_map(|p| {
                let name = p.title?.trim().to_string();
                (!name.is_empty()).then_some(Place {
                    name,
                    address: p.address,
                    phone: p.phone_number,
                })
            })
            .collect())
    }
}

#[async_trait]
impl IdentifierResolver for SerperClient {
    async fn resolve_business_id(&self, name: &str) -> Result<Option<String>, AppError> {
        let key = normalize_niche(name);
        if key.is_empty() {
            return Ok(None);
        }
        if let Some(cached) = self.resolved.get(&key).await {
            return Ok(cached);
        }

        let result = self
            .breaker
            .call(async {
                let response = self.post("search", json!({"q": format!("CNPJ {}", name)})).await?;
                response.json::<SerperSearchResponse>().await.map_err(|e| {
                    AppError::ExternalApiError(format!("Failed to parse Serper search: {}", e))
                })
            })
            .await;
        let body = unwrap_breaker("Serper", result)?;

        let cnpj = body
            .organic
            .iter()
            .find_map(|r| extract_cnpj(&format!("{} {}", r.title, r.snippet)));

        match &cnpj {
            Some(cnpj) => tracing::debug!("Resolved '{}' to CNPJ {}", name, cnpj),
            None => tracing::debug!("No CNPJ found for '{}'", name),
        }
        self.resolved.insert(key, cnpj.clone()).await;
        Ok(cnpj)
    }
}

// ============ Viper ============

/// Viper client: the public registry API and the internal partners API.
#[derive(Clone)]
pub struct ViperClient {
    client: Client,
    base_url: String,
    partners_url: String,
    api_key: String,
    breaker: ExternalBreaker,
}

impl ViperClient {
    pub fn new(
        base_url: impl Into<String>,
        partners_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client("Viper")?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            partners_url: partners_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            breaker: create_external_api_breaker(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        Self::new(
            &config.viper_base_url,
            &config.viper_partners_url,
            &config.viper_api_key,
        )
    }

    async fn fetch_record(&self, kind: &str, document: &str) -> Result<Option<Value>, AppError> {
        let url = format!("{}/ws/viperphone/{}/{}", self.base_url, kind, document);
        tracing::info!("Fetching registry {} record {}", kind, document);

        let result = self
            .breaker
            .call(async {
                let response = self
                    .client
                    .get(&url)
                    .header("Authorization", format!("Basic {}", self.api_key))
                    .send()
                    .await
                    .map_err(|e| {
                        AppError::ExternalApiError(format!("Viper request failed: {}", e))
                    })?;

                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                if !response.status().is_success() {
                    let status = response.status();
                    let error_text = error_body(response).await;
                    tracing::error!("Viper returned error {}: {}", status, error_text);
                    return Err(AppError::ExternalApiError(format!(
                        "Viper returned status {}: {}",
                        status, error_text
                    )));
                }

                let text = response.text().await.map_err(|e| {
                    AppError::ExternalApiError(format!("Failed to read Viper response: {}", e))
                })?;
                if text.trim().is_empty() {
                    return Ok(None);
                }
                serde_json::from_str::<Value>(&text).map(Some).map_err(|e| {
                    AppError::ExternalApiError(format!("Failed to parse Viper response: {}", e))
                })
            })
            .await;

        let record = unwrap_breaker("Viper", result)?;
        Ok(record.filter(|v| !crate::store::is_empty_value(v)))
    }
}

#[async_trait]
impl RegistryLookup for ViperClient {
    async fn fetch_company(&self, cnpj: &str) -> Result<Option<Value>, AppError> {
        self.fetch_record("cnpj", cnpj).await
    }

    async fn fetch_person(&self, cpf: &str) -> Result<Option<Value>, AppError> {
        self.fetch_record("cpf", cpf).await
    }
}

#[async_trait]
impl EnrichmentFetcher for ViperClient {
    async fn fetch_partners(
        &self,
        cnpj: &str,
        credentials: &SessionCredentials,
    ) -> Result<Value, EnrichmentError> {
        if credentials.is_empty() {
            return Err(EnrichmentError::MissingCredentials);
        }

        let url = format!(
            "{}/server/api/infoqualy/consultaCNPJSocios",
            self.partners_url
        );
        tracing::info!("Fetching partners for CNPJ {}", cnpj);

        let mut request = self
            .client
            .post(&url)
            .header("origin", &self.partners_url)
            .header("referer", format!("{}/", self.partners_url))
            .json(&json!({"CNPJ": cnpj.trim()}));
        for (name, value) in &credentials.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        // An expired session is not an outage; keep it out of the failure count.
        let result = self
            .breaker
            .call_with(
                |e: &EnrichmentError| !matches!(e, EnrichmentError::AuthExpired),
                async move {
                    let response = request.send().await.map_err(|e| {
                        EnrichmentError::Upstream(format!("partners request failed: {}", e))
                    })?;

                    let status = response.status();
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(EnrichmentError::AuthExpired);
                    }
                    if !status.is_success() {
                        let error_text = error_body(response).await;
                        return Err(EnrichmentError::Upstream(format!(
                            "partners API returned status {}: {}",
                            status, error_text
                        )));
                    }

                    response.json::<Value>().await.map_err(|e| {
                        EnrichmentError::Upstream(format!("failed to parse partners response: {}", e))
                    })
                },
            )
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(failsafe::Error::Inner(e)) => Err(e),
            Err(failsafe::Error::Rejected) => Err(EnrichmentError::Upstream(
                "partners API temporarily unavailable".to_string(),
            )),
        }
    }
}
