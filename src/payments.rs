//! Credit purchases through Kiwify and Mercado Pago.
//!
//! Checkout creation is delegated to the gateway. Crediting happens only
//! from a verified webhook, once per gateway payment id.

use async_trait::async_trait;
use axum::http::HeaderMap;
use bigdecimal::num_bigint::BigInt;
use bigdecimal::{BigDecimal, ToPrimitive};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::errors::{AppError, LedgerError};
use crate::ledger::Ledger;
use crate::models::{Account, LedgerKind, PaymentRef};
use crate::store::Store;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    Kiwify,
    MercadoPago,
}

impl GatewayKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GatewayKind::Kiwify => "kiwify",
            GatewayKind::MercadoPago => "mercadopago",
        }
    }
}

/// A fixed bundle of credits for sale.
#[derive(Debug, Clone, Serialize)]
pub struct CreditPackage {
    pub id: u32,
    pub credits: i64,
    pub price_brl: BigDecimal,
    pub name: &'static str,
}

fn brl(cents: i64) -> BigDecimal {
    BigDecimal::new(BigInt::from(cents), 2)
}

/// The packages on sale, cheapest first.
pub fn credit_packages() -> Vec<CreditPackage> {
    [
        (1, 50, 2500, "Starter"),
        (2, 100, 4000, "Basic"),
        (3, 250, 7500, "Intermediate"),
        (4, 500, 16000, "Advanced"),
        (5, 1000, 28000, "Premium"),
        (6, 2500, 65000, "Enterprise"),
        (7, 5000, 130000, "Corporate"),
    ]
    .into_iter()
    .map(|(id, credits, cents, name)| CreditPackage {
        id,
        credits,
        price_brl: brl(cents),
        name,
    })
    .collect()
}

pub fn find_package(id: u32) -> Option<CreditPackage> {
    credit_packages().into_iter().find(|p| p.id == id)
}

#[derive(Debug, Clone, Serialize)]
pub struct Charge {
    pub checkout_url: String,
    /// Gateway-side reference of the checkout.
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountRef {
    Email(String),
    Id(Uuid),
}

/// A confirmed payment, ready to be credited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub external_id: String,
    pub account_ref: AccountRef,
    pub credits: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Credited { balance: i64 },
    AlreadyProcessed,
    Ignored,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn kind(&self) -> GatewayKind;

    async fn create_charge(
        &self,
        account: &Account,
        package: &CreditPackage,
    ) -> Result<Charge, AppError>;

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> bool;

    /// The settlement a webhook stands for. `None` for events that credit nothing.
    async fn extract_settlement(&self, body: &[u8]) -> Result<Option<Settlement>, AppError>;
}

fn parse_body(gateway: &str, body: &[u8]) -> Result<Value, AppError> {
    serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("Invalid {} webhook payload: {}", gateway, e)))
}

/// Checks a hex HMAC-SHA256 of `message` in constant time.
pub fn verify_hmac_hex(secret: &str, message: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(&signature).is_ok()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// ============ Kiwify ============

pub struct KiwifyGateway {
    checkout_base_url: String,
    webhook_secret: Option<String>,
    /// Package id -> Kiwify product id.
    products: HashMap<u32, String>,
}

impl KiwifyGateway {
    pub fn new(
        checkout_base_url: impl Into<String>,
        webhook_secret: Option<String>,
        products: HashMap<u32, String>,
    ) -> Self {
        Self {
            checkout_base_url: checkout_base_url.into().trim_end_matches('/').to_string(),
            webhook_secret,
            products,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.kiwify_checkout_base_url,
            config.kiwify_webhook_secret.clone(),
            config.kiwify_products.clone(),
        )
    }

    fn credits_for_product(&self, product_id: &str) -> Option<i64> {
        let package_id = self
            .products
            .iter()
            .find(|(_, product)| product.as_str() == product_id)
            .map(|(id, _)| *id)?;
        find_package(package_id).map(|p| p.credits)
    }
}

#[async_trait]
impl PaymentGateway for KiwifyGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Kiwify
    }

    async fn create_charge(
        &self,
        account: &Account,
        package: &CreditPackage,
    ) -> Result<Charge, AppError> {
        let product = self.products.get(&package.id).ok_or_else(|| {
            AppError::BadRequest(format!("Package {} is not sold through Kiwify", package.id))
        })?;

        let url = url::Url::parse_with_params(
            &format!("{}/{}", self.checkout_base_url, product),
            &[("email", account.email.as_str()), ("region", "br")],
        )
        .map_err(|e| AppError::InternalError(format!("Failed to build checkout URL: {}", e)))?;

        Ok(Charge {
            checkout_url: url.to_string(),
            reference: product.clone(),
        })
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> bool {
        let Some(secret) = self.webhook_secret.as_deref() else {
            return true;
        };
        match header(headers, "x-kiwify-signature") {
            Some(signature) => verify_hmac_hex(secret, body, signature),
            None => false,
        }
    }

    async fn extract_settlement(&self, body: &[u8]) -> Result<Option<Settlement>, AppError> {
        let data = parse_body("Kiwify", body)?;

        let order_id = data
            .get("order_id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::BadRequest("Kiwify webhook without order_id".to_string()))?;

        let status = data.get("order_status").and_then(Value::as_str);
        if status != Some("paid") {
            tracing::info!(
                "Kiwify order {} has status {:?}, ignoring",
                order_id,
                status
            );
            return Ok(None);
        }

        let product_id = data
            .pointer("/Product/product_id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::BadRequest("Kiwify webhook without Product.product_id".to_string()))?;
        let email = data
            .pointer("/Customer/email")
            .and_then(Value::as_str)
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| AppError::BadRequest("Kiwify webhook without Customer.email".to_string()))?;

        let credits = self.credits_for_product(product_id).ok_or_else(|| {
            AppError::BadRequest(format!("Kiwify product {} is not a credit package", product_id))
        })?;

        Ok(Some(Settlement {
            external_id: order_id.to_string(),
            account_ref: AccountRef::Email(email),
            credits,
        }))
    }
}

// ============ Mercado Pago ============

pub struct MercadoPagoGateway {
    client: Client,
    base_url: String,
    access_token: String,
    webhook_secret: Option<String>,
    public_base_url: String,
}

impl MercadoPagoGateway {
    pub fn new(
        base_url: impl Into<String>,
        access_token: impl Into<String>,
        webhook_secret: Option<String>,
        public_base_url: impl Into<String>,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create Mercado Pago client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            webhook_secret,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// `None` when Mercado Pago is not configured.
    pub fn from_config(config: &Config) -> Result<Option<Self>, AppError> {
        config
            .mercadopago_access_token
            .as_ref()
            .map(|token| {
                Self::new(
                    &config.mercadopago_base_url,
                    token,
                    config.mercadopago_webhook_secret.clone(),
                    &config.public_base_url,
                )
            })
            .transpose()
    }

    async fn fetch_payment(&self, payment_id: &str) -> Result<Value, AppError> {
        let url = format!("{}/v1/payments/{}", self.base_url, payment_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Mercado Pago request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!("Mercado Pago payment {} lookup returned {}", payment_id, status);
            return Err(AppError::ExternalApiError(format!(
                "Mercado Pago returned status {}",
                status
            )));
        }

        response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse Mercado Pago payment: {}", e))
        })
    }
}

/// `data.id` of a notification, which arrives as a string or a number.
fn notification_data_id(data: &Value) -> Option<String> {
    match data.pointer("/data/id")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses `<account_id>:<credits>[:<timestamp>]`.
pub fn parse_external_reference(reference: &str) -> Option<(Uuid, i64)> {
    let mut parts = reference.split(':');
    let account_id = Uuid::parse_str(parts.next()?).ok()?;
    let credits: i64 = parts.next()?.parse().ok()?;
    (credits > 0).then_some((account_id, credits))
}

#[async_trait]
impl PaymentGateway for MercadoPagoGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::MercadoPago
    }

    async fn create_charge(
        &self,
        account: &Account,
        package: &CreditPackage,
    ) -> Result<Charge, AppError> {
        let external_reference = format!(
            "{}:{}:{}",
            account.id,
            package.credits,
            chrono::Utc::now().timestamp()
        );
        let payload = json!({
            "items": [{
                "id": format!("credits-{}", package.credits),
                "title": format!("{} - {} credits", package.name, package.credits),
                "quantity": 1,
                "currency_id": "BRL",
                "unit_price": package.price_brl.to_f64().unwrap_or_default(),
            }],
            "payer": {"email": account.email},
            "external_reference": external_reference,
            "notification_url": format!("{}/api/v1/webhooks/mercadopago", self.public_base_url),
            "back_urls": {
                "success": format!("{}/payment/success", self.public_base_url),
                "pending": format!("{}/payment/success?status=pending", self.public_base_url),
                "failure": format!("{}/payment/cancel", self.public_base_url),
            },
            "auto_return": "approved",
        });

        tracing::info!(
            "Creating Mercado Pago preference for account {} ({} credits)",
            account.id,
            package.credits
        );
        let response = self
            .client
            .post(format!("{}/checkout/preferences", self.base_url))
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Mercado Pago request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!("Mercado Pago preference failed {}: {}", status, error_text);
            return Err(AppError::ExternalApiError(format!(
                "Mercado Pago returned status {}",
                status
            )));
        }

        let body: Value = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse Mercado Pago preference: {}", e))
        })?;
        let reference = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::ExternalApiError("Mercado Pago preference without id".to_string()))?;
        let checkout_url = body
            .get("init_point")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AppError::ExternalApiError("Mercado Pago preference without init_point".to_string())
            })?;

        Ok(Charge {
            checkout_url: checkout_url.to_string(),
            reference: reference.to_string(),
        })
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> bool {
        let Some(secret) = self.webhook_secret.as_deref() else {
            return true;
        };
        let Some(signature) = header(headers, "x-signature") else {
            return false;
        };
        let request_id = header(headers, "x-request-id").unwrap_or("");

        let parts: HashMap<&str, &str> = signature
            .split(',')
            .filter_map(|part| part.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();
        let (Some(ts), Some(v1)) = (parts.get("ts"), parts.get("v1")) else {
            return false;
        };

        let Some(data_id) = serde_json::from_slice::<Value>(body)
            .ok()
            .as_ref()
            .and_then(notification_data_id)
        else {
            return false;
        };

        let manifest = format!("id:{};request-id:{};ts:{};", data_id, request_id, ts);
        verify_hmac_hex(secret, manifest.as_bytes(), v1)
    }

    async fn extract_settlement(&self, body: &[u8]) -> Result<Option<Settlement>, AppError> {
        let data = parse_body("Mercado Pago", body)?;

        let kind = data.get("type").and_then(Value::as_str);
        if kind != Some("payment") {
            tracing::info!("Mercado Pago notification type {:?} ignored", kind);
            return Ok(None);
        }

        let payment_id = notification_data_id(&data).ok_or_else(|| {
            AppError::BadRequest("Mercado Pago notification without data.id".to_string())
        })?;
        let payment = self.fetch_payment(&payment_id).await?;

        let status = payment.get("status").and_then(Value::as_str);
        if status != Some("approved") {
            tracing::info!("Mercado Pago payment {} is {:?}, ignoring", payment_id, status);
            return Ok(None);
        }

        let reference = payment
            .get("external_reference")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let (account_id, credits) = parse_external_reference(reference).ok_or_else(|| {
            AppError::BadRequest(format!(
                "Mercado Pago payment {} has an unusable external_reference",
                payment_id
            ))
        })?;

        Ok(Some(Settlement {
            external_id: payment_id,
            account_ref: AccountRef::Id(account_id),
            credits,
        }))
    }
}

// ============ Settlement ============

/// Routes checkouts and webhooks to the configured gateways.
#[derive(Clone)]
pub struct PaymentProcessor {
    store: Arc<dyn Store>,
    ledger: Ledger,
    gateways: HashMap<GatewayKind, Arc<dyn PaymentGateway>>,
}

impl PaymentProcessor {
    pub fn new(store: Arc<dyn Store>, gateways: Vec<Arc<dyn PaymentGateway>>) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            store,
            gateways: gateways.into_iter().map(|g| (g.kind(), g)).collect(),
        }
    }

    pub fn gateway(&self, kind: GatewayKind) -> Result<&Arc<dyn PaymentGateway>, AppError> {
        self.gateways
            .get(&kind)
            .ok_or_else(|| AppError::BadRequest(format!("{} is not enabled", kind.as_str())))
    }

    pub async fn checkout(
        &self,
        account: &Account,
        kind: GatewayKind,
        package_id: u32,
    ) -> Result<Charge, AppError> {
        let package = find_package(package_id)
            .ok_or_else(|| AppError::BadRequest(format!("Unknown package {}", package_id)))?;
        self.gateway(kind)?.create_charge(account, &package).await
    }

    /// Credits the account behind a gateway webhook, at most once per payment.
    pub async fn settle_payment(
        &self,
        kind: GatewayKind,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<SettlementOutcome, AppError> {
        let gateway = self.gateway(kind)?;

        if !gateway.verify_webhook(headers, body) {
            tracing::warn!("Rejected {} webhook with an invalid signature", kind.as_str());
            return Err(AppError::Unauthorized("Invalid webhook signature".to_string()));
        }

        let Some(settlement) = gateway.extract_settlement(body).await? else {
            return Ok(SettlementOutcome::Ignored);
        };

        let payment = PaymentRef {
            gateway: kind.as_str().to_string(),
            external_id: settlement.external_id.clone(),
        };
        if self.ledger.find_payment(&payment).await?.is_some() {
            tracing::info!(
                "{} payment {} already credited",
                kind.as_str(),
                payment.external_id
            );
            return Ok(SettlementOutcome::AlreadyProcessed);
        }

        let account = match &settlement.account_ref {
            AccountRef::Email(email) => self.store.find_account_by_email(email).await?,
            AccountRef::Id(id) => self.store.get_account(*id).await?,
        }
        .ok_or_else(|| {
            tracing::error!(
                "{} payment {} references an unknown account",
                kind.as_str(),
                payment.external_id
            );
            AppError::NotFound("Account for payment not found".to_string())
        })?;

        let description = format!(
            "Purchase: {} credits ({} {})",
            settlement.credits,
            kind.as_str(),
            payment.external_id
        );
        match self
            .ledger
            .credit(
                account.id,
                settlement.credits,
                LedgerKind::Purchase,
                &description,
                Some(&payment),
            )
            .await
        {
            Ok(balance) => Ok(SettlementOutcome::Credited { balance }),
            Err(LedgerError::DuplicatePayment { .. }) => Ok(SettlementOutcome::AlreadyProcessed),
            Err(e) => Err(e.into()),
        }
    }
}
