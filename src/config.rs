use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub api_key: String,
    pub serper_api_key: String,
    pub serper_base_url: String,
    pub viper_api_key: String,
    pub viper_base_url: String,
    pub viper_partners_url: String,
    pub viper_tokens_path: String,
    pub viper_refresh_command: Option<String>,
    pub viper_refresh_timeout_secs: u64,
    pub retention_days: i64,
    pub search_page_size: u32,
    pub search_max_pages: u32,
    pub lookup_wait_secs: u64,
    pub unlock_cost: i64,
    pub queue_poll_interval_secs: u64,
    /// Run the queue consumer inside the API process.
    pub embedded_worker: bool,
    pub kiwify_webhook_secret: Option<String>,
    pub kiwify_checkout_base_url: String,
    /// Credit package id -> Kiwify product id.
    pub kiwify_products: HashMap<u32, String>,
    pub mercadopago_access_token: Option<String>,
    pub mercadopago_webhook_secret: Option<String>,
    pub mercadopago_base_url: String,
    pub public_base_url: String,
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name)
        .map_err(|_| anyhow::anyhow!("{} environment variable required", name))
        .and_then(|value| {
            if value.trim().is_empty() {
                anyhow::bail!("{} cannot be empty", name);
            }
            Ok(value)
        })
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn http_url(name: &str, default: &str) -> anyhow::Result<String> {
    let url = std::env::var(name).unwrap_or_else(|_| default.to_string());
    if !url.starts_with("http://") && !url.starts_with("https://") {
        anyhow::bail!("{} must start with http:// or https://", name);
    }
    Ok(url.trim_end_matches('/').to_string())
}

fn number<T: std::str::FromStr>(name: &str, default: &str) -> anyhow::Result<T> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| anyhow::anyhow!("{} must be a valid number", name))
}

/// Parses `1=uuid-a,2=uuid-b` into a package map.
pub fn parse_product_map(raw: &str) -> anyhow::Result<HashMap<u32, String>> {
    let mut map = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (package, product) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("KIWIFY_PRODUCTS entry '{}' must be id=product", pair))?;
        let package: u32 = package
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("KIWIFY_PRODUCTS package id '{}' is not a number", package))?;
        map.insert(package, product.trim().to_string());
    }
    Ok(map)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .or_else(|_| std::env::var("DB_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DATABASE_URL or DB_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DATABASE_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DATABASE_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: number("PORT", "3000")?,
            api_key: required("API_KEY")?,
            serper_api_key: required("SERPER_API_KEY")?,
            serper_base_url: http_url("SERPER_BASE_URL", "https://google.serper.dev")?,
            viper_api_key: required("VIPER_API_KEY")?,
            viper_base_url: http_url("VIPER_BASE_URL", "https://api.viperphone.com.br")?,
            viper_partners_url: http_url(
                "VIPER_PARTNERS_URL",
                "https://sistemas.vipersolucoes.com.br",
            )?,
            viper_tokens_path: std::env::var("VIPER_TOKENS_PATH")
                .unwrap_or_else(|_| "viper_tokens.json".to_string()),
            viper_refresh_command: optional("VIPER_REFRESH_COMMAND"),
            viper_refresh_timeout_secs: number("VIPER_REFRESH_TIMEOUT_SECS", "120")?,
            retention_days: number::<i64>("RETENTION_DAYS", "30").and_then(|days| {
                if days < 0 {
                    anyhow::bail!("RETENTION_DAYS cannot be negative");
                }
                Ok(days)
            })?,
            search_page_size: number::<u32>("SEARCH_PAGE_SIZE", "10").and_then(|size| {
                if size == 0 || size > 100 {
                    anyhow::bail!("SEARCH_PAGE_SIZE must be between 1 and 100");
                }
                Ok(size)
            })?,
            search_max_pages: number::<u32>("SEARCH_MAX_PAGES", "5").and_then(|pages| {
                if pages == 0 {
                    anyhow::bail!("SEARCH_MAX_PAGES must be at least 1");
                }
                Ok(pages)
            })?,
            lookup_wait_secs: number("LOOKUP_WAIT_SECS", "30")?,
            unlock_cost: number::<i64>("UNLOCK_COST", "1").and_then(|cost| {
                if cost <= 0 {
                    anyhow::bail!("UNLOCK_COST must be positive");
                }
                Ok(cost)
            })?,
            queue_poll_interval_secs: number("QUEUE_POLL_INTERVAL_SECS", "5")?,
            embedded_worker: std::env::var("EMBEDDED_WORKER")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("EMBEDDED_WORKER must be true or false"))?,
            kiwify_webhook_secret: optional("KIWIFY_WEBHOOK_SECRET"),
            kiwify_checkout_base_url: http_url(
                "KIWIFY_CHECKOUT_BASE_URL",
                "https://pay.kiwify.com.br",
            )?,
            kiwify_products: parse_product_map(
                &std::env::var("KIWIFY_PRODUCTS").unwrap_or_default(),
            )?,
            mercadopago_access_token: optional("MERCADOPAGO_ACCESS_TOKEN"),
            mercadopago_webhook_secret: optional("MERCADOPAGO_WEBHOOK_SECRET"),
            mercadopago_base_url: http_url(
                "MERCADOPAGO_BASE_URL",
                "https://api.mercadopago.com",
            )?,
            public_base_url: http_url("PUBLIC_BASE_URL", "http://localhost:3000")?,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        tracing::debug!("Serper Base URL: {}", config.serper_base_url);
        tracing::debug!("Viper Base URL: {}", config.viper_base_url);
        if config.viper_refresh_command.is_none() {
            tracing::warn!("VIPER_REFRESH_COMMAND not set; expired partner sessions cannot be refreshed");
        }
        if config.kiwify_webhook_secret.is_none() {
            tracing::warn!("KIWIFY_WEBHOOK_SECRET not set; Kiwify webhooks are accepted unsigned");
        }
        if config.mercadopago_access_token.is_some() {
            tracing::info!("Mercado Pago gateway enabled");
        }
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }

    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }
}
