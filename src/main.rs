use axum::{
    routing::{get, post},
    Router,
};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_leads_api::config::Config;
use rust_leads_api::credentials::{CredentialProvider, FileCredentialProvider};
use rust_leads_api::db::Database;
use rust_leads_api::handlers::{self, AppState};
use rust_leads_api::payments::{KiwifyGateway, MercadoPagoGateway, PaymentGateway, PaymentProcessor};
use rust_leads_api::pg_store::PgStore;
use rust_leads_api::search::{SearchOrchestrator, SearchSettings};
use rust_leads_api::services::{SerperClient, ViperClient};
use rust_leads_api::store::Store;
use rust_leads_api::worker::{run_cleanup_loop, QueueWorker};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Main entry point for the application.
///
/// Initializes tracing, configuration, the database and the external
/// clients, spawns the queue consumer with its hourly cleanup unless
/// `EMBEDDED_WORKER=false`, and serves the HTTP API until Ctrl-C.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_leads_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    // Initialize database connection pool
    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");
    let store: Arc<dyn Store> = Arc::new(PgStore::new(db.pool.clone()));

    // External clients
    let serper = Arc::new(SerperClient::from_config(&config)?);
    let viper = Arc::new(ViperClient::from_config(&config)?);
    let credentials: Arc<dyn CredentialProvider> = Arc::new(FileCredentialProvider::new(
        &config.viper_tokens_path,
        config.viper_refresh_command.clone(),
        Duration::from_secs(config.viper_refresh_timeout_secs),
    ));

    let orchestrator = SearchOrchestrator::new(
        store.clone(),
        serper.clone(),
        serper,
        viper.clone(),
        SearchSettings::from_config(&config),
    );

    // Payment gateways
    let mut gateways: Vec<Arc<dyn PaymentGateway>> =
        vec![Arc::new(KiwifyGateway::from_config(&config))];
    match MercadoPagoGateway::from_config(&config)? {
        Some(gateway) => {
            tracing::info!("✓ Mercado Pago gateway enabled");
            gateways.push(Arc::new(gateway));
        }
        None => tracing::info!("Mercado Pago not configured, checkout limited to Kiwify"),
    }
    let payments = PaymentProcessor::new(store.clone(), gateways);

    // External identity -> account cache (5 minute TTL)
    let account_cache = Cache::builder()
        .time_to_live(Duration::from_secs(300))
        .max_capacity(10_000)
        .build();

    // Queue consumer and hourly cleanup
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = if config.embedded_worker {
        let worker = QueueWorker::new(store.clone(), viper.clone(), viper, credentials)
            .with_poll_interval(Duration::from_secs(config.queue_poll_interval_secs));
        let cleanup_queue = worker.queue().clone();
        let worker_shutdown = shutdown_rx.clone();
        Some((
            tokio::spawn(async move { worker.run(worker_shutdown).await }),
            tokio::spawn(run_cleanup_loop(cleanup_queue, CLEANUP_INTERVAL, shutdown_rx)),
        ))
    } else {
        tracing::info!("Embedded queue consumer disabled, run queue-worker separately");
        None
    };

    // Build application state
    let app_state = Arc::new(AppState {
        config: config.clone(),
        store,
        orchestrator,
        payments,
        account_cache,
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
    );

    // Build protected routes with security layers
    let protected_routes = Router::new()
        // Searches
        .route(
            "/api/v1/searches",
            post(handlers::create_search).get(handlers::list_searches),
        )
        .route(
            "/api/v1/searches/:id",
            get(handlers::get_search).delete(handlers::delete_search),
        )
        .route("/api/v1/searches/:id/leads", get(handlers::get_search_leads))
        // Leads & direct lookups
        .route("/api/v1/leads/:id/unlock", post(handlers::unlock_lead))
        .route("/api/v1/lookups/cnpj", post(handlers::lookup_company))
        .route("/api/v1/lookups/cpf", post(handlers::lookup_person))
        // Queue
        .route("/api/v1/queue/status", get(handlers::queue_status))
        .route("/api/v1/queue/items/:id", get(handlers::get_queue_item))
        // Credits
        .route("/api/v1/credits", get(handlers::get_credits))
        .route("/api/v1/credits/packages", get(handlers::list_packages))
        .route("/api/v1/credits/checkout", post(handlers::create_checkout))
        .layer(
            ServiceBuilder::new()
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
                // Rate limiting: 10 req/sec per IP, burst of 20
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Payment webhooks are signed by the gateways, not by our identity proxy
    let webhook_routes = Router::new()
        .route("/api/v1/webhooks/kiwify", post(handlers::kiwify_webhook))
        .route(
            "/api/v1/webhooks/mercadopago",
            post(handlers::mercadopago_webhook),
        )
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES));

    // Build final app with health check (bypasses rate limiting)
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .merge(webhook_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    })
    .await?;

    let _ = shutdown_tx.send(true);
    if let Some((worker_task, cleanup_task)) = background {
        let _ = tokio::join!(worker_task, cleanup_task);
    }

    Ok(())
}
