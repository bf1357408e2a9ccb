/// Catering Checkout Backend
///
/// Entry point of the checkout and payment service. It wires the
/// configuration, the PostgreSQL-backed repositories, the delivery zone
/// cache, the payment gateway, the notification channel and the HTTP server.
///
/// # Architecture
///
/// - Repository layer for data access
/// - Service layer for the checkout state machine
/// - Gateway adapter for the card-payment provider
/// - API layer for HTTP endpoints and metrics
use std::sync::Arc;

use anyhow::{Context, Result};
use app_config::AppConfig;
use cache::ZoneCache;
use gateway::{HttpPaymentGateway, PaymentGateway, SandboxGateway};
use notifier::{KafkaNotifier, LogNotifier};
use repository::{PgCouponsRepository, PgOrdersRepository, PgZonesRepository};
use secrecy::{ExposeSecret, SecretString};
use server::Server;
use service::{
    CheckoutOrchestrator, CheckoutService, CheckoutSettings, DeliveryFeeCalculator,
    NotificationDispatcher,
};
use tokio::signal;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber for logging. `RUST_LOG` overrides the
/// default `info` level.
fn init_logger() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn build_gateway(config: &AppConfig) -> Result<Arc<dyn PaymentGateway>> {
    if !config.has_gateway_credentials() {
        warn!("No payment gateway key configured, using the sandbox gateway");
        return Ok(Arc::new(SandboxGateway::new()));
    }

    let api_key = SecretString::from(config.gateway_api_key.expose_secret().to_string());
    let gateway = HttpPaymentGateway::new(
        config.gateway_base_url.clone(),
        api_key,
        config.gateway_timeout,
    )
    .context("Failed to create payment gateway client")?;
    info!(base_url = %config.gateway_base_url, "Using HTTP payment gateway");
    Ok(Arc::new(gateway))
}

fn build_notifier(config: &AppConfig) -> Arc<dyn NotificationDispatcher> {
    if config.kafka_brokers.iter().all(|b| b.trim().is_empty()) {
        warn!("No Kafka brokers configured, order confirmations will only be logged");
        return Arc::new(LogNotifier);
    }

    match KafkaNotifier::from_config(config) {
        Ok(notifier) => Arc::new(notifier),
        Err(err) => {
            error!("Failed to initialize Kafka notifier: {:#}", err);
            Arc::new(LogNotifier)
        }
    }
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();

    info!("Catering checkout backend starting...");

    let config = AppConfig::load().context("Failed to load configuration")?;

    let db_pool = db::init_db_pool(&config)
        .await
        .context("Failed to initialize database")?;
    info!("Database initialized successfully");

    let zones_repo = Arc::new(PgZonesRepository::new(db_pool.clone()));
    let coupons_repo = Arc::new(PgCouponsRepository::new(db_pool.clone()));
    let orders_repo = Arc::new(PgOrdersRepository::new(db_pool));

    let zone_cache = Arc::new(ZoneCache::new());
    match zone_cache.load_from_db(zones_repo.as_ref()).await {
        Ok(count) => info!("Loaded {} active delivery zones", count),
        // Every postcode gets the default fee until the next refresh succeeds.
        Err(e) => error!("Failed to load delivery zones: {:#}", e),
    }

    let orchestrator = Arc::new(CheckoutOrchestrator::new(
        zone_cache.clone(),
        DeliveryFeeCalculator::new(
            config.default_delivery_fee,
            config.default_delivery_area.clone(),
        ),
        build_gateway(&config)?,
        coupons_repo,
        orders_repo,
        build_notifier(&config),
        CheckoutSettings {
            currency: config.currency.clone(),
            intent_retry_backoff: config.gateway_retry_backoff,
            ledger_max_attempts: config.ledger_max_attempts,
            ledger_retry_backoff: config.ledger_retry_backoff,
        },
    ));
    let settlements = orchestrator.settlements();
    let checkout: Arc<dyn CheckoutService> = orchestrator;

    let refresh_shutdown = Arc::new(Notify::new());
    let server_shutdown = Arc::new(Notify::new());
    let mut tasks = JoinSet::new();

    tasks.spawn(cache::run_refresh(
        zone_cache,
        zones_repo,
        config.zone_refresh_interval,
        refresh_shutdown.clone(),
    ));

    let http_server = Server::new(config.http_port, checkout)?;
    let http_shutdown = server_shutdown.clone();
    tasks.spawn(async move {
        if let Err(err) = http_server.start(http_shutdown).await {
            error!("HTTP server error: {:#}", err);
        }
    });

    tokio::select! {
        _ = shutdown_signal() => {}
        Some(res) = tasks.join_next() => {
            if let Err(err) = res {
                error!("Task error: {}", err);
            }
            warn!("A service task stopped unexpectedly, shutting down");
        }
    }

    server_shutdown.notify_one();
    refresh_shutdown.notify_one();

    let drain = async {
        while let Some(res) = tasks.join_next().await {
            if let Err(err) = res {
                error!("Task error: {}", err);
            }
        }
    };
    if tokio::time::timeout(config.shutdown_timeout, drain).await.is_err() {
        warn!(
            "Shutdown did not finish within {:?}, aborting remaining tasks",
            config.shutdown_timeout
        );
        tasks.abort_all();
    }

    // A card may already have been charged, so these run to completion
    // regardless of the shutdown timeout.
    settlements.close();
    if !settlements.is_empty() {
        info!(pending = settlements.len(), "Waiting for in-flight payments to settle");
    }
    settlements.wait().await;

    info!("Application stopped");
    Ok(())
}
