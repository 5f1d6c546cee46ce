//! Warden - Entry Point
//!
//! Runs the health scheduler against the PostgreSQL registry and the configured
//! shared store until a shutdown signal arrives. The assignment selector is built
//! with the same registry so its configuration is validated and the pool's usage
//! is reported at startup.

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use warden::config::LogConfig;
use warden::health::{AlertEmitter, TransportProber};
use warden::repository::{AccountRepository, IdentityStore, ProxyRegistry, ProxyRepository};
use warden::{store, AssignmentSelector, Config, Database, HealthScheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!("Starting Warden proxy health engine");

    // Connect to database
    let db = Database::new(&config).await?;
    db.run_migrations().await?;
    let latency = db.health_check().await?;
    info!(latency_ms = latency.as_millis() as u64, "Database reachable");

    let store = store::connect(&config.store).await?;
    info!(backend = ?config.store.backend, "Shared store ready");

    let registry: Arc<dyn ProxyRegistry> = Arc::new(ProxyRepository::new(db.pool().clone()));
    let identities: Arc<dyn IdentityStore> = Arc::new(AccountRepository::new(db.pool().clone()));
    let prober = Arc::new(TransportProber::new(config.health.default_check_url.clone()));
    let alerts = AlertEmitter::new(store.clone());

    let selector = AssignmentSelector::new(
        registry.clone(),
        identities,
        store.clone(),
        &config.assignment,
    );

    let scheduler = HealthScheduler::new(
        registry,
        store,
        prober,
        alerts,
        config.health.clone(),
    );

    let metrics = scheduler.metrics().await?;
    info!(
        total = metrics.total_proxies,
        active = metrics.active_proxies,
        quarantined = metrics.error_proxies,
        inactive = metrics.inactive_proxies,
        "Loaded proxy registry"
    );

    let usage = selector.usage().await?;
    info!(
        assigned = usage.assigned_proxies,
        available = usage.available_proxies,
        identities = usage.total_assignments,
        default_strategy = %config.assignment.default_strategy,
        round_robin_order = config.assignment.round_robin_order.as_str(),
        "Loaded proxy assignments"
    );

    let shutdown = CancellationToken::new();
    let handle = scheduler.start(shutdown.clone());

    shutdown_signal().await;
    info!("Shutdown signal received");

    handle.stop().await;
    db.close().await;

    info!("Warden stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("warden={},sqlx=warn", log.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    if log.format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
