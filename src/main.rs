//! Application entry point.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use dotenvy::dotenv;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use resilient_ledger::api::create_router;
use resilient_ledger::app::{
    AppState, CrankConfig, OutboxRelayConfig, register_default_subscribers, spawn_outbox_relay,
    spawn_stale_crank,
};
use resilient_ledger::infra::metrics::Metrics;
use resilient_ledger::infra::{BreakerSettings, PostgresClient, PostgresConfig};

/// Application configuration
struct Config {
    database_url: String,
    host: String,
    port: u16,
    breaker_settings: BreakerSettings,
    async_concurrency: usize,
    relay_config: OutboxRelayConfig,
    crank_config: CrankConfig,
    json_logs: bool,
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env_parse("PORT", 3000);

        let breaker_settings = BreakerSettings::default()
            .with_max_requests(env_parse("BREAKER_MAX_REQUESTS", 3))
            .with_interval(Duration::from_secs(env_parse("BREAKER_INTERVAL_SECS", 60)))
            .with_timeout(Duration::from_secs(env_parse("BREAKER_TIMEOUT_SECS", 30)));

        let relay_config = OutboxRelayConfig {
            poll_interval: Duration::from_secs(env_parse("OUTBOX_POLL_INTERVAL_SECS", 5)),
            batch_size: env_parse("OUTBOX_BATCH_SIZE", 100),
            max_backoff: Duration::from_secs(env_parse("OUTBOX_MAX_BACKOFF_SECS", 300)),
            enabled: env_flag("ENABLE_OUTBOX_RELAY", true),
        };

        let crank_config = CrankConfig {
            poll_interval: Duration::from_secs(env_parse("CRANK_POLL_INTERVAL_SECS", 60)),
            stale_after: Duration::from_secs(env_parse("CRANK_STALE_AFTER_SECS", 300)),
            batch_size: env_parse("CRANK_BATCH_SIZE", 20),
            enabled: env_flag("ENABLE_STALE_CRANK", true),
        };

        ensure!(
            !relay_config.poll_interval.is_zero(),
            "OUTBOX_POLL_INTERVAL_SECS must be at least 1"
        );
        ensure!(
            !crank_config.poll_interval.is_zero(),
            "CRANK_POLL_INTERVAL_SECS must be at least 1"
        );
        ensure!(relay_config.batch_size > 0, "OUTBOX_BATCH_SIZE must be positive");
        ensure!(crank_config.batch_size > 0, "CRANK_BATCH_SIZE must be positive");

        let json_logs = env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(Self {
            database_url,
            host,
            port,
            breaker_settings,
            async_concurrency: env_parse("EVENT_BUS_ASYNC_CONCURRENCY", 64),
            relay_config,
            crank_config,
            json_logs,
        })
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

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
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let config = Config::from_env()?;
    init_tracing(config.json_logs);

    info!("Resilient Ledger v{}", env!("CARGO_PKG_VERSION"));

    Metrics::init().context("Failed to register metrics")?;

    let postgres_client = PostgresClient::new(&config.database_url, PostgresConfig::default())
        .await
        .context("Failed to connect to PostgreSQL")?;
    postgres_client.run_migrations().await?;
    info!("Database connected and migrations applied");

    let app_state = AppState::with_config(
        Arc::new(postgres_client),
        config.breaker_settings.clone(),
        config.async_concurrency,
        config.relay_config.max_backoff,
    );
    register_default_subscribers(&app_state.bus);
    let app_state = Arc::new(app_state);

    let relay_worker = if config.relay_config.enabled {
        Some(spawn_outbox_relay(
            Arc::clone(&app_state.relay),
            config.relay_config.clone(),
        ))
    } else {
        info!("Outbox relay disabled");
        None
    };

    let crank_worker = if config.crank_config.enabled {
        Some(spawn_stale_crank(
            Arc::clone(&app_state.service),
            config.crank_config.clone(),
        ))
    } else {
        info!("Stale transaction crank disabled");
        None
    };

    let router = create_router(app_state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Server starting on http://{}", addr);
    info!("Swagger UI available at http://{}/swagger-ui", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for (name, worker) in [("outbox relay", relay_worker), ("stale crank", crank_worker)] {
        if let Some((handle, shutdown_tx)) = worker {
            let _ = shutdown_tx.send(true);
            if let Err(e) = handle.await {
                error!(worker = name, error = %e, "Worker terminated abnormally");
            }
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
