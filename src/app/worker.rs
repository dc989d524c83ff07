//! Background workers: outbox relay loop and stale-pending crank.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::outbox::{DEFAULT_MAX_BACKOFF, OutboxRelay};
use super::service::LedgerService;

/// Shortest tick a worker loop accepts; shorter intervals are raised to it
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Outbox relay loop configuration
#[derive(Debug, Clone)]
pub struct OutboxRelayConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub max_backoff: Duration,
    pub enabled: bool,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            max_backoff: DEFAULT_MAX_BACKOFF,
            enabled: true,
        }
    }
}

/// Stale-pending crank configuration
#[derive(Debug, Clone)]
pub struct CrankConfig {
    pub poll_interval: Duration,
    /// Pending transactions older than this are failed
    pub stale_after: Duration,
    pub batch_size: i64,
    pub enabled: bool,
}

impl Default for CrankConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(300),
            batch_size: 20,
            enabled: true,
        }
    }
}

/// Spawn the relay loop. Send `true` on the returned sender to stop it
/// between ticks.
pub fn spawn_outbox_relay(
    relay: Arc<OutboxRelay>,
    config: OutboxRelayConfig,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        info!(
            poll_interval = ?config.poll_interval,
            batch_size = config.batch_size,
            "Outbox relay started"
        );
        let mut ticker = tokio::time::interval(config.poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = relay.process_batch(config.batch_size).await {
                        if e.is_temporarily_unavailable() {
                            warn!(error = %e, "Outbox store unavailable; skipping tick");
                        } else {
                            error!(error = %e, "Outbox relay pass failed");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Outbox relay stopped");
    });

    (handle, shutdown_tx)
}

/// Spawn the crank that fails transactions abandoned in pending
pub fn spawn_stale_crank(
    service: Arc<LedgerService>,
    config: CrankConfig,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        info!(
            poll_interval = ?config.poll_interval,
            stale_after = ?config.stale_after,
            "Stale transaction crank started"
        );
        let mut ticker = tokio::time::interval(config.poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match service
                        .fail_stale_transactions(config.stale_after, config.batch_size)
                        .await
                    {
                        Ok(0) => {}
                        Ok(count) => info!(count, "Failed stale pending transactions"),
                        Err(e) => error!(error = %e, "Stale transaction crank failed"),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Stale transaction crank stopped");
    });

    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppState;
    use crate::test_utils::MockLedgerStore;

    #[test]
    fn test_default_configs() {
        let relay = OutboxRelayConfig::default();
        assert_eq!(relay.poll_interval, Duration::from_secs(5));
        assert_eq!(relay.batch_size, 100);
        assert_eq!(relay.max_backoff, Duration::from_secs(300));

        let crank = CrankConfig::default();
        assert_eq!(crank.stale_after, Duration::from_secs(300));
        assert_eq!(crank.batch_size, 20);
    }

    #[tokio::test]
    async fn test_zero_poll_interval_keeps_workers_running() {
        let state = AppState::new(Arc::new(MockLedgerStore::new()));

        let (relay, relay_shutdown) = spawn_outbox_relay(
            Arc::clone(&state.relay),
            OutboxRelayConfig {
                poll_interval: Duration::ZERO,
                ..OutboxRelayConfig::default()
            },
        );
        let (crank, crank_shutdown) = spawn_stale_crank(
            Arc::clone(&state.service),
            CrankConfig {
                poll_interval: Duration::ZERO,
                ..CrankConfig::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!relay.is_finished());
        assert!(!crank.is_finished());

        relay_shutdown.send(true).unwrap();
        crank_shutdown.send(true).unwrap();
        relay.await.unwrap();
        crank.await.unwrap();
    }
}
