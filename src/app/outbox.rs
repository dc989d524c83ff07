//! Outbox relay: republishes staged events through the event bus.

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{AppError, DeliveryError, DomainEvent, OutboxRecord, OutboxStore};
use crate::infra::breaker::{BreakerRegistry, edges};
use crate::infra::events::EventBus;
use crate::infra::metrics;

/// Default cap for the retry delay (5 minutes)
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Outcome of one relay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
}

/// Delivers outbox records at least once.
///
/// A record is marked published only after every handler accepted it. A
/// failed record keeps `published = false` and is retried on a later pass;
/// retries never stop.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    bus: Arc<EventBus>,
    breakers: Arc<BreakerRegistry>,
    max_backoff: Duration,
}

impl OutboxRelay {
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<EventBus>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            store,
            bus,
            breakers,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }

    #[must_use]
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Relay up to `limit` due records, oldest first.
    ///
    /// Only the fetch can fail the pass; per-record failures are recorded on
    /// the record itself.
    #[instrument(skip(self))]
    pub async fn process_batch(&self, limit: i64) -> Result<BatchReport, AppError> {
        let breaker = self.breakers.get_breaker(edges::OUTBOX_DATABASE);
        let store = Arc::clone(&self.store);
        let records = breaker
            .execute(|| async move { store.fetch_pending(limit).await })
            .await?;

        let mut report = BatchReport {
            fetched: records.len(),
            ..BatchReport::default()
        };
        if records.is_empty() {
            debug!("No pending outbox records");
            return Ok(report);
        }

        for record in records {
            match self.relay_one(&record).await {
                Ok(()) => report.published += 1,
                Err(_) => report.failed += 1,
            }
        }

        info!(
            fetched = report.fetched,
            published = report.published,
            failed = report.failed,
            "Outbox batch processed"
        );
        Ok(report)
    }

    async fn relay_one(&self, record: &OutboxRecord) -> Result<(), AppError> {
        let delivered = match decode(record) {
            Ok(event) => self.bus.publish(&event).await,
            Err(e) => Err(e),
        };

        if let Err(e) = delivered {
            self.record_failure(record, &e).await;
            return Err(e.into());
        }

        self.store
            .mark_published(record.id, Utc::now())
            .await
            .inspect_err(|e| {
                error!(
                    outbox_id = %record.id,
                    error = %e,
                    "Delivered but could not mark published; will be redelivered"
                );
            })?;
        metrics::try_record_outbox("published");
        Ok(())
    }

    async fn record_failure(&self, record: &OutboxRecord, cause: &DeliveryError) {
        let attempts = record.attempts.saturating_add(1);
        let delay = calculate_backoff(attempts, self.max_backoff);
        let next_attempt_at = if delay.is_zero() {
            None
        } else {
            chrono::Duration::from_std(delay)
                .ok()
                .map(|delay| Utc::now() + delay)
        };

        warn!(
            outbox_id = %record.id,
            event_type = %record.event_type,
            attempts,
            next_attempt_at = ?next_attempt_at,
            error = %cause,
            "Outbox relay failed"
        );
        metrics::try_record_outbox("failed");

        if let Err(e) = self
            .store
            .mark_failed(record.id, &cause.to_string(), next_attempt_at)
            .await
        {
            error!(outbox_id = %record.id, error = %e, "Failed to record outbox failure");
        }
    }
}

/// Rebuild the staged event, keeping the record's type and aggregate
fn decode(record: &OutboxRecord) -> Result<DomainEvent, DeliveryError> {
    let mut event: DomainEvent = serde_json::from_str(&record.payload)
        .map_err(|e| DeliveryError::Deserialization(e.to_string()))?;
    event.event_type = record.event_type.clone();
    event.aggregate_id = record.aggregate_id.clone();
    Ok(event)
}

/// Delay before the next attempt after `failures` failed attempts.
///
/// The first retry is immediate. After that the delay doubles from one
/// second, with ±10% jitter, and never exceeds `max`.
fn calculate_backoff(failures: i32, max: Duration) -> Duration {
    if failures <= 1 {
        return Duration::ZERO;
    }
    let exponent = (failures - 2).min(20) as u32;
    let base = Duration::from_secs(2_u64.pow(exponent)).min(max);
    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    base.mul_f64(jitter).min(max)
}
