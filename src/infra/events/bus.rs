//! In-process publish/subscribe bus for domain events.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument};

use crate::domain::{DeliveryError, DomainEvent};
use crate::infra::metrics;

/// Default number of async dispatches allowed to run at once
pub const DEFAULT_ASYNC_CONCURRENCY: usize = 64;

/// Subscriber for one or more event types
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and aggregate errors
    fn name(&self) -> &str;

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Handler backed by a closure
pub struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(DomainEvent) -> HandlerFuture + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}

/// Adapt an async closure into an [`EventHandler`]
///
/// ```ignore
/// bus.subscribe("deposit.completed", handler_fn("audit", |event| async move {
///     tracing::info!(event_id = %event.id, "audited");
///     anyhow::Ok(())
/// }));
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(DomainEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f: move |event: DomainEvent| -> HandlerFuture { Box::pin(f(event)) },
    })
}

/// Event bus keyed by event type
///
/// Handlers for a type run in registration order. `publish` waits for all of
/// them; `publish_async` schedules the same dispatch on a separate task.
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    async_permits: Arc<Semaphore>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("event_types", &self.event_types())
            .field("async_permits", &self.async_permits.available_permits())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_ASYNC_CONCURRENCY)
    }
}

impl EventBus {
    /// `async_concurrency` bounds in-flight `publish_async` dispatches
    pub fn new(async_concurrency: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            async_permits: Arc::new(Semaphore::new(async_concurrency.max(1))),
        }
    }

    pub fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        debug!(event_type, handler = handler.name(), "Handler subscribed");
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event_type)
            .map_or(0, Vec::len)
    }

    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Run every handler for the event's type and wait for all of them.
    ///
    /// All handlers run even if an earlier one fails. Returns
    /// [`DeliveryError::HandlersFailed`] if at least one failed.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn publish(&self, event: &DomainEvent) -> Result<(), DeliveryError> {
        let handlers = self.handlers_for(&event.event_type);
        metrics::try_record_published(&event.event_type, "sync");
        dispatch(&handlers, event).await
    }

    /// Schedule dispatch on a spawned task and return immediately.
    ///
    /// Handler errors are logged, never returned. Delivery is not
    /// guaranteed; durable delivery goes through the outbox. The handle may
    /// be dropped; awaiting it waits for the dispatch to finish.
    pub fn publish_async(&self, event: DomainEvent) -> JoinHandle<()> {
        let handlers = self.handlers_for(&event.event_type);
        let permits = Arc::clone(&self.async_permits);
        metrics::try_record_published(&event.event_type, "async");

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = dispatch(&handlers, &event).await {
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Async publish failed"
                );
            }
        })
    }

    // Snapshot so handlers never run under the registry lock
    fn handlers_for(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }
}

async fn dispatch(
    handlers: &[Arc<dyn EventHandler>],
    event: &DomainEvent,
) -> Result<(), DeliveryError> {
    if handlers.is_empty() {
        debug!(event_type = %event.event_type, "No subscribers for event");
        return Ok(());
    }

    let mut errors = Vec::new();
    for handler in handlers {
        if let Err(e) = handler.handle(event).await {
            error!(
                event_id = %event.id,
                event_type = %event.event_type,
                handler = handler.name(),
                error = %e,
                "Event handler failed"
            );
            errors.push(format!("{}: {}", handler.name(), e));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        metrics::try_record_handler_failures(&event.event_type, errors.len());
        Err(DeliveryError::HandlersFailed {
            event_type: event.event_type.clone(),
            failed: errors.len(),
            total: handlers.len(),
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventPayload;
    use rust_decimal::Decimal;
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    fn deposit_event() -> DomainEvent {
        DomainEvent::new(
            Uuid::new_v4().to_string(),
            EventPayload::DepositCompleted {
                transaction_id: Uuid::new_v4(),
                owner_id: Uuid::new_v4(),
                amount: Decimal::TEN,
                reference_hash: "ref".to_string(),
            },
        )
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Arc<dyn EventHandler> {
        let log = Arc::clone(log);
        handler_fn(name, move |_event| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(name.to_string());
                anyhow::Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_publish_runs_handlers_in_registration_order() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("deposit.completed", recorder(&log, "first"));
        bus.subscribe("deposit.completed", recorder(&log, "second"));
        bus.subscribe("withdraw.completed", recorder(&log, "other"));

        bus.publish(&deposit_event()).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(bus.handler_count("deposit.completed"), 2);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        assert!(bus.publish(&deposit_event()).await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_aggregates_failures_and_runs_every_handler() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            "deposit.completed",
            handler_fn("broken", |_event| async {
                Err::<(), _>(anyhow::anyhow!("consumer offline"))
            }),
        );
        bus.subscribe("deposit.completed", recorder(&log, "after"));

        let err = bus.publish(&deposit_event()).await.unwrap_err();

        match err {
            DeliveryError::HandlersFailed {
                failed,
                total,
                errors,
                ..
            } => {
                assert_eq!((failed, total), (1, 2));
                assert_eq!(errors, vec!["broken: consumer offline".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn test_publish_async_returns_before_handlers_finish() {
        let bus = EventBus::default();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        let done = Arc::new(Mutex::new(false));

        bus.subscribe("deposit.completed", {
            let done = Arc::clone(&done);
            handler_fn("slow", move |_event| {
                let release_rx = Arc::clone(&release_rx);
                let done = Arc::clone(&done);
                async move {
                    if let Some(rx) = release_rx.lock().await.take() {
                        let _ = rx.await;
                    }
                    *done.lock().unwrap() = true;
                    anyhow::Ok(())
                }
            })
        });

        let handle = bus.publish_async(deposit_event());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!*done.lock().unwrap());

        release_tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(*done.lock().unwrap());
    }

    #[tokio::test]
    async fn test_publish_async_swallows_handler_errors() {
        let bus = EventBus::new(1);
        bus.subscribe(
            "deposit.completed",
            handler_fn("broken", |_event| async { Err::<(), _>(anyhow::anyhow!("nope")) }),
        );

        let handle = bus.publish_async(deposit_event());
        assert!(handle.await.is_ok());
    }
}
