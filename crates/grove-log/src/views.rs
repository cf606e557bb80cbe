//! Materialized-view handler registry and stream router.
//!
//! Handlers declare the namespaces they consume and receive each sealed
//! batch grouped by namespace. Delivery is at-least-once per commit point;
//! handlers key their outputs by event id so redelivery is harmless.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use grove_types::{Event, TargetKey};

/// Delivery attempts per handler per batch before giving up.
const DELIVERY_ATTEMPTS: usize = 2;

/// A materialized-view handler fed from the CDC stream.
#[async_trait]
pub trait ViewHandler: Send + Sync {
    /// Handler name, for logging and registration.
    fn name(&self) -> &str;

    /// Namespaces this handler consumes. `*` subscribes to everything.
    fn source_namespaces(&self) -> &[String];

    /// Process one batch of events. Handler errors flow back as `anyhow`
    /// since views run arbitrary user code.
    async fn process(&self, events: &[Event]) -> anyhow::Result<()>;
}

/// Routes sealed batches to the registered handlers.
#[derive(Default)]
pub struct ViewRouter {
    handlers: RwLock<Vec<Arc<dyn ViewHandler>>>,
}

impl ViewRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Registration order is delivery order.
    pub async fn register(&self, handler: Arc<dyn ViewHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Deliver a sealed batch. Each handler receives the events whose
    /// target namespace it subscribed to, in write order, at least once.
    pub async fn dispatch(&self, events: &[Event]) -> anyhow::Result<()> {
        let handlers = self.handlers.read().await.clone();
        let mut first_failure = None;
        for handler in handlers {
            let selected: Vec<Event> = events
                .iter()
                .filter(|event| handler_wants(handler.as_ref(), event))
                .cloned()
                .collect();
            if selected.is_empty() {
                continue;
            }
            for attempt in 0..DELIVERY_ATTEMPTS {
                match handler.process(&selected).await {
                    Ok(()) => break,
                    Err(error) => {
                        warn!(
                            handler = handler.name(),
                            attempt,
                            %error,
                            "view handler failed"
                        );
                        if attempt + 1 == DELIVERY_ATTEMPTS && first_failure.is_none() {
                            first_failure = Some(error);
                        }
                    }
                }
            }
        }
        match first_failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn handler_wants(handler: &dyn ViewHandler, event: &Event) -> bool {
    let Ok(key) = TargetKey::parse(&event.target) else {
        return false;
    };
    let ns = key.namespace();
    handler
        .source_namespaces()
        .iter()
        .any(|wanted| wanted == "*" || wanted == ns)
}
