//! In-process publish/subscribe for ledger change notifications.
//!
//! Publishing only enqueues; a single dispatcher task drains the queue and
//! runs every handler registered for the event's kind, one at a time, in
//! registration order. Events are therefore delivered in publish order and
//! a slow handler delays other subscribers but never the publisher. Each
//! handler call runs in its own task, so a panicking handler is logged and
//! the dispatcher keeps going.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::domain::entities::Trade;
use crate::domain::errors::Result;

pub const DEFAULT_SLOW_HANDLER_THRESHOLD: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TradeAdded,
    TradeUpdated,
    TradeRemoved,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::TradeAdded,
        EventKind::TradeUpdated,
        EventKind::TradeRemoved,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::TradeAdded => "trade-added",
            EventKind::TradeUpdated => "trade-updated",
            EventKind::TradeRemoved => "trade-removed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEvent {
    TradeAdded(Trade),
    /// Carries both copies so subscribers can reverse the old contribution
    TradeUpdated { old: Trade, new: Trade },
    TradeRemoved(Trade),
}

impl LedgerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LedgerEvent::TradeAdded(_) => EventKind::TradeAdded,
            LedgerEvent::TradeUpdated { .. } => EventKind::TradeUpdated,
            LedgerEvent::TradeRemoved(_) => EventKind::TradeRemoved,
        }
    }

    /// The trade as it stands after the change (the removed copy for removals)
    pub fn trade(&self) -> &Trade {
        match self {
            LedgerEvent::TradeAdded(trade) | LedgerEvent::TradeRemoved(trade) => trade,
            LedgerEvent::TradeUpdated { new, .. } => new,
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &LedgerEvent) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

type Registry = HashMap<EventKind, Vec<(SubscriptionToken, Arc<dyn EventHandler>)>>;

enum Envelope {
    Event(LedgerEvent),
    Settle(oneshot::Sender<()>),
}

pub struct EventBus {
    registry: Arc<RwLock<Registry>>,
    next_token: AtomicU64,
    queue: mpsc::UnboundedSender<Envelope>,
}

impl EventBus {
    /// Spawns the dispatcher; must be called inside a tokio runtime
    pub fn new() -> Arc<Self> {
        Self::with_slow_handler_threshold(DEFAULT_SLOW_HANDLER_THRESHOLD)
    }

    pub fn with_slow_handler_threshold(threshold: Duration) -> Arc<Self> {
        let registry: Arc<RwLock<Registry>> = Arc::new(RwLock::new(HashMap::new()));
        let (queue, rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::dispatch(rx, Arc::clone(&registry), threshold));

        Arc::new(Self {
            registry,
            next_token: AtomicU64::new(1),
            queue,
        })
    }

    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry.entry(kind).or_default().push((token, handler));
        debug!(event = %kind, token = token.0, "Subscribed handler");
        token
    }

    /// Returns false when the token was not registered for `kind`
    pub fn unsubscribe(&self, kind: EventKind, token: SubscriptionToken) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let Some(handlers) = registry.get_mut(&kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(registered, _)| *registered != token);
        let removed = handlers.len() != before;
        if removed {
            debug!(event = %kind, token = token.0, "Unsubscribed handler");
        }
        removed
    }

    /// Queues `event` for delivery; returns false if the dispatcher is gone
    pub fn publish(&self, event: LedgerEvent) -> bool {
        let kind = event.kind();
        match self.queue.send(Envelope::Event(event)) {
            Ok(()) => true,
            Err(_) => {
                warn!(event = %kind, "Event dispatcher stopped, event dropped");
                false
            }
        }
    }

    /// Waits until everything published before this call has been handled
    pub async fn settle(&self) {
        let (done, wait) = oneshot::channel();
        if self.queue.send(Envelope::Settle(done)).is_ok() {
            let _ = wait.await;
        }
    }

    async fn dispatch(
        mut rx: mpsc::UnboundedReceiver<Envelope>,
        registry: Arc<RwLock<Registry>>,
        slow_threshold: Duration,
    ) {
        while let Some(envelope) = rx.recv().await {
            let event = match envelope {
                Envelope::Event(event) => event,
                Envelope::Settle(done) => {
                    let _ = done.send(());
                    continue;
                }
            };

            let kind = event.kind();
            let handlers: Vec<(SubscriptionToken, Arc<dyn EventHandler>)> = {
                let registry = registry.read().unwrap_or_else(PoisonError::into_inner);
                registry.get(&kind).cloned().unwrap_or_default()
            };
            let event = Arc::new(event);

            for (token, handler) in handlers {
                let started = Instant::now();
                let delivery = {
                    let event = Arc::clone(&event);
                    tokio::spawn(async move { handler.handle(&event).await })
                };
                match delivery.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(
                        event = %kind,
                        token = token.0,
                        trade_id = %event.trade().trade_id,
                        "Event handler failed: {}",
                        e
                    ),
                    Err(e) => error!(
                        event = %kind,
                        token = token.0,
                        trade_id = %event.trade().trade_id,
                        "Event handler panicked: {}",
                        e
                    ),
                }
                let elapsed = started.elapsed();
                if elapsed > slow_threshold {
                    warn!(
                        event = %kind,
                        token = token.0,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Slow event handler"
                    );
                }
            }
        }

        debug!("Event dispatcher stopped");
    }
}
