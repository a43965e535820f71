//! Message Bus Module
//!
//! Durable, ordered delivery of [`Envelope`]s between chat channels and the
//! agent. Inbound envelopes flow from channel adapters to the agent loop;
//! outbound envelopes flow back through the [`OutboundDispatcher`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌─────────────┐
//! │   Channel   │────>│    MessageBus    │────>│  AgentLoop  │
//! │  (Telegram) │     │ inbound (journal)│     │             │
//! └─────────────┘     └──────────────────┘     └─────────────┘
//!                              │ outbound             │
//!                              ▼                      │
//! ┌─────────────┐     ┌──────────────────┐            │
//! │   Channel   │<────│    Dispatcher    │<───────────┘
//! │  (Telegram) │     │                  │
//! └─────────────┘     └──────────────────┘
//! ```
//!
//! Delivery is at-least-once. A consumer claims an envelope (`in_flight`),
//! then acknowledges it (`done`) or fails it (`failed`, later `dead_letter`).
//! Envelopes of one session are handed out one at a time in publish order.
//!
//! # Example
//!
//! ```
//! use aisbot::bus::{ConsumeScope, Direction, Envelope, MessageBus};
//!
//! # tokio_test::block_on(async {
//! let bus = MessageBus::new();
//!
//! let msg = Envelope::inbound("telegram", "user123", "chat456", "Hello");
//! bus.publish(msg).await.unwrap();
//!
//! let received = bus
//!     .try_consume(Direction::Inbound, &ConsumeScope::Any)
//!     .await
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(received.content(), "Hello");
//! bus.acknowledge(&received.id).await.unwrap();
//! # });
//! ```

pub mod dispatch;
pub mod envelope;
pub mod store;

pub use dispatch::{OutboundDispatcher, OutboundHandler};
pub use envelope::{DeliveryState, Direction, Envelope, MediaAttachment, MediaType, Payload};
pub use store::QueueStore;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{BusConfig, Config};
use crate::error::{AisbotError, Result};

/// Which envelopes a consumer will accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeScope {
    /// Only envelopes of this session key
    Session(String),
    /// Any session
    Any,
}

impl ConsumeScope {
    fn matches(&self, envelope: &Envelope) -> bool {
        match self {
            ConsumeScope::Session(key) => envelope.session_key == *key,
            ConsumeScope::Any => true,
        }
    }
}

/// Result of [`MessageBus::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// An envelope with this id already exists; nothing was written
    Duplicate,
}

/// Delivery events, sent after the durable write.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Published {
        id: String,
        direction: Direction,
        session_key: String,
    },
    Acknowledged {
        id: String,
    },
    Failed {
        id: String,
        attempts: u32,
        error: String,
    },
    Requeued {
        id: String,
    },
    DeadLettered {
        id: String,
        attempts: u32,
        error: String,
    },
}

/// What one visibility sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub dead_lettered: usize,
}

/// Consumer side of the inbound queue, as seen by the agent loop.
#[async_trait]
pub trait InboundSource: Send + Sync {
    /// Wait for the next inbound envelope; `None` once the source is closed.
    async fn receive(&self) -> Result<Option<Envelope>>;
    /// The envelope was handled and its reply emitted.
    async fn complete(&self, id: &str) -> Result<()>;
    /// Handling failed; returns where the envelope went.
    async fn abandon(&self, id: &str, reason: &str) -> Result<DeliveryState>;
    /// Handling was cancelled; make the envelope deliverable again.
    async fn release(&self, id: &str) -> Result<()>;
}

/// Producer side of the outbound queue.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn emit(&self, envelope: Envelope) -> Result<PublishOutcome>;
}

/// The central message bus.
///
/// Shared as `Arc<MessageBus>`. All queue state lives in a [`QueueStore`]
/// behind an async mutex, held while the store's writer thread persists a
/// change, so operations reach the journal in the order they were applied and
/// runtime workers never wait on disk. The table changes only after the
/// write, so dropping a `consume` future can never lose a claimed envelope:
/// at worst the claim is journaled while the envelope stays deliverable.
pub struct MessageBus {
    store: Mutex<QueueStore>,
    inbound_ready: Notify,
    outbound_ready: Notify,
    events: broadcast::Sender<BusEvent>,
    shutdown_tx: watch::Sender<bool>,
    config: BusConfig,
}

impl MessageBus {
    /// In-memory bus with default settings.
    pub fn new() -> Self {
        Self::with_config(&BusConfig::default())
    }

    /// In-memory bus; `storage_path` is ignored.
    pub fn with_config(config: &BusConfig) -> Self {
        Self::from_store(QueueStore::memory(config.done_retention), config)
    }

    /// Durable bus backed by the journal at `path`.
    pub fn open(path: &Path, config: &BusConfig) -> Result<Self> {
        let store = QueueStore::open(path, config.fsync, config.done_retention)?;
        info!(
            path = %path.display(),
            envelopes = store.len(),
            "Message bus opened"
        );
        Ok(Self::from_store(store, config))
    }

    /// Durable bus at the configured (or default) journal path.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::open(&config.bus_storage_path(), &config.bus)
    }

    fn from_store(store: QueueStore, config: &BusConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store: Mutex::new(store),
            inbound_ready: Notify::new(),
            outbound_ready: Notify::new(),
            events,
            shutdown_tx,
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    fn ready(&self, direction: Direction) -> &Notify {
        match direction {
            Direction::Inbound => &self.inbound_ready,
            Direction::Outbound => &self.outbound_ready,
        }
    }

    fn wake(&self, direction: Direction) {
        self.ready(direction).notify_waiters();
    }

    fn emit_event(&self, event: BusEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Durably append an envelope. Never waits for consumers.
    ///
    /// # Errors
    /// `BusClosed` after [`close`](Self::close); `Storage`/`Io` when the
    /// journal write fails.
    pub async fn publish(&self, mut envelope: Envelope) -> Result<PublishOutcome> {
        if self.is_closed() {
            return Err(AisbotError::BusClosed);
        }

        envelope.state = DeliveryState::Pending;
        envelope.attempts = 0;
        envelope.claimed_at = None;

        let stored = {
            let mut store = self.store.lock().await;
            if store.contains(&envelope.id) {
                debug!(id = %envelope.id, "Duplicate publish ignored");
                return Ok(PublishOutcome::Duplicate);
            }
            store.insert(envelope).await?
        };

        debug!(
            id = %stored.id,
            seq = stored.seq,
            direction = %stored.direction,
            session = %stored.session_key,
            "Envelope published"
        );
        self.emit_event(BusEvent::Published {
            id: stored.id.clone(),
            direction: stored.direction,
            session_key: stored.session_key.clone(),
        });
        self.wake(stored.direction);
        Ok(PublishOutcome::Published)
    }

    /// Claim the next envelope for `scope` without waiting.
    ///
    /// Skips sessions that already have an envelope in flight in this
    /// direction and returns the lowest-`seq` deliverable envelope.
    pub async fn try_consume(
        &self,
        direction: Direction,
        scope: &ConsumeScope,
    ) -> Result<Option<Envelope>> {
        let mut store = self.store.lock().await;

        let busy: HashSet<&str> = store
            .iter()
            .filter(|e| e.direction == direction && e.state == DeliveryState::InFlight)
            .map(|e| e.session_key.as_str())
            .collect();

        let next = store
            .iter()
            .filter(|e| {
                e.direction == direction
                    && e.state.is_deliverable()
                    && scope.matches(e)
                    && !busy.contains(e.session_key.as_str())
            })
            .min_by_key(|e| e.seq)
            .cloned();

        let Some(mut envelope) = next else {
            return Ok(None);
        };

        envelope.state = DeliveryState::InFlight;
        envelope.attempts += 1;
        envelope.claimed_at = Some(Utc::now());
        store.update(envelope.clone()).await?;

        debug!(
            id = %envelope.id,
            seq = envelope.seq,
            attempt = envelope.attempts,
            session = %envelope.session_key,
            "Envelope claimed"
        );
        Ok(Some(envelope))
    }

    /// Wait for and claim the next envelope for `scope`.
    ///
    /// Returns `Ok(None)` once the bus is closed. Cancel-safe.
    pub async fn consume(
        &self,
        direction: Direction,
        scope: ConsumeScope,
    ) -> Result<Option<Envelope>> {
        loop {
            // Register interest before looking, so a publish between the
            // check and the await is not missed.
            let notified = self.ready(direction).notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return Ok(None);
            }
            if let Some(envelope) = self.try_consume(direction, &scope).await? {
                return Ok(Some(envelope));
            }
            notified.await;
        }
    }

    /// [`consume`](Self::consume) bounded by `timeout`; `Ok(None)` when it
    /// elapses.
    pub async fn consume_timeout(
        &self,
        direction: Direction,
        scope: ConsumeScope,
        timeout: Duration,
    ) -> Result<Option<Envelope>> {
        match tokio::time::timeout(timeout, self.consume(direction, scope)).await {
            Ok(result) => result,
            Err(_) => Ok(None),
        }
    }

    /// Mark an envelope done. Acknowledging a done envelope is a no-op.
    pub async fn acknowledge(&self, id: &str) -> Result<()> {
        let direction = {
            let mut store = self.store.lock().await;
            let mut envelope = store
                .get(id)
                .cloned()
                .ok_or_else(|| AisbotError::NotFound(format!("envelope {}", id)))?;

            match envelope.state {
                DeliveryState::Done => return Ok(()),
                DeliveryState::DeadLetter => {
                    warn!(id, "Acknowledge ignored for dead-lettered envelope");
                    return Ok(());
                }
                DeliveryState::InFlight => {}
                state => debug!(id, %state, "Late acknowledge after redelivery"),
            }

            envelope.state = DeliveryState::Done;
            envelope.claimed_at = None;
            let direction = envelope.direction;
            store.update(envelope).await?;
            direction
        };

        self.emit_event(BusEvent::Acknowledged { id: id.to_string() });
        self.wake(direction);
        Ok(())
    }

    /// Record a failed delivery attempt.
    ///
    /// The envelope becomes `failed` (redeliverable) while attempts remain,
    /// else `dead_letter`. Returns the new state.
    pub async fn fail(&self, id: &str, reason: &str) -> Result<DeliveryState> {
        let envelope = {
            let mut store = self.store.lock().await;
            let mut envelope = store
                .get(id)
                .cloned()
                .ok_or_else(|| AisbotError::NotFound(format!("envelope {}", id)))?;

            if envelope.state != DeliveryState::InFlight {
                return Ok(envelope.state);
            }

            envelope.state = if envelope.attempts >= self.config.max_retries {
                DeliveryState::DeadLetter
            } else {
                DeliveryState::Failed
            };
            envelope.claimed_at = None;
            envelope.last_error = Some(reason.to_string());
            store.update(envelope.clone()).await?;
            envelope
        };

        if envelope.state == DeliveryState::DeadLetter {
            error!(
                id,
                attempts = envelope.attempts,
                session = %envelope.session_key,
                error = reason,
                "Envelope dead-lettered"
            );
            self.emit_event(BusEvent::DeadLettered {
                id: id.to_string(),
                attempts: envelope.attempts,
                error: reason.to_string(),
            });
        } else {
            warn!(id, attempts = envelope.attempts, error = reason, "Envelope delivery failed");
            self.emit_event(BusEvent::Failed {
                id: id.to_string(),
                attempts: envelope.attempts,
                error: reason.to_string(),
            });
        }
        self.wake(envelope.direction);
        Ok(envelope.state)
    }

    /// Return an in-flight envelope to `pending` without counting the attempt.
    ///
    /// Returns `false` when the envelope was not in flight.
    pub async fn requeue(&self, id: &str) -> Result<bool> {
        let direction = {
            let mut store = self.store.lock().await;
            let mut envelope = store
                .get(id)
                .cloned()
                .ok_or_else(|| AisbotError::NotFound(format!("envelope {}", id)))?;
            if envelope.state != DeliveryState::InFlight {
                return Ok(false);
            }
            envelope.state = DeliveryState::Pending;
            envelope.attempts = envelope.attempts.saturating_sub(1);
            envelope.claimed_at = None;
            let direction = envelope.direction;
            store.update(envelope).await?;
            direction
        };

        debug!(id, "Envelope requeued");
        self.emit_event(BusEvent::Requeued { id: id.to_string() });
        self.wake(direction);
        Ok(true)
    }

    /// Return envelopes whose claim outlived the visibility timeout.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let visibility = chrono::Duration::seconds(
            i64::try_from(self.config.visibility_timeout_secs).unwrap_or(i64::MAX),
        );
        let now = Utc::now();
        let mut report = SweepReport::default();
        let mut events = Vec::new();
        let mut woken = HashSet::new();

        {
            let mut store = self.store.lock().await;
            let expired: Vec<Envelope> = store
                .iter()
                .filter(|e| {
                    e.state == DeliveryState::InFlight
                        && e.claimed_at.is_some_and(|at| now - at > visibility)
                })
                .cloned()
                .collect();

            let mut changed = Vec::with_capacity(expired.len());
            for mut envelope in expired {
                let error = "visibility timeout expired".to_string();
                envelope.claimed_at = None;
                envelope.last_error = Some(error.clone());
                let event = if envelope.attempts >= self.config.max_retries {
                    envelope.state = DeliveryState::DeadLetter;
                    report.dead_lettered += 1;
                    error!(id = %envelope.id, attempts = envelope.attempts, "Envelope dead-lettered after visibility timeout");
                    BusEvent::DeadLettered {
                        id: envelope.id.clone(),
                        attempts: envelope.attempts,
                        error,
                    }
                } else {
                    envelope.state = DeliveryState::Pending;
                    report.requeued += 1;
                    BusEvent::Requeued {
                        id: envelope.id.clone(),
                    }
                };
                woken.insert(envelope.direction);
                changed.push(envelope);
                events.push(event);
            }
            store.update_many(changed).await?;

            if store.needs_compaction() {
                let dropped = store.compact().await?;
                debug!(dropped, "Store compacted during sweep");
            }
        }

        for event in events {
            self.emit_event(event);
        }
        for direction in woken {
            self.wake(direction);
        }
        if report != SweepReport::default() {
            info!(
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                "Visibility sweep"
            );
        }
        Ok(report)
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval_secs` until close.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = bus.sweep().await {
                            error!(error = %e, "Visibility sweep failed");
                        }
                    }
                }
            }
            debug!("Sweeper stopped");
        })
    }

    /// Subscribe to delivery events.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, id: &str) -> Option<Envelope> {
        self.store.lock().await.get(id).cloned()
    }

    async fn count(&self, direction: Direction, pred: impl Fn(DeliveryState) -> bool) -> usize {
        self.store
            .lock()
            .await
            .iter()
            .filter(|e| e.direction == direction && pred(e.state))
            .count()
    }

    /// Deliverable envelopes (`pending` or `failed`).
    pub async fn pending_count(&self, direction: Direction) -> usize {
        self.count(direction, DeliveryState::is_deliverable).await
    }

    pub async fn in_flight_count(&self, direction: Direction) -> usize {
        self.count(direction, |s| s == DeliveryState::InFlight).await
    }

    /// Dead-lettered envelopes in publish order.
    pub async fn dead_letters(&self, direction: Direction) -> Vec<Envelope> {
        let store = self.store.lock().await;
        let mut dead: Vec<Envelope> = store
            .iter()
            .filter(|e| e.direction == direction && e.state == DeliveryState::DeadLetter)
            .cloned()
            .collect();
        dead.sort_by_key(|e| e.seq);
        dead
    }

    /// Inbound envelopes not yet finished (deliverable or in flight).
    pub async fn inbound_size(&self) -> usize {
        self.count(Direction::Inbound, |s| !s.is_terminal()).await
    }

    /// Outbound envelopes not yet finished (deliverable or in flight).
    pub async fn outbound_size(&self) -> usize {
        self.count(Direction::Outbound, |s| !s.is_terminal()).await
    }

    /// Drop old `done` envelopes and rewrite the journal.
    pub async fn compact(&self) -> Result<usize> {
        self.store.lock().await.compact().await
    }

    /// Stop accepting publishes and release all waiting consumers.
    pub fn close(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!("Message bus closed");
        }
        self.inbound_ready.notify_waiters();
        self.outbound_ready.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InboundSource for MessageBus {
    async fn receive(&self) -> Result<Option<Envelope>> {
        self.consume(Direction::Inbound, ConsumeScope::Any).await
    }

    async fn complete(&self, id: &str) -> Result<()> {
        self.acknowledge(id).await
    }

    async fn abandon(&self, id: &str, reason: &str) -> Result<DeliveryState> {
        self.fail(id, reason).await
    }

    async fn release(&self, id: &str) -> Result<()> {
        self.requeue(id).await.map(|_| ())
    }
}

#[async_trait]
impl OutboundSink for MessageBus {
    async fn emit(&self, envelope: Envelope) -> Result<PublishOutcome> {
        self.publish(envelope).await
    }
}
