//! Outbound dispatch
//!
//! Routes outbound envelopes to the handler subscribed for their channel.
//! Delivery is acknowledged on success and failed (for redelivery, then
//! dead-lettering) when the handler errors or no handler is subscribed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::Result;

use super::{ConsumeScope, Direction, Envelope, MessageBus};

/// A chat platform adapter's sending side.
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    /// Deliver one envelope to the platform.
    async fn send(&self, envelope: &Envelope) -> Result<()>;
}

/// Consumes outbound envelopes and hands them to per-channel handlers.
pub struct OutboundDispatcher {
    bus: Arc<MessageBus>,
    handlers: RwLock<HashMap<String, Arc<dyn OutboundHandler>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl OutboundDispatcher {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            bus,
            handlers: RwLock::new(HashMap::new()),
            shutdown_tx,
        }
    }

    /// Route envelopes for `channel` to `handler`, replacing any previous one.
    pub async fn subscribe(&self, channel: &str, handler: Arc<dyn OutboundHandler>) {
        let previous = self
            .handlers
            .write()
            .await
            .insert(channel.to_string(), handler);
        if previous.is_some() {
            warn!(channel, "Replaced outbound handler");
        } else {
            info!(channel, "Subscribed outbound handler");
        }
    }

    pub async fn unsubscribe(&self, channel: &str) -> bool {
        self.handlers.write().await.remove(channel).is_some()
    }

    pub async fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispatch until [`stop`](Self::stop) is called or the bus closes.
    pub async fn run(&self) {
        let _ = self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!("Outbound dispatcher started");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Outbound dispatcher received shutdown signal");
                        break;
                    }
                }
                next = self.bus.consume(Direction::Outbound, ConsumeScope::Any) => {
                    match next {
                        Ok(Some(envelope)) => self.deliver(envelope).await,
                        Ok(None) => {
                            info!("Message bus closed");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to consume outbound envelope");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
        info!("Outbound dispatcher stopped");
    }

    /// Signal [`run`](Self::run) to return.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send_replace(true);
    }

    async fn deliver(&self, envelope: Envelope) {
        let handler = self.handlers.read().await.get(&envelope.channel).cloned();

        let result = match handler {
            Some(handler) => handler.send(&envelope).await.map_err(|e| e.to_string()),
            None => Err(format!("no handler for channel '{}'", envelope.channel)),
        };

        let outcome = match result {
            Ok(()) => {
                debug!(id = %envelope.id, channel = %envelope.channel, "Outbound delivered");
                self.bus.acknowledge(&envelope.id).await
            }
            Err(reason) => {
                warn!(id = %envelope.id, channel = %envelope.channel, error = %reason, "Outbound delivery failed");
                self.bus.fail(&envelope.id, &reason).await.map(|_| ())
            }
        };
        if let Err(e) = outcome {
            error!(id = %envelope.id, error = %e, "Failed to record outbound delivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::DeliveryState;
    use crate::config::BusConfig;
    use crate::error::AisbotError;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OutboundHandler for RecordingHandler {
        async fn send(&self, envelope: &Envelope) -> Result<()> {
            self.sent.lock().await.push(envelope.content().to_string());
            Ok(())
        }
    }

    struct BrokenHandler;

    #[async_trait]
    impl OutboundHandler for BrokenHandler {
        async fn send(&self, _envelope: &Envelope) -> Result<()> {
            Err(AisbotError::Provider("platform down".into()))
        }
    }

    async fn wait_for_state(bus: &MessageBus, id: &str, state: DeliveryState) {
        for _ in 0..100 {
            if bus.get(id).await.map(|e| e.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("envelope {} never reached {}", id, state);
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_channel() {
        let bus = Arc::new(MessageBus::new());
        let dispatcher = Arc::new(OutboundDispatcher::new(Arc::clone(&bus)));
        let telegram = Arc::new(RecordingHandler::default());
        dispatcher.subscribe("telegram", telegram.clone()).await;
        assert_eq!(dispatcher.channels().await, vec!["telegram".to_string()]);

        let runner = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.run().await })
        };

        let msg = Envelope::outbound("telegram", "42", "hello");
        let id = msg.id.clone();
        bus.publish(msg).await.unwrap();
        wait_for_state(&bus, &id, DeliveryState::Done).await;
        assert_eq!(*telegram.sent.lock().await, vec!["hello".to_string()]);

        dispatcher.stop();
        tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_handler_fails_delivery() {
        let config = BusConfig {
            max_retries: 1,
            ..BusConfig::default()
        };
        let bus = Arc::new(MessageBus::with_config(&config));
        let dispatcher = Arc::new(OutboundDispatcher::new(Arc::clone(&bus)));
        let runner = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.run().await })
        };

        let msg = Envelope::outbound("nowhere", "1", "lost");
        let id = msg.id.clone();
        bus.publish(msg).await.unwrap();
        wait_for_state(&bus, &id, DeliveryState::DeadLetter).await;

        bus.close();
        tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_fails_delivery() {
        let config = BusConfig {
            max_retries: 1,
            ..BusConfig::default()
        };
        let bus = Arc::new(MessageBus::with_config(&config));
        let dispatcher = Arc::new(OutboundDispatcher::new(Arc::clone(&bus)));
        dispatcher.subscribe("slack", Arc::new(BrokenHandler)).await;
        let runner = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.run().await })
        };

        let msg = Envelope::outbound("slack", "c", "hi");
        let id = msg.id.clone();
        bus.publish(msg).await.unwrap();
        wait_for_state(&bus, &id, DeliveryState::DeadLetter).await;
        let dead = bus.dead_letters(Direction::Outbound).await;
        assert!(dead[0].last_error.as_deref().unwrap().contains("platform down"));

        dispatcher.stop();
        runner.await.unwrap();
    }
}
