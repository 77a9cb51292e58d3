//! Event publisher - fan-out of engine events to subscribers
//!
//! Subscribers register `(channel, symbol)` interests and receive
//! serialised envelopes over a bounded per-client queue. Publishing copies
//! the subscriber set at that instant and never blocks the engine: a full
//! outbound queue disconnects the offending client with `SlowConsumer`.
//!
//! Per `(channel, symbol)`, envelopes are delivered in the engine's
//! emission order (symbol workers are single-writer, and each client queue
//! is FIFO). Heartbeats ping every subscriber on an interval; a subscriber
//! that has not answered the previous ping by the next tick is terminated.

pub mod messages;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rustc_hash::FxHashSet;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core_types::ClientId;
use crate::error::EngineError;
pub use messages::{Channel, EventEnvelope, OutboundMessage};

struct ClientState {
    sender: mpsc::Sender<OutboundMessage>,
    topics: FxHashSet<(Channel, String)>,
    awaiting_pong: bool,
}

/// Handle returned to a connected subscriber.
pub struct Subscription {
    pub client_id: ClientId,
    pub receiver: mpsc::Receiver<OutboundMessage>,
}

/// Fan-out hub for `order` / `trade` / `depth` events.
pub struct EventPublisher {
    clients: DashMap<ClientId, ClientState>,
    next_client_id: AtomicU64,
    outbound_capacity: usize,
}

impl EventPublisher {
    pub fn new(outbound_capacity: usize) -> Self {
        Self {
            clients: DashMap::new(),
            next_client_id: AtomicU64::new(1),
            outbound_capacity: outbound_capacity.max(1),
        }
    }

    /// Register a new subscriber and hand back its receiving end.
    pub fn connect(&self) -> Subscription {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.outbound_capacity);
        self.clients.insert(
            client_id,
            ClientState {
                sender,
                topics: FxHashSet::default(),
                awaiting_pong: false,
            },
        );
        debug!(client_id, "subscriber connected");
        Subscription {
            client_id,
            receiver,
        }
    }

    pub fn subscribe(
        &self,
        client_id: ClientId,
        channel: Channel,
        symbol: &str,
    ) -> Result<(), EngineError> {
        let mut state = self.clients.get_mut(&client_id).ok_or(EngineError::NotFound)?;
        state.topics.insert((channel, symbol.to_string()));
        Ok(())
    }

    pub fn unsubscribe(
        &self,
        client_id: ClientId,
        channel: Channel,
        symbol: &str,
    ) -> Result<(), EngineError> {
        let mut state = self.clients.get_mut(&client_id).ok_or(EngineError::NotFound)?;
        state.topics.remove(&(channel, symbol.to_string()));
        Ok(())
    }

    pub fn disconnect(&self, client_id: ClientId) {
        if self.clients.remove(&client_id).is_some() {
            debug!(client_id, "subscriber disconnected");
        }
    }

    /// Heartbeat answer from a subscriber.
    pub fn pong(&self, client_id: ClientId) {
        if let Some(mut state) = self.clients.get_mut(&client_id) {
            state.awaiting_pong = false;
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_connected(&self, client_id: ClientId) -> bool {
        self.clients.contains_key(&client_id)
    }

    /// Deliver an event to every subscriber of `(channel, symbol)`.
    ///
    /// Never blocks: clients whose outbound queue is full are disconnected
    /// with `SlowConsumer`. Failures are logged and swallowed - publication
    /// never rolls back engine state.
    pub fn publish(&self, channel: Channel, symbol: &str, data: Value) {
        let envelope = EventEnvelope::new(channel, symbol, data);
        let topic = (channel, symbol.to_string());

        // Snapshot the matching subscriber set before sending so slow
        // consumer removal does not run under the registry's shard locks.
        let targets: Vec<(ClientId, mpsc::Sender<OutboundMessage>)> = self
            .clients
            .iter()
            .filter(|entry| entry.topics.contains(&topic))
            .map(|entry| (*entry.key(), entry.sender.clone()))
            .collect();

        for (client_id, sender) in targets {
            match sender.try_send(OutboundMessage::Event(envelope.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        client_id,
                        %channel,
                        symbol,
                        "outbound queue full, disconnecting slow consumer"
                    );
                    self.disconnect(client_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.disconnect(client_id);
                }
            }
        }
    }

    /// One heartbeat round: terminate subscribers that missed the previous
    /// ping, then ping the rest.
    pub fn heartbeat_tick(&self) {
        let now = Utc::now().timestamp_millis();
        let mut dead: Vec<ClientId> = Vec::new();
        let mut pings: Vec<(ClientId, mpsc::Sender<OutboundMessage>)> = Vec::new();

        for mut entry in self.clients.iter_mut() {
            if entry.awaiting_pong {
                dead.push(*entry.key());
            } else {
                entry.awaiting_pong = true;
                pings.push((*entry.key(), entry.sender.clone()));
            }
        }

        for client_id in dead {
            warn!(client_id, "heartbeat missed, terminating subscriber");
            self.disconnect(client_id);
        }
        for (client_id, sender) in pings {
            if sender.try_send(OutboundMessage::Ping { timestamp: now }).is_err() {
                self.disconnect(client_id);
            }
        }
    }

    /// Spawn the periodic heartbeat task.
    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let publisher = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // immediate first tick
            info!(interval_secs = interval.as_secs(), "heartbeat task started");
            loop {
                tick.tick().await;
                publisher.heartbeat_tick();
            }
        })
    }
}
