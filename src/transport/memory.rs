//! In-process broker
//!
//! `MemoryBroker` keeps topics and their subscribers in memory and routes
//! published messages to every subscriber on every open connection, the way
//! a real broker would. It also records each raw operation in call order and
//! can be scripted to refuse connects, fail sends or drop every connection,
//! which is what the client tests rely on.
//!
//! State sits behind a `std::sync::Mutex`; it is never held across an await.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Connection, Endpoint, EventSender, Transport, TransportEvent};
use crate::client::SubscriptionToken;
use crate::message::Message;
use crate::utils::error::TransportError;

type ConnectionId = u64;

/// A raw transport operation as the broker saw it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawCall {
    Connect,
    Send { topic: String, message: Message },
    Subscribe { topic: String, token: SubscriptionToken },
    Unsubscribe { token: SubscriptionToken },
    ListDestinations,
}

#[derive(Debug, Default)]
struct Topic {
    subscribers: Vec<(ConnectionId, SubscriptionToken)>,
}

#[derive(Debug)]
struct BrokerState {
    topics: BTreeMap<String, Topic>,
    connections: HashMap<ConnectionId, EventSender>,
    next_connection: ConnectionId,
    calls: Vec<RawCall>,
    available: bool,
    failing_connects: u32,
    hang_connects: bool,
    fail_sends: bool,
    send_delay: Option<Duration>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            topics: BTreeMap::new(),
            connections: HashMap::new(),
            next_connection: 1,
            calls: Vec::new(),
            available: true,
            failing_connects: 0,
            hang_connects: false,
            fail_sends: false,
            send_delay: None,
        }
    }
}

impl BrokerState {
    fn route(&self, topic: &str, message: &Message) {
        let Some(t) = self.topics.get(topic) else {
            return;
        };
        for (conn_id, token) in &t.subscribers {
            if let Some(events) = self.connections.get(conn_id) {
                let _ = events.send(TransportEvent::Message {
                    token: *token,
                    message: message.clone(),
                });
            }
        }
    }

    fn remove_connection(&mut self, id: ConnectionId) -> Option<EventSender> {
        for topic in self.topics.values_mut() {
            topic.subscribers.retain(|(conn_id, _)| *conn_id != id);
        }
        self.connections.remove(&id)
    }
}

/// Cloning yields another handle to the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // a panicking test listener must not wedge the broker for other tests
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// When unavailable, every connect attempt is refused.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Refuses the next `n` connect attempts, then behaves normally.
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().failing_connects = n;
    }

    /// Connect attempts never resolve while set.
    pub fn set_hang_connects(&self, hang: bool) {
        self.lock().hang_connects = hang;
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    /// Every send waits this long before the broker looks at it.
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        self.lock().send_delay = delay;
    }

    /// Kills every open connection, notifying each with `ConnectionLost`.
    pub fn drop_connections(&self, cause: &str) {
        let mut state = self.lock();
        let ids: Vec<ConnectionId> = state.connections.keys().copied().collect();
        for id in ids {
            if let Some(events) = state.remove_connection(id) {
                let _ = events.send(TransportEvent::ConnectionLost {
                    cause: cause.to_string(),
                });
            }
        }
        debug!("Dropped all connections: {}", cause);
    }

    /// Publishes from the broker side, as another producer would.
    pub fn inject(&self, topic: &str, message: Message) {
        let mut state = self.lock();
        state.topics.entry(topic.to_string()).or_default();
        state.route(topic, &message);
    }

    pub fn calls(&self) -> Vec<RawCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, RawCall::Connect))
            .count()
    }

    /// Messages accepted by the broker, in send order.
    pub fn sent(&self) -> Vec<(String, Message)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                RawCall::Send { topic, message } => Some((topic.clone(), message.clone())),
                _ => None,
            })
            .collect()
    }

    /// Subscribe calls received, in order.
    pub fn subscribes(&self) -> Vec<(String, SubscriptionToken)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                RawCall::Subscribe { topic, token } => Some((topic.clone(), *token)),
                _ => None,
            })
            .collect()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        events: EventSender,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let hang = {
            let mut state = self.lock();
            state.calls.push(RawCall::Connect);
            state.hang_connects
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::connect(format!("{endpoint} refused connection")));
        }
        if !state.available {
            return Err(TransportError::connect(format!("{endpoint} unavailable")));
        }

        let id = state.next_connection;
        state.next_connection += 1;
        state.connections.insert(id, events);
        debug!("Memory broker accepted connection {} from {}", id, endpoint);

        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.clone(),
        }))
    }
}

struct MemoryConnection {
    id: ConnectionId,
    broker: MemoryBroker,
}

impl MemoryConnection {
    fn live(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        let state = self.broker.lock();
        if state.connections.contains_key(&self.id) {
            Ok(state)
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, topic: &str, message: &Message) -> Result<(), TransportError> {
        let delay = self.live()?.send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.live()?;
        if state.fail_sends {
            return Err(TransportError::send(format!("broker rejected message for {topic}")));
        }
        state.calls.push(RawCall::Send {
            topic: topic.to_string(),
            message: message.clone(),
        });
        state.topics.entry(topic.to_string()).or_default();
        state.route(topic, message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, token: SubscriptionToken) -> Result<(), TransportError> {
        let mut state = self.live()?;
        state.calls.push(RawCall::Subscribe {
            topic: topic.to_string(),
            token,
        });
        let entry = state.topics.entry(topic.to_string()).or_default();
        if !entry.subscribers.contains(&(self.id, token)) {
            entry.subscribers.push((self.id, token));
        }
        Ok(())
    }

    async fn unsubscribe(&self, token: SubscriptionToken) -> Result<(), TransportError> {
        let mut state = self.live()?;
        state.calls.push(RawCall::Unsubscribe { token });
        let id = self.id;
        for topic in state.topics.values_mut() {
            topic.subscribers.retain(|entry| *entry != (id, token));
        }
        Ok(())
    }

    async fn list_destinations(&self) -> Result<Vec<String>, TransportError> {
        let mut state = self.live()?;
        state.calls.push(RawCall::ListDestinations);
        Ok(state.topics.keys().cloned().collect())
    }

    async fn close(&self) {
        self.broker.lock().remove_connection(self.id);
    }
}
