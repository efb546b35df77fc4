//! Subscription registry
//!
//! Keeps every subscription the caller asked for, in the order they were
//! made, together with the listener to call for incoming messages. The
//! registry is the source of truth: the broker only learns about a
//! subscription when a connection is available, and learns about all of them
//! again after each reconnect.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::supervisor::ConnectionObserver;
use crate::message::Message;
use crate::transport::Connection;
use crate::utils::error::{ClientError, TransportError};

/// Opaque handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(Uuid);

impl SubscriptionToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Callback invoked with each message received on a subscription.
///
/// Listeners run on the client's delivery task. Every other delivery, and
/// the handling of connection loss, waits while a listener runs, so a
/// listener should return within a few milliseconds and hand heavy work to
/// a channel or a spawned task.
///
/// Clones share identity: subscribing the same topic twice with clones of
/// one `Listener` is a single subscription.
#[derive(Clone)]
pub struct Listener(Arc<dyn Fn(&Message) + Send + Sync>);

impl Listener {
    pub fn new(f: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn same_as(&self, other: &Listener) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn call(&self, message: &Message) {
        (self.0)(message)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Listener")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

#[derive(Debug, Clone)]
struct Subscription {
    token: SubscriptionToken,
    topic: String,
    listener: Listener,
}

#[derive(Default)]
struct RegistryState {
    // insertion order is replay order
    entries: Vec<Subscription>,
    connection: Option<Arc<dyn Connection>>,
    // set by clear; no subscriptions are accepted afterwards
    closed: bool,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for `topic`. Issued to the broker right away when
    /// connected, otherwise on the next reconnect.
    pub async fn subscribe(
        &self,
        topic: &str,
        listener: Listener,
    ) -> Result<SubscriptionToken, ClientError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ClientError::Closed);
        }

        if let Some(existing) = state
            .entries
            .iter()
            .find(|s| s.topic == topic && s.listener.same_as(&listener))
        {
            debug!("Already subscribed to {} with {}", topic, existing.token);
            return Ok(existing.token);
        }

        let token = SubscriptionToken::new();
        match &state.connection {
            Some(connection) => {
                connection
                    .subscribe(topic, token)
                    .await
                    .map_err(|e| ClientError::Subscribe {
                        topic: topic.to_string(),
                        reason: e.to_string(),
                    })?;
                info!("Subscribed to {} ({})", topic, token);
            }
            None => debug!("Subscription to {} deferred until connected ({})", topic, token),
        }

        state.entries.push(Subscription {
            token,
            topic: topic.to_string(),
            listener,
        });
        Ok(token)
    }

    pub async fn unsubscribe(&self, token: SubscriptionToken) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ClientError::Closed);
        }
        let Some(pos) = state.entries.iter().position(|s| s.token == token) else {
            return Err(ClientError::NotFound(token));
        };
        let removed = state.entries.remove(pos);

        if let Some(connection) = &state.connection {
            if let Err(e) = connection.unsubscribe(token).await {
                warn!("Unsubscribe from {} failed on broker: {}", removed.topic, e);
            }
        }
        info!("Unsubscribed from {} ({})", removed.topic, token);
        Ok(())
    }

    /// Calls the listener registered under `token`. Unknown tokens are
    /// ignored: the subscription may have been removed while the message was
    /// in flight.
    pub async fn deliver(&self, token: SubscriptionToken, message: &Message) {
        let listener = {
            let state = self.state.lock().await;
            state
                .entries
                .iter()
                .find(|s| s.token == token)
                .map(|s| (s.topic.clone(), s.listener.clone()))
        };
        let Some((topic, listener)) = listener else {
            debug!("Dropping message for unknown subscription {}", token);
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| listener.call(message))).is_err() {
            error!("Listener for {} panicked while handling a message", topic);
        }
    }

    /// Issues every registered subscription to `connection`, oldest first.
    pub async fn replay(&self, connection: &Arc<dyn Connection>) -> Result<usize, TransportError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TransportError::Closed);
        }
        for entry in &state.entries {
            connection.subscribe(&entry.topic, entry.token).await?;
            debug!("Replayed subscription to {} ({})", entry.topic, entry.token);
        }
        state.connection = Some(Arc::clone(connection));
        Ok(state.entries.len())
    }

    pub async fn detach(&self) {
        self.state.lock().await.connection = None;
    }

    /// Drops every subscription. Later subscribes fail with
    /// `ClientError::Closed`.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.entries.clear();
        state.connection = None;
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Topics of the registered subscriptions, in registration order.
    pub async fn topics(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.entries.iter().map(|s| s.topic.clone()).collect()
    }
}

#[async_trait]
impl ConnectionObserver for SubscriptionRegistry {
    async fn on_reconnected(&self, connection: &Arc<dyn Connection>) -> Result<(), TransportError> {
        let replayed = self.replay(connection).await?;
        if replayed > 0 {
            info!("Replayed {} subscriptions", replayed);
        }
        Ok(())
    }

    async fn on_disconnected(&self) {
        self.detach().await;
    }

    async fn on_message(&self, token: SubscriptionToken, message: &Message) {
        self.deliver(token, message).await;
    }
}
