//! Publish gateway
//!
//! Sends messages over the live connection, or parks them in a bounded FIFO
//! queue while there is none. After a reconnect the queue is flushed in
//! enqueue order before new publishes go straight to the broker again.
//!
//! Nothing queued is lost silently: entries that age out, entries left
//! behind by a failed flush, and entries discarded on close are all handed
//! to the `FailureHandler`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::supervisor::ConnectionObserver;
use crate::message::{Headers, Message};
use crate::transport::Connection;
use crate::utils::error::{ClientError, TransportError};

/// Outcome of a successful `publish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStatus {
    /// Accepted by the transport
    Delivered,
    /// Parked until the next reconnect
    Queued,
}

/// A data-loss risk reported through the failure handler.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishFailure {
    /// Dropped from the queue after exceeding the maximum age
    Expired {
        topic: String,
        message: Message,
        age: Duration,
    },
    /// A flush stopped at this entry; it and `remaining - 1` others stay queued
    FlushInterrupted {
        topic: String,
        reason: String,
        remaining: usize,
    },
    /// Still queued when the client was closed
    Discarded { topic: String, message: Message },
}

pub type FailureHandler = Arc<dyn Fn(PublishFailure) + Send + Sync>;

/// Logs each failure at `warn`.
pub fn log_failures() -> FailureHandler {
    Arc::new(|failure| match failure {
        PublishFailure::Expired { topic, age, .. } => {
            warn!("Dropped queued message for {} after {:?}", topic, age)
        }
        PublishFailure::FlushInterrupted {
            topic,
            reason,
            remaining,
        } => warn!(
            "Flush stopped at message for {}: {} ({} still queued)",
            topic, reason, remaining
        ),
        PublishFailure::Discarded { topic, .. } => {
            warn!("Discarded queued message for {} on close", topic)
        }
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuePolicy {
    pub max_entries: usize,
    pub max_age: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_age: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingPublish {
    id: u64,
    topic: String,
    message: Message,
    enqueued_at: Instant,
}

#[derive(Default)]
struct GatewayState {
    queue: VecDeque<PendingPublish>,
    connection: Option<Arc<dyn Connection>>,
    next_id: u64,
    // set by discard_all; nothing may be queued afterwards
    closed: bool,
}

impl GatewayState {
    fn purge_expired(&mut self, max_age: Duration) -> Vec<PublishFailure> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.queue.retain(|p| {
            let age = now.duration_since(p.enqueued_at);
            if age > max_age {
                expired.push(PublishFailure::Expired {
                    topic: p.topic.clone(),
                    message: p.message.clone(),
                    age,
                });
                false
            } else {
                true
            }
        });
        expired
    }

    fn remove(&mut self, id: u64) {
        if let Some(pos) = self.queue.iter().position(|p| p.id == id) {
            self.queue.remove(pos);
        }
    }
}

pub struct PublishGateway {
    policy: QueuePolicy,
    state: Mutex<GatewayState>,
    on_failure: FailureHandler,
}

impl PublishGateway {
    pub fn new(policy: QueuePolicy, on_failure: FailureHandler) -> Self {
        Self {
            policy,
            state: Mutex::new(GatewayState::default()),
            on_failure,
        }
    }

    fn report(&self, failures: Vec<PublishFailure>) {
        for failure in failures {
            (self.on_failure)(failure);
        }
    }

    /// Sends now when connected, otherwise queues. `headers` are merged over
    /// the message's own headers.
    pub async fn publish(
        &self,
        topic: &str,
        mut message: Message,
        headers: Headers,
    ) -> Result<PublishStatus, ClientError> {
        message.merge_headers(headers);

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ClientError::Closed);
        }
        if let Some(connection) = state.connection.clone() {
            drop(state);
            debug!(
                "Sending {} message to {}: {}",
                message.message_type(),
                topic,
                message.payload_text()
            );
            connection
                .send(topic, &message)
                .await
                .map_err(|e| ClientError::Send {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })?;
            return Ok(PublishStatus::Delivered);
        }

        let expired = state.purge_expired(self.policy.max_age);
        let result = if state.queue.len() >= self.policy.max_entries {
            Err(ClientError::QueueFull {
                capacity: self.policy.max_entries,
            })
        } else {
            let id = state.next_id;
            state.next_id += 1;
            state.queue.push_back(PendingPublish {
                id,
                topic: topic.to_string(),
                message,
                enqueued_at: Instant::now(),
            });
            debug!("Queued message for {} ({} pending)", topic, state.queue.len());
            Ok(PublishStatus::Queued)
        };
        drop(state);

        self.report(expired);
        result
    }

    /// Sends queued entries oldest first, then switches to direct sending.
    /// An entry leaves the queue only once the transport accepted it, so a
    /// flush that is cancelled or fails leaves it at the head. On failure the
    /// error is returned.
    pub async fn flush(&self, connection: &Arc<dyn Connection>) -> Result<usize, TransportError> {
        let mut flushed = 0;
        loop {
            let (next, expired) = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(TransportError::Closed);
                }
                let expired = state.purge_expired(self.policy.max_age);
                let next = state
                    .queue
                    .front()
                    .map(|p| (p.id, p.topic.clone(), p.message.clone()));
                if next.is_none() {
                    state.connection = Some(Arc::clone(connection));
                }
                (next, expired)
            };
            self.report(expired);

            let Some((id, topic, message)) = next else {
                return Ok(flushed);
            };

            if let Err(e) = connection.send(&topic, &message).await {
                let remaining = self.state.lock().await.queue.len();
                self.report(vec![PublishFailure::FlushInterrupted {
                    topic,
                    reason: e.to_string(),
                    remaining,
                }]);
                return Err(e);
            }
            self.state.lock().await.remove(id);
            flushed += 1;
        }
    }

    /// Needs a live connection; reads are not queued.
    pub async fn list_destinations(&self) -> Result<Vec<String>, ClientError> {
        let connection = self.state.lock().await.connection.clone();
        let Some(connection) = connection else {
            return Err(ClientError::NotConnected);
        };
        Ok(connection.list_destinations().await?)
    }

    pub async fn detach(&self) {
        self.state.lock().await.connection = None;
    }

    /// Empties the queue, reporting every entry as discarded. Later
    /// publishes fail with `ClientError::Closed`.
    pub async fn discard_all(&self) {
        let drained: Vec<PendingPublish> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.connection = None;
            state.queue.drain(..).collect()
        };
        self.report(
            drained
                .into_iter()
                .map(|p| PublishFailure::Discarded {
                    topic: p.topic,
                    message: p.message,
                })
                .collect(),
        );
    }

    pub async fn queued_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }
}

#[async_trait]
impl ConnectionObserver for PublishGateway {
    async fn on_reconnected(&self, connection: &Arc<dyn Connection>) -> Result<(), TransportError> {
        let flushed = self.flush(connection).await?;
        if flushed > 0 {
            info!("Flushed {} queued messages", flushed);
        }
        Ok(())
    }

    async fn on_disconnected(&self) {
        self.detach().await;
    }
}
