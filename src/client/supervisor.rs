//! Connection supervisor
//!
//! Owns the one logical connection of a client. `run` is the client's
//! background task: it connects, backs off and retries after failures,
//! notices connection loss, and delivers incoming messages to observers.
//!
//! State transitions:
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connected ...
//! Any state -> Closed (absorbing). Connecting/Reconnecting -> Disconnected
//! only when a finite retry budget runs out.
//!
//! `Connected` is published only after every observer has accepted the new
//! connection (subscriptions replayed, queued publishes flushed).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::SubscriptionToken;
use super::backoff::{Backoff, RetryPolicy};
use crate::message::Message;
use crate::transport::{Connection, Endpoint, Transport, TransportEvent};
use crate::utils::error::{ClientError, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// How the first connection attempt after `connect()` settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected,
    /// First attempt failed; retries continue in the background
    Retrying,
}

/// Receives the supervisor's connection events, in order, on its task.
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    /// A new connection is up. An error makes the supervisor treat the
    /// connection as lost.
    async fn on_reconnected(&self, connection: &Arc<dyn Connection>) -> Result<(), TransportError>;

    async fn on_disconnected(&self);

    async fn on_message(&self, _token: SubscriptionToken, _message: &Message) {}
}

pub struct ConnectionSupervisor {
    endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    state: watch::Sender<ConnectionState>,
    last_error: Mutex<Option<String>>,
}

enum Served {
    Lost(String),
    Closed,
}

impl ConnectionSupervisor {
    pub fn new(endpoint: Endpoint, transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            endpoint,
            transport,
            policy,
            state,
            last_error: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Moves to `next` unless closed. Returns false when closed.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut accepted = false;
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed {
                return false;
            }
            accepted = true;
            if *current == next {
                false
            } else {
                debug!("Connection state {:?} -> {:?}", current, next);
                *current = next;
                true
            }
        });
        accepted
    }

    /// Disconnected -> Connecting, ahead of spawning `run`.
    pub(crate) fn begin(&self) -> Result<(), ClientError> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| match current {
            ConnectionState::Closed => {
                result = Err(ClientError::Closed);
                false
            }
            ConnectionState::Disconnected => {
                *current = ConnectionState::Connecting;
                true
            }
            _ => false,
        });
        result
    }

    /// Terminal. Wakes the background task and every waiter. Returns false
    /// if the supervisor was already closed.
    pub fn close(&self) -> bool {
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed {
                false
            } else {
                *current = ConnectionState::Closed;
                true
            }
        })
    }

    /// Transport reported the connection gone: Connected -> Reconnecting.
    fn on_connection_lost(&self, cause: &str) {
        warn!("Connection to {} lost: {}", self.endpoint, cause);
        self.record_error(cause.to_string());
        self.transition(ConnectionState::Reconnecting);
    }

    fn record_error(&self, error: String) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error);
        }
    }

    fn connect_error(&self) -> ClientError {
        let last = self.last_error.lock().ok().and_then(|l| l.clone());
        ClientError::Connect(last.unwrap_or_else(|| format!("not connected to {}", self.endpoint)))
    }

    fn settled(&self, state: ConnectionState) -> Result<ConnectStatus, ClientError> {
        match state {
            ConnectionState::Connected => Ok(ConnectStatus::Connected),
            ConnectionState::Reconnecting | ConnectionState::Connecting => Ok(ConnectStatus::Retrying),
            ConnectionState::Disconnected => Err(self.connect_error()),
            ConnectionState::Closed => Err(ClientError::Closed),
        }
    }

    /// Waits until the first attempt since `begin` settled.
    pub async fn first_settled(&self) -> Result<ConnectStatus, ClientError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed);
        self.settled(state)
    }

    /// Waits for `Connected`; fails once that can no longer happen.
    pub async fn wait_connected(&self) -> Result<(), ClientError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| {
                matches!(
                    s,
                    ConnectionState::Connected | ConnectionState::Disconnected | ConnectionState::Closed
                )
            })
            .await
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed);
        self.settled(state).map(|_| ())
    }

    /// Background task body. Returns when closed or when the retry budget is
    /// exhausted.
    pub(crate) async fn run(self: Arc<Self>, observers: Vec<Arc<dyn ConnectionObserver>>) {
        let mut closed = self.state.subscribe();
        let mut backoff = Backoff::new(self.policy.clone());
        let mut delay = None;

        loop {
            if let Some(delay) = delay.take() {
                debug!("Waiting {:?} before retrying {}", delay, self.endpoint);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_closed(&mut closed) => break,
                }
                info!("Reconnecting to {}: retry #{}", self.endpoint, backoff.retries());
            }

            let (events_tx, mut events) = mpsc::unbounded_channel();
            let attempt = tokio::select! {
                result = self.transport.connect(&self.endpoint, events_tx) => result,
                _ = wait_closed(&mut closed) => break,
            };

            let connection = match attempt {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("Connecting to {} failed: {}", self.endpoint, e);
                    self.record_error(e.to_string());
                    match self.schedule_retry(&mut backoff) {
                        Some(next) => {
                            delay = Some(next);
                            continue;
                        }
                        None => break,
                    }
                }
            };

            let activated = tokio::select! {
                result = activate(&observers, &connection) => result,
                _ = wait_closed(&mut closed) => {
                    connection.close().await;
                    break;
                }
            };
            if let Err(e) = activated {
                warn!("Connection to {} unusable: {}", self.endpoint, e);
                self.record_error(e.to_string());
                notify_disconnected(&observers).await;
                connection.close().await;
                match self.schedule_retry(&mut backoff) {
                    Some(next) => {
                        delay = Some(next);
                        continue;
                    }
                    None => break,
                }
            }

            if !self.transition(ConnectionState::Connected) {
                connection.close().await;
                break;
            }
            info!("Connected to {}", self.endpoint);
            let connected_at = Instant::now();

            let served = loop {
                tokio::select! {
                    biased;
                    _ = wait_closed(&mut closed) => break Served::Closed,
                    event = events.recv() => match event {
                        Some(TransportEvent::Message { token, message }) => {
                            for observer in &observers {
                                observer.on_message(token, &message).await;
                            }
                        }
                        Some(TransportEvent::ConnectionLost { cause }) => break Served::Lost(cause),
                        None => break Served::Lost("transport event channel closed".to_string()),
                    },
                }
            };

            let cause = match served {
                Served::Closed => {
                    connection.close().await;
                    break;
                }
                Served::Lost(cause) => cause,
            };

            // detach observers first so nobody sees Reconnecting while they
            // still hold the dead connection
            notify_disconnected(&observers).await;
            self.on_connection_lost(&cause);
            connection.close().await;

            if connected_at.elapsed() >= self.policy.reset_threshold {
                backoff.reset();
            }
            match self.schedule_retry(&mut backoff) {
                Some(next) => delay = Some(next),
                None => break,
            }
        }

        debug!("Supervisor for {} stopped in state {:?}", self.endpoint, self.state());
    }

    fn schedule_retry(&self, backoff: &mut Backoff) -> Option<std::time::Duration> {
        match backoff.next_delay() {
            Some(delay) => {
                self.transition(ConnectionState::Reconnecting);
                Some(delay)
            }
            None => {
                error!(
                    "Reached max retries limit ({}) for {}",
                    backoff.retries(),
                    self.endpoint
                );
                self.transition(ConnectionState::Disconnected);
                None
            }
        }
    }
}

async fn wait_closed(rx: &mut watch::Receiver<ConnectionState>) {
    let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
}

async fn activate(
    observers: &[Arc<dyn ConnectionObserver>],
    connection: &Arc<dyn Connection>,
) -> Result<(), TransportError> {
    for observer in observers {
        observer.on_reconnected(connection).await?;
    }
    Ok(())
}

async fn notify_disconnected(observers: &[Arc<dyn ConnectionObserver>]) {
    for observer in observers {
        observer.on_disconnected().await;
    }
}
