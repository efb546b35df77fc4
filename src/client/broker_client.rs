//! Public client surface
//!
//! `BrokerClient` wires a `ConnectionSupervisor`, a `SubscriptionRegistry`
//! and a `PublishGateway` together. It keeps no state of its own beyond the
//! handle of the background task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backoff::RetryPolicy;
use super::gateway::{FailureHandler, PublishFailure, PublishGateway, PublishStatus, QueuePolicy, log_failures};
use super::registry::{Listener, SubscriptionRegistry, SubscriptionToken};
use super::supervisor::{ConnectStatus, ConnectionObserver, ConnectionState, ConnectionSupervisor};
use crate::message::{Headers, Message};
use crate::transport::{Endpoint, Transport};
use crate::utils::error::{ClientError, Result};

pub const DEFAULT_STOP_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct BrokerClientBuilder {
    endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    queue: QueuePolicy,
    on_failure: FailureHandler,
    stop_wait_timeout: Option<Duration>,
}

impl BrokerClientBuilder {
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn queue_policy(mut self, queue: QueuePolicy) -> Self {
        self.queue = queue;
        self
    }

    /// How long `close` waits for the background task (for instance a slow
    /// listener) before aborting it. `None` waits indefinitely.
    pub fn stop_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stop_wait_timeout = timeout;
        self
    }

    /// Replaces the default handler, which logs failures.
    pub fn on_failure(mut self, handler: impl Fn(PublishFailure) + Send + Sync + 'static) -> Self {
        self.on_failure = Arc::new(handler);
        self
    }

    pub fn build(self) -> BrokerClient {
        BrokerClient {
            supervisor: Arc::new(ConnectionSupervisor::new(self.endpoint, self.transport, self.retry)),
            registry: Arc::new(SubscriptionRegistry::new()),
            gateway: Arc::new(PublishGateway::new(self.queue, self.on_failure)),
            driver: Mutex::new(None),
            stop_wait_timeout: self.stop_wait_timeout,
        }
    }
}

pub struct BrokerClient {
    supervisor: Arc<ConnectionSupervisor>,
    registry: Arc<SubscriptionRegistry>,
    gateway: Arc<PublishGateway>,
    driver: Mutex<Option<JoinHandle<()>>>,
    stop_wait_timeout: Option<Duration>,
}

impl BrokerClient {
    pub fn builder(endpoint: Endpoint, transport: impl Transport) -> BrokerClientBuilder {
        BrokerClientBuilder {
            endpoint,
            transport: Arc::new(transport),
            retry: RetryPolicy::default(),
            queue: QueuePolicy::default(),
            on_failure: log_failures(),
            stop_wait_timeout: Some(DEFAULT_STOP_WAIT_TIMEOUT),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.supervisor.is_closed() {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    /// Starts supervising the connection and waits for the first attempt to
    /// settle. Calling it again while supervision runs just reports the
    /// current state.
    pub async fn connect(&self) -> Result<ConnectStatus> {
        self.ensure_open()?;
        {
            let mut driver = self.driver.lock().await;
            // Disconnected means the budget ran out and the task is exiting
            let running = driver.as_ref().is_some_and(|handle| !handle.is_finished())
                && self.supervisor.state() != ConnectionState::Disconnected;
            if !running {
                self.supervisor.begin()?;
                info!("Connecting to broker: {}", self.supervisor.endpoint());
                // registry before gateway: replay precedes flush
                let registry: Arc<dyn ConnectionObserver> = self.registry.clone();
                let gateway: Arc<dyn ConnectionObserver> = self.gateway.clone();
                let observers = vec![registry, gateway];
                *driver = Some(tokio::spawn(Arc::clone(&self.supervisor).run(observers)));
            }
        }
        self.supervisor.first_settled().await
    }

    /// Closes the client. Idempotent. Waiting `connect`/`wait_connected`
    /// callers get `ClientError::Closed`; queued publishes are reported as
    /// discarded.
    pub async fn close(&self) {
        if !self.supervisor.close() {
            return;
        }
        info!("Closing broker client for {}", self.supervisor.endpoint());
        let driver = self.driver.lock().await.take();
        if let Some(handle) = driver {
            self.stop_driver(handle).await;
        }
        self.registry.clear().await;
        self.gateway.discard_all().await;
    }

    async fn stop_driver(&self, handle: JoinHandle<()>) {
        let abort = handle.abort_handle();
        let joined = match self.stop_wait_timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        "Supervisor task did not stop within {:?}, aborting it",
                        limit
                    );
                    abort.abort();
                    return;
                }
            },
            None => handle.await,
        };
        if let Err(e) = joined {
            debug!("Supervisor task ended abnormally: {}", e);
        }
    }

    pub async fn subscribe(&self, topic: &str, listener: Listener) -> Result<SubscriptionToken> {
        self.ensure_open()?;
        self.registry.subscribe(topic, listener).await
    }

    pub async fn unsubscribe(&self, token: SubscriptionToken) -> Result<()> {
        self.ensure_open()?;
        self.registry.unsubscribe(token).await
    }

    pub async fn publish(&self, topic: &str, message: Message, headers: Headers) -> Result<PublishStatus> {
        self.ensure_open()?;
        self.gateway.publish(topic, message, headers).await
    }

    pub async fn list_destinations(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        self.gateway.list_destinations().await
    }

    pub async fn wait_connected(&self) -> Result<()> {
        self.supervisor.wait_connected().await
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.state_changes()
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.supervisor.endpoint()
    }

    pub async fn queued_len(&self) -> usize {
        self.gateway.queued_len().await
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        // stops the background task; close() does the rest of the cleanup
        self.supervisor.close();
    }
}
