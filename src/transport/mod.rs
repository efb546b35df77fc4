//! The `transport` module is the seam between the client core and a broker.
//!
//! A `Transport` knows how to open a `Connection` to an `Endpoint`. The
//! connection performs raw broker operations and reports incoming messages
//! and connection loss through the `TransportEvent` channel it was handed at
//! connect time. The client core owns reconnection, replay and queuing; a
//! transport only ever deals with one live connection at a time.
//!
//! Two implementations ship with the crate:
//! - `memory`: an in-process broker, used by tests and local demos.
//! - `websocket`: the popsub JSON protocol over WebSockets.

pub mod memory;
pub mod message;
pub mod websocket;


use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::client::SubscriptionToken;
use crate::message::Message;
use crate::utils::error::TransportError;

pub use memory::MemoryBroker;
pub use websocket::WebSocketTransport;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Broker address plus optional credentials. Fixed for the life of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.credentials {
            Some(c) => write!(f, "{}@{}:{}", c.username, self.host, self.port),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Notifications a connection pushes to the client core.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A message arrived for the subscription identified by `token`
    Message {
        token: SubscriptionToken,
        message: Message,
    },
    /// The connection died; no further events follow on this channel
    ConnectionLost { cause: String },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a connection. `events` receives everything the connection
    /// observes until it is closed or lost.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        events: EventSender,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, topic: &str, message: &Message) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, token: SubscriptionToken) -> Result<(), TransportError>;

    async fn unsubscribe(&self, token: SubscriptionToken) -> Result<(), TransportError>;

    async fn list_destinations(&self) -> Result<Vec<String>, TransportError>;

    /// Releases the connection. Must not emit `ConnectionLost`.
    async fn close(&self);
}
