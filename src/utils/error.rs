//! The `error` module defines the error types used within `brokerlink`.
//!
//! `ClientError` is what callers of `BrokerClient` see. `TransportError` is
//! what a `Transport` implementation reports back to the client core; the
//! core decides whether it is retried (connect failures) or surfaced.

use thiserror::Error;

use crate::client::SubscriptionToken;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors returned by the broker transport seam.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not establish a connection to the broker
    #[error("connect failed: {0}")]
    Connect(String),

    /// A frame could not be written to the broker
    #[error("send failed: {0}")]
    Send(String),

    /// The broker refused or failed a subscription
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// Unexpected or malformed frame from the broker
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A request did not get an answer in time
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The connection is gone
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    pub fn send(msg: impl Into<String>) -> Self {
        Self::Send(msg.into())
    }

    pub fn subscribe(msg: impl Into<String>) -> Self {
        Self::Subscribe(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Errors surfaced to callers of the client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Connecting gave up (finite retry budget exhausted)
    #[error("could not connect to broker: {0}")]
    Connect(String),

    /// A publish issued while connected was rejected by the transport
    #[error("publish to '{topic}' failed: {reason}")]
    Send { topic: String, reason: String },

    /// A subscribe issued while connected was rejected by the transport
    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    /// Unsubscribe with a token the registry does not know
    #[error("no subscription with token {0}")]
    NotFound(SubscriptionToken),

    /// The pending-publish queue is saturated
    #[error("publish queue is full ({capacity} entries)")]
    QueueFull { capacity: usize },

    /// The client has been closed
    #[error("client is closed")]
    Closed,

    /// Operation needs a live connection and has no queuing fallback
    #[error("not connected to broker")]
    NotConnected,

    /// Any other transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}
