//! The `client` module is the resilient publish/subscribe core.
//!
//! - `supervisor`: connection lifecycle, backoff and reconnection.
//! - `registry`: subscriptions and their listeners, replayed on reconnect.
//! - `gateway`: outbound messages and the offline publish queue.
//! - `broker_client`: the `BrokerClient` facade combining the three.

pub mod backoff;
pub mod broker_client;
pub mod gateway;
pub mod registry;
pub mod supervisor;

pub use backoff::{Backoff, RetryPolicy};
pub use broker_client::{BrokerClient, BrokerClientBuilder};
pub use gateway::{FailureHandler, PublishFailure, PublishGateway, PublishStatus, QueuePolicy};
pub use registry::{Listener, SubscriptionRegistry, SubscriptionToken};
pub use supervisor::{ConnectStatus, ConnectionObserver, ConnectionState, ConnectionSupervisor};

#[cfg(test)]
mod tests;
