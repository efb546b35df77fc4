//! # brokerlink
//!
//! `brokerlink` is a resilient publish/subscribe client. It keeps one logical
//! connection to a message broker alive across failures, replays
//! subscriptions after every reconnect, and queues publishes made while the
//! broker is unreachable.
//!
//! ## Core Modules
//!
//! - `client`: the `BrokerClient` facade and the supervisor, registry and
//!   gateway behind it.
//! - `config`: layered configuration from a file and the environment.
//! - `message`: message payloads and headers.
//! - `transport`: the broker seam, with an in-process broker and a WebSocket
//!   implementation.
//! - `utils`: error types and logging setup.

pub mod client;
pub mod config;
pub mod message;
pub mod transport;
pub mod utils;
