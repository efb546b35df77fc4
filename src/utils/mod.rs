//! The `utils` module provides the error types and logging setup shared
//! across `brokerlink`.

pub mod error;
pub mod logging;
