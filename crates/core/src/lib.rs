//! Connection and error types for the statrpc bridge.
//!
//! [`Connection`] turns a pair of byte streams into typed request, response
//! and notification semantics on top of [`statrpc_protocol`].

pub mod config;
pub mod connection;
pub mod error;
mod pending;

pub use config::{ConnectionConfig, DEFAULT_REQUEST_TIMEOUT};
pub use connection::{Connection, HandlerResult, Subscription};
pub use error::{Error, Result};
