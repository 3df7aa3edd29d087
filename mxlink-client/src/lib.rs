//! # mxlink-client
//!
//! Client engine for MXP audio/intercom routing matrices.
//!
//! This crate provides:
//! - Async TCP transport with sequential port-failover connection
//! - Outbound request queue with urgency ordering and rate limiting
//! - Request/reply correlation with per-call timeouts
//! - Broadcast notifications for state, messages, and transport errors
//! - UDP discovery of matrices on the local network

pub mod client;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod limiter;
pub mod queue;
pub mod request;

pub use client::MatrixClient;
pub use connection::{Connection, ConnectionConfig};
pub use discovery::{DiscoveredMatrix, Discovery};
pub use error::ClientError;
pub use request::Request;

/// First port tried by the default configuration.
pub const DEFAULT_PORT_START: u16 = 52020;

/// Last port tried by the default configuration. Being below
/// [`DEFAULT_PORT_START`], the default scan runs downward.
pub const DEFAULT_PORT_END: u16 = 52001;

/// UDP port matrices announce themselves on.
pub const DISCOVERY_PORT: u16 = 52000;
