//! # RelayMQ
//!
//! RelayMQ is a bridge process that relays records between a set of TCP
//! clients and an MQTT message bus. Lines received from TCP clients are
//! published to the bus, and bus messages matching one static topic filter
//! are fanned out to every connected client.
//!
//! ## Architecture
//!
//! The bridge is built from four components:
//!
//! - [`codec`] - the line-based `topic,payload` wire format used on the
//!   TCP side, with a bounded non-blocking read path
//! - [`pool`] - a fixed-capacity table of client connections that owns the
//!   eviction policy applied when the table is full
//! - [`bridge`] - the single-task event loop that services the bus,
//!   multiplexes the client sockets and the listening socket, and moves
//!   records between the two sides
//! - [`bus`] - the thin adapter over the external MQTT client, exposing
//!   only the subscribe/publish/service surface the event loop needs
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relaymq::{BridgeConfig, BridgeServer, MqttBus};
//!
//! #[tokio::main]
//! async fn main() -> relaymq::Result<()> {
//!     let config = BridgeConfig::default();
//!     let bus = MqttBus::connect(&config);
//!     let server = BridgeServer::bind(config, bus).await?;
//!     server.run().await
//! }
//! ```

pub mod bridge;
pub mod bus;
pub mod codec;
pub mod config;
pub mod pool;

pub use bridge::BridgeServer;
pub use bus::{BusClient, BusMessage, MqttBus};
pub use codec::{CodecError, ReadOutcome, Record};
pub use config::BridgeConfig;
pub use pool::{ConnectionPool, Insert, SlotInfo};

use thiserror::Error;

/// RelayMQ error types
///
/// Fatal startup conditions (socket bind failures, bus subscription
/// failures) propagate out of `main` and abort the process. Everything
/// else is recovered locally: a broken client connection is evicted from
/// the pool, and a bus transport error arms the reconnect backoff.
#[derive(Debug, Error)]
pub enum RelaymqError {
    /// Socket and file I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message bus transport and client errors
    #[error("Bus error: {0}")]
    Bus(String),

    /// Configuration validation and parsing errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias used throughout RelayMQ.
pub type Result<T> = std::result::Result<T, RelaymqError>;
