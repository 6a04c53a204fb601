use crate::{RelaymqError, Result};
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bridge configuration.
///
/// The defaults reproduce the fixed constants of the deployed bridge: TCP
/// port 9122, a 25-slot connection pool, 255-byte lines, and a local MQTT
/// broker with one vision topic filter. The bus endpoint is deliberately
/// not exposed on the command line; override it through the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,

    /// Pool capacity. A connection accepted while the pool is full evicts
    /// the occupant that has aged across the most broadcasts.
    pub max_connections: usize,
    /// Maximum line length on the TCP side, terminator included. Enforced
    /// symmetrically on read and write.
    pub max_line_len: usize,

    // Bus endpoint and subscription
    pub bus_host: String,
    pub bus_port: u16,
    pub bus_keepalive_secs: u64,
    pub topic_filter: String,

    // Event loop pacing
    pub service_timeout_us: u64,
    pub poll_timeout_us: u64,
    pub reconnect_backoff_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9122,
            max_connections: 25,
            max_line_len: 255,
            bus_host: "localhost".to_string(),
            bus_port: 1883,
            bus_keepalive_secs: 60,
            topic_filter: "PI/CV/SHOOT/DATA".to_string(),
            service_timeout_us: 1000, // one bus-servicing slice per tick
            poll_timeout_us: 100,     // keeps the loop responsive to the bus
            reconnect_backoff_secs: 10,
        }
    }
}

impl BridgeConfig {
    /// Layer `RELAYMQ_`-prefixed environment variables over the defaults.
    /// Fields left unset keep their default values.
    pub fn from_env() -> Result<Self> {
        let settings = Config::builder()
            .add_source(Environment::with_prefix("RELAYMQ"))
            .build()
            .map_err(|e| RelaymqError::Config(e.to_string()))?;

        let config = settings
            .try_deserialize::<BridgeConfig>()
            .map_err(|e| RelaymqError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_micros(self.service_timeout_us)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_micros(self.poll_timeout_us)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn bus_keepalive(&self) -> Duration {
        Duration::from_secs(self.bus_keepalive_secs)
    }
}
