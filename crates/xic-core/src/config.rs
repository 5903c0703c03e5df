//! Centralized configuration for the XIC core.
//!
//! Protocol and connection constants live in constant groups; settings an
//! operator may change at runtime live in [`EngineConfig`].

use crate::{Result, XicError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wire protocol constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const MAGIC: u8 = b'X';
    pub const VERSION: u8 = b'!';
    pub const HEADER_SIZE: usize = 8;
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
    /// Width reserved for a txid inside an encoded Quest ("-9223372036854775808").
    pub const TXID_SLOT_WIDTH: usize = 20;
    pub const MAX_DECODE_DEPTH: usize = 64;
    /// Stream transport used when an endpoint leaves the protocol empty.
    pub const DEFAULT_PROTOCOL: &'static str = "tcp";
    /// Context key read by the hash load-balancing policy.
    pub const HASH_HINT_KEY: &'static str = "HASH";
}

/// Connection-level timing defaults, used when an endpoint leaves a timeout unset.
pub struct ConnectionConfig;

impl ConnectionConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Defaults for [`EngineConfig`].
pub struct EngineDefaults;

impl EngineDefaults {
    /// Zero disables overload control.
    pub const MAX_IN_FLIGHT: usize = 0;
    pub const ADAPTER_CONCURRENCY: usize = 0;
}

/// Runtime settings for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum inbound requests being processed at once; 0 means unlimited.
    pub max_in_flight: usize,
    /// Upper bound on a frame body, in bytes.
    pub max_message_size: usize,
    /// Concurrent dispatches per adapter. 1 dispatches inline on the reader
    /// task, 0 means unbounded.
    pub adapter_concurrency: usize,
    /// Used when an endpoint does not carry its own connect timeout, in ms.
    pub connect_timeout_ms: u64,
    /// Used when an endpoint does not carry its own close timeout, in ms.
    pub close_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: EngineDefaults::MAX_IN_FLIGHT,
            max_message_size: ProtocolConfig::MAX_MESSAGE_SIZE,
            adapter_concurrency: EngineDefaults::ADAPTER_CONCURRENCY,
            connect_timeout_ms: ConnectionConfig::CONNECT_TIMEOUT.as_millis() as u64,
            close_timeout_ms: ConnectionConfig::CLOSE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn with_adapter_concurrency(mut self, concurrency: usize) -> Self {
        self.adapter_concurrency = concurrency;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Reject settings the wire format cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.max_message_size == 0 || self.max_message_size > i32::MAX as usize {
            return Err(XicError::Config {
                message: format!(
                    "max_message_size must be in 1..={}, got {}",
                    i32::MAX,
                    self.max_message_size
                ),
            });
        }
        Ok(())
    }
}
