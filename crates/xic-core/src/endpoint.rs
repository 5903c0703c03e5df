//! Endpoint descriptors.
//!
//! Textual form:
//!
//! ```text
//! @proto+host+port[ timeout=t,c,n]
//! ```
//!
//! `t` is the per-request timeout, `c` the close timeout and `n` the connect
//! timeout, all in milliseconds. An empty slot (or 0) leaves that timeout
//! unset. An empty protocol means the default stream transport (`tcp`); an
//! empty host means "any" when binding and loopback when connecting.

use crate::config::ProtocolConfig;
use crate::{Result, XicError};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Transport address plus per-link timeout triple. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    protocol: String,
    host: String,
    port: u16,
    timeout_ms: u32,
    close_timeout_ms: u32,
    connect_timeout_ms: u32,
}

impl Endpoint {
    /// Build a TCP endpoint without timeouts.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: ProtocolConfig::DEFAULT_PROTOCOL.to_string(),
            host: host.into(),
            port,
            timeout_ms: 0,
            close_timeout_ms: 0,
            connect_timeout_ms: 0,
        }
    }

    /// Parse a single endpoint.
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |message: &str| XicError::InvalidEndpoint {
            text: text.to_string(),
            message: message.to_string(),
        };

        let trimmed = text.trim();
        let body = trimmed.strip_prefix('@').unwrap_or(trimmed);
        let mut tokens = body.split_whitespace();
        let address = tokens.next().ok_or_else(|| invalid("empty endpoint"))?;

        let parts: Vec<&str> = address.split('+').collect();
        if parts.len() != 3 {
            return Err(invalid("expected proto+host+port"));
        }

        let protocol = if parts[0].is_empty() {
            ProtocolConfig::DEFAULT_PROTOCOL.to_string()
        } else {
            parts[0].to_ascii_lowercase()
        };

        let host = parts[1].to_string();
        if let Some((_, prefix)) = host.split_once('/') {
            match prefix.parse::<u8>() {
                Ok(len) if len <= 128 => {}
                _ => return Err(invalid("invalid prefix length")),
            }
        }

        let port = parts[2]
            .parse::<u16>()
            .map_err(|_| invalid("invalid port"))?;

        let mut endpoint = Self {
            protocol,
            host,
            port,
            timeout_ms: 0,
            close_timeout_ms: 0,
            connect_timeout_ms: 0,
        };

        for option in tokens {
            let (key, value) = option
                .split_once('=')
                .ok_or_else(|| invalid("expected key=value option"))?;
            match key {
                "timeout" => {
                    let slots: Vec<&str> = value.split(',').collect();
                    if slots.len() > 3 {
                        return Err(invalid("timeout takes at most three values"));
                    }
                    let mut values = [0u32; 3];
                    for (i, slot) in slots.iter().enumerate() {
                        if !slot.is_empty() {
                            values[i] = slot.parse().map_err(|_| invalid("invalid timeout value"))?;
                        }
                    }
                    endpoint.timeout_ms = values[0];
                    endpoint.close_timeout_ms = values[1];
                    endpoint.connect_timeout_ms = values[2];
                }
                _ => return Err(invalid(&format!("unknown option {}", key))),
            }
        }

        Ok(endpoint)
    }

    /// Parse a whitespace separated list of `@`-prefixed endpoints.
    pub fn parse_list(text: &str) -> Result<Vec<Self>> {
        text.split('@')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(Self::parse)
            .collect()
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Host as written, including any `/prefixLen` suffix.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Host without the prefix length.
    pub fn host_address(&self) -> &str {
        self.host.split('/').next().unwrap_or_default()
    }

    pub fn prefix_len(&self) -> Option<u8> {
        self.host.split_once('/').and_then(|(_, len)| len.parse().ok())
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeout(&self) -> Option<Duration> {
        millis(self.timeout_ms)
    }

    pub fn close_timeout(&self) -> Option<Duration> {
        millis(self.close_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        millis(self.connect_timeout_ms)
    }

    /// Same endpoint with another port. Used once a listener bound port 0.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    /// Address string suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        self.socket_addr("0.0.0.0")
    }

    /// Address string suitable for `TcpStream::connect`.
    pub fn connect_addr(&self) -> String {
        self.socket_addr("127.0.0.1")
    }

    fn socket_addr(&self, empty_host: &str) -> String {
        let host = match self.host_address() {
            "" => empty_host,
            other => other,
        };
        if host.contains(':') {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    pub(crate) fn ensure_stream_transport(&self) -> Result<()> {
        if self.protocol == ProtocolConfig::DEFAULT_PROTOCOL {
            Ok(())
        } else {
            Err(XicError::UnsupportedProtocol {
                protocol: self.protocol.clone(),
            })
        }
    }
}

fn millis(ms: u32) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(u64::from(ms)))
}

fn slot(ms: u32) -> String {
    if ms == 0 {
        String::new()
    } else {
        ms.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}+{}+{}", self.protocol, self.host, self.port)?;
        if self.timeout_ms != 0 || self.close_timeout_ms != 0 || self.connect_timeout_ms != 0 {
            write!(
                f,
                " timeout={},{},{}",
                slot(self.timeout_ms),
                slot(self.close_timeout_ms),
                slot(self.connect_timeout_ms)
            )?;
        }
        Ok(())
    }
}

impl FromStr for Endpoint {
    type Err = XicError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
