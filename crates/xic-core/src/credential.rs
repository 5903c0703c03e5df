//! Credential lookup and handshake hooks.
//!
//! The key exchange that produces a connection's shared secret is not part
//! of the core. A [`Handshake`] installed on a connection receives every
//! Check frame; once it reports a shared secret the connection switches to
//! sealed frames.

use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::message::Check;
use crate::{Result, XicError};
use async_trait::async_trait;
use std::net::IpAddr;

/// Client-side credential for a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub identity: String,
    pub password: String,
}

/// Looks up the credential to present when connecting to a service.
pub trait SecretStore: Send + Sync {
    fn find(&self, service: &str, endpoint: &Endpoint) -> Option<Secret>;
}

/// SRP-6a group parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Srp6aParams {
    pub param_id: String,
    pub hash: String,
    pub generator: Vec<u8>,
    pub modulus: Vec<u8>,
}

/// Stored password verifier for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verifier {
    pub identity: String,
    pub param_id: String,
    pub salt: Vec<u8>,
    pub verifier: Vec<u8>,
}

/// Server-side verifier lookup.
pub trait ShadowStore: Send + Sync {
    fn get_srp6a(&self, param_id: &str) -> Option<Srp6aParams>;
    fn get_verifier(&self, identity: &str) -> Option<Verifier>;
}

/// Drives the Check exchange on one connection.
#[async_trait]
pub trait Handshake: Send + Sync + 'static {
    /// Handle a received Check and optionally reply with another one.
    async fn on_check(&self, connection: &Connection, check: Check) -> Result<Option<Check>>;

    /// Key material, available once the exchange has completed.
    fn shared_secret(&self) -> Option<Vec<u8>>;
}

/// One entry of a [`SecretTable`].
///
/// Empty service or host, and port 0, match anything. The host may carry a
/// `/prefixLen` network mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRule {
    service: String,
    protocol: String,
    host: String,
    port: u16,
    secret: Secret,
}

impl SecretRule {
    /// Parse `identity:password @service+proto+host+port`.
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |message: &str| XicError::Config {
            message: format!("invalid secret rule {:?}: {}", text, message),
        };

        let (credential, pattern) = text
            .trim()
            .split_once('@')
            .ok_or_else(|| invalid("missing '@' before the service pattern"))?;
        let (identity, password) = credential
            .trim()
            .split_once(':')
            .ok_or_else(|| invalid("expected identity:password"))?;
        if identity.is_empty() {
            return Err(invalid("empty identity"));
        }

        let parts: Vec<&str> = pattern.trim().split('+').collect();
        if parts.len() != 4 {
            return Err(invalid("expected service+proto+host+port"));
        }
        let port = if parts[3].is_empty() {
            0
        } else {
            parts[3].parse().map_err(|_| invalid("invalid port"))?
        };

        Ok(Self {
            service: parts[0].to_string(),
            protocol: parts[1].to_ascii_lowercase(),
            host: parts[2].to_string(),
            port,
            secret: Secret {
                identity: identity.to_string(),
                password: password.to_string(),
            },
        })
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }

    fn matches(&self, service: &str, endpoint: &Endpoint) -> bool {
        if !self.service.is_empty() && self.service != service {
            return false;
        }
        if !self.protocol.is_empty() && self.protocol != endpoint.protocol() {
            return false;
        }
        if self.port != 0 && self.port != endpoint.port() {
            return false;
        }
        self.host.is_empty() || host_matches(&self.host, endpoint.host_address())
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    let Some((network, prefix)) = pattern.split_once('/') else {
        return pattern.eq_ignore_ascii_case(host);
    };
    let (Ok(network), Ok(prefix), Ok(addr)) = (
        network.parse::<IpAddr>(),
        prefix.parse::<u32>(),
        host.parse::<IpAddr>(),
    ) else {
        return false;
    };

    match (network, addr) {
        (IpAddr::V4(net), IpAddr::V4(addr)) if prefix <= 32 => {
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            u32::from(net) & mask == u32::from(addr) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) if prefix <= 128 => {
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            u128::from(net) & mask == u128::from(addr) & mask
        }
        _ => false,
    }
}

/// In-memory [`SecretStore`]; the first matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct SecretTable {
    rules: Vec<SecretRule>,
}

impl SecretTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one rule per line. Blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Result<Self> {
        let rules = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(SecretRule::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn push(&mut self, rule: SecretRule) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl SecretStore for SecretTable {
    fn find(&self, service: &str, endpoint: &Endpoint) -> Option<Secret> {
        self.rules
            .iter()
            .find(|rule| rule.matches(service, endpoint))
            .map(|rule| rule.secret.clone())
    }
}
