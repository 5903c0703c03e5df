//! Error types for the XIC core.
//!
//! `XicError` covers every failure the core can report. Service-level errors
//! raised on the server side travel over the wire as a [`Fault`] inside an
//! exceptional Answer and come back to the caller as [`XicError::Remote`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the XIC core.
#[derive(Debug, Error)]
pub enum XicError {
    // Wire errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // Transport errors
    #[error("Connection to {endpoint} closed")]
    ConnectionClosed { endpoint: String },

    #[error("Fixed connection to {endpoint} is broken")]
    FixedConnectionBroken { endpoint: String },

    #[error("Failed to connect to {endpoint}: {message}")]
    ConnectFailed { endpoint: String, message: String },

    #[error("Unsupported protocol: {protocol}")]
    UnsupportedProtocol { protocol: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Service-level errors, produced by the dispatching side
    #[error("Service not found: {service}")]
    ServiceNotFound { service: String },

    #[error("Method not found: {service}.{method}")]
    MethodNotFound { service: String, method: String },

    #[error("No adapter bound to the connection for service {service}")]
    AdapterAbsent { service: String },

    #[error("Invalid parameters: {message}")]
    InvalidParams { message: String },

    #[error("Service overloaded: {in_flight} requests in flight")]
    ServiceOverloaded { in_flight: usize },

    #[error("Remote exception {}: {}", .0.exname, .0.message)]
    Remote(Fault),

    // Configuration and lifecycle errors
    #[error("Invalid endpoint {text:?}: {message}")]
    InvalidEndpoint { text: String, message: String },

    #[error("Invalid proxy string {text:?}: {message}")]
    InvalidProxy { text: String, message: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("Adapter {adapter}: {message}")]
    AdapterState { adapter: String, message: String },

    #[error("Engine is shutting down")]
    EngineShutdown,

    #[error("An engine has already been created in this process")]
    EngineExists,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for XIC operations.
pub type Result<T> = std::result::Result<T, XicError>;

impl From<std::io::Error> for XicError {
    fn from(err: std::io::Error) -> Self {
        XicError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for XicError {
    fn from(err: serde_json::Error) -> Self {
        XicError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<Fault> for XicError {
    fn from(fault: Fault) -> Self {
        XicError::Remote(fault)
    }
}

impl XicError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        XicError::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn codec(message: impl Into<String>) -> Self {
        XicError::Codec {
            message: message.into(),
        }
    }

    /// Convert to the structured fault carried by an exceptional Answer.
    ///
    /// A `Remote` error is passed through unchanged so a servant that calls
    /// another service can re-raise what it received.
    pub fn to_fault(&self) -> Fault {
        let exname = match self {
            XicError::Remote(fault) => return fault.clone(),
            XicError::ServiceNotFound { .. } => Fault::SERVICE_NOT_FOUND,
            XicError::MethodNotFound { .. } => Fault::METHOD_NOT_FOUND,
            XicError::AdapterAbsent { .. } => Fault::ADAPTER_ABSENT,
            XicError::InvalidParams { .. } | XicError::Json { .. } | XicError::Codec { .. } => {
                Fault::PARAMETER
            }
            XicError::ServiceOverloaded { .. } => Fault::SERVICE_OVERLOADED,
            XicError::Protocol { .. } => Fault::PROTOCOL,
            XicError::ConnectionClosed { .. } | XicError::FixedConnectionBroken { .. } => {
                Fault::CONNECTION_CLOSED
            }
            _ => Fault::REMOTE,
        };
        Fault::new(exname, self.to_string())
    }

    /// The remote fault, if this error came back in an exceptional Answer.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            XicError::Remote(fault) => Some(fault),
            _ => None,
        }
    }

    /// Whether this error must tear down the connection it happened on.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            XicError::Protocol { .. }
                | XicError::Codec { .. }
                | XicError::Json { .. }
                | XicError::Authentication { .. }
                | XicError::ConnectionClosed { .. }
                | XicError::Io { .. }
        )
    }
}

/// Structured exception carried across the wire.
///
/// `detail` holds the raising locus for diagnostics only; callers must not
/// depend on its content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub exname: String,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub detail: String,
}

impl Fault {
    pub const SERVICE_NOT_FOUND: &'static str = "ServiceNotFoundException";
    pub const METHOD_NOT_FOUND: &'static str = "MethodNotFoundException";
    pub const ADAPTER_ABSENT: &'static str = "AdapterAbsentException";
    pub const PARAMETER: &'static str = "ParameterException";
    pub const SERVICE_OVERLOADED: &'static str = "ServiceOverloadedException";
    pub const PROTOCOL: &'static str = "ProtocolException";
    pub const CONNECTION_CLOSED: &'static str = "ConnectionClosedException";
    pub const REMOTE: &'static str = "RemoteException";

    /// Create a fault with code -1 and no tag.
    pub fn new(exname: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exname: exname.into(),
            code: -1,
            tag: String::new(),
            message: message.into(),
            detail: String::new(),
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = code;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    /// Whether the fault has the given exception name.
    pub fn is(&self, exname: &str) -> bool {
        self.exname == exname
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.exname, self.message)
    }
}
