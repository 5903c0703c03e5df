//! XIC Core - asynchronous RPC runtime over framed TCP.
//!
//! An [`Engine`] owns named [`Adapter`]s that serve registered servants and
//! [`Proxy`] handles that call remote services. Every call travels as a
//! Quest frame on a multiplexed [`Connection`]; answers are correlated by
//! transaction id, so many calls can be in flight on one connection.
//!
//! # Example
//!
//! ```rust,ignore
//! use xic_core::{echo_servant, Arguments, Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> xic_core::Result<()> {
//!     let engine = Engine::new(EngineConfig::default())?;
//!     let adapter = engine.create_adapter("Main", "@tcp+127.0.0.1+7000")?;
//!     adapter.add_servant("Echo", echo_servant("Echo"))?;
//!     adapter.activate().await?;
//!
//!     let proxy = engine.string_to_proxy("Echo @tcp+127.0.0.1+7000")?;
//!     let out = proxy.invoke("echo", Arguments::new().with("a", 1)).await?;
//!     println!("{:?}", out);
//!
//!     engine.shutdown();
//!     engine.wait_for_shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod carp;
pub mod codec;
pub mod config;
pub mod connection;
pub mod credential;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod message;
pub mod overload;
pub mod proxy;
pub mod secure;
pub mod servant;

// Re-export commonly used types
pub use adapter::Adapter;
pub use carp::Carp;
pub use codec::{Arguments, Context};
pub use config::{EngineConfig, ProtocolConfig};
pub use connection::{Connection, ConnectionOptions, ConnectionState, InvokeResult};
pub use credential::{Handshake, Secret, SecretRule, SecretStore, SecretTable, ShadowStore};
pub use endpoint::Endpoint;
pub use engine::{Engine, EngineState};
pub use error::{Fault, Result, XicError};
pub use message::{Check, MessageType};
pub use proxy::{LoadBalance, Proxy};
pub use secure::{AeadCipher, CipherFactory, SecureChannel};
pub use servant::{echo_servant, Current, ServantBuilder, ServantInfo};
