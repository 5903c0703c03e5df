//! Client-side proxies and load balancing.
//!
//! A proxy names a remote service and a list of candidate endpoints. Every
//! call merges its context over the proxy's default context, picks a
//! candidate by policy and reuses (or lazily replaces) the connection cached
//! in that candidate's slot.

use crate::carp::Carp;
use crate::codec::{Arguments, Context};
use crate::config::ProtocolConfig;
use crate::connection::{Connection, ConnectionOptions, InvokeResult};
use crate::endpoint::Endpoint;
use crate::engine::{Engine, EngineInner};
use crate::message::OutQuest;
use crate::{Result, XicError};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// How a proxy picks among its endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalance {
    /// Stick to one endpoint and move on only when it is dead.
    #[default]
    Normal,
    /// Uniformly random endpoint per call.
    Random,
    /// Endpoint ranked by CARP over a hint taken from the call context.
    Hash,
}

impl FromStr for LoadBalance {
    type Err = XicError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(LoadBalance::Normal),
            "random" => Ok(LoadBalance::Random),
            "hash" => Ok(LoadBalance::Hash),
            other => Err(XicError::Config {
                message: format!("unknown load balance policy {:?}", other),
            }),
        }
    }
}

struct ProxyInner {
    service: String,
    endpoints: Vec<Endpoint>,
    policy: LoadBalance,
    context: Context,
    hash_key: String,
    carp: Option<Carp>,
    slots: Vec<parking_lot::Mutex<Option<Connection>>>,
    cursor: AtomicUsize,
    fixed: Option<Connection>,
    engine: Option<Weak<EngineInner>>,
}

/// Handle to a remote service. Clones share connection slots; the `with_*`
/// derivations get their own.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("text", &self.to_string())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.service)?;
        if let Some(fixed) = &self.inner.fixed {
            return write!(f, " {}", fixed.endpoint());
        }
        for endpoint in &self.inner.endpoints {
            write!(f, " {}", endpoint)?;
        }
        Ok(())
    }
}

impl FromStr for Proxy {
    type Err = XicError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Split `Service @ep1 @ep2` into its service name and endpoints.
pub(crate) fn parse_text(text: &str) -> Result<(String, Vec<Endpoint>)> {
    let invalid = |message: String| XicError::InvalidProxy {
        text: text.to_string(),
        message,
    };

    let trimmed = text.trim();
    let (service, rest) = match trimmed.find('@') {
        Some(at) => (trimmed[..at].trim(), &trimmed[at..]),
        None => (trimmed, ""),
    };
    if service.is_empty() {
        return Err(invalid("missing service name".to_string()));
    }
    if service.contains(char::is_whitespace) {
        return Err(invalid("service name contains whitespace".to_string()));
    }

    let endpoints = Endpoint::parse_list(rest).map_err(|e| invalid(e.to_string()))?;
    if endpoints.is_empty() {
        return Err(invalid("no endpoints".to_string()));
    }
    Ok((service.to_string(), endpoints))
}

impl Proxy {
    /// Proxy that dials its own connections, outside any engine.
    pub fn parse(text: &str) -> Result<Self> {
        let (service, endpoints) = parse_text(text)?;
        Ok(Self::new(&service, endpoints, None))
    }

    pub(crate) fn new(
        service: &str,
        endpoints: Vec<Endpoint>,
        engine: Option<Weak<EngineInner>>,
    ) -> Self {
        Self::assemble(
            service.to_string(),
            endpoints,
            LoadBalance::Normal,
            Context::new(),
            ProtocolConfig::HASH_HINT_KEY.to_string(),
            None,
            engine,
        )
    }

    pub(crate) fn fixed(service: &str, connection: Connection) -> Self {
        let endpoints = vec![connection.endpoint().clone()];
        Self::assemble(
            service.to_string(),
            endpoints,
            LoadBalance::Normal,
            Context::new(),
            ProtocolConfig::HASH_HINT_KEY.to_string(),
            Some(connection),
            None,
        )
    }

    fn assemble(
        service: String,
        endpoints: Vec<Endpoint>,
        policy: LoadBalance,
        context: Context,
        hash_key: String,
        fixed: Option<Connection>,
        engine: Option<Weak<EngineInner>>,
    ) -> Self {
        let carp = match policy {
            LoadBalance::Hash if !endpoints.is_empty() => {
                let names: Vec<String> = endpoints.iter().map(Endpoint::to_string).collect();
                Carp::from_names(&names).ok()
            }
            _ => None,
        };
        let slots = endpoints
            .iter()
            .map(|_| parking_lot::Mutex::new(None))
            .collect();
        Self {
            inner: Arc::new(ProxyInner {
                service,
                endpoints,
                policy,
                context,
                hash_key,
                carp,
                slots,
                cursor: AtomicUsize::new(0),
                fixed,
                engine,
            }),
        }
    }

    fn derive(
        &self,
        service: &str,
        policy: LoadBalance,
        context: Context,
        hash_key: String,
    ) -> Self {
        Self::assemble(
            service.to_string(),
            self.inner.endpoints.clone(),
            policy,
            context,
            hash_key,
            self.inner.fixed.clone(),
            self.inner.engine.clone(),
        )
    }

    pub fn with_load_balance(&self, policy: LoadBalance) -> Self {
        self.derive(
            &self.inner.service,
            policy,
            self.inner.context.clone(),
            self.inner.hash_key.clone(),
        )
    }

    /// Default context merged under every call's own context.
    pub fn with_context(&self, context: Context) -> Self {
        self.derive(
            &self.inner.service,
            self.inner.policy,
            context,
            self.inner.hash_key.clone(),
        )
    }

    /// Context key holding the hash hint.
    pub fn with_hash_key(&self, key: &str) -> Self {
        self.derive(
            &self.inner.service,
            self.inner.policy,
            self.inner.context.clone(),
            key.to_string(),
        )
    }

    /// Same endpoints and settings, another service.
    pub fn with_service(&self, service: &str) -> Self {
        self.derive(
            service,
            self.inner.policy,
            self.inner.context.clone(),
            self.inner.hash_key.clone(),
        )
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.inner.endpoints
    }

    pub fn policy(&self) -> LoadBalance {
        self.inner.policy
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// The live connection the next Normal call would use, if any.
    pub fn connection(&self) -> Option<Connection> {
        if let Some(fixed) = &self.inner.fixed {
            return fixed.is_alive().then(|| fixed.clone());
        }
        let index = self.inner.cursor.load(Ordering::Relaxed);
        let cached = self.inner.slots.get(index)?.lock().clone();
        cached.filter(Connection::is_alive)
    }

    /// Call `method` and wait for its output.
    pub async fn invoke(&self, method: &str, args: Arguments) -> Result<Arguments> {
        self.invoke_with_context(method, args, &Context::new()).await
    }

    pub async fn invoke_with_context(
        &self,
        method: &str,
        args: Arguments,
        context: &Context,
    ) -> Result<Arguments> {
        self.invoke_async_with_context(method, args, context)
            .await?
            .into_output()
            .await
    }

    /// Send a twoway call without waiting for its Answer.
    pub async fn invoke_async(&self, method: &str, args: Arguments) -> Result<InvokeResult> {
        self.invoke_async_with_context(method, args, &Context::new())
            .await
    }

    pub async fn invoke_async_with_context(
        &self,
        method: &str,
        args: Arguments,
        context: &Context,
    ) -> Result<InvokeResult> {
        let context = context.merge_over(&self.inner.context);
        let connection = self.select(&context).await?;
        let quest = OutQuest::new(&self.inner.service, method, &context, &args)?;
        connection.invoke(quest, args).await
    }

    pub async fn invoke_oneway(&self, method: &str, args: Arguments) -> Result<()> {
        self.invoke_oneway_with_context(method, args, &Context::new())
            .await
    }

    pub async fn invoke_oneway_with_context(
        &self,
        method: &str,
        args: Arguments,
        context: &Context,
    ) -> Result<()> {
        let context = context.merge_over(&self.inner.context);
        let connection = self.select(&context).await?;
        let quest = OutQuest::new(&self.inner.service, method, &context, &args)?;
        connection.invoke_oneway(quest).await
    }

    /// Typed call: `input` must encode as a map, the output must decode as `Out`.
    pub async fn call<In, Out>(&self, method: &str, input: &In) -> Result<Out>
    where
        In: Serialize + ?Sized,
        Out: DeserializeOwned,
    {
        let args = Arguments::from_record(input)?;
        self.invoke(method, args).await?.into_record()
    }

    #[cfg(test)]
    pub(crate) fn shares_slots_with(&self, other: &Proxy) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    async fn select(&self, context: &Context) -> Result<Connection> {
        if let Some(fixed) = &self.inner.fixed {
            return if fixed.is_alive() {
                Ok(fixed.clone())
            } else {
                Err(XicError::FixedConnectionBroken {
                    endpoint: fixed.endpoint().to_string(),
                })
            };
        }

        let count = self.inner.endpoints.len();
        if count == 0 {
            return Err(XicError::InvalidProxy {
                text: self.to_string(),
                message: "no endpoints".to_string(),
            });
        }

        let order = match self.inner.policy {
            LoadBalance::Normal => rotation(self.inner.cursor.load(Ordering::Relaxed), count),
            LoadBalance::Random => rotation(rand::rng().random_range(0..count), count),
            LoadBalance::Hash => match (self.hash_hint(context), &self.inner.carp) {
                (Some(key), Some(carp)) => carp.sequence(key, count),
                _ => rotation(self.inner.cursor.load(Ordering::Relaxed), count),
            },
        };

        let mut last_error = None;
        for index in order {
            match self.slot_connection(index).await {
                Ok(connection) => {
                    if self.inner.policy == LoadBalance::Normal {
                        self.inner.cursor.store(index, Ordering::Relaxed);
                    }
                    return Ok(connection);
                }
                Err(e @ XicError::EngineShutdown) => return Err(e),
                Err(e) => {
                    debug!(
                        "{} unavailable for {}: {}",
                        self.inner.endpoints[index], self.inner.service, e
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(XicError::EngineShutdown))
    }

    /// 32-bit hint for the hash policy, if the context carries a usable one.
    fn hash_hint(&self, context: &Context) -> Option<u32> {
        let key = &self.inner.hash_key;
        let Some(value) = context.get(key) else {
            warn!(
                "Hash hint {:?} missing for {}; using normal selection",
                key, self.inner.service
            );
            return None;
        };
        let hint = hint_of(value);
        if hint.is_none() {
            warn!(
                "Hash hint {:?} for {} has unusable value {}; using normal selection",
                key, self.inner.service, value
            );
        }
        hint
    }

    async fn slot_connection(&self, index: usize) -> Result<Connection> {
        let cached = self.inner.slots[index].lock().clone();
        if let Some(connection) = cached.filter(Connection::is_alive) {
            return Ok(connection);
        }

        let endpoint = &self.inner.endpoints[index];
        let connection = match &self.inner.engine {
            Some(engine) => {
                let engine = engine
                    .upgrade()
                    .map(Engine::from_inner)
                    .ok_or(XicError::EngineShutdown)?;
                engine.outbound_connection(endpoint).await?
            }
            None => Connection::connect(endpoint, ConnectionOptions::default()).await?,
        };
        Ok(self.adopt(index, connection).await)
    }

    /// Store a dialed connection in its slot unless a concurrent call already
    /// put a live one there. A standalone proxy owns what it dials, so it
    /// closes the connection that lost.
    async fn adopt(&self, index: usize, connection: Connection) -> Connection {
        let existing = {
            let mut slot = self.inner.slots[index].lock();
            if let Some(current) = slot
                .as_ref()
                .filter(|current| current.is_alive() && !current.same_as(&connection))
            {
                Some(current.clone())
            } else {
                *slot = Some(connection.clone());
                None
            }
        };
        match existing {
            Some(current) => {
                if self.inner.engine.is_none() {
                    debug!("Closing redundant connection to {}", connection.endpoint());
                    connection.close(true).await;
                }
                current
            }
            None => connection,
        }
    }
}

fn rotation(start: usize, count: usize) -> Vec<usize> {
    (0..count).map(|i| (start + i) % count).collect()
}

/// Reduce a context value to a 32-bit hash key.
///
/// Integers keep their low 32 bits. Strings, floats (as text) and byte
/// arrays are reduced with crc32c.
fn hint_of(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i as u32)
            } else if let Some(u) = n.as_u64() {
                Some(u as u32)
            } else {
                n.as_f64()
                    .map(|f| crc32c::crc32c(f.to_string().as_bytes()))
            }
        }
        Value::String(s) => Some(crc32c::crc32c(s.as_bytes())),
        Value::Array(items) => {
            let bytes = items
                .iter()
                .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect::<Option<Vec<u8>>>()?;
            Some(crc32c::crc32c(&bytes))
        }
        _ => None,
    }
}
