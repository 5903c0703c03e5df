//! The engine: process-wide root of adapters, proxies and connections.
//!
//! At most one engine is ever constructed per process. Its state only moves
//! forward (`Active -> Shutting -> Shutted`). Shutdown freezes the registries by
//! taking them out from under their lock, so nothing can register while the
//! coordinator task deactivates adapters and closes connections.

use crate::adapter::Adapter;
use crate::config::EngineConfig;
use crate::connection::{Connection, ConnectionOptions};
use crate::credential::{Secret, SecretStore, ShadowStore};
use crate::endpoint::Endpoint;
use crate::overload::InFlight;
use crate::proxy::{parse_text, Proxy};
use crate::{Result, XicError};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Set by the first successful `Engine::new` and never cleared.
static ENGINE_CREATED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Active,
    Shutting,
    Shutted,
}

pub type ShutdownHandler = Arc<dyn Fn(&Engine) + Send + Sync>;

#[derive(Default)]
struct Registry {
    adapters: HashMap<String, Adapter>,
    slack: Option<Adapter>,
    proxies: HashMap<String, Proxy>,
    outbound: HashMap<String, Connection>,
    inbound: Vec<Connection>,
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    state: watch::Sender<EngineState>,
    /// `None` once shutdown has begun.
    registry: Mutex<Option<Registry>>,
    limiter: Arc<InFlight>,
    secret_store: RwLock<Option<Arc<dyn SecretStore>>>,
    shadow_store: RwLock<Option<Arc<dyn ShadowStore>>>,
    shutdown_handler: RwLock<Option<ShutdownHandler>>,
}

/// Handle to the engine. Clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("max_in_flight", &self.inner.limiter.max())
            .field("in_flight", &self.inner.limiter.current())
            .finish()
    }
}

impl Engine {
    /// Create the process's engine. Fails with `EngineExists` once any engine
    /// has been constructed, including one that has already shut down.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        ENGINE_CREATED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| XicError::EngineExists)?;
        let (state, _) = watch::channel(EngineState::Active);
        let limiter = Arc::new(InFlight::new(config.max_in_flight));
        info!(
            "Engine started (max_in_flight={}, adapter_concurrency={})",
            config.max_in_flight, config.adapter_concurrency
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                state,
                registry: Mutex::new(Some(Registry::default())),
                limiter,
                secret_store: RwLock::new(None),
                shadow_store: RwLock::new(None),
                shutdown_handler: RwLock::new(None),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    /// Create a named adapter listening on `endpoints` (`@tcp+host+port ...`).
    /// The adapter starts inactive.
    pub fn create_adapter(&self, name: &str, endpoints: &str) -> Result<Adapter> {
        if name.is_empty() {
            return Err(XicError::Config {
                message: "adapter name must not be empty".to_string(),
            });
        }
        let endpoints = Endpoint::parse_list(endpoints)?;

        let mut registry = self.inner.registry.lock();
        let registry = registry.as_mut().ok_or(XicError::EngineShutdown)?;
        if registry.adapters.contains_key(name) {
            return Err(XicError::AlreadyExists {
                kind: "adapter",
                name: name.to_string(),
            });
        }
        let adapter = Adapter::new(
            name,
            endpoints,
            self.inner.config.adapter_concurrency,
            Arc::downgrade(&self.inner),
        );
        registry.adapters.insert(name.to_string(), adapter.clone());
        debug!("Created adapter {}", name);
        Ok(adapter)
    }

    /// The unnamed adapter bound to every outbound connection, so peers can
    /// call back over it. Created on first use.
    pub fn create_slack_adapter(&self) -> Result<Adapter> {
        let mut registry = self.inner.registry.lock();
        let registry = registry.as_mut().ok_or(XicError::EngineShutdown)?;
        let adapter = registry.slack.get_or_insert_with(|| {
            Adapter::new(
                "",
                Vec::new(),
                self.inner.config.adapter_concurrency,
                Arc::downgrade(&self.inner),
            )
        });
        Ok(adapter.clone())
    }

    pub fn adapter(&self, name: &str) -> Option<Adapter> {
        self.inner
            .registry
            .lock()
            .as_ref()
            .and_then(|registry| registry.adapters.get(name).cloned())
    }

    /// Resolve `Service @ep1 @ep2 ...` to a proxy. Proxies are cached by text.
    pub fn string_to_proxy(&self, text: &str) -> Result<Proxy> {
        let key = text.trim();
        if let Some(proxy) = self.cached_proxy(key)? {
            return Ok(proxy);
        }

        let (service, endpoints) = parse_text(key)?;
        let proxy = Proxy::new(&service, endpoints, Some(Arc::downgrade(&self.inner)));

        let mut registry = self.inner.registry.lock();
        let registry = registry.as_mut().ok_or(XicError::EngineShutdown)?;
        Ok(registry
            .proxies
            .entry(key.to_string())
            .or_insert(proxy)
            .clone())
    }

    fn cached_proxy(&self, key: &str) -> Result<Option<Proxy>> {
        let registry = self.inner.registry.lock();
        let registry = registry.as_ref().ok_or(XicError::EngineShutdown)?;
        Ok(registry.proxies.get(key).cloned())
    }

    /// Zero disables overload control.
    pub fn set_max_in_flight(&self, max: usize) {
        self.inner.limiter.set_max(max);
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.limiter.max()
    }

    /// Inbound requests currently being processed.
    pub fn in_flight(&self) -> usize {
        self.inner.limiter.current()
    }

    pub fn set_secret_store(&self, store: Arc<dyn SecretStore>) {
        *self.inner.secret_store.write() = Some(store);
    }

    pub fn set_shadow_store(&self, store: Arc<dyn ShadowStore>) {
        *self.inner.shadow_store.write() = Some(store);
    }

    pub fn shadow_store(&self) -> Option<Arc<dyn ShadowStore>> {
        self.inner.shadow_store.read().clone()
    }

    /// Credential to present to `service` at `endpoint`, if a secret store is set.
    pub fn find_secret(&self, service: &str, endpoint: &Endpoint) -> Option<Secret> {
        let store = self.inner.secret_store.read().clone()?;
        store.find(service, endpoint)
    }

    /// Replace what happens on ctrl-c. Without a handler the engine shuts down.
    pub fn set_shutdown_handler<F>(&self, handler: F)
    where
        F: Fn(&Engine) + Send + Sync + 'static,
    {
        *self.inner.shutdown_handler.write() = Some(Arc::new(handler));
    }

    /// Listen for ctrl-c and run the shutdown handler.
    pub fn install_signal_handler(&self) {
        let engine = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
                return;
            }
            let Some(inner) = engine.upgrade() else {
                return;
            };
            let engine = Engine::from_inner(inner);
            info!("Interrupt received");
            let handler = engine.inner.shutdown_handler.read().clone();
            match handler {
                Some(handler) => handler(&engine),
                None => engine.shutdown(),
            }
        });
    }

    /// Begin shutdown. Returns immediately; use [`Engine::wait_for_shutdown`]
    /// to wait for it to finish. Must be called within a Tokio runtime.
    pub fn shutdown(&self) {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == EngineState::Active {
                *state = EngineState::Shutting;
                true
            } else {
                false
            }
        });
        if !started {
            return;
        }

        info!("Engine shutting down");
        let engine = self.clone();
        tokio::spawn(async move { engine.coordinate_shutdown().await });
    }

    /// Resolves once every adapter is deactivated and every connection has
    /// been offered a graceful close.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == EngineState::Shutted).await;
    }

    async fn coordinate_shutdown(self) {
        let registry = self.inner.registry.lock().take();
        if let Some(registry) = registry {
            let adapters: Vec<Adapter> = registry
                .adapters
                .into_values()
                .chain(registry.slack)
                .collect();
            for adapter in &adapters {
                if adapter.is_active() {
                    if let Err(e) = adapter.deactivate().await {
                        debug!("Deactivating adapter {} during shutdown: {}", adapter, e);
                    }
                }
            }
            debug!("Adapters deactivated");

            let connections: Vec<Connection> = registry
                .inbound
                .into_iter()
                .chain(registry.outbound.into_values())
                .collect();
            let count = connections.len();
            join_all(
                connections
                    .iter()
                    .map(|connection| connection.close(true)),
            )
            .await;
            debug!("Closed {} connections", count);
        }

        self.inner.state.send_replace(EngineState::Shutted);
        info!("Engine shut down");
    }

    pub(crate) fn connection_options(&self, adapter: Option<Adapter>) -> ConnectionOptions {
        let config = &self.inner.config;
        ConnectionOptions {
            max_message_size: config.max_message_size,
            connect_timeout: config.connect_timeout(),
            close_timeout: config.close_timeout(),
            limiter: Some(self.inner.limiter.clone()),
            adapter,
        }
    }

    /// Track an accepted connection. Returns false once shutdown has begun.
    pub(crate) fn register_inbound(&self, connection: &Connection) -> bool {
        let mut registry = self.inner.registry.lock();
        match registry.as_mut() {
            Some(registry) => {
                registry.inbound.retain(|c| !c.state().is_terminal());
                registry.inbound.push(connection.clone());
                true
            }
            None => false,
        }
    }

    /// Live outbound connection to `endpoint`, dialing a new one if needed.
    pub(crate) async fn outbound_connection(&self, endpoint: &Endpoint) -> Result<Connection> {
        let key = endpoint.to_string();
        let slack = {
            let registry = self.inner.registry.lock();
            let registry = registry.as_ref().ok_or(XicError::EngineShutdown)?;
            if let Some(connection) = registry.outbound.get(&key).filter(|c| c.is_alive()) {
                return Ok(connection.clone());
            }
            registry.slack.clone()
        };

        let connection = Connection::connect(endpoint, self.connection_options(slack)).await?;

        let existing = {
            let mut registry = self.inner.registry.lock();
            match registry.as_mut() {
                Some(registry) => match registry.outbound.get(&key).filter(|c| c.is_alive()) {
                    Some(existing) => Some(existing.clone()),
                    None => {
                        registry.outbound.insert(key, connection.clone());
                        return Ok(connection);
                    }
                },
                None => None,
            }
        };

        // Lost a dial race, or shutdown began while dialing.
        connection.close(true).await;
        existing.ok_or(XicError::EngineShutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::SecretTable;
    use crate::servant::echo_servant;
    use crate::Arguments;
    use std::sync::atomic::AtomicUsize;

    // Only one engine can ever exist in this process, so the whole lifecycle
    // runs as a single test.
    #[tokio::test]
    async fn test_engine_lifecycle() {
        // A rejected config does not consume the guard.
        let invalid = EngineConfig {
            max_message_size: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(Engine::new(invalid), Err(XicError::Config { .. })));
        let engine = Engine::new(EngineConfig::default().with_max_in_flight(4)).unwrap();
        assert!(matches!(
            Engine::new(EngineConfig::default()),
            Err(XicError::EngineExists)
        ));

        // Limits and credentials
        assert_eq!(engine.max_in_flight(), 4);
        engine.set_max_in_flight(0);
        assert_eq!(engine.max_in_flight(), 0);
        assert_eq!(engine.in_flight(), 0);

        let table = SecretTable::parse("alice:pw @Billing+++").unwrap();
        let endpoint = Endpoint::tcp("10.0.0.1", 1);
        assert!(engine.find_secret("Billing", &endpoint).is_none());
        engine.set_secret_store(Arc::new(table));
        assert_eq!(engine.find_secret("Billing", &endpoint).unwrap().identity, "alice");

        // Proxies are cached by their trimmed text
        let a = engine.string_to_proxy("Echo @tcp+127.0.0.1+7000").unwrap();
        let b = engine.string_to_proxy(" Echo @tcp+127.0.0.1+7000 ").unwrap();
        assert!(a.shares_slots_with(&b));
        assert!(engine.string_to_proxy("no endpoints").is_err());

        let slack = engine.create_slack_adapter().unwrap();
        assert_eq!(slack.name(), "");
        assert!(engine.adapter("").is_none());

        // Adapters and outbound connections
        let adapter = engine.create_adapter("Main", "@tcp+127.0.0.1+0").unwrap();
        assert!(matches!(
            engine.create_adapter("Main", "@tcp+127.0.0.1+0"),
            Err(XicError::AlreadyExists { kind: "adapter", .. })
        ));
        assert!(engine.adapter("Main").is_some());
        adapter.set_default_servant(echo_servant("Echo"));
        adapter.activate().await.unwrap();

        let port = adapter.endpoints()[0].port();
        let proxy = engine
            .string_to_proxy(&format!("Echo @tcp+127.0.0.1+{}", port))
            .unwrap();
        proxy.invoke("echo", Arguments::new()).await.unwrap();
        let connection = proxy.connection().unwrap();

        // Shutdown through the installed handler
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        engine.set_shutdown_handler(move |engine| {
            seen.fetch_add(1, Ordering::SeqCst);
            engine.shutdown();
        });
        let handler = engine.inner.shutdown_handler.read().clone().unwrap();
        handler(&engine);
        engine.wait_for_shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state(), EngineState::Shutted);

        assert!(!adapter.is_active());
        assert!(connection.state().is_terminal());
        assert!(matches!(
            proxy.invoke("echo", Arguments::new()).await,
            Err(XicError::EngineShutdown)
        ));
        assert!(matches!(
            engine.create_adapter("Other", "@tcp+127.0.0.1+0"),
            Err(XicError::EngineShutdown)
        ));
        assert!(matches!(
            engine.string_to_proxy("Echo @tcp+127.0.0.1+1"),
            Err(XicError::EngineShutdown)
        ));
        assert!(engine.adapter("Main").is_none());

        // The guard is never re-armed.
        drop(engine);
        assert!(matches!(
            Engine::new(EngineConfig::default()),
            Err(XicError::EngineExists)
        ));
    }
}
