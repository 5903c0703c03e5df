//! Adapters: named groups of listeners and servants.
//!
//! Each listener runs an accept loop that wraps every accepted stream in an
//! inbound [`Connection`] bound to the adapter. Servants can be added and
//! removed at any time; requests already dispatched keep their own handle to
//! the servant and complete normally.

use crate::connection::{Connection, ConnectionOptions};
use crate::endpoint::Endpoint;
use crate::engine::{Engine, EngineInner};
use crate::proxy::Proxy;
use crate::servant::ServantInfo;
use crate::{Result, XicError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

struct Listener {
    endpoint: Endpoint,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Listener {
    async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                error!("Accept loop on {} ended abnormally: {}", self.endpoint, e);
            }
        }
    }
}

enum Activation {
    Inactive,
    Activating,
    Active(Vec<Listener>),
}

struct AdapterInner {
    name: String,
    configured: Vec<Endpoint>,
    servants: RwLock<HashMap<String, ServantInfo>>,
    default_servant: RwLock<Option<ServantInfo>>,
    concurrency: usize,
    permits: Option<Arc<Semaphore>>,
    activation: Mutex<Activation>,
    bound: RwLock<Vec<Endpoint>>,
    engine: Option<Weak<EngineInner>>,
}

/// Handle to an adapter. Clones share the same registrations.
#[derive(Clone)]
pub struct Adapter {
    inner: Arc<AdapterInner>,
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.inner.name)
            .field("endpoints", &self.endpoints())
            .field("active", &self.is_active())
            .finish()
    }
}

impl fmt::Display for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inner.name.is_empty() {
            write!(f, "<slack>")
        } else {
            write!(f, "{}", self.inner.name)
        }
    }
}

impl Adapter {
    /// Adapter not owned by any engine. Its proxies dial their own
    /// connections and its inbound connections are not tracked.
    pub fn standalone(name: &str, endpoints: Vec<Endpoint>, concurrency: usize) -> Self {
        Self::build(name, endpoints, concurrency, None)
    }

    pub(crate) fn new(
        name: &str,
        endpoints: Vec<Endpoint>,
        concurrency: usize,
        engine: Weak<EngineInner>,
    ) -> Self {
        Self::build(name, endpoints, concurrency, Some(engine))
    }

    fn build(
        name: &str,
        endpoints: Vec<Endpoint>,
        concurrency: usize,
        engine: Option<Weak<EngineInner>>,
    ) -> Self {
        let permits = (concurrency > 1).then(|| Arc::new(Semaphore::new(concurrency)));
        Self {
            inner: Arc::new(AdapterInner {
                name: name.to_string(),
                configured: endpoints,
                servants: RwLock::new(HashMap::new()),
                default_servant: RwLock::new(None),
                concurrency,
                permits,
                activation: Mutex::new(Activation::Inactive),
                bound: RwLock::new(Vec::new()),
                engine,
            }),
        }
    }

    /// Empty for a slack adapter.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Concurrent dispatches allowed: 1 runs inline on the reader, 0 is unbounded.
    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.inner.activation.lock(), Activation::Active(_))
    }

    /// Bound endpoints while active (port 0 resolved), configured ones otherwise.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let bound = self.inner.bound.read();
        if bound.is_empty() {
            self.inner.configured.clone()
        } else {
            bound.clone()
        }
    }

    /// Register a servant and return a proxy to it through this adapter.
    pub fn add_servant(&self, name: &str, servant: ServantInfo) -> Result<Proxy> {
        {
            let mut servants = self.inner.servants.write();
            if servants.contains_key(name) {
                return Err(XicError::AlreadyExists {
                    kind: "servant",
                    name: name.to_string(),
                });
            }
            servants.insert(name.to_string(), servant);
        }
        debug!("Adapter {} registered servant {}", self, name);
        Ok(Proxy::new(name, self.endpoints(), self.inner.engine.clone()))
    }

    pub fn remove_servant(&self, name: &str) -> Option<ServantInfo> {
        self.inner.servants.write().remove(name)
    }

    /// Servant registered under `name`, or the default servant.
    pub fn find_servant(&self, name: &str) -> Option<ServantInfo> {
        if let Some(servant) = self.inner.servants.read().get(name) {
            return Some(servant.clone());
        }
        self.inner.default_servant.read().clone()
    }

    pub fn set_default_servant(&self, servant: ServantInfo) {
        *self.inner.default_servant.write() = Some(servant);
    }

    pub fn clear_default_servant(&self) -> Option<ServantInfo> {
        self.inner.default_servant.write().take()
    }

    /// Bind every endpoint and start accepting connections.
    pub async fn activate(&self) -> Result<()> {
        {
            let mut activation = self.inner.activation.lock();
            match *activation {
                Activation::Inactive => *activation = Activation::Activating,
                _ => return Err(self.state_error("already active")),
            }
        }

        let mut listeners = Vec::with_capacity(self.inner.configured.len());
        for endpoint in &self.inner.configured {
            match self.listen(endpoint).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    for listener in listeners {
                        listener.stop().await;
                    }
                    *self.inner.activation.lock() = Activation::Inactive;
                    return Err(e);
                }
            }
        }

        *self.inner.bound.write() = listeners.iter().map(|l| l.endpoint.clone()).collect();
        *self.inner.activation.lock() = Activation::Active(listeners);
        info!("Adapter {} activated", self);
        Ok(())
    }

    /// Stop every listener. Connections already accepted stay open.
    pub async fn deactivate(&self) -> Result<()> {
        let listeners = {
            let mut activation = self.inner.activation.lock();
            match std::mem::replace(&mut *activation, Activation::Inactive) {
                Activation::Active(listeners) => listeners,
                other => {
                    *activation = other;
                    return Err(self.state_error("not active"));
                }
            }
        };

        for listener in listeners {
            listener.stop().await;
        }
        self.inner.bound.write().clear();
        info!("Adapter {} deactivated", self);
        Ok(())
    }

    pub(crate) async fn admit(&self) -> Option<OwnedSemaphorePermit> {
        match &self.inner.permits {
            Some(permits) => permits.clone().acquire_owned().await.ok(),
            None => None,
        }
    }

    fn state_error(&self, message: &str) -> XicError {
        XicError::AdapterState {
            adapter: self.to_string(),
            message: message.to_string(),
        }
    }

    fn engine(&self) -> Option<Engine> {
        self.inner
            .engine
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Engine::from_inner)
    }

    async fn listen(&self, endpoint: &Endpoint) -> Result<Listener> {
        endpoint.ensure_stream_transport()?;
        let listener = TcpListener::bind(endpoint.bind_addr())
            .await
            .map_err(|e| XicError::Io {
                message: format!("failed to bind {}: {}", endpoint, e),
                source: Some(e),
            })?;
        let bound = endpoint.with_port(listener.local_addr()?.port());
        info!("Adapter {} listening on {}", self, bound);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(Self::accept_loop(
            self.clone(),
            listener,
            bound.clone(),
            shutdown_rx,
        ));
        Ok(Listener {
            endpoint: bound,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    async fn accept_loop(
        adapter: Adapter,
        listener: TcpListener,
        endpoint: Endpoint,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("Listener on {} shutting down", endpoint);
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let adapter = adapter.clone();
                            let endpoint = endpoint.clone();
                            tokio::spawn(async move {
                                adapter.accept(stream, endpoint, peer_addr).await;
                            });
                        }
                        Err(e) => {
                            error!("Accept error on {}: {}", endpoint, e);
                        }
                    }
                }
            }
        }
    }

    async fn accept(&self, stream: TcpStream, endpoint: Endpoint, peer_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let engine = self.engine();
        let options = match &engine {
            Some(engine) => engine.connection_options(Some(self.clone())),
            None => ConnectionOptions {
                adapter: Some(self.clone()),
                ..ConnectionOptions::default()
            },
        };

        match Connection::inbound(stream, endpoint, options).await {
            Ok(connection) => {
                debug!("Accepted {} on adapter {}", peer_addr, self);
                if let Some(engine) = engine {
                    if !engine.register_inbound(&connection) {
                        connection.close(false).await;
                    }
                }
            }
            Err(e) => debug!("Inbound connection from {} failed: {}", peer_addr, e),
        }
    }
}
