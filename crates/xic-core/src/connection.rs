//! Connection: one byte stream carrying multiplexed Quests and Answers.
//!
//! # State machine
//!
//! ```text
//! Init -> WaitingHello (outbound) -> Active -> Close -> Closing -> Closed
//!      \-> Active (inbound)                  \---------------------> Error
//! ```
//!
//! Every transition is a compare-and-set on a `watch` channel, so waiters
//! (`closed()`, the connect handshake) observe each change.
//!
//! # Thread Safety
//!
//! A single reader task owns the read half. Writers share the write half
//! through an async mutex; a sealed frame is encrypted while that lock is
//! held so the nonce order always matches the byte order on the wire. The
//! pending table is a short synchronous critical section: txid assignment and
//! registration happen under one lock acquisition.

use crate::adapter::Adapter;
use crate::codec::Arguments;
use crate::config::{ConnectionConfig, ProtocolConfig};
use crate::credential::Handshake;
use crate::endpoint::Endpoint;
use crate::message::{
    bye_frame, encode_frame, hello_frame, Answer, Check, Header, MessageType, OutQuest, Quest,
};
use crate::overload::{InFlight, InFlightGuard};
use crate::proxy::Proxy;
use crate::secure::{CipherFactory, Role, SecureChannel};
use crate::servant::Current;
use crate::{Fault, Result, XicError};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Reply = oneshot::Sender<Result<Arguments>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    WaitingHello,
    Active,
    Close,
    Closing,
    Closed,
    Error,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Error)
    }
}

/// Settings a connection is created with.
#[derive(Clone)]
pub struct ConnectionOptions {
    pub max_message_size: usize,
    /// Used when the endpoint carries no connect timeout.
    pub connect_timeout: Duration,
    /// Used when the endpoint carries no close timeout.
    pub close_timeout: Duration,
    /// Shared limit on inbound requests being processed.
    pub limiter: Option<Arc<InFlight>>,
    /// Adapter that receives inbound Quests.
    pub adapter: Option<Adapter>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_message_size: ProtocolConfig::MAX_MESSAGE_SIZE,
            connect_timeout: ConnectionConfig::CONNECT_TIMEOUT,
            close_timeout: ConnectionConfig::CLOSE_TIMEOUT,
            limiter: None,
            adapter: None,
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("max_message_size", &self.max_message_size)
            .field("connect_timeout", &self.connect_timeout)
            .field("close_timeout", &self.close_timeout)
            .field("limiter", &self.limiter.as_ref().map(|l| l.max()))
            .field("adapter", &self.adapter.as_ref().map(|a| a.name().to_string()))
            .finish()
    }
}

#[derive(Default)]
struct Pending {
    last_txid: i64,
    table: HashMap<i64, Reply>,
    /// Set once the connection has failed; no more entries are accepted.
    closed: bool,
}

impl Pending {
    fn next_txid(&mut self) -> i64 {
        loop {
            self.last_txid = self.last_txid.wrapping_add(1);
            if self.last_txid != 0 && !self.table.contains_key(&self.last_txid) {
                return self.last_txid;
            }
        }
    }
}

struct HandshakeSlot {
    handshake: Arc<dyn Handshake>,
    factory: Arc<dyn CipherFactory>,
}

struct Inner {
    endpoint: Endpoint,
    incoming: bool,
    state: watch::Sender<ConnectionState>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    pending: parking_lot::Mutex<Pending>,
    adapter: parking_lot::Mutex<Option<Adapter>>,
    secure: parking_lot::Mutex<Option<SecureChannel>>,
    handshake: parking_lot::Mutex<Option<HandshakeSlot>>,
    limiter: Option<Arc<InFlight>>,
    max_message_size: usize,
    close_timeout: Duration,
    processing: AtomicUsize,
    idle: Notify,
    bye_received: AtomicBool,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a connection. Clones share the same stream.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.inner.endpoint.to_string())
            .field("incoming", &self.inner.incoming)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.inner.incoming { "in" } else { "out" };
        write!(f, "{} {}", direction, self.inner.endpoint)
    }
}

impl Connection {
    /// Dial `endpoint` and wait for the peer's Hello.
    pub async fn connect(endpoint: &Endpoint, options: ConnectionOptions) -> Result<Self> {
        endpoint.ensure_stream_transport()?;
        let limit = endpoint.connect_timeout().unwrap_or(options.connect_timeout);
        let addr = endpoint.connect_addr();
        let connect_failed = |message: String| XicError::ConnectFailed {
            endpoint: endpoint.to_string(),
            message,
        };

        let stream = tokio::time::timeout(limit, TcpStream::connect(&addr))
            .await
            .map_err(|_| connect_failed(format!("timed out after {:?}", limit)))?
            .map_err(|e| connect_failed(e.to_string()))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
        }

        let connection = Self::outbound(stream, endpoint.clone(), options);
        match tokio::time::timeout(limit, connection.established()).await {
            Ok(Ok(())) => {
                debug!("Connected to {}", endpoint);
                Ok(connection)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                connection.abort();
                Err(connect_failed(format!("no Hello within {:?}", limit)))
            }
        }
    }

    /// Wrap the dialing side of a stream. The connection becomes usable once
    /// the peer's Hello arrives.
    pub fn outbound<S>(stream: S, endpoint: Endpoint, options: ConnectionOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let connection = Self::new(endpoint, false, options, Box::new(writer));
        connection.transition(&[ConnectionState::Init], ConnectionState::WaitingHello);
        connection.spawn_reader(Box::new(reader));
        connection
    }

    /// Wrap the accepting side of a stream: send Hello and become active.
    pub async fn inbound<S>(
        stream: S,
        endpoint: Endpoint,
        options: ConnectionOptions,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let connection = Self::new(endpoint, true, options, Box::new(writer));
        connection.send_raw(&hello_frame()).await?;
        connection.transition(&[ConnectionState::Init], ConnectionState::Active);
        connection.spawn_reader(Box::new(reader));
        Ok(connection)
    }

    fn new(endpoint: Endpoint, incoming: bool, options: ConnectionOptions, writer: Writer) -> Self {
        let close_timeout = endpoint.close_timeout().unwrap_or(options.close_timeout);
        let (state, _) = watch::channel(ConnectionState::Init);
        Self {
            inner: Arc::new(Inner {
                endpoint,
                incoming,
                state,
                writer: tokio::sync::Mutex::new(Some(writer)),
                pending: parking_lot::Mutex::new(Pending::default()),
                adapter: parking_lot::Mutex::new(options.adapter),
                secure: parking_lot::Mutex::new(None),
                handshake: parking_lot::Mutex::new(None),
                limiter: options.limiter,
                max_message_size: options.max_message_size,
                close_timeout,
                processing: AtomicUsize::new(0),
                idle: Notify::new(),
                bye_received: AtomicBool::new(false),
                reader: parking_lot::Mutex::new(None),
            }),
        }
    }

    fn spawn_reader(&self, reader: Reader) {
        let connection = self.clone();
        let handle = tokio::spawn(async move { connection.read_loop(reader).await });
        *self.inner.reader.lock() = Some(handle);
    }

    /// Whether both handles refer to the same connection.
    pub(crate) fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn is_incoming(&self) -> bool {
        self.inner.incoming
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Whether the connection can still carry new requests.
    pub fn is_alive(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Init | ConnectionState::WaitingHello | ConnectionState::Active
        )
    }

    /// Number of twoway requests awaiting an Answer.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().table.len()
    }

    pub fn adapter(&self) -> Option<Adapter> {
        self.inner.adapter.lock().clone()
    }

    /// Bind (or unbind) the adapter that receives inbound Quests.
    pub fn set_adapter(&self, adapter: Option<Adapter>) {
        *self.inner.adapter.lock() = adapter;
    }

    /// Proxy that always uses this connection.
    pub fn create_proxy(&self, service: &str) -> Proxy {
        Proxy::fixed(service, self.clone())
    }

    pub fn is_secure(&self) -> bool {
        self.inner.secure.lock().is_some()
    }

    /// Seal every following Quest, Answer and Check frame.
    pub fn install_secure(&self, channel: SecureChannel) {
        debug!("Secure channel installed on {}", self);
        *self.inner.secure.lock() = Some(channel);
    }

    /// Route received Check frames to `handshake`. Once it yields a shared
    /// secret, a channel built by `factory` is installed.
    pub fn set_handshake(&self, handshake: Arc<dyn Handshake>, factory: Arc<dyn CipherFactory>) {
        *self.inner.handshake.lock() = Some(HandshakeSlot { handshake, factory });
    }

    pub async fn send_check(&self, check: &Check) -> Result<()> {
        self.send_frame(MessageType::Check, &check.encode()?).await
    }

    /// Send a twoway Quest. The txid is assigned here.
    pub async fn invoke(&self, mut quest: OutQuest, input: Arguments) -> Result<InvokeResult> {
        self.ensure_active()?;
        let (tx, rx) = oneshot::channel();
        let txid = {
            let mut pending = self.inner.pending.lock();
            if pending.closed {
                return Err(self.closed_error());
            }
            let txid = pending.next_txid();
            pending.table.insert(txid, tx);
            txid
        };
        quest.set_txid(txid);

        if let Err(e) = self.send_frame(MessageType::Quest, quest.payload()).await {
            self.inner.pending.lock().table.remove(&txid);
            return Err(e);
        }

        Ok(InvokeResult {
            txid,
            service: quest.service().to_string(),
            method: quest.method().to_string(),
            input,
            endpoint: self.inner.endpoint.to_string(),
            rx: Some(rx),
            outcome: None,
        })
    }

    /// Send a one-way Quest (txid 0). No Answer is expected.
    pub async fn invoke_oneway(&self, quest: OutQuest) -> Result<()> {
        self.ensure_active()?;
        self.send_frame(MessageType::Quest, quest.payload()).await
    }

    /// Close the connection.
    ///
    /// A graceful close stops taking new requests, waits for outstanding
    /// ones in both directions (bounded by the close timeout), sends Bye and
    /// waits for the peer to finish. Otherwise the stream is dropped at once.
    pub async fn close(&self, graceful: bool) {
        if !graceful {
            self.abort();
            return;
        }

        let limit = self.inner.close_timeout;
        if self.transition(&[ConnectionState::Active], ConnectionState::Close) {
            if tokio::time::timeout(limit, self.drained()).await.is_err() {
                debug!(
                    "Close of {} timed out with {} pending, {} in process",
                    self,
                    self.pending_count(),
                    self.inner.processing.load(Ordering::SeqCst)
                );
            }
            if self.transition(&[ConnectionState::Close], ConnectionState::Closing) {
                self.send_bye().await;
            }
        } else if self.transition(
            &[ConnectionState::Init, ConnectionState::WaitingHello],
            ConnectionState::Closing,
        ) {
            self.abort();
            return;
        }

        if tokio::time::timeout(limit, self.closed()).await.is_err() {
            debug!("Peer of {} did not finish within {:?}", self, limit);
            self.abort();
        }
    }

    /// Resolves once the connection is Closed or in Error.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| state.is_terminal()).await;
    }

    pub(crate) async fn established(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let state = *rx
            .wait_for(|state| {
                !matches!(state, ConnectionState::Init | ConnectionState::WaitingHello)
            })
            .await
            .map_err(|_| self.closed_error())?;
        if state == ConnectionState::Active {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    async fn drained(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending_count() == 0 && self.inner.processing.load(Ordering::SeqCst) == 0 {
                return;
            }
            if self.state().is_terminal() {
                return;
            }
            notified.await;
        }
    }

    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        let changed = self.inner.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("Connection {} -> {:?}", self, to);
        }
        changed
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state() == ConnectionState::Active {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    fn closed_error(&self) -> XicError {
        XicError::ConnectionClosed {
            endpoint: self.inner.endpoint.to_string(),
        }
    }

    async fn send_raw(&self, frame: &[u8]) -> Result<()> {
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.closed_error())?;
        let result = async {
            writer.write_all(frame).await?;
            writer.flush().await
        }
        .await;
        drop(guard);
        result.map_err(|e| self.write_failed(e))
    }

    /// Largest payload that still fits in one frame once sealed.
    fn max_payload(&self) -> usize {
        let overhead = self
            .inner
            .secure
            .lock()
            .as_ref()
            .map_or(0, SecureChannel::mac_size);
        self.inner.max_message_size.saturating_sub(overhead)
    }

    async fn send_frame(&self, kind: MessageType, payload: &[u8]) -> Result<()> {
        let limit = self.max_payload();
        if payload.len() > limit {
            return Err(XicError::protocol(format!(
                "{:?} body of {} bytes exceeds maximum {}",
                kind,
                payload.len(),
                limit
            )));
        }

        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.closed_error())?;
        let frame = self.seal_frame(kind, payload)?;
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        drop(guard);
        result.map_err(|e| self.write_failed(e))
    }

    fn seal_frame(&self, kind: MessageType, payload: &[u8]) -> Result<Bytes> {
        let mut secure = self.inner.secure.lock();
        let Some(channel) = secure.as_mut() else {
            return encode_frame(kind, 0, payload);
        };
        let body_size = payload.len() + channel.mac_size();
        let header = Header::new(kind, Header::FLAG_SEALED, body_size as u32).encode();
        let body = channel.seal(&header, payload);
        let mut frame = BytesMut::with_capacity(header.len() + body.len());
        frame.put_slice(&header);
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    fn write_failed(&self, err: std::io::Error) -> XicError {
        self.fail(XicError::from(err));
        self.closed_error()
    }

    /// Send Bye once and shut the write half.
    async fn send_bye(&self) {
        let mut guard = self.inner.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            if let Err(e) = writer.write_all(&bye_frame()).await {
                debug!("Failed to send Bye on {}: {}", self, e);
            }
            let _ = writer.shutdown().await;
        }
    }

    /// Drop the stream immediately.
    pub fn abort(&self) {
        let changed = self.inner.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        });
        if changed {
            debug!("Connection {} aborted", self);
        }
        self.release();
    }

    fn fail(&self, err: XicError) {
        let changed = self.inner.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = ConnectionState::Error;
                true
            }
        });
        if changed {
            warn!("Connection {} failed: {}", self, err);
        }
        self.release();
    }

    fn release(&self) {
        let orphans: Vec<Reply> = {
            let mut pending = self.inner.pending.lock();
            pending.closed = true;
            pending.table.drain().map(|(_, reply)| reply).collect()
        };
        for reply in orphans {
            let _ = reply.send(Err(self.closed_error()));
        }

        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }
        if let Some(handle) = self.inner.reader.lock().take() {
            handle.abort();
        }
        self.inner.idle.notify_waiters();
    }

    async fn read_loop(self, mut reader: Reader) {
        match self.read_frames(&mut reader).await {
            Ok(()) => {
                self.transition(&[ConnectionState::Closing], ConnectionState::Closed);
                self.release();
                info!("Connection {} closed", self);
            }
            Err(e) => self.fail(e),
        }
    }

    async fn read_frames(&self, reader: &mut Reader) -> Result<()> {
        loop {
            let mut head = [0u8; ProtocolConfig::HEADER_SIZE];
            if let Err(e) = reader.read_exact(&mut head).await {
                if e.kind() == std::io::ErrorKind::UnexpectedEof
                    && self.state() == ConnectionState::Closing
                {
                    return Ok(());
                }
                return Err(if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    self.closed_error()
                } else {
                    e.into()
                });
            }

            let header = Header::parse(&head, self.inner.max_message_size)?;
            let mut body = vec![0u8; header.body_size as usize];
            reader.read_exact(&mut body).await?;
            let body = self.unseal(&header, &head, body)?;

            if let Err(e) = self.on_message(header.kind, &body).await {
                if e.is_fatal_to_connection() {
                    return Err(e);
                }
                warn!("Ignoring {:?} on {}: {}", header.kind, self, e);
            }
        }
    }

    async fn on_message(&self, kind: MessageType, body: &[u8]) -> Result<()> {
        match kind {
            MessageType::Hello => self.on_hello(),
            MessageType::Bye => self.on_bye().await,
            MessageType::Check => self.on_check(Check::decode(body)?).await,
            MessageType::Quest => {
                let (quest, invalid) = Quest::decode_routed(body)?;
                self.on_quest(quest, invalid).await
            }
            MessageType::Answer => self.on_answer(Answer::decode(body)?),
        }
    }

    fn unseal(&self, header: &Header, head: &[u8], body: Vec<u8>) -> Result<Vec<u8>> {
        let mut secure = self.inner.secure.lock();
        match (header.is_sealed(), secure.as_mut()) {
            (true, Some(channel)) => channel.open(head, &body),
            (true, None) => Err(XicError::protocol(
                "sealed frame before a secure channel was established",
            )),
            (false, Some(_)) if header.body_size > 0 => Err(XicError::protocol(format!(
                "plaintext {:?} on a secured connection",
                header.kind
            ))),
            _ => Ok(body),
        }
    }

    fn on_hello(&self) -> Result<()> {
        if self.transition(&[ConnectionState::WaitingHello], ConnectionState::Active) {
            Ok(())
        } else {
            Err(XicError::protocol(format!(
                "unexpected Hello in state {:?}",
                self.state()
            )))
        }
    }

    async fn on_bye(&self) -> Result<()> {
        let state = self.state();
        let expected = matches!(
            state,
            ConnectionState::Active | ConnectionState::Close | ConnectionState::Closing
        );
        if !expected || self.inner.bye_received.swap(true, Ordering::SeqCst) {
            return Err(XicError::protocol(format!("unexpected Bye in state {:?}", state)));
        }

        debug!("Bye received on {}", self);
        self.transition(
            &[ConnectionState::Active, ConnectionState::Close],
            ConnectionState::Closing,
        );
        let orphans: Vec<Reply> = {
            let mut pending = self.inner.pending.lock();
            pending.table.drain().map(|(_, reply)| reply).collect()
        };
        for reply in orphans {
            let _ = reply.send(Err(self.closed_error()));
        }
        self.inner.idle.notify_waiters();
        self.send_bye().await;
        Ok(())
    }

    async fn on_check(&self, check: Check) -> Result<()> {
        if !matches!(self.state(), ConnectionState::Active | ConnectionState::Close) {
            return Err(XicError::protocol(format!(
                "unexpected Check in state {:?}",
                self.state()
            )));
        }
        let (handshake, factory) = match self.inner.handshake.lock().as_ref() {
            Some(slot) => (slot.handshake.clone(), slot.factory.clone()),
            None => return Err(XicError::protocol("Check received without a handshake")),
        };

        let reply = handshake
            .on_check(self, check)
            .await
            .map_err(|e| match e {
                XicError::Authentication { .. } => e,
                other => XicError::Authentication {
                    message: other.to_string(),
                },
            })?;
        if let Some(reply) = reply {
            self.send_check(&reply).await?;
        }

        if !self.is_secure() {
            if let Some(key) = handshake.shared_secret() {
                let role = if self.inner.incoming {
                    Role::Server
                } else {
                    Role::Client
                };
                self.install_secure(SecureChannel::new(factory.as_ref(), &key, role));
            }
        }
        Ok(())
    }

    async fn on_quest(&self, quest: Quest, invalid: Option<XicError>) -> Result<()> {
        match self.state() {
            ConnectionState::Active | ConnectionState::Close => {}
            ConnectionState::WaitingHello | ConnectionState::Init => {
                return Err(XicError::protocol("Quest received before Hello"));
            }
            state => {
                debug!("Ignoring Quest {} on {} in state {:?}", quest.txid, self, state);
                return Ok(());
            }
        }

        if let Some(err) = invalid {
            self.refuse(&quest, err).await;
            return Ok(());
        }

        let Some(adapter) = self.adapter() else {
            self.refuse(
                &quest,
                XicError::AdapterAbsent {
                    service: quest.service.clone(),
                },
            )
            .await;
            return Ok(());
        };

        let slot = match &self.inner.limiter {
            Some(limiter) => match limiter.try_acquire() {
                Ok(guard) => Some(guard),
                Err(in_flight) => {
                    warn!(
                        "Rejecting {}.{} on {}: {} requests in flight",
                        quest.service, quest.method, self, in_flight
                    );
                    self.refuse(&quest, XicError::ServiceOverloaded { in_flight })
                        .await;
                    return Ok(());
                }
            },
            None => None,
        };
        let work = Work::new(self, slot);

        if adapter.concurrency() == 1 {
            self.serve(&adapter, quest).await;
            drop(work);
        } else {
            let connection = self.clone();
            tokio::spawn(async move {
                let _permit = adapter.admit().await;
                connection.serve(&adapter, quest).await;
                drop(work);
            });
        }
        Ok(())
    }

    async fn serve(&self, adapter: &Adapter, quest: Quest) {
        let Some(servant) = adapter.find_servant(&quest.service) else {
            let err = XicError::ServiceNotFound {
                service: quest.service.clone(),
            };
            self.refuse(&quest, err).await;
            return;
        };

        let Quest {
            txid,
            service,
            method,
            context,
            arguments,
        } = quest;

        // A one-way method is acknowledged before it runs, so a twoway caller
        // never waits on it and never sees what it raises.
        let txid = if txid != 0 && servant.is_oneway(&method) {
            self.reply(Answer::normal(txid, Arguments::new())).await;
            0
        } else {
            txid
        };

        let current =
            Current::new(Some(self.clone()), txid, service.clone(), method.clone(), context);
        match servant.dispatch(current, arguments).await {
            Ok(_) if txid == 0 => {}
            Ok(output) => self.reply(Answer::normal(txid, output)).await,
            Err(e) => {
                debug!("{}.{} on {} raised: {}", service, method, self, e);
                if txid != 0 {
                    let fault = locate(e.to_fault(), &service, &method);
                    self.reply(Answer::fault(txid, &fault)).await;
                }
            }
        }
    }

    /// Answer a Quest that never reached a servant.
    async fn refuse(&self, quest: &Quest, err: XicError) {
        if quest.is_oneway() {
            debug!("Dropping one-way {}.{}: {}", quest.service, quest.method, err);
            return;
        }
        let fault = locate(err.to_fault(), &quest.service, &quest.method);
        self.reply(Answer::fault(quest.txid, &fault)).await;
    }

    async fn reply(&self, answer: Answer) {
        let txid = answer.txid;
        let payload = match answer.encode() {
            Ok(payload) if payload.len() <= self.max_payload() => payload,
            Ok(payload) => {
                let fault = Fault::new(
                    Fault::PROTOCOL,
                    format!("answer of {} bytes exceeds the message size limit", payload.len()),
                );
                match Answer::fault(txid, &fault).encode() {
                    Ok(payload) => payload,
                    Err(_) => return,
                }
            }
            Err(e) => {
                warn!("Failed to encode answer {} on {}: {}", txid, self, e);
                return;
            }
        };
        if let Err(e) = self.send_frame(MessageType::Answer, &payload).await {
            debug!("Dropping answer {} on {}: {}", txid, self, e);
        }
    }

    fn on_answer(&self, answer: Answer) -> Result<()> {
        if matches!(
            self.state(),
            ConnectionState::Init | ConnectionState::WaitingHello
        ) {
            return Err(XicError::protocol("Answer received before Hello"));
        }

        let reply = self.inner.pending.lock().table.remove(&answer.txid);
        match reply {
            Some(reply) => {
                let _ = reply.send(answer.into_result());
                self.inner.idle.notify_waiters();
            }
            None => warn!(
                "Dropping Answer for unknown txid {} on {}",
                answer.txid, self
            ),
        }
        Ok(())
    }
}

fn locate(fault: Fault, service: &str, method: &str) -> Fault {
    if fault.detail.is_empty() {
        fault.with_detail(format!("{}.{}", service, method))
    } else {
        fault
    }
}

/// Marks an inbound Quest as being processed until dropped.
struct Work {
    inner: Arc<Inner>,
    _slot: Option<InFlightGuard>,
}

impl Work {
    fn new(connection: &Connection, slot: Option<InFlightGuard>) -> Self {
        connection.inner.processing.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: connection.inner.clone(),
            _slot: slot,
        }
    }
}

impl Drop for Work {
    fn drop(&mut self) {
        if self.inner.processing.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Outcome of a twoway invocation.
///
/// `out()` and `err()` are meaningful only after `wait()` returned or
/// `is_done()` reported true. Dropping an unfinished result is fine: the
/// pending entry is still reclaimed when the Answer arrives or the
/// connection fails.
#[derive(Debug)]
pub struct InvokeResult {
    txid: i64,
    service: String,
    method: String,
    input: Arguments,
    endpoint: String,
    rx: Option<oneshot::Receiver<Result<Arguments>>>,
    outcome: Option<Result<Arguments>>,
}

impl InvokeResult {
    pub fn txid(&self) -> i64 {
        self.txid
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn input(&self) -> &Arguments {
        &self.input
    }

    pub async fn wait(&mut self) {
        if let Some(rx) = self.rx.take() {
            let outcome = match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(self.closed_error()),
            };
            self.outcome = Some(outcome);
        }
    }

    /// Non-blocking completion check.
    pub fn is_done(&mut self) -> bool {
        let Some(rx) = self.rx.as_mut() else {
            return true;
        };
        let outcome = match rx.try_recv() {
            Ok(outcome) => outcome,
            Err(oneshot::error::TryRecvError::Empty) => return false,
            Err(oneshot::error::TryRecvError::Closed) => Err(self.closed_error()),
        };
        self.rx = None;
        self.outcome = Some(outcome);
        true
    }

    pub fn out(&self) -> Option<&Arguments> {
        self.outcome.as_ref().and_then(|outcome| outcome.as_ref().ok())
    }

    pub fn err(&self) -> Option<&XicError> {
        self.outcome.as_ref().and_then(|outcome| outcome.as_ref().err())
    }

    /// Wait and take the outcome.
    pub async fn into_output(mut self) -> Result<Arguments> {
        self.wait().await;
        let closed = self.closed_error();
        self.outcome.take().unwrap_or(Err(closed))
    }

    fn closed_error(&self) -> XicError {
        XicError::ConnectionClosed {
            endpoint: self.endpoint.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Context;
    use crate::secure::testing::ToyFactory;
    use crate::servant::ServantInfo;
    use serde_json::json;
    use tokio::io::DuplexStream;

    fn endpoint() -> Endpoint {
        Endpoint::tcp("127.0.0.1", 4000)
    }

    fn quest(method: &str) -> OutQuest {
        OutQuest::new("Echo", method, &Context::new(), &Arguments::new().with("a", 1)).unwrap()
    }

    /// An outbound connection whose peer is driven by hand.
    async fn client_with_raw_peer() -> (Connection, DuplexStream) {
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let client = Connection::outbound(local, endpoint(), ConnectionOptions::default());
        assert_eq!(client.state(), ConnectionState::WaitingHello);
        remote.write_all(&hello_frame()).await.unwrap();
        client.established().await.unwrap();
        (client, remote)
    }

    async fn read_frame(stream: &mut DuplexStream) -> (Header, Vec<u8>) {
        let mut head = [0u8; 8];
        stream.read_exact(&mut head).await.unwrap();
        let header = Header::parse(&head, ProtocolConfig::MAX_MESSAGE_SIZE).unwrap();
        let mut body = vec![0u8; header.body_size as usize];
        stream.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    #[tokio::test]
    async fn test_txids_unique_and_nonzero() {
        let (client, mut remote) = client_with_raw_peer().await;
        let mut results = Vec::new();
        for _ in 0..50 {
            results.push(client.invoke(quest("echo"), Arguments::new()).await.unwrap());
        }
        let mut txids: Vec<i64> = results.iter().map(InvokeResult::txid).collect();
        assert!(txids.iter().all(|&t| t != 0));
        txids.sort_unstable();
        txids.dedup();
        assert_eq!(txids.len(), 50);
        assert_eq!(client.pending_count(), 50);

        let (header, body) = read_frame(&mut remote).await;
        assert_eq!(header.kind, MessageType::Quest);
        assert_eq!(Quest::decode(&body).unwrap().txid, results[0].txid());
    }

    #[test]
    fn test_txid_skips_zero_and_live_entries() {
        let mut pending = Pending {
            last_txid: -2,
            ..Pending::default()
        };
        let (tx, _rx) = oneshot::channel();
        pending.table.insert(1, tx);
        assert_eq!(pending.next_txid(), -1);
        assert_eq!(pending.next_txid(), 2);
    }

    #[tokio::test]
    async fn test_oneway_creates_no_pending_entry() {
        let (client, mut remote) = client_with_raw_peer().await;
        client.invoke_oneway(quest("log")).await.unwrap();
        assert_eq!(client.pending_count(), 0);

        let (_, body) = read_frame(&mut remote).await;
        assert!(Quest::decode(&body).unwrap().is_oneway());
    }

    #[tokio::test]
    async fn test_answer_correlated_out_of_order() {
        let (client, mut remote) = client_with_raw_peer().await;
        let mut first = client.invoke(quest("a"), Arguments::new()).await.unwrap();
        let mut second = client.invoke(quest("b"), Arguments::new()).await.unwrap();

        for (txid, value) in [(second.txid(), 2), (first.txid(), 1)] {
            let body = Answer::normal(txid, Arguments::new().with("v", value))
                .encode()
                .unwrap();
            remote
                .write_all(&encode_frame(MessageType::Answer, 0, &body).unwrap())
                .await
                .unwrap();
        }

        second.wait().await;
        first.wait().await;
        assert_eq!(first.out().unwrap().get("v"), Some(&json!(1)));
        assert_eq!(second.out().unwrap().get("v"), Some(&json!(2)));
        assert!(first.err().is_none());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_txid_is_not_fatal() {
        let (client, mut remote) = client_with_raw_peer().await;
        let body = Answer::normal(999, Arguments::new()).encode().unwrap();
        remote
            .write_all(&encode_frame(MessageType::Answer, 0, &body).unwrap())
            .await
            .unwrap();

        let mut result = client.invoke(quest("echo"), Arguments::new()).await.unwrap();
        let body = Answer::normal(result.txid(), Arguments::new()).encode().unwrap();
        remote
            .write_all(&encode_frame(MessageType::Answer, 0, &body).unwrap())
            .await
            .unwrap();
        result.wait().await;
        assert!(result.out().is_some());
        assert_eq!(client.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn test_transport_failure_fails_all_pending() {
        let (client, remote) = client_with_raw_peer().await;
        let mut results = Vec::new();
        for _ in 0..3 {
            results.push(client.invoke(quest("echo"), Arguments::new()).await.unwrap());
        }
        assert_eq!(client.pending_count(), 3);
        assert!(!results[0].is_done());

        drop(remote);
        for result in &mut results {
            result.wait().await;
            assert!(matches!(result.err(), Some(XicError::ConnectionClosed { .. })));
        }
        client.closed().await;
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.state(), ConnectionState::Error);
        assert!(client.invoke(quest("late"), Arguments::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_magic_is_fatal() {
        let (client, mut remote) = client_with_raw_peer().await;
        let result = client.invoke(quest("echo"), Arguments::new()).await.unwrap();
        remote.write_all(b"Y!A\0\0\0\0\0").await.unwrap();

        let err = result.into_output().await.unwrap_err();
        assert!(matches!(err, XicError::ConnectionClosed { .. }));
        client.closed().await;
        assert_eq!(client.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_second_hello_is_fatal() {
        let (client, mut remote) = client_with_raw_peer().await;
        remote.write_all(&hello_frame()).await.unwrap();
        client.closed().await;
        assert_eq!(client.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_inbound_without_adapter_answers_fault() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = Connection::inbound(a, endpoint(), ConnectionOptions::default())
            .await
            .unwrap();
        let client = Connection::outbound(b, endpoint(), ConnectionOptions::default());
        client.established().await.unwrap();
        assert_eq!(server.state(), ConnectionState::Active);

        let err = client
            .invoke(quest("echo"), Arguments::new())
            .await
            .unwrap()
            .into_output()
            .await
            .unwrap_err();
        assert_eq!(err.fault().unwrap().exname, Fault::ADAPTER_ABSENT);
        assert_eq!(client.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn test_graceful_close_exchanges_bye() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = Connection::inbound(a, endpoint(), ConnectionOptions::default())
            .await
            .unwrap();
        let client = Connection::outbound(b, endpoint(), ConnectionOptions::default());
        client.established().await.unwrap();

        client.close(true).await;
        assert_eq!(client.state(), ConnectionState::Closed);
        server.closed().await;
        assert_eq!(server.state(), ConnectionState::Closed);
        assert!(!server.is_alive());
    }

    #[tokio::test]
    async fn test_secure_frames_after_install() {
        let (client, mut remote) = client_with_raw_peer().await;
        client.install_secure(SecureChannel::new(&ToyFactory, b"k", Role::Client));
        client.invoke_oneway(quest("sealed")).await.unwrap();

        let mut head = [0u8; 8];
        remote.read_exact(&mut head).await.unwrap();
        let header = Header::parse(&head, ProtocolConfig::MAX_MESSAGE_SIZE).unwrap();
        assert!(header.is_sealed());
        let mut body = vec![0u8; header.body_size as usize];
        remote.read_exact(&mut body).await.unwrap();

        let mut server = SecureChannel::new(&ToyFactory, b"k", Role::Server);
        let plain = server.open(&head, &body).unwrap();
        assert_eq!(Quest::decode(&plain).unwrap().method, "sealed");

        // A plaintext Answer on a secured connection is a violation.
        let answer = Answer::normal(1, Arguments::new()).encode().unwrap();
        remote
            .write_all(&encode_frame(MessageType::Answer, 0, &answer).unwrap())
            .await
            .unwrap();
        client.closed().await;
        assert_eq!(client.state(), ConnectionState::Error);
    }

    fn echo_adapter() -> Adapter {
        let servant = ServantInfo::builder("Echo")
            .oneway("log", |_current, _args| async move {
                Err(XicError::Other("raised by a one-way method".into()))
            })
            .fallback(|_current, args| async move { Ok(args) })
            .build();
        let adapter = Adapter::standalone("test", Vec::new(), 1);
        adapter.add_servant("Echo", servant).unwrap();
        adapter
    }

    /// An inbound connection serving `echo_adapter`, with its peer driven by hand.
    async fn server_with_raw_peer() -> (Connection, DuplexStream) {
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let options = ConnectionOptions {
            adapter: Some(echo_adapter()),
            ..ConnectionOptions::default()
        };
        let server = Connection::inbound(local, endpoint(), options).await.unwrap();
        let (hello, _) = read_frame(&mut remote).await;
        assert_eq!(hello.kind, MessageType::Hello);
        (server, remote)
    }

    /// A client connected to an inbound connection serving `echo_adapter`.
    async fn linked_pair() -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let options = ConnectionOptions {
            adapter: Some(echo_adapter()),
            ..ConnectionOptions::default()
        };
        let server = Connection::inbound(a, endpoint(), options).await.unwrap();
        let client = Connection::outbound(b, endpoint(), ConnectionOptions::default());
        client.established().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_bad_arguments_answer_a_parameter_fault() {
        let (server, mut remote) = server_with_raw_peer().await;
        let bad = br#"5 "Echo" "echo" {} [1]"#;
        remote
            .write_all(&encode_frame(MessageType::Quest, 0, bad).unwrap())
            .await
            .unwrap();

        let (header, body) = read_frame(&mut remote).await;
        assert_eq!(header.kind, MessageType::Answer);
        let answer = Answer::decode(&body).unwrap();
        assert_eq!(answer.txid, 5);
        let err = answer.into_result().unwrap_err();
        assert_eq!(err.fault().unwrap().exname, Fault::PARAMETER);
        assert_eq!(server.state(), ConnectionState::Active);

        // The connection keeps serving.
        let good = br#"6 "Echo" "echo" {} {"a":1}"#;
        remote
            .write_all(&encode_frame(MessageType::Quest, 0, good).unwrap())
            .await
            .unwrap();
        let (_, body) = read_frame(&mut remote).await;
        let out = Answer::decode(&body).unwrap().into_result().unwrap();
        assert_eq!(out.get("a"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_twoway_call_to_oneway_method_is_acknowledged() {
        let (client, server) = linked_pair().await;
        let out = client
            .invoke(quest("log"), Arguments::new())
            .await
            .unwrap()
            .into_output()
            .await
            .unwrap();
        assert_eq!(out, Arguments::new());

        let echoed = client
            .invoke(quest("echo"), Arguments::new())
            .await
            .unwrap()
            .into_output()
            .await
            .unwrap();
        assert_eq!(echoed.get("a"), Some(&json!(1)));
        assert_eq!(server.state(), ConnectionState::Active);
    }

    /// Replies to a Check when `reply` is set and derives a fixed key.
    struct FixedKeyHandshake {
        reply: Option<&'static str>,
        received: parking_lot::Mutex<Vec<String>>,
        secret: parking_lot::Mutex<Option<Vec<u8>>>,
    }

    impl FixedKeyHandshake {
        fn new(reply: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                received: parking_lot::Mutex::new(Vec::new()),
                secret: parking_lot::Mutex::new(None),
            })
        }
    }

    #[async_trait::async_trait]
    impl Handshake for FixedKeyHandshake {
        async fn on_check(&self, _connection: &Connection, check: Check) -> Result<Option<Check>> {
            self.received.lock().push(check.command);
            *self.secret.lock() = Some(b"session".to_vec());
            Ok(self.reply.map(|command| Check::new(command, Arguments::new())))
        }

        fn shared_secret(&self) -> Option<Vec<u8>> {
            self.secret.lock().clone()
        }
    }

    #[tokio::test]
    async fn test_handshake_installs_secure_channels() {
        let (client, server) = linked_pair().await;
        let accepting = FixedKeyHandshake::new(Some("welcome"));
        let initiating = FixedKeyHandshake::new(None);
        server.set_handshake(accepting.clone(), Arc::new(ToyFactory));
        client.set_handshake(initiating.clone(), Arc::new(ToyFactory));

        client
            .send_check(&Check::new("hello", Arguments::new()))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !client.is_secure() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Both directions now travel sealed.
        let out = client
            .invoke(quest("echo"), Arguments::new())
            .await
            .unwrap()
            .into_output()
            .await
            .unwrap();
        assert_eq!(out.get("a"), Some(&json!(1)));
        assert!(server.is_secure());
        assert_eq!(*accepting.received.lock(), vec!["hello".to_string()]);
        assert_eq!(*initiating.received.lock(), vec!["welcome".to_string()]);
        assert_eq!(client.state(), ConnectionState::Active);
        assert_eq!(server.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn test_tampered_sealed_frame_is_fatal() {
        let (client, mut remote) = client_with_raw_peer().await;
        client.install_secure(SecureChannel::new(&ToyFactory, b"k", Role::Client));
        let result = client.invoke(quest("echo"), Arguments::new()).await.unwrap();
        let (header, _) = read_frame(&mut remote).await;
        assert!(header.is_sealed());

        let mut server = SecureChannel::new(&ToyFactory, b"k", Role::Server);
        let plain = Answer::normal(result.txid(), Arguments::new()).encode().unwrap();
        let body_size = (plain.len() + server.mac_size()) as u32;
        let head = Header::new(MessageType::Answer, Header::FLAG_SEALED, body_size).encode();
        let mut body = server.seal(&head, &plain);
        body[0] ^= 0x40;
        remote.write_all(&head).await.unwrap();
        remote.write_all(&body).await.unwrap();

        let err = result.into_output().await.unwrap_err();
        assert!(matches!(err, XicError::ConnectionClosed { .. }));
        client.closed().await;
        assert_eq!(client.state(), ConnectionState::Error);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_size_limit_counts_the_mac() {
        let limit = quest("sized").payload().len();
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let options = ConnectionOptions {
            max_message_size: limit,
            ..ConnectionOptions::default()
        };
        let client = Connection::outbound(local, endpoint(), options);
        remote.write_all(&hello_frame()).await.unwrap();
        client.established().await.unwrap();

        client.invoke_oneway(quest("sized")).await.unwrap();
        read_frame(&mut remote).await;

        client.install_secure(SecureChannel::new(&ToyFactory, b"k", Role::Client));
        let err = client.invoke_oneway(quest("sized")).await.unwrap_err();
        assert!(matches!(err, XicError::Protocol { .. }));
        assert_eq!(client.state(), ConnectionState::Active);
    }
}
