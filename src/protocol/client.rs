//! Multiplexing protocol client.
//!
//! `ProtocolClient` owns at most one connection to the server. A
//! background receive loop is the only reader of that connection: it
//! hands each response to the task waiting on its correlation id and
//! copies each notification into every registered listener's queue.
//! Callers on any task may issue commands concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, SpallocError};
use crate::protocol::codec::{self, Command, Frame};
use crate::protocol::listener::{
    ListenerId, ListenerRegistry, NotificationListener, DEFAULT_LISTENER_CAPACITY,
};
use crate::protocol::transport::{FrameReader, FrameWriter, Received, Transport};

/// Default spalloc server port.
pub const DEFAULT_PORT: u16 = 22244;

/// Default call timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

type CallResult = Result<Value>;

/// Outstanding calls of one connection, keyed by correlation id.
#[derive(Debug)]
struct PendingCalls {
    /// `None` once the connection has been torn down
    calls: Mutex<Option<HashMap<u64, oneshot::Sender<CallResult>>>>,
}

impl PendingCalls {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Some(HashMap::new())),
        }
    }

    fn insert(&self, id: u64) -> Result<oneshot::Receiver<CallResult>> {
        let (tx, rx) = oneshot::channel();
        let mut calls = self.calls.lock();
        let table = calls.as_mut().ok_or(SpallocError::ConnectionClosed)?;
        table.insert(id, tx);
        Ok(rx)
    }

    fn remove(&self, id: u64) -> Option<oneshot::Sender<CallResult>> {
        self.calls.lock().as_mut().and_then(|table| table.remove(&id))
    }

    /// Fail every outstanding call and refuse new ones.
    fn close(&self) {
        let drained = self.calls.lock().take();
        if let Some(table) = drained {
            if !table.is_empty() {
                debug!("Failing {} outstanding call(s): connection closed", table.len());
            }
            for (_, tx) in table {
                let _ = tx.send(Err(SpallocError::ConnectionClosed));
            }
        }
    }

    fn len(&self) -> usize {
        self.calls.lock().as_ref().map_or(0, HashMap::len)
    }
}

/// Removes a pending entry when the waiting call returns or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

/// One live connection plus its receive loop.
#[derive(Debug)]
struct ActiveConnection {
    writer: FrameWriter,
    pending: PendingCalls,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl ActiveConnection {
    async fn shutdown(&self) {
        self.pending.close();
        self.writer.shutdown().await;
        let task = self.reader_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

#[derive(Debug)]
struct ClientInner {
    hostname: String,
    port: u16,
    default_timeout: Option<Duration>,
    listener_capacity: usize,
    /// Never reset, so ids stay unique across reconnects
    next_id: AtomicU64,
    active: Mutex<Option<Arc<ActiveConnection>>>,
    /// Serializes connect/close so only one connection is ever live
    lifecycle: tokio::sync::Mutex<()>,
    /// True until the first connection is opened or the client is closed
    lazy_connect: Mutex<bool>,
    connected: watch::Sender<bool>,
    listeners: Arc<ListenerRegistry>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.pending.close();
            if let Some(task) = active.reader_task.lock().take() {
                task.abort();
            }
        }
    }
}

/// Client for the spalloc server protocol.
///
/// Cloning is cheap and every clone talks over the same connection, so a
/// `ProtocolClient` can be handed to job controllers and background tasks
/// alongside the caller.
///
/// # Example
///
/// ```ignore
/// use spalloc_client::protocol::ProtocolClient;
/// use serde_json::json;
///
/// let client = ProtocolClient::new("spalloc.example.com", 22244);
/// client.connect().await?;
/// let version = client.version().await?;
/// let jobs = client.call("list_jobs", vec![], Default::default()).await?;
/// client.close().await;
/// ```
#[derive(Debug, Clone)]
pub struct ProtocolClient {
    inner: Arc<ClientInner>,
}

impl ProtocolClient {
    /// Create a client for `hostname:port`. Does not connect.
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self::with_timeout(
            hostname,
            port,
            Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
        )
    }

    /// Create a client with a custom default call timeout (`None` waits forever).
    pub fn with_timeout(hostname: impl Into<String>, port: u16, timeout: Option<Duration>) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                hostname: hostname.into(),
                port,
                default_timeout: timeout,
                listener_capacity: DEFAULT_LISTENER_CAPACITY,
                next_id: AtomicU64::new(1),
                active: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                lazy_connect: Mutex::new(true),
                connected,
                listeners: ListenerRegistry::new(),
            }),
        }
    }

    /// Create a client from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let hostname = config
            .hostname
            .clone()
            .ok_or_else(|| SpallocError::Config("A hostname must be specified".to_string()))?;
        Ok(Self::with_timeout(hostname, config.port, config.timeout))
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Default timeout applied by [`call`](Self::call).
    pub fn default_timeout(&self) -> Option<Duration> {
        self.inner.default_timeout
    }

    /// (Re)connect to the server, replacing any existing connection.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with_timeout(self.inner.default_timeout).await
    }

    /// (Re)connect with an explicit connect timeout.
    pub async fn connect_with_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let previous = self.inner.active.lock().take();
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
        self.open_locked(timeout).await.map(|_| ())
    }

    /// Open a connection; the caller holds the lifecycle lock.
    async fn open_locked(&self, timeout: Option<Duration>) -> Result<Arc<ActiveConnection>> {
        let connection = Transport::connect(&self.inner.hostname, self.inner.port, timeout)
            .await
            .map_err(|e| {
                warn!(
                    "Could not connect to {}:{}: {}",
                    self.inner.hostname, self.inner.port, e
                );
                e
            })?;
        let peer = connection.peer();
        let (reader, writer) = connection.into_split();

        let active = Arc::new(ActiveConnection {
            writer,
            pending: PendingCalls::new(),
            reader_task: Mutex::new(None),
        });
        let task = tokio::spawn(receive_loop(
            reader,
            Arc::clone(&active),
            Arc::clone(&self.inner.listeners),
            Arc::downgrade(&self.inner),
        ));
        *active.reader_task.lock() = Some(task);

        *self.inner.lazy_connect.lock() = false;
        *self.inner.active.lock() = Some(Arc::clone(&active));
        self.inner.connected.send_replace(true);
        info!("Connected to spalloc server {}", peer);
        Ok(active)
    }

    /// The live connection.
    ///
    /// Only the very first call connects lazily; once a connection has been
    /// lost or closed, reconnecting is the caller's decision.
    async fn active(&self) -> Result<Arc<ActiveConnection>> {
        if let Some(active) = self.inner.active.lock().clone() {
            return Ok(active);
        }
        if !*self.inner.lazy_connect.lock() {
            return Err(SpallocError::ConnectionClosed);
        }

        let _lifecycle = self.inner.lifecycle.lock().await;
        // Another task may have connected (or closed) while we waited
        if let Some(active) = self.inner.active.lock().clone() {
            return Ok(active);
        }
        if !*self.inner.lazy_connect.lock() {
            return Err(SpallocError::ConnectionClosed);
        }
        self.open_locked(self.inner.default_timeout).await
    }

    /// True while a connection is open.
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Resolve once no connection is open.
    pub async fn disconnected(&self) {
        let mut rx = self.inner.connected.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|connected| !*connected).await;
    }

    /// Disconnect from the server.
    ///
    /// Idempotent. Outstanding calls fail with `ConnectionClosed` and the
    /// receive loop is stopped before this returns. Later calls fail until
    /// [`connect`](Self::connect) is called again.
    pub async fn close(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        *self.inner.lazy_connect.lock() = false;
        let active = self.inner.active.lock().take();
        if let Some(active) = active {
            active.shutdown().await;
            info!("Disconnected from spalloc server");
        }
        self.inner.connected.send_replace(false);
    }

    /// Send a command and wait for its result using the default timeout.
    pub async fn call(
        &self,
        command: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        self.call_with_timeout(command, args, kwargs, self.inner.default_timeout)
            .await
    }

    /// Send a command and wait for its result.
    ///
    /// Resolves with whichever happens first: the matching response, the
    /// timeout elapsing (`ProtocolTimeout`), or the connection being torn
    /// down (`ConnectionClosed`). A zero timeout only succeeds if the
    /// response is already available. The pending entry is removed on
    /// every exit path, including the returned future being dropped.
    pub async fn call_with_timeout(
        &self,
        command: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let active = self.active().await?;
        let id = self.next_correlation_id();
        let frame = codec::encode(&Command::new(command, args, kwargs, id))?;

        let rx = active.pending.insert(id)?;
        let _guard = PendingGuard {
            pending: &active.pending,
            id,
        };

        let exchange = async {
            if let Err(e) = active.writer.send(&frame).await {
                warn!("Failed to send '{}': {}", command, e);
                return Err(e);
            }
            debug!("Sent '{}' (correlation id {})", command, id);
            rx.await.unwrap_or(Err(SpallocError::ConnectionClosed))
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange).await.unwrap_or_else(|_| {
                debug!("'{}' (correlation id {}) timed out", command, id);
                Err(SpallocError::ProtocolTimeout {
                    command: command.to_string(),
                    timeout: limit,
                })
            }),
            None => exchange.await,
        }
    }

    /// Send a command without waiting for its response.
    ///
    /// No pending entry is created, so the eventual response is discarded
    /// by the receive loop.
    pub async fn cast(&self, command: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<()> {
        let active = self.active().await?;
        let id = self.next_correlation_id();
        let frame = codec::encode(&Command::new(command, args, kwargs, id))?;
        active.writer.send(&frame).await?;
        debug!("Cast '{}' (correlation id {})", command, id);
        Ok(())
    }

    /// Register a notification listener with the default queue capacity.
    pub fn subscribe(&self) -> NotificationListener {
        self.subscribe_with_capacity(self.inner.listener_capacity)
    }

    /// Register a notification listener with a queue of `capacity` entries.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> NotificationListener {
        self.inner.listeners.register(capacity)
    }

    /// Unregister a listener by id. Returns false if it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        self.inner.listeners.unregister(id)
    }

    /// Number of registered notification listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Number of calls waiting for a response on the live connection.
    pub fn outstanding_calls(&self) -> usize {
        self.inner
            .active
            .lock()
            .as_ref()
            .map_or(0, |active| active.pending.len())
    }

    fn next_correlation_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Background task reading frames until the connection dies.
async fn receive_loop(
    mut reader: FrameReader,
    active: Arc<ActiveConnection>,
    listeners: Arc<ListenerRegistry>,
    inner: Weak<ClientInner>,
) {
    loop {
        match reader.receive(None).await {
            Ok(Received::Frame(bytes)) => match codec::decode(&bytes) {
                Ok(Frame::Response(response)) => match active.pending.remove(response.correlation_id) {
                    Some(tx) => {
                        let result = response.outcome.map_err(SpallocError::Server);
                        let _ = tx.send(result);
                    }
                    None => debug!(
                        "Discarding response for unknown correlation id {}",
                        response.correlation_id
                    ),
                },
                Ok(Frame::Notification(notification)) => {
                    debug!("Received '{}' notification", notification.kind.as_str());
                    listeners.dispatch(&notification);
                }
                Err(e) => warn!("Dropping frame: {}", e),
            },
            Ok(Received::Eof) => {
                info!("Server closed the connection");
                break;
            }
            Err(e) => {
                warn!("Connection to spalloc server lost: {}", e);
                break;
            }
        }
    }

    active.pending.close();
    active.writer.shutdown().await;

    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut current = inner.active.lock();
    if current
        .as_ref()
        .is_some_and(|live| Arc::ptr_eq(live, &active))
    {
        *current = None;
        inner.connected.send_replace(false);
    }
}
