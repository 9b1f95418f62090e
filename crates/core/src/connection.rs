//! Request/response dispatch over a pair of byte streams.
//!
//! A [`Connection`] owns two background tasks: a reader that decodes inbound
//! lines and routes them, and a single writer that serializes every outbound
//! message so lines never interleave. Both halves of the bridge use the same
//! type; the host mostly issues requests, the backend mostly handles them.

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::pending::PendingCalls;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use statrpc_protocol::{ErrorCode, ErrorPayload, Frame, Message, MessageCodec, RequestId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// What a request handler produces: the `result` value, or the `error` value.
pub type HandlerResult = std::result::Result<Value, Value>;

type RequestHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handlers per method, kept in registration order.
struct Registry<T> {
    entries: HashMap<String, Vec<(u64, T)>>,
}

impl<T: Clone> Registry<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn add(&mut self, method: &str, key: u64, handler: T) {
        self.entries
            .entry(method.to_string())
            .or_default()
            .push((key, handler));
    }

    fn remove(&mut self, method: &str, key: u64) {
        if let Some(list) = self.entries.get_mut(method) {
            list.retain(|(k, _)| *k != key);
            if list.is_empty() {
                self.entries.remove(method);
            }
        }
    }

    fn first(&self, method: &str) -> Option<T> {
        self.entries
            .get(method)
            .and_then(|list| list.first())
            .map(|(_, handler)| handler.clone())
    }

    fn all(&self, method: &str) -> Vec<T> {
        self.entries
            .get(method)
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerKind {
    Request,
    Notification,
}

struct Shared {
    config: ConnectionConfig,
    next_id: AtomicU64,
    next_key: AtomicU64,
    pending: Mutex<PendingCalls>,
    requests: Mutex<Registry<RequestHandler>>,
    notifications: Mutex<Registry<NotificationHandler>>,
    outbound: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
    terminated: CancellationToken,
}

impl Shared {
    fn send(&self, message: Message) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        self.outbound.send(message).is_ok()
    }

    fn dispose(&self) {
        let rejected = lock(&self.pending).close();
        self.shutdown.cancel();
        // handlers may hold clones of the connection
        lock(&self.requests).clear();
        lock(&self.notifications).clear();
        if rejected > 0 {
            debug!(rejected, "connection disposed with pending calls");
        }
    }

    fn complete(&self, id: RequestId, result: Result<Value>) {
        if !lock(&self.pending).resolve(id, result) {
            debug!(%id, "ignoring response for unknown request id");
        }
    }

    fn dispatch(self: &Arc<Self>, message: Message, tracker: &TaskTracker) {
        match message {
            Message::Success { id, result } => self.complete(id, Ok(result)),
            Message::Failure { id, error } => {
                self.complete(id, Err(Error::Remote(ErrorPayload::from_value(error))))
            }
            Message::Request { id, method, params } => {
                self.handle_request(id, method, params, tracker)
            }
            Message::Notification { method, params } => {
                let listeners = lock(&self.notifications).all(&method);
                for listener in listeners {
                    listener(params.clone());
                }
            }
        }
    }

    fn handle_request(
        self: &Arc<Self>,
        id: RequestId,
        method: String,
        params: Value,
        tracker: &TaskTracker,
    ) {
        let Some(handler) = lock(&self.requests).first(&method) else {
            debug!(%id, %method, "no handler registered for request");
            let error = ErrorPayload::new(
                ErrorCode::Other("ENOSYS".to_string()),
                format!("no handler for method '{}'", method),
            );
            self.send(Message::Failure {
                id,
                error: error.to_value(),
            });
            return;
        };

        let shared = Arc::clone(self);
        tracker.spawn(async move {
            let outcome = AssertUnwindSafe(async move { handler(params).await })
                .catch_unwind()
                .await;
            let reply = match outcome {
                Ok(Ok(result)) => Message::Success { id, result },
                Ok(Err(error)) => {
                    debug!(%id, %method, %error, "request handler failed");
                    Message::Failure { id, error }
                }
                Err(_) => {
                    warn!(%id, %method, "request handler panicked");
                    let error = ErrorPayload::new(
                        ErrorCode::Other("UNKNOWN".to_string()),
                        format!("handler for '{}' panicked", method),
                    );
                    Message::Failure {
                        id,
                        error: error.to_value(),
                    }
                }
            };
            shared.send(reply);
        });
    }
}

/// Removes a pending entry when the waiting future goes away early.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.shared.pending).remove(self.id);
    }
}

/// A bidirectional request/response/notification connection.
///
/// Cloning is cheap and yields another handle to the same connection.
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Creates a connection with the default [`ConnectionConfig`].
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_config(reader, writer, ConnectionConfig::default())
    }

    pub fn with_config<R, W>(reader: R, writer: W, config: ConnectionConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            next_id: AtomicU64::new(1),
            next_key: AtomicU64::new(1),
            pending: Mutex::new(PendingCalls::new()),
            requests: Mutex::new(Registry::new()),
            notifications: Mutex::new(Registry::new()),
            outbound,
            shutdown: CancellationToken::new(),
            terminated: CancellationToken::new(),
        });

        tokio::spawn(write_loop(
            Arc::clone(&shared),
            FramedWrite::new(writer, MessageCodec::new()),
            outbound_rx,
        ));
        tokio::spawn(read_loop(
            Arc::clone(&shared),
            FramedRead::new(reader, MessageCodec::new()),
        ));

        Self { shared }
    }

    /// Sends a request and waits for the matching response.
    ///
    /// Resolves with the response's `result`, or fails with
    /// [`Error::Remote`] carrying its `error`. Fails with [`Error::Disposed`]
    /// if the connection is or becomes disposed, and with [`Error::Timeout`]
    /// once the configured request timeout elapses.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value> {
        let id = RequestId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, tx)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        if !self.shared.send(Message::request(id, method, params)) {
            return Err(Error::Disposed);
        }

        let response = match self.shared.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| {
                Error::Timeout(format!(
                    "request {} ({}) got no response within {:?}",
                    id, method, limit
                ))
            })?,
            None => rx.await,
        };

        response.unwrap_or(Err(Error::Disposed))
    }

    /// Typed wrapper around [`send_request`](Self::send_request).
    pub async fn request<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.send_request(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Sends a fire-and-forget notification.
    pub fn send_notification(&self, method: &str, params: Value) -> Result<()> {
        if !self.shared.send(Message::notification(method, params)) {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    /// Registers a handler for inbound requests named `method`.
    ///
    /// Only the first registered handler for a method runs; later ones stay
    /// dormant until every earlier one is disposed.
    pub fn on_request<F, Fut>(&self, method: &str, handler: F) -> Subscription
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let key = self.shared.next_key.fetch_add(1, Ordering::Relaxed);
        let handler: RequestHandler = Arc::new(move |params| handler(params).boxed());

        let mut registry = lock(&self.shared.requests);
        if registry.first(method).is_some() {
            warn!(method, "request handler already registered, first registration stays active");
        }
        registry.add(method, key, handler);

        Subscription {
            shared: Arc::downgrade(&self.shared),
            method: method.to_string(),
            key,
            kind: HandlerKind::Request,
        }
    }

    /// Registers a typed request handler.
    ///
    /// Parameters that fail to deserialize are answered with an `EINVAL`
    /// error without invoking `handler`.
    pub fn handle<P, R, F, Fut>(&self, method: &str, handler: F) -> Subscription
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, ErrorPayload>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on_request(method, move |params| {
            let handler = Arc::clone(&handler);
            async move { call_typed(handler.as_ref(), params).await }
        })
    }

    /// Registers a listener for notifications named `method`.
    ///
    /// Every listener runs, in registration order.
    pub fn on_notification<F>(&self, method: &str, handler: F) -> Subscription
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let key = self.shared.next_key.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.notifications).add(method, key, Arc::new(handler));

        Subscription {
            shared: Arc::downgrade(&self.shared),
            method: method.to_string(),
            key,
            kind: HandlerKind::Notification,
        }
    }

    /// Disposes the connection, rejecting every pending call with
    /// [`Error::Disposed`].
    pub fn dispose(&self) {
        self.shared.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Number of requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Waits until the connection is disposed and queued output is flushed.
    pub async fn closed(&self) {
        self.shared.terminated.cancelled().await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("pending", &self.pending_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Registration returned by [`Connection::on_request`] and
/// [`Connection::on_notification`].
pub struct Subscription {
    shared: Weak<Shared>,
    method: String,
    key: u64,
    kind: HandlerKind,
}

impl Subscription {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Unregisters exactly this handler.
    pub fn dispose(self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        match self.kind {
            HandlerKind::Request => lock(&shared.requests).remove(&self.method, self.key),
            HandlerKind::Notification => {
                lock(&shared.notifications).remove(&self.method, self.key)
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("method", &self.method)
            .field("kind", &self.kind)
            .finish()
    }
}

async fn call_typed<P, R, F, Fut>(handler: &F, params: Value) -> HandlerResult
where
    P: DeserializeOwned,
    R: Serialize,
    F: Fn(P) -> Fut,
    Fut: Future<Output = std::result::Result<R, ErrorPayload>>,
{
    let params: P = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(e) => {
            let error = ErrorPayload::new(ErrorCode::Other("EINVAL".to_string()), e.to_string());
            return Err(error.to_value());
        }
    };
    let result = handler(params).await.map_err(|e| e.to_value())?;
    serde_json::to_value(result).map_err(|e| {
        ErrorPayload::new(ErrorCode::Other("UNKNOWN".to_string()), e.to_string()).to_value()
    })
}

async fn read_loop<R>(shared: Arc<Shared>, mut frames: FramedRead<R, MessageCodec>)
where
    R: AsyncRead + Unpin,
{
    let tracker = TaskTracker::new();

    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(Frame::Message(message))) => shared.dispatch(message, &tracker),
            Some(Ok(Frame::Malformed(reason))) => {
                warn!(%reason, "dropping malformed message");
            }
            Some(Err(e)) => {
                warn!(error = %e, "failed to read from transport");
                break;
            }
            None => {
                debug!("transport reached end of stream");
                break;
            }
        }
    }

    // let in-flight handlers queue their responses before shutting down
    tracker.close();
    tokio::select! {
        _ = tracker.wait() => {}
        _ = shared.shutdown.cancelled() => {}
    }
    shared.dispose();
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    mut sink: FramedWrite<W, MessageCodec>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            message = outbound.recv() => message,
            _ = shared.shutdown.cancelled() => None,
        };
        let Some(message) = message else {
            break;
        };
        if let Err(e) = sink.send(message).await {
            warn!(error = %e, "failed to write to transport");
            shared.dispose();
            break;
        }
    }

    while let Ok(message) = outbound.try_recv() {
        if sink.feed(message).await.is_err() {
            break;
        }
    }
    if let Err(e) = SinkExt::<Message>::close(&mut sink).await {
        debug!(error = %e, "failed to close transport");
    }
    shared.terminated.cancel();
}
