use futures::{SinkExt, StreamExt};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::StompItem;
use crate::config::ClientConfig;
use crate::error::{ConnectError, ServerError, StompError};
use crate::frame::Frame;
use crate::heartbeat::{HeartbeatMonitor, negotiate_heartbeats, parse_heartbeat_header};
use crate::message::Message;
use crate::receipt::ReceiptTracker;
use crate::subscription::{
    CloseReason, DeferredSink, Registered, SubscribeOptions, Subscription, SubscriptionRegistry,
};
use crate::transaction::Transaction;
use crate::transport::{self, FrameSink, FrameStream, Transport};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a connection.
///
/// `Disconnected → Connecting → Connected → Disconnecting → Disconnected`,
/// with `Failed` reachable from every non-terminal state and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Failed => "failed",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Disconnecting)
                | (Connected, Failed)
                | (Disconnecting, Disconnected)
                | (Disconnecting, Failed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for `send`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Extra SEND headers.
    pub headers: Vec<(String, String)>,
    /// Wait for a RECEIPT, bounded by `messageSendTimeout`.
    pub receipt: bool,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn receipt(mut self, receipt: bool) -> Self {
        self.receipt = receipt;
        self
    }
}

/// What the broker told us in CONNECTED.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub version: String,
    pub server: Option<String>,
    pub session: Option<String>,
    /// Negotiated `(outgoing, incoming)` heartbeat intervals.
    pub heartbeat: (Option<Duration>, Option<Duration>),
}

#[derive(Debug, Clone)]
struct Status {
    state: ConnectionState,
    error: Option<StompError>,
}

struct Inner {
    id: u64,
    config: ClientConfig,
    session: SessionInfo,
    status: watch::Sender<Status>,
    /// Per-connection write lock; `None` once the transport is closed.
    writer: Mutex<Option<FrameSink>>,
    receipts: ReceiptTracker,
    subscriptions: SubscriptionRegistry,
    heartbeat: HeartbeatMonitor,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    tx_counter: AtomicU64,
}

/// One STOMP 1.2 session over one transport.
///
/// A background reader decodes inbound frames and routes them to the
/// heartbeat monitor, the receipt tracker and the subscription registry; a
/// heartbeat task keeps both liveness directions honest. Cloning the handle
/// is cheap and every clone refers to the same connection. Dropping the last
/// handle without `disconnect` stops the background tasks and closes the
/// transport without a DISCONNECT frame.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Open the configured transport and perform the STOMP handshake.
    ///
    /// `config.timeout` bounds transport open plus handshake together; when
    /// it elapses the attempt fails with [`ConnectError::Timeout`].
    pub async fn connect(config: ClientConfig) -> Result<Self, StompError> {
        config.validate()?;
        let timeout = config.timeout;
        tracing::debug!(
            addr = %config.addr,
            from = %ConnectionState::Disconnected,
            to = %ConnectionState::Connecting,
            "state transition"
        );
        match tokio::time::timeout(timeout, Self::establish(config)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout(timeout).into()),
        }
    }

    async fn establish(config: ClientConfig) -> Result<Self, StompError> {
        let mut transport = transport::open(&config).await?;

        let proposal = config.heartbeat.proposal();
        let mut connect = Frame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", config.host_header())
            .header("heart-beat", proposal.to_string());
        if let Some(user) = &config.user {
            connect = connect.header("login", user);
        }
        if let Some(pass) = &config.pass {
            connect = connect.header("passcode", pass);
        }
        connect = connect.headers(config.headers.iter());

        transport
            .sink
            .send(StompItem::Frame(connect))
            .await
            .map_err(handshake_error)?;

        let connected = loop {
            match transport.stream.next().await {
                Some(Ok(StompItem::Heartbeat)) => continue,
                Some(Ok(StompItem::Frame(frame))) => match frame.command.as_str() {
                    "CONNECTED" => break frame,
                    "ERROR" => {
                        return Err(ConnectError::Rejected(ServerError::from_frame(frame)).into());
                    }
                    other => {
                        return Err(ConnectError::Handshake(format!(
                            "expected CONNECTED, got {}",
                            other
                        ))
                        .into());
                    }
                },
                Some(Err(e)) => return Err(handshake_error(e)),
                None => return Err(ConnectError::Closed.into()),
            }
        };

        match connected.get_header("version") {
            Some("1.2") => {}
            other => {
                return Err(ConnectError::Handshake(format!(
                    "broker negotiated version {:?}, only 1.2 is supported",
                    other.unwrap_or("1.0")
                ))
                .into());
            }
        }

        let (sx, sy) = parse_heartbeat_header(connected.get_header("heart-beat").unwrap_or("0,0"));
        let (outgoing, incoming) =
            negotiate_heartbeats(proposal.send_ms, proposal.receive_ms, sx, sy);
        let session = SessionInfo {
            version: "1.2".to_string(),
            server: connected.get_header("server").map(str::to_string),
            session: connected.get_header("session").map(str::to_string),
            heartbeat: (outgoing, incoming),
        };
        let monitor = HeartbeatMonitor::new(outgoing, incoming, config.heartbeat.grace);
        Ok(Self::start(config, transport, session, monitor).await)
    }

    /// Wrap an already negotiated transport and spawn the background tasks.
    async fn start(
        config: ClientConfig,
        transport: Transport,
        session: SessionInfo,
        heartbeat: HeartbeatMonitor,
    ) -> Self {
        let Transport { sink, stream } = transport;
        let (shutdown, _) = broadcast::channel(1);
        let (status, _) = watch::channel(Status {
            state: ConnectionState::Connected,
            error: None,
        });
        heartbeat.record_sent();
        heartbeat.record_received();
        let capacity = config.read_channel_capacity;

        let inner = Arc::new(Inner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst),
            config,
            session,
            status,
            writer: Mutex::new(Some(sink)),
            receipts: ReceiptTracker::new(),
            subscriptions: SubscriptionRegistry::new(capacity),
            heartbeat,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            tx_counter: AtomicU64::new(0),
        });
        tracing::debug!(
            connection = inner.id,
            server = ?inner.session.server,
            session = ?inner.session.session,
            outgoing = ?inner.session.heartbeat.0,
            incoming = ?inner.session.heartbeat.1,
            from = %ConnectionState::Connecting,
            to = %ConnectionState::Connected,
            "state transition"
        );

        let mut handles = vec![tokio::spawn(read_loop(
            Arc::downgrade(&inner),
            stream,
            inner.shutdown.subscribe(),
        ))];
        if let Some(tick) = heartbeat_tick(&inner.heartbeat) {
            handles.push(tokio::spawn(heartbeat_loop(
                Arc::downgrade(&inner),
                inner.shutdown.subscribe(),
                tick,
            )));
        }
        inner.tasks.lock().await.extend(handles);
        Self { inner }
    }

    /// Process-unique id of this connection.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status.borrow().state
    }

    /// The error that moved the connection to `Failed`, if any.
    pub fn failure(&self) -> Option<StompError> {
        self.inner.status.borrow().error.clone()
    }

    /// Wait until the connection is `Disconnected` or `Failed`.
    pub async fn closed(&self) -> ConnectionState {
        let mut rx = self.inner.status.subscribe();
        match rx
            .wait_for(|s| {
                matches!(
                    s.state,
                    ConnectionState::Disconnected | ConnectionState::Failed
                )
            })
            .await
        {
            Ok(status) => status.state,
            Err(_) => self.state(),
        }
    }

    pub fn session_info(&self) -> &SessionInfo {
        &self.inner.session
    }

    /// The CONNECTED `server` header.
    pub fn server(&self) -> Option<&str> {
        self.inner.session.server.as_deref()
    }

    /// The CONNECTED `session` header.
    pub fn session(&self) -> Option<&str> {
        self.inner.session.session.as_deref()
    }

    /// Negotiated protocol version, always `1.2`.
    pub fn version(&self) -> &str {
        &self.inner.session.version
    }

    /// Negotiated `(outgoing, incoming)` heartbeat intervals.
    pub fn heartbeat(&self) -> (Option<Duration>, Option<Duration>) {
        self.inner.session.heartbeat
    }

    /// Number of receipts still waiting for their RECEIPT frame.
    pub async fn pending_receipts(&self) -> usize {
        self.inner.receipts.pending_count().await
    }

    /// Number of live subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len().await
    }

    /// Delivered but unacknowledged message ids of a subscription.
    pub async fn outstanding(&self, subscription_id: &str) -> Option<Vec<String>> {
        self.inner.subscriptions.outstanding(subscription_id).await
    }

    fn ensure_connected(&self, operation: &'static str) -> Result<(), StompError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            state => Err(StompError::State { operation, state }),
        }
    }

    /// Send a message to `destination`.
    ///
    /// An empty `content_type` omits the header. With `opts.receipt` the call
    /// returns once the broker confirmed it, or fails after
    /// `messageSendTimeout`.
    pub async fn send(
        &self,
        destination: &str,
        content_type: &str,
        body: impl Into<Vec<u8>>,
        opts: SendOptions,
    ) -> Result<(), StompError> {
        self.send_in(destination, content_type, body.into(), opts, None)
            .await
    }

    pub(crate) async fn send_in(
        &self,
        destination: &str,
        content_type: &str,
        body: Vec<u8>,
        opts: SendOptions,
        transaction: Option<&str>,
    ) -> Result<(), StompError> {
        self.ensure_connected("send")?;
        let mut frame = Frame::new("SEND").header("destination", destination);
        if !content_type.is_empty() {
            frame = frame.header("content-type", content_type);
        }
        if let Some(tx) = transaction {
            frame = frame.header("transaction", tx);
        }
        let frame = frame.headers(opts.headers).set_body(body);
        if opts.receipt {
            self.inner
                .request(frame, self.inner.config.message_send_timeout)
                .await
        } else {
            self.inner.write(StompItem::Frame(frame)).await
        }
    }

    /// Subscribe with a read queue; drain it with [`Subscription::read`].
    ///
    /// Accepts either an [`AckMode`](crate::AckMode) or full
    /// [`SubscribeOptions`].
    pub async fn subscribe(
        &self,
        destination: &str,
        opts: impl Into<SubscribeOptions>,
    ) -> Result<Subscription, StompError> {
        let registered = self.subscribe_with(destination, opts.into(), None).await?;
        Ok(Subscription::new(registered, self.clone()))
    }

    /// Subscribe with a deferred sink instead of a read queue.
    ///
    /// The reader hands every message to `sink`, and a connection failure
    /// once as `Err`.
    pub async fn subscribe_deferred(
        &self,
        destination: &str,
        opts: impl Into<SubscribeOptions>,
        sink: DeferredSink,
    ) -> Result<Subscription, StompError> {
        let registered = self
            .subscribe_with(destination, opts.into(), Some(sink))
            .await?;
        Ok(Subscription::new(registered, self.clone()))
    }

    async fn subscribe_with(
        &self,
        destination: &str,
        opts: SubscribeOptions,
        sink: Option<DeferredSink>,
    ) -> Result<Registered, StompError> {
        self.ensure_connected("subscribe")?;
        let registered = self
            .inner
            .subscriptions
            .register(opts.id.clone(), destination, opts.ack, sink)
            .await?;
        let id = registered.shared.id().to_string();
        let frame = Frame::new("SUBSCRIBE")
            .header("id", &id)
            .header("destination", destination)
            .header("ack", opts.ack.as_str())
            .headers(opts.headers);
        let result = if opts.receipt {
            self.inner
                .request(frame, self.inner.config.receipt_timeout)
                .await
        } else {
            self.inner.write(StompItem::Frame(frame)).await
        };
        if let Err(e) = result {
            self.inner.subscriptions.remove(&id).await;
            return Err(e);
        }
        tracing::debug!(connection = self.inner.id, subscription = %id, destination, ack = %opts.ack, "subscribed");
        Ok(registered)
    }

    /// Send UNSUBSCRIBE and drop the subscription; a blocked read on it
    /// fails with `Unsubscribed`.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<(), StompError> {
        self.ensure_connected("unsubscribe")?;
        if self.inner.subscriptions.remove(subscription_id).await.is_none() {
            return Err(StompError::Subscription(format!(
                "unknown subscription '{}'",
                subscription_id
            )));
        }
        let frame = Frame::new("UNSUBSCRIBE").header("id", subscription_id);
        self.inner.write(StompItem::Frame(frame)).await?;
        tracing::debug!(connection = self.inner.id, subscription = %subscription_id, "unsubscribed");
        Ok(())
    }

    /// Acknowledge `message`. On a `client` subscription this also settles
    /// every earlier message of that subscription.
    pub async fn ack(&self, message: &Message) -> Result<(), StompError> {
        self.settle("ACK", message, None).await
    }

    /// Negative-acknowledge `message`.
    pub async fn nack(&self, message: &Message) -> Result<(), StompError> {
        self.settle("NACK", message, None).await
    }

    pub(crate) async fn settle(
        &self,
        command: &'static str,
        message: &Message,
        transaction: Option<&str>,
    ) -> Result<(), StompError> {
        let operation = if command == "ACK" { "ack" } else { "nack" };
        self.ensure_connected(operation)?;
        if message.connection_id() != self.inner.id {
            return Err(StompError::AckMode(format!(
                "message '{}' was received on another connection",
                message.message_id()
            )));
        }
        self.inner
            .subscriptions
            .acknowledge(message.subscription(), message.message_id())
            .await?;
        let mut frame = Frame::new(command)
            .header("id", message.ack_id())
            .header("subscription", message.subscription());
        if let Some(tx) = transaction {
            frame = frame.header("transaction", tx);
        }
        self.inner.write(StompItem::Frame(frame)).await
    }

    /// Start a transaction.
    pub async fn begin(&self) -> Result<Transaction, StompError> {
        self.ensure_connected("begin")?;
        let id = format!(
            "tx-{}-{}",
            self.inner.id,
            self.inner.tx_counter.fetch_add(1, Ordering::SeqCst) + 1
        );
        self.transaction_frame("BEGIN", &id).await?;
        Ok(Transaction::new(self.clone(), id))
    }

    pub(crate) async fn transaction_frame(
        &self,
        command: &'static str,
        transaction: &str,
    ) -> Result<(), StompError> {
        let operation = match command {
            "BEGIN" => "begin",
            "COMMIT" => "commit",
            _ => "abort",
        };
        self.ensure_connected(operation)?;
        let frame = Frame::new(command).header("transaction", transaction);
        self.inner.write(StompItem::Frame(frame)).await
    }

    /// Close the session.
    ///
    /// Sends DISCONNECT with a receipt and waits up to `disconnectTimeout`
    /// for it, then closes the transport regardless. Pending receipts and
    /// blocked reads fail with `ConnectionClosed`, or with the failure of a
    /// connection that already failed, and both background tasks have
    /// finished when this returns. Calling it again is a no-op.
    pub async fn disconnect(&self) -> Result<(), StompError> {
        let inner = &self.inner;
        let was_connected = inner.transition(ConnectionState::Connected, ConnectionState::Disconnecting);

        if was_connected {
            let receipt_id = inner.receipts.next_id();
            match inner.receipts.expect(&receipt_id).await {
                Ok(waiter) => {
                    let frame = Frame::new("DISCONNECT").receipt(&receipt_id);
                    match inner.write(StompItem::Frame(frame)).await {
                        Ok(()) => {
                            if let Err(e) = inner
                                .receipts
                                .wait(waiter, inner.config.disconnect_timeout)
                                .await
                            {
                                tracing::debug!(connection = inner.id, error = %e, "no DISCONNECT receipt, closing anyway");
                            }
                        }
                        Err(e) => {
                            tracing::debug!(connection = inner.id, error = %e, "DISCONNECT not sent");
                        }
                    }
                }
                Err(e) => tracing::debug!(connection = inner.id, error = %e, "DISCONNECT receipt refused"),
            }
        }

        // A failed connection may still be tearing down in its reader task,
        // which is about to be aborted; finish the release here.
        let failure = inner.status.borrow().error.clone();
        match failure {
            Some(e) => inner.teardown(CloseReason::Failed(e.clone()), e).await,
            None => {
                inner
                    .teardown(CloseReason::ConnectionClosed, StompError::ConnectionClosed)
                    .await
            }
        }
        if was_connected {
            inner.transition(ConnectionState::Disconnecting, ConnectionState::Disconnected);
        }

        let handles: Vec<JoinHandle<()>> = inner.tasks.lock().await.drain(..).collect();
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.config.addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    /// Compare-and-set on the state; logs the transition when it happens.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let changed = self.status.send_if_modified(|status| {
            if status.state == from && from.can_transition(to) {
                status.state = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(connection = self.id, %from, %to, "state transition");
        }
        changed
    }

    /// Write one item under the write lock, bounded by `messageSendTimeout`.
    /// A failed or timed-out write is fatal to the connection.
    async fn write(&self, item: StompItem) -> Result<(), StompError> {
        let deadline = self.config.message_send_timeout;
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(self.closed_error());
        };
        let result = match tokio::time::timeout(deadline, sink.send(item)).await {
            Ok(result) => result,
            Err(_) => Err(StompError::Io(Arc::new(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write did not complete within {:?}", deadline),
            )))),
        };
        drop(writer);
        match result {
            Ok(()) => {
                self.heartbeat.record_sent();
                Ok(())
            }
            Err(e) => {
                self.fail(e.clone()).await;
                Err(e)
            }
        }
    }

    /// Write a frame carrying a fresh receipt and wait for its RECEIPT;
    /// `timeout` covers both.
    async fn request(&self, frame: Frame, timeout: Duration) -> Result<(), StompError> {
        let started = Instant::now();
        let receipt_id = self.receipts.next_id();
        let waiter = self.receipts.expect(&receipt_id).await?;
        if let Err(e) = self.write(StompItem::Frame(frame.receipt(&receipt_id))).await {
            self.receipts.fail(&receipt_id, e.clone()).await;
            return Err(e);
        }
        self.receipts
            .wait(waiter, timeout.saturating_sub(started.elapsed()))
            .await
    }

    fn closed_error(&self) -> StompError {
        self.status
            .borrow()
            .error
            .clone()
            .unwrap_or(StompError::ConnectionClosed)
    }

    /// Move a live connection to `Failed` and release every waiter.
    async fn fail(&self, err: StompError) {
        let changed = self.status.send_if_modified(|status| {
            if status.state.can_transition(ConnectionState::Failed)
                && status.state != ConnectionState::Disconnecting
            {
                status.state = ConnectionState::Failed;
                status.error = Some(err.clone());
                true
            } else {
                false
            }
        });
        if !changed {
            tracing::debug!(connection = self.id, error = %err, "ignoring error on closing connection");
            return;
        }
        tracing::warn!(connection = self.id, error = %err, "connection failed");
        self.teardown(CloseReason::Failed(err.clone()), err).await;
    }

    /// Stop the background tasks, fail everything still waiting, then close
    /// the transport. Safe to call more than once and from the tasks
    /// themselves.
    ///
    /// Waiters are released before the close, and the close is bounded by
    /// `disconnectTimeout`: a peer that stopped reading cannot hold it up.
    async fn teardown(&self, reason: CloseReason, err: StompError) {
        let _ = self.shutdown.send(());
        self.receipts.fail_all(err).await;
        self.subscriptions.close_all(reason).await;

        let sink = self.writer.lock().await.take();
        if let Some(mut sink) = sink {
            match tokio::time::timeout(self.config.disconnect_timeout, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(connection = self.id, error = %e, "error closing transport")
                }
                Err(_) => tracing::debug!(
                    connection = self.id,
                    timeout = ?self.config.disconnect_timeout,
                    "transport did not close in time, dropping it"
                ),
            }
        }
    }

    /// Route one inbound frame. An `Err` is fatal to the connection.
    async fn route(&self, frame: Frame) -> Result<(), StompError> {
        match frame.command.as_str() {
            "MESSAGE" => {
                self.subscriptions.dispatch(frame, self.id).await;
                Ok(())
            }
            "RECEIPT" => {
                match frame.get_header("receipt-id") {
                    Some(id) => match self.receipts.resolve(id).await {
                        Ok(elapsed) => {
                            tracing::debug!(connection = self.id, receipt = %id, ?elapsed, "receipt resolved")
                        }
                        Err(e) => tracing::warn!(connection = self.id, error = %e, "ignoring receipt"),
                    },
                    None => tracing::warn!(connection = self.id, "RECEIPT without receipt-id"),
                }
                Ok(())
            }
            "ERROR" => {
                let err = ServerError::from_frame(frame);
                if let Some(receipt_id) = &err.receipt_id {
                    self.receipts
                        .fail(receipt_id, StompError::Broker(err.clone()))
                        .await;
                }
                Err(StompError::Broker(err))
            }
            other => Err(StompError::Protocol(format!(
                "unexpected {} frame while connected",
                other
            ))),
        }
    }
}

fn handshake_error(err: StompError) -> StompError {
    match err {
        StompError::Io(e) => ConnectError::Io(e).into(),
        StompError::Connect(e) => e.into(),
        other => ConnectError::Handshake(other.to_string()).into(),
    }
}

/// How often the heartbeat task wakes up: a quarter of the shortest
/// enabled interval, or `None` when both directions are off.
fn heartbeat_tick(monitor: &HeartbeatMonitor) -> Option<Duration> {
    [monitor.outgoing(), monitor.incoming_deadline()]
        .into_iter()
        .flatten()
        .min()
        .map(|d| (d / 4).max(Duration::from_millis(5)))
}

async fn read_loop(
    inner: Weak<Inner>,
    mut stream: FrameStream,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let item = tokio::select! {
            _ = shutdown.recv() => break,
            item = stream.next() => item,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match item {
            Some(Ok(StompItem::Heartbeat)) => inner.heartbeat.record_received(),
            Some(Ok(StompItem::Frame(frame))) => {
                inner.heartbeat.record_received();
                if let Err(e) = inner.route(frame).await {
                    inner.fail(e).await;
                    break;
                }
            }
            Some(Err(e)) => {
                inner.fail(e).await;
                break;
            }
            None => {
                inner
                    .fail(StompError::Io(Arc::new(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ))))
                    .await;
                break;
            }
        }
    }
}

async fn heartbeat_loop(inner: Weak<Inner>, mut shutdown: broadcast::Receiver<()>, tick: Duration) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.heartbeat.incoming_expired() {
            let deadline = inner.heartbeat.incoming_deadline().unwrap_or_default();
            inner.fail(StompError::HeartbeatTimeout(deadline)).await;
            break;
        }
        if inner.heartbeat.outgoing_due() && inner.write(StompItem::Heartbeat).await.is_err() {
            break;
        }
    }
}
