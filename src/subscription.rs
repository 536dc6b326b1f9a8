use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};

use crate::connection::Connection;
use crate::error::StompError;
use crate::frame::Frame;
use crate::message::Message;

/// Subscription acknowledgement modes as defined by STOMP 1.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    #[default]
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckMode {
    type Err = StompError;

    /// Accepts `""`/`"auto"`, `"client"` and `"client-individual"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "client-individual" => Ok(AckMode::ClientIndividual),
            other => Err(StompError::Subscription(format!(
                "ack mode should be 'auto', 'client' or 'client-individual', got '{}'",
                other
            ))),
        }
    }
}

/// Options for `subscribe`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub ack: AckMode,
    /// Caller-chosen subscription id; generated when `None`.
    pub id: Option<String>,
    /// Extra SUBSCRIBE headers (selectors, durable names, ...).
    pub headers: Vec<(String, String)>,
    /// Wait for a RECEIPT before returning.
    pub receipt: bool,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ack(mut self, ack: AckMode) -> Self {
        self.ack = ack;
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
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

impl From<AckMode> for SubscribeOptions {
    fn from(ack: AckMode) -> Self {
        Self::default().ack(ack)
    }
}

/// What a deferred subscription hands to its owner: a message, or the
/// fatal error that ended the subscription.
pub type Delivery = Result<Message, StompError>;

/// Enqueue-only callback used for listener subscriptions.
///
/// The reader calls it for every message; it must only hand the delivery
/// to the owning context (see [`crate::client::VirtualContext`]) and never
/// run script code itself.
pub type DeferredSink = Arc<dyn Fn(Delivery) + Send + Sync>;

pub(crate) enum DeliveryTarget {
    Queue(mpsc::Sender<Message>),
    Deferred(DeferredSink),
}

#[derive(Debug, Clone)]
pub(crate) enum CloseReason {
    Unsubscribed,
    ConnectionClosed,
    Failed(StompError),
}

/// State shared between the registry entry and the caller's handle.
#[derive(Debug)]
pub(crate) struct SubscriptionShared {
    id: String,
    destination: String,
    ack: AckMode,
    closed: watch::Sender<Option<CloseReason>>,
}

impl SubscriptionShared {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// Record why the subscription ended; the first reason sticks.
    fn close(&self, reason: CloseReason) {
        self.closed.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    fn error_for(&self, reason: &CloseReason) -> StompError {
        match reason {
            CloseReason::Unsubscribed => StompError::Unsubscribed(self.id.clone()),
            CloseReason::ConnectionClosed => StompError::ConnectionClosed,
            CloseReason::Failed(err) => err.clone(),
        }
    }

    fn close_error(&self) -> Option<StompError> {
        self.closed.borrow().as_ref().map(|r| self.error_for(r))
    }
}

pub(crate) struct SubscriptionEntry {
    shared: Arc<SubscriptionShared>,
    target: DeliveryTarget,
    /// Delivered but un-acked message ids, oldest first. Empty for `auto`.
    outstanding: VecDeque<String>,
}

/// Result of registering a subscription.
pub(crate) struct Registered {
    pub(crate) shared: Arc<SubscriptionShared>,
    pub(crate) receiver: Option<mpsc::Receiver<Message>>,
}

/// Per-connection map of subscription id to entry.
pub(crate) struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, SubscriptionEntry>>,
    counter: AtomicU64,
    capacity: usize,
}

impl SubscriptionRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Register a subscription. With `deferred` the messages go to the sink,
    /// otherwise to a bounded read queue whose receiver is returned.
    pub(crate) async fn register(
        &self,
        id: Option<String>,
        destination: &str,
        ack: AckMode,
        deferred: Option<DeferredSink>,
    ) -> Result<Registered, StompError> {
        let mut entries = self.entries.lock().await;
        let id = match id {
            Some(id) if entries.contains_key(&id) => {
                return Err(StompError::Subscription(format!(
                    "subscription id '{}' is already in use",
                    id
                )));
            }
            Some(id) if id.is_empty() => {
                return Err(StompError::Subscription(
                    "subscription id must not be empty".to_string(),
                ));
            }
            Some(id) => id,
            None => loop {
                let candidate = format!("sub-{}", self.counter.fetch_add(1, Ordering::SeqCst));
                if !entries.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        let (closed, _) = watch::channel(None);
        let shared = Arc::new(SubscriptionShared {
            id: id.clone(),
            destination: destination.to_string(),
            ack,
            closed,
        });
        let (target, receiver) = match deferred {
            Some(sink) => (DeliveryTarget::Deferred(sink), None),
            None => {
                let (tx, rx) = mpsc::channel(self.capacity);
                (DeliveryTarget::Queue(tx), Some(rx))
            }
        };
        entries.insert(
            id,
            SubscriptionEntry {
                shared: shared.clone(),
                target,
                outstanding: VecDeque::new(),
            },
        );
        Ok(Registered { shared, receiver })
    }

    /// Route a MESSAGE frame to its subscription.
    ///
    /// Messages for unknown subscriptions (e.g. in flight during an
    /// unsubscribe) are dropped. A full read queue blocks here, and so
    /// blocks the reader: that is the connection's backpressure point.
    /// A subscription whose read queue was dropped is removed along with
    /// its outstanding ids.
    pub(crate) async fn dispatch(&self, frame: Frame, connection_id: u64) -> bool {
        let Some(sub_id) = frame.get_header("subscription").map(str::to_string) else {
            tracing::warn!("dropping MESSAGE without subscription header");
            return false;
        };
        let message_id = frame.get_header("message-id").unwrap_or_default().to_string();

        let (message, target) = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(&sub_id) else {
                tracing::warn!(subscription = %sub_id, message_id = %message_id, "dropping MESSAGE for unknown subscription");
                return false;
            };
            let ack = entry.shared.ack;
            if ack != AckMode::Auto {
                if message_id.is_empty() {
                    tracing::warn!(subscription = %sub_id, "MESSAGE without message-id cannot be acknowledged");
                } else {
                    entry.outstanding.push_back(message_id.clone());
                }
            }
            let message = Message::new(frame, connection_id, sub_id.clone(), message_id, ack);
            let target = match &entry.target {
                DeliveryTarget::Queue(tx) => DeliveryTarget::Queue(tx.clone()),
                DeliveryTarget::Deferred(sink) => DeliveryTarget::Deferred(sink.clone()),
            };
            (message, target)
        };

        match target {
            DeliveryTarget::Queue(tx) => {
                if let Err(mpsc::error::SendError(message)) = tx.send(message).await {
                    tracing::debug!(subscription = %sub_id, message_id = %message.message_id(), "read queue dropped, removing subscription");
                    self.discard(&sub_id).await;
                    return false;
                }
            }
            DeliveryTarget::Deferred(sink) => sink(Ok(message)),
        }
        true
    }

    /// Settle `message_id` in the subscription's outstanding set.
    ///
    /// `client` mode settles the message and every earlier one;
    /// `client-individual` settles exactly that message.
    pub(crate) async fn acknowledge(
        &self,
        subscription: &str,
        message_id: &str,
    ) -> Result<AckMode, StompError> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(subscription) else {
            return Err(StompError::Subscription(format!(
                "unknown subscription '{}'",
                subscription
            )));
        };
        let ack = entry.shared.ack;
        if ack == AckMode::Auto {
            return Err(StompError::AckMode(format!(
                "subscription '{}' uses auto acknowledgement",
                subscription
            )));
        }
        let Some(pos) = entry.outstanding.iter().position(|id| id == message_id) else {
            return Err(StompError::AckMode(format!(
                "message '{}' is not outstanding on subscription '{}'",
                message_id, subscription
            )));
        };
        match ack {
            AckMode::Client => {
                entry.outstanding.drain(..=pos);
            }
            _ => {
                entry.outstanding.remove(pos);
            }
        }
        Ok(ack)
    }

    /// Remove a subscription; a blocked read on it fails with `Unsubscribed`.
    pub(crate) async fn remove(&self, id: &str) -> Option<Arc<SubscriptionShared>> {
        let entry = self.entries.lock().await.remove(id)?;
        entry.shared.close(CloseReason::Unsubscribed);
        Some(entry.shared)
    }

    /// Drop a subscription whose read queue is gone, with everything it
    /// still had outstanding.
    async fn discard(&self, id: &str) {
        let entry = self.entries.lock().await.remove(id);
        if let Some(entry) = entry {
            entry.shared.close(CloseReason::Unsubscribed);
        }
    }

    /// Discard every subscription. Deferred targets receive a `Failed`
    /// reason as one final error delivery.
    pub(crate) async fn close_all(&self, reason: CloseReason) {
        let drained: Vec<SubscriptionEntry> = {
            let mut entries = self.entries.lock().await;
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.shared.close(reason.clone());
            if let (DeliveryTarget::Deferred(sink), CloseReason::Failed(err)) =
                (&entry.target, &reason)
            {
                sink(Err(err.clone()));
            }
        }
    }

    pub(crate) async fn outstanding(&self, id: &str) -> Option<Vec<String>> {
        let entries = self.entries.lock().await;
        entries
            .get(id)
            .map(|e| e.outstanding.iter().cloned().collect())
    }

    pub(crate) async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// A subscription handle returned from [`Connection::subscribe`].
///
/// Queue subscriptions are drained with [`read`](Self::read). Subscriptions
/// created with a deferred sink have no read queue.
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
    receiver: Option<Mutex<mpsc::Receiver<Message>>>,
    conn: Connection,
}

impl Subscription {
    pub(crate) fn new(registered: Registered, conn: Connection) -> Self {
        Self {
            shared: registered.shared,
            receiver: registered.receiver.map(Mutex::new),
            conn,
        }
    }

    /// Returns the subscription id.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Returns the destination this subscription listens to.
    pub fn destination(&self) -> &str {
        &self.shared.destination
    }

    pub fn ack_mode(&self) -> AckMode {
        self.shared.ack
    }

    /// Whether the subscription is still registered with the connection.
    pub fn is_active(&self) -> bool {
        self.shared.closed.borrow().is_none()
    }

    /// Wait for the next message.
    ///
    /// Fails with `Unsubscribed` once the subscription is removed, with the
    /// connection's error once it closes or fails, and with `ReadTimeout`
    /// when `timeout` elapses first. Only the calling task is suspended.
    pub async fn read(&self, timeout: Option<Duration>) -> Result<Message, StompError> {
        let Some(receiver) = &self.receiver else {
            return Err(StompError::Subscription(format!(
                "subscription '{}' delivers to a listener and cannot be read",
                self.shared.id
            )));
        };
        let mut closed = self.shared.closed.subscribe();
        let next = async {
            let mut rx = receiver.lock().await;
            tokio::select! {
                biased;
                reason = closed.wait_for(Option::is_some) => Err(match reason {
                    Ok(reason) => reason
                        .as_ref()
                        .map(|r| self.shared.error_for(r))
                        .unwrap_or(StompError::ConnectionClosed),
                    Err(_) => StompError::ConnectionClosed,
                }),
                message = rx.recv() => message.ok_or_else(|| {
                    self.shared.close_error().unwrap_or(StompError::ConnectionClosed)
                }),
            }
        };
        match timeout {
            Some(t) => tokio::time::timeout(t, next)
                .await
                .map_err(|_| StompError::ReadTimeout(t))?,
            None => next.await,
        }
    }

    /// Send UNSUBSCRIBE and remove the subscription.
    pub async fn unsubscribe(&self) -> Result<(), StompError> {
        self.conn.unsubscribe(&self.shared.id).await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("destination", &self.shared.destination)
            .field("ack", &self.shared.ack)
            .finish()
    }
}
