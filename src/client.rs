//! Synchronous facade for single-threaded script contexts.
//!
//! A [`VirtualContext`] stands for one cooperatively scheduled script
//! instance. It lives on its own OS thread and drives async work on a shared
//! tokio runtime through [`tokio::runtime::Handle::block_on`], so a blocking
//! call only parks that context's thread. Listener callbacks are queued by
//! the connection's reader and run only when the context reaches a safe
//! point ([`VirtualContext::run_pending`] or [`VirtualContext::sleep`]).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState, SendOptions};
use crate::error::StompError;
use crate::message::Message;
use crate::subscription::{AckMode, DeferredSink, Delivery, SubscribeOptions, Subscription};
use crate::transaction::Transaction;

/// Result of a message listener. An `Err` is logged and does not affect
/// the subscription.
pub type ListenerResult = Result<(), Box<dyn StdError>>;

type MessageCallback = Box<dyn FnMut(Message) -> ListenerResult>;
type ErrorCallback = Box<dyn FnMut(StompError)>;

struct ListenerSlot {
    destination: String,
    on_message: MessageCallback,
    on_error: Option<ErrorCallback>,
}

struct Event {
    listener: u64,
    delivery: Delivery,
}

struct ContextInner {
    runtime: Handle,
    events: mpsc::UnboundedSender<Event>,
    queue: RefCell<mpsc::UnboundedReceiver<Event>>,
    listeners: RefCell<HashMap<u64, Rc<RefCell<ListenerSlot>>>>,
    next_listener: Cell<u64>,
    draining: Cell<bool>,
}

/// One script context: owns its connections and runs their callbacks.
///
/// Not `Send`; create one per OS thread.
#[derive(Clone)]
pub struct VirtualContext {
    inner: Rc<ContextInner>,
}

impl VirtualContext {
    /// Create a context driving async work on `runtime`.
    ///
    /// Must be used from a thread that is not itself running inside the
    /// runtime.
    pub fn new(runtime: Handle) -> Self {
        let (events, queue) = mpsc::unbounded_channel();
        Self {
            inner: Rc::new(ContextInner {
                runtime,
                events,
                queue: RefCell::new(queue),
                listeners: RefCell::new(HashMap::new()),
                next_listener: Cell::new(1),
                draining: Cell::new(false),
            }),
        }
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.inner.runtime.block_on(future)
    }

    /// Connect a new client owned by this context.
    pub fn connect(&self, config: ClientConfig) -> Result<Client, StompError> {
        let conn = self.block_on(Connection::connect(config))?;
        Ok(Client {
            ctx: self.clone(),
            conn,
        })
    }

    /// Safe point: run every queued listener callback. Returns how many
    /// deliveries were handled. Calling it from inside a callback does
    /// nothing.
    pub fn run_pending(&self) -> usize {
        if self.inner.draining.replace(true) {
            return 0;
        }
        let mut handled = 0;
        loop {
            let next = self.inner.queue.borrow_mut().try_recv();
            match next {
                Ok(event) => {
                    self.dispatch(event);
                    handled += 1;
                }
                Err(_) => break,
            }
        }
        self.inner.draining.set(false);
        handled
    }

    /// Cooperative sleep: wait `duration`, running listener callbacks as
    /// their deliveries arrive. Returns how many deliveries were handled.
    pub fn sleep(&self, duration: Duration) -> usize {
        let deadline = Instant::now() + duration;
        let mut handled = self.run_pending();
        loop {
            let next = {
                let mut queue = self.inner.queue.borrow_mut();
                self.block_on(async { tokio::time::timeout_at(deadline, queue.recv()).await })
            };
            match next {
                Ok(Some(event)) => {
                    self.dispatch(event);
                    handled += 1;
                    handled += self.run_pending();
                }
                Ok(None) | Err(_) => break,
            }
        }
        handled
    }

    /// Number of deliveries waiting for the next safe point.
    pub fn pending(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    fn dispatch(&self, event: Event) {
        let slot = self.inner.listeners.borrow().get(&event.listener).cloned();
        let Some(slot) = slot else {
            tracing::debug!(listener = event.listener, "dropping delivery for removed listener");
            return;
        };
        let Ok(mut slot) = slot.try_borrow_mut() else {
            tracing::warn!(listener = event.listener, "listener is busy, delivery dropped");
            return;
        };
        match event.delivery {
            Ok(message) => {
                if let Err(e) = (slot.on_message)(message) {
                    tracing::warn!(destination = %slot.destination, error = %e, "listener returned an error");
                }
            }
            Err(err) => {
                match slot.on_error.as_mut() {
                    Some(on_error) => on_error(err),
                    None => {
                        tracing::warn!(destination = %slot.destination, error = %err, "subscription failed without error callback")
                    }
                }
                drop(slot);
                self.inner.listeners.borrow_mut().remove(&event.listener);
            }
        }
    }

    fn register_listener(&self, slot: ListenerSlot) -> (u64, DeferredSink) {
        let id = self.inner.next_listener.get();
        self.inner.next_listener.set(id + 1);
        self.inner
            .listeners
            .borrow_mut()
            .insert(id, Rc::new(RefCell::new(slot)));
        let events = self.inner.events.clone();
        let sink: DeferredSink = Arc::new(move |delivery| {
            let _ = events.send(Event {
                listener: id,
                delivery,
            });
        });
        (id, sink)
    }

    fn remove_listener(&self, id: u64) {
        self.inner.listeners.borrow_mut().remove(&id);
    }
}

/// Synchronous client owned by one [`VirtualContext`].
pub struct Client {
    ctx: VirtualContext,
    conn: Connection,
}

impl Client {
    /// Connect from a loose JSON configuration document.
    pub fn connect_value(
        ctx: &VirtualContext,
        config: &serde_json::Value,
    ) -> Result<Client, StompError> {
        ctx.connect(ClientConfig::from_value(config)?)
    }

    /// The async connection behind this client.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn server(&self) -> Option<&str> {
        self.conn.server()
    }

    pub fn session(&self) -> Option<&str> {
        self.conn.session()
    }

    pub fn version(&self) -> &str {
        self.conn.version()
    }

    pub fn heartbeat(&self) -> (Option<Duration>, Option<Duration>) {
        self.conn.heartbeat()
    }

    pub fn send(
        &self,
        destination: &str,
        content_type: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), StompError> {
        self.send_with(destination, content_type, body, SendOptions::default())
    }

    pub fn send_with(
        &self,
        destination: &str,
        content_type: &str,
        body: impl Into<Vec<u8>>,
        opts: SendOptions,
    ) -> Result<(), StompError> {
        self.ctx
            .block_on(self.conn.send(destination, content_type, body, opts))
    }

    /// Subscribe with a read queue. `opts` is an [`AckMode`] or full
    /// [`SubscribeOptions`].
    pub fn subscribe(
        &self,
        destination: &str,
        opts: impl Into<SubscribeOptions>,
    ) -> Result<SyncSubscription, StompError> {
        let sub = self.ctx.block_on(self.conn.subscribe(destination, opts))?;
        Ok(SyncSubscription {
            ctx: self.ctx.clone(),
            sub,
            listener: None,
        })
    }

    /// Subscribe with a listener instead of a read queue.
    ///
    /// `on_message` runs for each message and `on_error` once if the
    /// connection fails, both only at the context's safe points.
    pub fn subscribe_listener<F>(
        &self,
        destination: &str,
        opts: impl Into<SubscribeOptions>,
        on_message: F,
        on_error: Option<Box<dyn FnMut(StompError)>>,
    ) -> Result<SyncSubscription, StompError>
    where
        F: FnMut(Message) -> ListenerResult + 'static,
    {
        let (listener, sink) = self.ctx.register_listener(ListenerSlot {
            destination: destination.to_string(),
            on_message: Box::new(on_message),
            on_error,
        });
        match self
            .ctx
            .block_on(self.conn.subscribe_deferred(destination, opts, sink))
        {
            Ok(sub) => Ok(SyncSubscription {
                ctx: self.ctx.clone(),
                sub,
                listener: Some(listener),
            }),
            Err(e) => {
                self.ctx.remove_listener(listener);
                Err(e)
            }
        }
    }

    pub fn ack(&self, message: &Message) -> Result<(), StompError> {
        self.ctx.block_on(self.conn.ack(message))
    }

    pub fn nack(&self, message: &Message) -> Result<(), StompError> {
        self.ctx.block_on(self.conn.nack(message))
    }

    pub fn begin(&self) -> Result<SyncTransaction, StompError> {
        let tx = self.ctx.block_on(self.conn.begin())?;
        Ok(SyncTransaction {
            ctx: self.ctx.clone(),
            tx,
        })
    }

    /// Close the connection; idempotent.
    pub fn disconnect(&self) -> Result<(), StompError> {
        self.ctx.block_on(self.conn.disconnect())
    }
}

/// A subscription as seen from a [`VirtualContext`].
pub struct SyncSubscription {
    ctx: VirtualContext,
    sub: Subscription,
    listener: Option<u64>,
}

impl SyncSubscription {
    pub fn id(&self) -> &str {
        self.sub.id()
    }

    pub fn destination(&self) -> &str {
        self.sub.destination()
    }

    pub fn ack_mode(&self) -> AckMode {
        self.sub.ack_mode()
    }

    pub fn is_active(&self) -> bool {
        self.sub.is_active()
    }

    /// Block this context until a message arrives, `timeout` elapses, or
    /// the subscription or connection ends.
    pub fn read(&self, timeout: Option<Duration>) -> Result<Message, StompError> {
        self.ctx.block_on(self.sub.read(timeout))
    }

    pub fn unsubscribe(&self) -> Result<(), StompError> {
        if let Some(listener) = self.listener {
            self.ctx.remove_listener(listener);
        }
        self.ctx.block_on(self.sub.unsubscribe())
    }
}

/// A transaction as seen from a [`VirtualContext`].
pub struct SyncTransaction {
    ctx: VirtualContext,
    tx: Transaction,
}

impl SyncTransaction {
    pub fn id(&self) -> &str {
        self.tx.id()
    }

    pub fn send(
        &self,
        destination: &str,
        content_type: &str,
        body: impl Into<Vec<u8>>,
        opts: SendOptions,
    ) -> Result<(), StompError> {
        self.ctx
            .block_on(self.tx.send(destination, content_type, body, opts))
    }

    pub fn ack(&self, message: &Message) -> Result<(), StompError> {
        self.ctx.block_on(self.tx.ack(message))
    }

    pub fn nack(&self, message: &Message) -> Result<(), StompError> {
        self.ctx.block_on(self.tx.nack(message))
    }

    pub fn commit(&self) -> Result<(), StompError> {
        self.ctx.block_on(self.tx.commit())
    }

    pub fn abort(&self) -> Result<(), StompError> {
        self.ctx.block_on(self.tx.abort())
    }
}
