use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::connection::ConnectionState;
use crate::frame::Frame;

/// Errors returned by every operation of the engine.
///
/// The enum is `Clone` so that one connection-fatal failure can be handed to
/// every pending waiter (receipts, blocked reads, error callbacks).
#[derive(Error, Debug, Clone)]
pub enum StompError {
    /// The connect attempt failed; the connection never reached `Connected`.
    #[error("connect failed: {0}")]
    Connect(#[from] ConnectError),
    /// Malformed frame or a command that is not valid in the current state.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The broker sent an ERROR frame.
    #[error(transparent)]
    Broker(#[from] ServerError),
    /// No RECEIPT arrived for the given receipt-id in time.
    #[error("receipt timeout: no RECEIPT received for '{0}' within timeout")]
    ReceiptTimeout(String),
    /// Nothing was received from the broker within the heartbeat deadline.
    #[error("heartbeat timeout: nothing received for {0:?}")]
    HeartbeatTimeout(Duration),
    /// The operation requires a `Connected` connection.
    #[error("cannot {operation} while {state}")]
    State {
        operation: &'static str,
        state: ConnectionState,
    },
    /// ack/nack on an `auto` subscription or for an unknown message.
    #[error("ack error: {0}")]
    AckMode(String),
    /// Invalid ack mode, duplicate id or unknown subscription.
    #[error("subscription error: {0}")]
    Subscription(String),
    /// The subscription a read was waiting on has been unsubscribed.
    #[error("subscription '{0}' was unsubscribed")]
    Unsubscribed(String),
    /// The connection was closed by `disconnect()`.
    #[error("connection closed")]
    ConnectionClosed,
    /// A subscription read gave up waiting.
    #[error("no message received within {0:?}")]
    ReadTimeout(Duration),
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// I/O-level error on an established transport.
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for StompError {
    fn from(err: io::Error) -> Self {
        StompError::Io(Arc::new(err))
    }
}

impl StompError {
    /// Whether this error moves a connection to `Failed`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StompError::Protocol(_)
                | StompError::Broker(_)
                | StompError::HeartbeatTimeout(_)
                | StompError::Io(_)
        )
    }
}

/// Failures of the connect attempt.
#[derive(Error, Debug, Clone)]
pub enum ConnectError {
    /// Transport open plus handshake did not complete within the timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Socket-level failure such as a refused connection.
    #[error("{0}")]
    Io(Arc<io::Error>),
    /// TLS configuration or handshake failure.
    #[error("tls: {0}")]
    Tls(String),
    /// WebSocket upgrade failure.
    #[error("websocket: {0}")]
    WebSocket(String),
    /// The broker answered CONNECT with an ERROR frame.
    #[error("rejected: {0}")]
    Rejected(ServerError),
    /// The broker closed the stream before sending CONNECTED.
    #[error("connection closed before CONNECTED")]
    Closed,
    /// CONNECTED did not negotiate STOMP 1.2, or an unexpected frame arrived.
    #[error("handshake: {0}")]
    Handshake(String),
}

impl From<io::Error> for ConnectError {
    fn from(err: io::Error) -> Self {
        ConnectError::Io(Arc::new(err))
    }
}

/// A STOMP ERROR frame sent by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// The `message` header, or "unknown error".
    pub message: String,
    /// Body decoded as UTF-8 (lossy), if non-empty.
    pub body: Option<String>,
    /// The `receipt-id` header, when the error answers a receipted frame.
    pub receipt_id: Option<String>,
    /// The original frame.
    pub frame: Frame,
}

impl ServerError {
    pub fn from_frame(frame: Frame) -> Self {
        let message = frame
            .get_header("message")
            .unwrap_or("unknown error")
            .to_string();
        let body = if frame.body.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&frame.body).into_owned())
        };
        let receipt_id = frame.get_header("receipt-id").map(str::to_string);
        Self {
            message,
            body,
            receipt_id,
            frame,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "STOMP server error: {}", self.message)?;
        if let Some(body) = &self.body {
            write!(f, ": {}", body)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}
