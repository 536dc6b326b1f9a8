//! STOMP 1.2 client engine for load-testing virtual users.
//!
//! Each [`Connection`] owns one transport (TCP, TLS or WebSocket), a
//! background reader and a heartbeat task. [`client::VirtualContext`] and
//! [`client::Client`] put a synchronous, single-threaded face on it for
//! script-style callers.
//!
//! ```no_run
//! use stomp_vu::{AckMode, ClientConfig, Connection, SendOptions};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), stomp_vu::StompError> {
//! let conn = Connection::connect(ClientConfig::new("localhost:61613")).await?;
//! conn.send("/queue/a", "text/plain", "hello", SendOptions::new()).await?;
//! let sub = conn.subscribe("/queue/a", AckMode::Client).await?;
//! let msg = sub.read(Some(Duration::from_secs(5))).await?;
//! conn.ack(&msg).await?;
//! conn.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod message;
pub mod parser;
pub mod receipt;
pub mod subscription;
pub mod transaction;
pub mod transport;

pub use client::{Client, SyncSubscription, SyncTransaction, VirtualContext};
pub use codec::{StompCodec, StompItem};
pub use config::{ClientConfig, HeartbeatConfig, Protocol};
pub use connection::{Connection, ConnectionState, SendOptions, SessionInfo};
pub use error::{ConnectError, ServerError, StompError};
pub use frame::Frame;
pub use heartbeat::Heartbeat;
pub use message::Message;
pub use subscription::{AckMode, DeferredSink, Delivery, SubscribeOptions, Subscription};
pub use transaction::Transaction;
