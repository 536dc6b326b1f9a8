//! Heartbeat proposal, negotiation and liveness tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Default multiplier applied to the negotiated incoming interval before
/// the connection is declared dead.
pub const DEFAULT_GRACE: f64 = 2.0;

/// Client heartbeat proposal, sent as the CONNECT `heart-beat` header.
///
/// `send_ms` is how often the client offers to send heartbeats and
/// `receive_ms` how often it wants to receive them. Zero disables the
/// direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub send_ms: u64,
    pub receive_ms: u64,
}

impl Heartbeat {
    pub fn new(send_ms: u64, receive_ms: u64) -> Self {
        Self {
            send_ms,
            receive_ms,
        }
    }

    /// No heartbeats in either direction.
    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    /// Same interval in both directions.
    pub fn from_duration(interval: Duration) -> Self {
        let ms = interval.as_millis() as u64;
        Self::new(ms, ms)
    }

    /// Build from optional outgoing/incoming durations; `None` disables.
    pub fn from_intervals(outgoing: Option<Duration>, incoming: Option<Duration>) -> Self {
        let ms = |d: Option<Duration>| d.map(|d| d.as_millis() as u64).unwrap_or(0);
        Self::new(ms(outgoing), ms(incoming))
    }
}

impl Default for Heartbeat {
    /// One minute in each direction.
    fn default() -> Self {
        Self::new(60_000, 60_000)
    }
}

impl fmt::Display for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.send_ms, self.receive_ms)
    }
}

/// Parse the STOMP `heart-beat` header value (format: "cx,cy").
///
/// Returns `(cx, cy)` in milliseconds. Missing or invalid fields default
/// to `0`.
pub fn parse_heartbeat_header(header: &str) -> (u64, u64) {
    let mut parts = header.split(',');
    let cx = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let cy = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    (cx, cy)
}

/// Negotiate heartbeat intervals between client and server.
///
/// Parameters
/// - `client_out`: client's outgoing offer (cx of the CONNECT header).
/// - `client_in`: client's desired incoming interval (cy).
/// - `server_out`: server's outgoing offer (sx of the CONNECTED header).
/// - `server_in`: server's desired incoming interval (sy).
///
/// Returns `(outgoing, incoming)`. A direction is enabled only when both
/// sides are non-zero for it; the interval is then the larger of the two so
/// that neither side is asked to go faster than it agreed to.
pub fn negotiate_heartbeats(
    client_out: u64,
    client_in: u64,
    server_out: u64,
    server_in: u64,
) -> (Option<Duration>, Option<Duration>) {
    let agree = |ours: u64, theirs: u64| {
        if ours == 0 || theirs == 0 {
            None
        } else {
            Some(Duration::from_millis(ours.max(theirs)))
        }
    };
    (agree(client_out, server_in), agree(client_in, server_out))
}

/// Liveness bookkeeping for one connection.
///
/// The writer calls [`record_sent`](Self::record_sent) after every frame or
/// heartbeat, the reader calls [`record_received`](Self::record_received) for
/// everything it decodes. The heartbeat task polls
/// [`outgoing_due`](Self::outgoing_due) and
/// [`incoming_expired`](Self::incoming_expired).
#[derive(Debug)]
pub struct HeartbeatMonitor {
    origin: Instant,
    outgoing: Option<Duration>,
    incoming: Option<Duration>,
    grace: f64,
    last_sent: AtomicU64,
    last_received: AtomicU64,
}

impl HeartbeatMonitor {
    pub fn new(outgoing: Option<Duration>, incoming: Option<Duration>, grace: f64) -> Self {
        Self {
            origin: Instant::now(),
            outgoing,
            incoming,
            grace,
            last_sent: AtomicU64::new(0),
            last_received: AtomicU64::new(0),
        }
    }

    /// Monitor with both directions disabled.
    pub fn disabled() -> Self {
        Self::new(None, None, DEFAULT_GRACE)
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    pub fn outgoing(&self) -> Option<Duration> {
        self.outgoing
    }

    pub fn incoming(&self) -> Option<Duration> {
        self.incoming
    }

    /// How long the peer may stay silent: incoming interval × grace.
    pub fn incoming_deadline(&self) -> Option<Duration> {
        self.incoming.map(|d| d.mul_f64(self.grace))
    }

    pub fn record_sent(&self) {
        self.last_sent.store(self.now_ms(), Ordering::SeqCst);
    }

    pub fn record_received(&self) {
        self.last_received.store(self.now_ms(), Ordering::SeqCst);
    }

    /// True when outgoing heartbeats are enabled and nothing was written
    /// for a full interval.
    pub fn outgoing_due(&self) -> bool {
        let Some(interval) = self.outgoing else {
            return false;
        };
        let last = self.last_sent.load(Ordering::SeqCst);
        self.now_ms().saturating_sub(last) >= interval.as_millis() as u64
    }

    /// True when incoming heartbeats are enabled and nothing arrived within
    /// the deadline.
    pub fn incoming_expired(&self) -> bool {
        let Some(deadline) = self.incoming_deadline() else {
            return false;
        };
        let last = self.last_received.load(Ordering::SeqCst);
        self.now_ms().saturating_sub(last) > deadline.as_millis() as u64
    }
}
