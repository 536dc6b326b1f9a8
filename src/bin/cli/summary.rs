use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use stomp_vu::{ConnectError, StompError};

use super::exit_codes;

/// Outcome counters for one virtual user, merged into the run total.
#[derive(Debug, Default)]
pub struct Summary {
    pub vus: usize,
    pub connected: usize,
    pub connect_failures: usize,
    pub rejected: usize,
    pub iterations: usize,
    pub sent: usize,
    pub received: usize,
    pub acked: usize,
    pub errors: BTreeMap<&'static str, usize>,
    pub round_trips: Vec<Duration>,
    pub elapsed: Duration,
}

impl Summary {
    pub fn record_error(&mut self, err: &StompError) {
        *self.errors.entry(error_kind(err)).or_insert(0) += 1;
    }

    pub fn record_connect_error(&mut self, err: &StompError) {
        match err {
            StompError::Connect(ConnectError::Rejected(_)) => self.rejected += 1,
            _ => self.connect_failures += 1,
        }
        self.record_error(err);
    }

    pub fn merge(&mut self, other: Summary) {
        self.vus += other.vus;
        self.connected += other.connected;
        self.connect_failures += other.connect_failures;
        self.rejected += other.rejected;
        self.iterations += other.iterations;
        self.sent += other.sent;
        self.received += other.received;
        self.acked += other.acked;
        for (kind, count) in other.errors {
            *self.errors.entry(kind).or_insert(0) += count;
        }
        self.round_trips.extend(other.round_trips);
    }

    pub fn exit_code(&self) -> u8 {
        if self.rejected > 0 {
            exit_codes::AUTH_ERROR
        } else if self.connected == 0 && self.connect_failures > 0 {
            exit_codes::NETWORK_ERROR
        } else if self.errors.values().sum::<usize>() > 0 {
            exit_codes::PROTOCOL_ERROR
        } else {
            exit_codes::SUCCESS
        }
    }

    fn percentile(&self, p: f64) -> Option<Duration> {
        if self.round_trips.is_empty() {
            return None;
        }
        let mut sorted = self.round_trips.clone();
        sorted.sort();
        let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
        sorted.get(idx).copied()
    }
}

/// Stable label for an error in the summary table.
fn error_kind(err: &StompError) -> &'static str {
    match err {
        StompError::Connect(ConnectError::Timeout(_)) => "connect timeout",
        StompError::Connect(ConnectError::Rejected(_)) => "connect rejected",
        StompError::Connect(_) => "connect",
        StompError::Protocol(_) => "protocol",
        StompError::Broker(_) => "broker",
        StompError::ReceiptTimeout(_) => "receipt timeout",
        StompError::HeartbeatTimeout(_) => "heartbeat timeout",
        StompError::State { .. } => "state",
        StompError::AckMode(_) => "ack mode",
        StompError::Subscription(_) => "subscription",
        StompError::Unsubscribed(_) => "unsubscribed",
        StompError::ConnectionClosed => "connection closed",
        StompError::ReadTimeout(_) => "read timeout",
        StompError::Config(_) => "config",
        StompError::Io(_) => "io",
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== stomp-vu summary ===")?;
        writeln!(f, "duration:          {:.2?}", self.elapsed)?;
        writeln!(f, "virtual users:     {}", self.vus)?;
        writeln!(
            f,
            "connected:         {} (failed {}, rejected {})",
            self.connected, self.connect_failures, self.rejected
        )?;
        writeln!(f, "iterations:        {}", self.iterations)?;
        writeln!(f, "messages sent:     {}", self.sent)?;
        writeln!(f, "messages received: {}", self.received)?;
        writeln!(f, "messages acked:    {}", self.acked)?;
        if let (Some(p50), Some(p95), Some(max)) =
            (self.percentile(0.5), self.percentile(0.95), self.percentile(1.0))
        {
            writeln!(f, "round trip:        p50 {:.2?}  p95 {:.2?}  max {:.2?}", p50, p95, max)?;
        }
        if self.errors.is_empty() {
            write!(f, "errors:            none")
        } else {
            write!(f, "errors:")?;
            for (kind, count) in &self.errors {
                write!(f, "\n  {:<18} {}", kind, count)?;
            }
            Ok(())
        }
    }
}
