//! Client configuration and its loose-document parsing.

use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::StompError;
use crate::heartbeat::{DEFAULT_GRACE, Heartbeat};

/// Heartbeat interval proposed for a direction that is not configured.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_CHANNEL_CAPACITY: usize = 1024;

/// Transport used to reach the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tls",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, Protocol::Ws | Protocol::Wss)
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Protocol::Tls | Protocol::Wss)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = StompError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "tcp" => Ok(Protocol::Tcp),
            "tls" | "ssl" => Ok(Protocol::Tls),
            "ws" => Ok(Protocol::Ws),
            "wss" => Ok(Protocol::Wss),
            other => Err(StompError::Config(format!(
                "protocol should be 'tcp', 'tls', 'ws' or 'wss', got '{}'",
                other
            ))),
        }
    }
}

/// Proposed heartbeat intervals.
///
/// A direction left as `None` is proposed at [`DEFAULT_HEARTBEAT`]; a zero
/// duration disables it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatConfig {
    pub incoming: Option<Duration>,
    pub outgoing: Option<Duration>,
    /// Multiplier on the negotiated incoming interval before the peer is
    /// considered dead.
    pub grace: f64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            incoming: None,
            outgoing: None,
            grace: DEFAULT_GRACE,
        }
    }
}

impl HeartbeatConfig {
    /// The `heart-beat` value sent with CONNECT.
    pub fn proposal(&self) -> Heartbeat {
        Heartbeat::from_intervals(
            Some(self.outgoing.unwrap_or(DEFAULT_HEARTBEAT)),
            Some(self.incoming.unwrap_or(DEFAULT_HEARTBEAT)),
        )
    }
}

/// Everything needed to open one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub protocol: Protocol,
    /// `host:port` of the broker.
    pub addr: String,
    /// WebSocket endpoint path.
    pub path: String,
    /// WebSocket URL query, without the leading `?`.
    pub query: Option<String>,
    /// Bound on transport open plus STOMP handshake.
    pub timeout: Duration,
    /// Wrap the selected transport in TLS (`tcp` becomes `tls`, `ws` becomes `wss`).
    pub tls: bool,
    pub insecure_skip_tls_verify: bool,
    /// Extra CONNECT headers, also sent on the WebSocket upgrade request.
    pub headers: BTreeMap<String, String>,
    /// Virtual host for CONNECT; defaults to the host part of `addr`.
    pub host: Option<String>,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub heartbeat: HeartbeatConfig,
    /// Bound on a SEND that waits for its receipt.
    pub message_send_timeout: Duration,
    /// Bound on every other receipt-bearing operation.
    pub receipt_timeout: Duration,
    /// Bound on DISCONNECT waiting for its receipt.
    pub disconnect_timeout: Duration,
    /// Per-subscription read queue capacity.
    pub read_channel_capacity: usize,
    /// Log every wire item under the `stomp_vu::wire` target.
    pub verbose: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            addr: String::new(),
            path: String::new(),
            query: None,
            timeout: DEFAULT_CONNECT_TIMEOUT,
            tls: false,
            insecure_skip_tls_verify: false,
            headers: BTreeMap::new(),
            host: None,
            user: None,
            pass: None,
            heartbeat: HeartbeatConfig::default(),
            message_send_timeout: DEFAULT_SEND_TIMEOUT,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            read_channel_capacity: DEFAULT_READ_CHANNEL_CAPACITY,
            verbose: false,
        }
    }
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn login(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.pass = Some(pass.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Propose heartbeat intervals; `Duration::ZERO` disables a direction.
    pub fn heartbeat(mut self, outgoing: Duration, incoming: Duration) -> Self {
        self.heartbeat.outgoing = Some(outgoing);
        self.heartbeat.incoming = Some(incoming);
        self
    }

    pub fn heartbeat_grace(mut self, grace: f64) -> Self {
        self.heartbeat.grace = grace;
        self
    }

    pub fn receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    pub fn message_send_timeout(mut self, timeout: Duration) -> Self {
        self.message_send_timeout = timeout;
        self
    }

    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Protocol after applying the `tls` flag.
    pub fn effective_protocol(&self) -> Protocol {
        match (self.protocol, self.tls) {
            (Protocol::Tcp, true) => Protocol::Tls,
            (Protocol::Ws, true) => Protocol::Wss,
            (p, _) => p,
        }
    }

    /// Host part of `addr`, without port or IPv6 brackets.
    pub fn addr_host(&self) -> &str {
        let addr = self.addr.as_str();
        if let Some(rest) = addr.strip_prefix('[') {
            return rest.split(']').next().unwrap_or(rest);
        }
        match addr.rsplit_once(':') {
            Some((host, _)) if !host.contains(':') => host,
            _ => addr,
        }
    }

    /// Value of the CONNECT `host` header.
    pub fn host_header(&self) -> &str {
        self.host.as_deref().unwrap_or_else(|| self.addr_host())
    }

    /// URL used for the WebSocket upgrade.
    pub fn websocket_url(&self) -> String {
        let scheme = if self.effective_protocol().is_tls() {
            "wss"
        } else {
            "ws"
        };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        match self.query.as_deref().map(|q| q.trim_start_matches('?')) {
            Some(q) if !q.is_empty() => format!("{}://{}{}?{}", scheme, self.addr, path, q),
            _ => format!("{}://{}{}", scheme, self.addr, path),
        }
    }

    /// Reject configurations no connection could use.
    pub fn validate(&self) -> Result<(), StompError> {
        if self.addr.trim().is_empty() {
            return Err(StompError::Config("addr is required".to_string()));
        }
        if !(self.heartbeat.grace.is_finite() && self.heartbeat.grace >= 1.0) {
            return Err(StompError::Config(format!(
                "heartbeat.grace must be at least 1.0, got {}",
                self.heartbeat.grace
            )));
        }
        if self.read_channel_capacity == 0 {
            return Err(StompError::Config(
                "readChannelCapacity must be greater than zero".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(StompError::Config("timeout must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// Parse a loose JSON document such as a script would pass to `connect`.
    ///
    /// Unknown keys are logged with `warn!` and otherwise ignored.
    pub fn from_value(value: &Value) -> Result<Self, StompError> {
        let (config, warnings) = Self::from_value_with_warnings(value)?;
        for warning in warnings {
            tracing::warn!("{}", warning);
        }
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self, StompError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| StompError::Config(format!("invalid JSON: {}", e)))?;
        Self::from_value(&value)
    }

    /// Like [`from_value`](Self::from_value) but returns the warnings instead
    /// of logging them.
    pub fn from_value_with_warnings(value: &Value) -> Result<(Self, Vec<String>), StompError> {
        let raw = RawConfig::deserialize(value)
            .map_err(|e| StompError::Config(e.to_string()))?;
        let mut warnings = Vec::new();
        let mut config = ClientConfig::default();

        for key in raw.unknown.keys() {
            warnings.push(format!("unknown configuration key '{}' ignored", key));
        }
        for (key, present) in [
            ("readBufferSize", raw.read_buffer_size.is_some()),
            ("writeBufferSize", raw.write_buffer_size.is_some()),
            ("writeChannelCapacity", raw.write_channel_capacity.is_some()),
        ] {
            if present {
                warnings.push(format!("configuration key '{}' has no effect", key));
            }
        }

        if let Some(protocol) = raw.protocol {
            config.protocol = protocol.parse()?;
        }
        config.addr = raw.addr.unwrap_or_default();
        config.path = raw.path.unwrap_or_default();
        config.query = raw.query.filter(|q| !q.is_empty());
        if let Some(timeout) = raw.timeout {
            config.timeout = timeout.into_duration("timeout")?;
        }
        config.tls = raw.tls.unwrap_or(false);
        config.insecure_skip_tls_verify = raw.insecure_skip_tls_verify.unwrap_or(false);
        config.headers = raw.headers.unwrap_or_default();
        config.host = raw.host.filter(|h| !h.is_empty());
        config.user = raw.user.filter(|u| !u.is_empty());
        config.pass = raw.pass.filter(|p| !p.is_empty());

        if let Some(hb) = raw.heartbeat {
            for key in hb.unknown.keys() {
                warnings.push(format!("unknown configuration key 'heartbeat.{}' ignored", key));
            }
            config.heartbeat.incoming = hb
                .incoming
                .map(|d| d.into_duration("heartbeat.incoming"))
                .transpose()?;
            config.heartbeat.outgoing = hb
                .outgoing
                .map(|d| d.into_duration("heartbeat.outgoing"))
                .transpose()?;
            if let Some(grace) = hb.grace {
                config.heartbeat.grace = grace;
            }
        }

        if let Some(d) = raw.message_send_timeout {
            config.message_send_timeout = d.into_duration("messageSendTimeout")?;
        }
        if let Some(d) = raw.receipt_timeout {
            config.receipt_timeout = d.into_duration("receiptTimeout")?;
        }
        if let Some(d) = raw.disconnect_timeout {
            config.disconnect_timeout = d.into_duration("disconnectTimeout")?;
        }
        if let Some(capacity) = raw.read_channel_capacity.filter(|c| *c > 0) {
            config.read_channel_capacity = capacity;
        }
        config.verbose = raw.verbose.unwrap_or(false);

        Ok((config, warnings))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    protocol: Option<String>,
    addr: Option<String>,
    path: Option<String>,
    query: Option<String>,
    timeout: Option<DurationValue>,
    tls: Option<bool>,
    #[serde(alias = "insecure_skip_tls_verify", alias = "insecureSkipTLSVerify")]
    insecure_skip_tls_verify: Option<bool>,
    headers: Option<BTreeMap<String, String>>,
    host: Option<String>,
    user: Option<String>,
    pass: Option<String>,
    heartbeat: Option<RawHeartbeat>,
    #[serde(alias = "message_send_timeout")]
    message_send_timeout: Option<DurationValue>,
    #[serde(alias = "receipt_timeout")]
    receipt_timeout: Option<DurationValue>,
    #[serde(alias = "disconnect_timeout")]
    disconnect_timeout: Option<DurationValue>,
    #[serde(alias = "read_channel_capacity")]
    read_channel_capacity: Option<usize>,
    #[serde(alias = "read_buffer_size")]
    read_buffer_size: Option<usize>,
    #[serde(alias = "write_buffer_size")]
    write_buffer_size: Option<usize>,
    #[serde(alias = "write_channel_capacity")]
    write_channel_capacity: Option<usize>,
    verbose: Option<bool>,
    #[serde(flatten)]
    unknown: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawHeartbeat {
    incoming: Option<DurationValue>,
    outgoing: Option<DurationValue>,
    grace: Option<f64>,
    #[serde(flatten)]
    unknown: HashMap<String, Value>,
}

/// A duration as written in a config document: integer milliseconds or a
/// Go-style string such as `"1m30s"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DurationValue {
    Millis(u64),
    Text(String),
}

impl DurationValue {
    fn into_duration(self, key: &str) -> Result<Duration, StompError> {
        match self {
            DurationValue::Millis(ms) => Ok(Duration::from_millis(ms)),
            DurationValue::Text(text) => parse_duration(&text)
                .map_err(|e| StompError::Config(format!("{}: {}", key, e))),
        }
    }
}

/// Parse a Go-style duration: a sequence of decimal numbers with a unit
/// (`ns`, `us`/`µs`, `ms`, `s`, `m`, `h`), e.g. `"300ms"`, `"1.5h"`,
/// `"2h45m"`. A bare `"0"` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.starts_with('-') {
        return Err(format!("negative duration '{}'", input));
    }
    let s = s.strip_prefix('+').unwrap_or(s);

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration '{}'", input))?;
        if num_end == 0 {
            return Err(format!("invalid duration '{}'", input));
        }
        let number: f64 = rest[..num_end]
            .parse()
            .map_err(|_| format!("invalid number in duration '{}'", input))?;
        rest = &rest[num_end..];
        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1e-9,
            "us" | "µs" | "μs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => return Err(format!("unknown unit '{}' in duration '{}'", unit, input)),
        };
        total += number * scale;
        rest = &rest[unit_end..];
    }
    Duration::try_from_secs_f64(total).map_err(|e| format!("duration '{}' out of range: {}", input, e))
}
