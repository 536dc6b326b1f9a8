use std::fmt;

/// Headers whose values are worth showing in a one-line frame summary.
const SUMMARY_HEADERS: &[&str] = &[
    "destination",
    "id",
    "subscription",
    "message-id",
    "receipt",
    "receipt-id",
    "transaction",
    "message",
];

/// One STOMP frame: command, ordered headers and raw body.
///
/// Header names may repeat on the wire and are kept in arrival order;
/// [`get_header`](Self::get_header) returns the first occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Append a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Append every pair from `headers`, keeping their order.
    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Ask the broker to confirm this frame with a RECEIPT.
    pub fn receipt(self, receipt_id: impl Into<String>) -> Self {
        self.header("receipt", receipt_id)
    }

    pub fn set_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find_map(|(k, v)| (k == key).then_some(v.as_str()))
    }

    /// The body cannot be NUL-terminated (it holds a NUL or is not text),
    /// so the encoder must add `content-length`.
    pub fn needs_content_length(&self) -> bool {
        self.body.contains(&0) || std::str::from_utf8(&self.body).is_err()
    }
}

/// One line, e.g. `SEND destination=/queue/a receipt=rcpt-1 (5 bytes)`.
/// Credentials and custom headers are left out.
impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)?;
        for name in SUMMARY_HEADERS {
            if let Some(value) = self.get_header(name) {
                write!(f, " {}={}", name, value)?;
            }
        }
        write!(f, " ({} bytes)", self.body.len())
    }
}
