use serde_json::Value;

use crate::error::StompError;
use crate::frame::Frame;
use crate::subscription::AckMode;

/// A MESSAGE frame delivered to a subscription.
///
/// Besides the frame itself a `Message` remembers which connection and
/// subscription it arrived on, so `ack`/`nack` need nothing but the message.
#[derive(Debug, Clone)]
pub struct Message {
    frame: Frame,
    connection_id: u64,
    subscription: String,
    message_id: String,
    ack_mode: AckMode,
}

impl Message {
    pub(crate) fn new(
        frame: Frame,
        connection_id: u64,
        subscription: String,
        message_id: String,
        ack_mode: AckMode,
    ) -> Self {
        Self {
            frame,
            connection_id,
            subscription,
            message_id,
            ack_mode,
        }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.frame.get_header(name)
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.frame.headers
    }

    pub fn destination(&self) -> Option<&str> {
        self.header("destination")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Value for the `id` header of an ACK/NACK: the MESSAGE's `ack` header
    /// when present, otherwise its `message-id`.
    pub fn ack_id(&self) -> &str {
        self.header("ack").unwrap_or(&self.message_id)
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub(crate) fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Raw body bytes.
    pub fn body(&self) -> &[u8] {
        &self.frame.body
    }

    /// Body as UTF-8 text.
    pub fn text(&self) -> Result<&str, StompError> {
        std::str::from_utf8(&self.frame.body)
            .map_err(|e| StompError::Protocol(format!("message body is not utf8: {}", e)))
    }

    /// Body as text, replacing invalid UTF-8 sequences.
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.frame.body).into_owned()
    }

    /// Body parsed as JSON.
    pub fn json(&self) -> Result<Value, StompError> {
        if self.frame.body.is_empty() {
            return Err(StompError::Protocol(
                "message body is empty, cannot parse JSON".to_string(),
            ));
        }
        serde_json::from_slice(&self.frame.body)
            .map_err(|e| StompError::Protocol(format!("message body is not JSON: {}", e)))
    }

    /// Select a value inside the JSON body with a dotted path such as
    /// `"items.0.name"`. Returns `Ok(None)` when the path does not exist.
    pub fn json_select(&self, path: &str) -> Result<Option<Value>, StompError> {
        let root = self.json()?;
        let pointer: String = path
            .split('.')
            .filter(|segment| !segment.is_empty())
            .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
            .collect();
        Ok(root.pointer(&pointer).cloned())
    }
}
