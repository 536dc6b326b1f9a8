use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::StompError;
use crate::frame::Frame;
use crate::parser::{eol_len, parse_frame_slice, unescape_header_value};

/// STOMP 1.2 escaping for header names and values: `\\`, `\r`, `\n`
/// and `\c` for a colon.
pub fn escape_header_value(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            ':' => result.push_str("\\c"),
            _ => result.push(ch),
        }
    }
    result
}

/// CONNECT and CONNECTED headers are exempt from escaping in STOMP 1.2.
fn uses_escaping(command: &str) -> bool {
    command != "CONNECT" && command != "CONNECTED"
}

/// What travels over a transport: a frame or a bare heartbeat EOL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    Frame(Frame),
    /// `\n` on the way out; `\n` or `\r\n` at a frame boundary on the way in.
    Heartbeat,
}

/// Byte-stream codec for STOMP 1.2, used with `Framed` over TCP and TLS.
///
/// Bodies holding a NUL byte or non-UTF-8 data are written with
/// `content-length`; everything else is NUL-terminated.
#[derive(Debug, Default)]
pub struct StompCodec {}

impl StompCodec {
    pub fn new() -> Self {
        Self {}
    }
}

fn utf8(bytes: Vec<u8>, what: &str) -> Result<String, StompError> {
    String::from_utf8(bytes)
        .map_err(|e| StompError::Protocol(format!("invalid utf8 in {}: {}", what, e)))
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = StompError;

    /// Decode bytes from `src` into a `StompItem`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched when more bytes are
    /// required. A lone EOL at a frame boundary is a heartbeat; a frame whose
    /// command line is empty is a protocol error.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(n) = eol_len(src.chunk()) {
            src.advance(n);
            return Ok(Some(StompItem::Heartbeat));
        }
        if src.chunk() == b"\r" {
            return Ok(None);
        }

        let Some(raw) = parse_frame_slice(src.chunk()).map_err(StompError::Protocol)? else {
            return Ok(None);
        };
        src.advance(raw.consumed);

        let command = utf8(raw.command, "command")?;
        let escaped = uses_escaping(&command);
        let mut headers = Vec::with_capacity(raw.headers.len());
        for (k, v) in raw.headers {
            let (k, v) = if escaped {
                (
                    unescape_header_value(&k).map_err(StompError::Protocol)?,
                    unescape_header_value(&v).map_err(StompError::Protocol)?,
                )
            } else {
                (k, v)
            };
            headers.push((utf8(k, "header name")?, utf8(v, "header value")?));
        }

        Ok(Some(StompItem::Frame(Frame {
            command,
            headers,
            body: raw.body,
        })))
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = StompError;

    /// Encode a `StompItem` into `dst`.
    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            StompItem::Heartbeat => {
                dst.put_u8(b'\n');
            }
            StompItem::Frame(frame) => {
                if frame.command.is_empty() || frame.command.contains(['\n', '\r', '\0']) {
                    return Err(StompError::Protocol(format!(
                        "invalid command {:?}",
                        frame.command
                    )));
                }
                let escaped = uses_escaping(&frame.command);
                let needs_cl = frame.needs_content_length();

                dst.reserve(frame.command.len() + frame.body.len() + 64);
                dst.extend_from_slice(frame.command.as_bytes());
                dst.put_u8(b'\n');

                let mut has_cl = false;
                for (k, v) in &frame.headers {
                    has_cl |= k.eq_ignore_ascii_case("content-length");
                    if escaped {
                        dst.extend_from_slice(escape_header_value(k).as_bytes());
                        dst.put_u8(b':');
                        dst.extend_from_slice(escape_header_value(v).as_bytes());
                    } else {
                        dst.extend_from_slice(k.as_bytes());
                        dst.put_u8(b':');
                        dst.extend_from_slice(v.as_bytes());
                    }
                    dst.put_u8(b'\n');
                }
                if !has_cl && needs_cl {
                    dst.extend_from_slice(b"content-length:");
                    dst.extend_from_slice(frame.body.len().to_string().as_bytes());
                    dst.put_u8(b'\n');
                }

                dst.put_u8(b'\n');
                dst.extend_from_slice(&frame.body);
                dst.put_u8(0);
            }
        }

        Ok(())
    }
}

/// Decode every complete item contained in one self-contained buffer,
/// as delivered by a message-oriented transport such as WebSocket.
///
/// Trailing bytes that do not form a complete frame are a protocol error.
pub fn decode_all(bytes: &[u8]) -> Result<Vec<StompItem>, StompError> {
    let mut codec = StompCodec::new();
    let mut buf = BytesMut::from(bytes);
    let mut items = Vec::new();
    while let Some(item) = codec.decode(&mut buf)? {
        items.push(item);
    }
    if !buf.is_empty() {
        return Err(StompError::Protocol(format!(
            "incomplete frame in message ({} trailing bytes)",
            buf.len()
        )));
    }
    Ok(items)
}

/// Encode a single item into a fresh byte vector.
pub fn encode_to_vec(item: StompItem) -> Result<Vec<u8>, StompError> {
    let mut buf = BytesMut::new();
    StompCodec::new().encode(item, &mut buf)?;
    Ok(buf.to_vec())
}
