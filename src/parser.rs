// Slice-based STOMP frame parser (produces owned Vecs from input slices)

/// Maximum number of header lines accepted in a single frame.
pub const MAX_HEADER_LINES: usize = 1000;

/// Maximum size in bytes of the command line plus header section.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Largest body accepted through an explicit `content-length`.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// A frame split into its raw parts, before UTF-8 conversion and
/// header unescaping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub command: Vec<u8>,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub body: Vec<u8>,
    /// Number of input bytes the frame occupied, including the NUL
    /// terminator and an optional trailing EOL.
    pub consumed: usize,
}

type ParseResult = Result<Option<RawFrame>, String>;

/// Extract the first `content-length` header value from a header list.
///
/// Returns:
/// - Ok(Some(n)) when a valid content-length header is present and parsed.
/// - Ok(None) when no content-length header is present.
/// - Err(String) when content-length is present but not a valid unsigned integer.
fn get_content_length(headers: &[(Vec<u8>, Vec<u8>)]) -> Result<Option<usize>, String> {
    let Some((_, v)) = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(&b"content-length"[..]))
    else {
        return Ok(None);
    };
    let s = std::str::from_utf8(v).map_err(|e| format!("content-length not utf8: {}", e))?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err("empty content-length".to_string());
    }
    let n = trimmed
        .parse::<usize>()
        .map_err(|e| format!("invalid content-length '{}': {}", trimmed, e))?;
    if n > MAX_BODY_BYTES {
        return Err(format!(
            "content-length {} exceeds limit of {} bytes",
            n, MAX_BODY_BYTES
        ));
    }
    Ok(Some(n))
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((b'\r', rest)) => rest,
        _ => line,
    }
}

/// Length of an end-of-line sequence (`\n` or `\r\n`) at the start of `input`.
pub fn eol_len(input: &[u8]) -> Option<usize> {
    match input {
        [b'\n', ..] => Some(1),
        [b'\r', b'\n', ..] => Some(2),
        _ => None,
    }
}

/// Skip at most one EOL following a frame's NUL terminator.
fn trailing_eol(input: &[u8], pos: usize) -> usize {
    pos + eol_len(&input[pos..]).unwrap_or(0)
}

/// Parse a single STOMP frame from a raw byte slice.
///
/// The input must start at a frame boundary; heartbeat EOLs are the
/// caller's concern. Returns `Ok(Some(frame))` when a full frame was
/// parsed, `Ok(None)` when more bytes are required, and `Err` on protocol
/// errors: an empty command, a malformed header line, a header section over
/// [`MAX_HEADER_LINES`] lines or [`MAX_HEADER_BYTES`] bytes, or a
/// content-length body without its NUL terminator.
pub fn parse_frame_slice(input: &[u8]) -> ParseResult {
    let len = input.len();
    let mut pos = 0usize;

    // command line
    let Some(cmd_end) = input.iter().position(|&b| b == b'\n') else {
        if input.contains(&0) {
            return Err("frame has no command line".to_string());
        }
        if len > MAX_HEADER_BYTES {
            return Err(format!("command line exceeds {} bytes", MAX_HEADER_BYTES));
        }
        return Ok(None);
    };
    let command = strip_cr(&input[..cmd_end]).to_vec();
    if command.is_empty() {
        return Err("frame has an empty command".to_string());
    }
    if command.contains(&0) {
        return Err("NUL byte inside command line".to_string());
    }
    pos += cmd_end + 1;

    // headers until a blank line
    let mut headers: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    loop {
        if pos > MAX_HEADER_BYTES {
            return Err(format!("header section exceeds {} bytes", MAX_HEADER_BYTES));
        }
        if pos >= len {
            return Ok(None);
        }
        if let Some(n) = eol_len(&input[pos..]) {
            pos += n;
            break;
        }
        if input[pos] == b'\r' && pos + 1 >= len {
            return Ok(None);
        }
        let Some(line_end) = input[pos..].iter().position(|&b| b == b'\n') else {
            if len - pos > MAX_HEADER_BYTES {
                return Err(format!("header section exceeds {} bytes", MAX_HEADER_BYTES));
            }
            return Ok(None);
        };
        if headers.len() >= MAX_HEADER_LINES {
            return Err(format!("more than {} header lines", MAX_HEADER_LINES));
        }
        let line = strip_cr(&input[pos..pos + line_end]);
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return Err(format!(
                "malformed header line: {:?}",
                String::from_utf8_lossy(line)
            ));
        };
        headers.push((line[..colon].to_vec(), line[colon + 1..].to_vec()));
        pos += line_end + 1;
    }

    // body
    match get_content_length(&headers)? {
        Some(content_len) => {
            if pos + content_len + 1 > len {
                return Ok(None);
            }
            let body = input[pos..pos + content_len].to_vec();
            pos += content_len;
            if input[pos] != 0 {
                return Err("missing NUL terminator after content-length body".to_string());
            }
            let consumed = trailing_eol(input, pos + 1);
            Ok(Some(RawFrame {
                command,
                headers,
                body,
                consumed,
            }))
        }
        None => match input[pos..].iter().position(|&b| b == 0) {
            Some(nul) => {
                let body = input[pos..pos + nul].to_vec();
                let consumed = trailing_eol(input, pos + nul + 1);
                Ok(Some(RawFrame {
                    command,
                    headers,
                    body,
                    consumed,
                }))
            }
            None => Ok(None),
        },
    }
}

/// Reverse STOMP 1.2 header escaping (`\\`, `\n`, `\r`, `\c`).
///
/// Any other escape sequence is a protocol error.
pub fn unescape_header_value(input: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.iter();
    while let Some(&b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b'c') => out.push(b':'),
            Some(&other) => {
                return Err(format!("undefined escape sequence '\\{}'", other as char));
            }
            None => return Err("dangling backslash at end of header".to_string()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nul_terminated_frame_with_trailing_eol() {
        let raw = b"SEND\ndestination:/q/a\n\nhi\0\nNEXT";
        let frame = parse_frame_slice(raw).unwrap().unwrap();
        assert_eq!(frame.command, b"SEND");
        assert_eq!(frame.body, b"hi");
        assert_eq!(&raw[frame.consumed..], b"NEXT");
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let raw = b"MESSAGE\r\nmessage-id:1\r\n\r\nbody\0";
        let frame = parse_frame_slice(raw).unwrap().unwrap();
        assert_eq!(frame.command, b"MESSAGE");
        assert_eq!(frame.headers[0], (b"message-id".to_vec(), b"1".to_vec()));
        assert_eq!(frame.body, b"body");
    }

    #[test]
    fn partial_frame_needs_more_bytes() {
        assert_eq!(parse_frame_slice(b"SEND\ndest").unwrap(), None);
        assert_eq!(parse_frame_slice(b"SEND\ncontent-length:5\n\nab").unwrap(), None);
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(parse_frame_slice(b"\nheader:x\n\n\0").is_err());
        assert!(parse_frame_slice(b"\0").is_err());
    }

    #[test]
    fn too_many_header_lines_is_rejected() {
        let mut raw = b"SEND\n".to_vec();
        for i in 0..=MAX_HEADER_LINES {
            raw.extend_from_slice(format!("h{}:v\n", i).as_bytes());
        }
        raw.extend_from_slice(b"\n\0");
        let err = parse_frame_slice(&raw).unwrap_err();
        assert!(err.contains("header lines"));
    }

    #[test]
    fn oversized_incomplete_header_section_is_rejected() {
        let mut raw = b"SEND\nx:".to_vec();
        raw.extend(std::iter::repeat_n(b'a', MAX_HEADER_BYTES + 1));
        assert!(parse_frame_slice(&raw).is_err());
    }

    #[test]
    fn unescape_rejects_undefined_sequences() {
        assert_eq!(unescape_header_value(b"a\\cb\\\\c").unwrap(), b"a:b\\c");
        assert!(unescape_header_value(b"bad\\t").is_err());
        assert!(unescape_header_value(b"bad\\").is_err());
    }
}
