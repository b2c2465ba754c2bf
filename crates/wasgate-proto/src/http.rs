//! Minimal HTTP pieces: request-head parsing for the WebSocket handshake
//! and plain-HTTP mode, URL encoding, query-string and cookie parsing.
//!
//! This is deliberately not a general HTTP implementation; the gateway only
//! needs enough to negotiate upgrades, read a Content-Length body, and
//! populate request params from CGI-style variables.

use std::fmt;

/// Finds the end of the header block (`\r\n\r\n`), returning the offset
/// just past it.
#[must_use]
pub fn find_header_block_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Head parsing failure.
#[derive(Debug, PartialEq, Eq)]
pub enum HeadError {
    /// The request line is missing or malformed.
    InvalidRequestLine,
    /// The head is not valid UTF-8.
    InvalidEncoding,
}

impl fmt::Display for HeadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidEncoding => write!(f, "request head is not valid UTF-8"),
        }
    }
}

impl std::error::Error for HeadError {}

/// A parsed HTTP request head (request line + headers).
#[derive(Debug, Clone)]
pub struct HttpHead {
    /// Request method, e.g. `GET`.
    pub method: String,
    /// Request target, e.g. `/chat?room=1`.
    pub target: String,
    /// Protocol version token, e.g. `HTTP/1.1`.
    pub version: String,
    /// Headers in arrival order, names as received.
    pub headers: Vec<(String, String)>,
}

impl HttpHead {
    /// Parses a header block. `block` may or may not include the trailing
    /// empty line.
    ///
    /// # Errors
    ///
    /// Fails on a malformed request line or non-UTF-8 head bytes. Header
    /// lines without a colon are skipped rather than rejected.
    pub fn parse(block: &[u8]) -> Result<Self, HeadError> {
        let text = std::str::from_utf8(block).map_err(|_| HeadError::InvalidEncoding)?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().ok_or(HeadError::InvalidRequestLine)?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or(HeadError::InvalidRequestLine)?.to_string();
        let target = parts.next().ok_or(HeadError::InvalidRequestLine)?.to_string();
        let version = parts.next().unwrap_or("HTTP/1.0").to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some(colon) = line.find(':') else {
                continue;
            };
            let name = line[..colon].trim().to_string();
            let value = line[colon + 1..].trim().to_string();
            if !name.is_empty() {
                headers.push((name, value));
            }
        }

        Ok(Self {
            method,
            target,
            version,
            headers,
        })
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The declared body length, if any.
    #[must_use]
    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.trim().parse().ok()
    }

    /// True when the head asks for a WebSocket upgrade: `Upgrade:
    /// websocket` and `Connection: upgrade` tokens present
    /// (case-insensitive, comma-tolerant).
    #[must_use]
    pub fn is_websocket_upgrade(&self) -> bool {
        let has_token = |value: &str, token: &str| {
            value.split(',').any(|v| v.trim().eq_ignore_ascii_case(token))
        };
        self.header("upgrade").is_some_and(|v| has_token(v, "websocket"))
            && self.header("connection").is_some_and(|v| has_token(v, "upgrade"))
    }

    /// The client's `Sec-WebSocket-Key`, trimmed.
    #[must_use]
    pub fn websocket_key(&self) -> Option<&str> {
        self.header("sec-websocket-key").map(str::trim)
    }
}

fn hexval(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(10 + c - b'a'),
        b'A'..=b'F' => Some(10 + c - b'A'),
        _ => None,
    }
}

/// Percent-decodes a string; `+` becomes space, bad escapes pass through.
/// Non-UTF-8 decode results are replaced lossily.
#[must_use]
pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                if let (Some(h), Some(l)) = (hexval(bytes[i + 1]), hexval(bytes[i + 2])) {
                    out.push((h << 4) | l);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Percent-encodes everything but unreserved characters.
#[must_use]
pub fn url_encode(s: &str) -> String {
    fn unreserved(c: u8) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, b'-' | b'_' | b'.' | b'~')
    }
    let mut out = String::with_capacity(s.len() * 3 / 2 + 8);
    for &c in s.as_bytes() {
        if unreserved(c) {
            out.push(c as char);
        } else {
            out.push('%');
            out.push(char::from_digit(u32::from(c >> 4), 16).unwrap_or('0').to_ascii_uppercase());
            out.push(char::from_digit(u32::from(c & 0xF), 16).unwrap_or('0').to_ascii_uppercase());
        }
    }
    out
}

/// Parses a query string into decoded key/value pairs in arrival order.
/// A segment without `=` becomes a key with an empty value.
#[must_use]
pub fn parse_query_string(input: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for segment in input.split('&') {
        if segment.is_empty() {
            continue;
        }
        match segment.find('=') {
            Some(eq) => {
                let key = url_decode(&segment[..eq]);
                let value = url_decode(&segment[eq + 1..]);
                if !key.is_empty() {
                    out.push((key, value));
                }
            }
            None => {
                let key = url_decode(segment);
                if !key.is_empty() {
                    out.push((key, String::new()));
                }
            }
        }
    }
    out
}

/// Parses a `Cookie:` header value into key/value pairs. Values wrapped in
/// double quotes are unquoted; a segment without `=` becomes a flag cookie
/// with an empty value.
#[must_use]
pub fn parse_cookie_header(input: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for segment in input.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (key, value) = match segment.find('=') {
            None => (segment.to_string(), String::new()),
            Some(eq) => {
                let key = segment[..eq].trim().to_string();
                let mut value = segment[eq + 1..].trim().to_string();
                if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                    value = value[1..value.len() - 1].to_string();
                }
                (key, value)
            }
        };
        if !key.is_empty() {
            out.push((key, value));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_block_end() {
        assert_eq!(find_header_block_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(find_header_block_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn parse_head_basic() {
        let head = HttpHead::parse(
            b"GET /x?a=1 HTTP/1.1\r\nHost: h\r\nContent-Length: 12\r\n\r\n",
        )
        .expect("valid head");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/x?a=1");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.header("host"), Some("h"));
        assert_eq!(head.header("HOST"), Some("h"));
        assert_eq!(head.content_length(), Some(12));
    }

    #[test]
    fn parse_head_rejects_garbage() {
        assert_eq!(HttpHead::parse(b"\r\n\r\n").unwrap_err(), HeadError::InvalidRequestLine);
        assert!(HttpHead::parse(&[0xFF, 0xFE]).is_err());
    }

    #[test]
    fn upgrade_detection() {
        let head = HttpHead::parse(
            b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: keep-alive, Upgrade\r\nSec-WebSocket-Key: abc\r\n\r\n",
        )
        .expect("valid head");
        assert!(head.is_websocket_upgrade());
        assert_eq!(head.websocket_key(), Some("abc"));
    }

    #[test]
    fn plain_request_is_not_upgrade() {
        let head = HttpHead::parse(b"POST /api HTTP/1.1\r\nHost: h\r\n\r\n").expect("valid head");
        assert!(!head.is_websocket_upgrade());
        assert!(head.websocket_key().is_none());
    }

    #[test]
    fn url_decode_basics() {
        assert_eq!(url_decode("a+b"), "a b");
        assert_eq!(url_decode("a%20b"), "a b");
        assert_eq!(url_decode("100%25"), "100%");
        assert_eq!(url_decode("%zz"), "%zz");
        assert_eq!(url_decode("caf%C3%A9"), "café");
    }

    #[test]
    fn url_encode_roundtrip() {
        let original = "hello world/path?q=1&x=ü";
        assert_eq!(url_decode(&url_encode(original)), original);
    }

    #[test]
    fn query_string_parsing() {
        let pairs = parse_query_string("a=1&b=two+words&flag&=skipme&c=%2F");
        assert_eq!(
            pairs,
            vec![
                ("a".into(), "1".into()),
                ("b".into(), "two words".into()),
                ("flag".into(), String::new()),
                ("c".into(), "/".into()),
            ]
        );
    }

    #[test]
    fn cookie_parsing() {
        let pairs = parse_cookie_header("session_id=abc123; theme=\"dark\" ; secure; =bad");
        assert_eq!(
            pairs,
            vec![
                ("session_id".into(), "abc123".into()),
                ("theme".into(), "dark".into()),
                ("secure".into(), String::new()),
            ]
        );
    }
}
