//! Wire codec: request framing, staged parsing and response serialisation.
//!
//! # Data Flow
//! ```text
//! input bytes ──frame()──▶ Incomplete | Complete(n) | ParseError
//!                              │
//!                  parse_into(&input[..n], ctx)
//!                   ├─ split head / body      (MissingTerminator)
//!                   ├─ head as UTF-8          (Encoding)
//!                   ├─ request line, 3 tokens (RequestLine)
//!                   ├─ target → path + query  (Target)
//!                   └─ headers, body
//!
//! response ──write_response()──▶ "VERSION STATUS\r\n" headers
//!                                "Content-Length: n\r\n" (non-empty body)
//!                                "\r\n" body
//! ```
//!
//! # Design Decisions
//! - A request is complete once its head is present and the declared
//!   `Content-Length` is satisfied; no declared length means no body
//! - Header names are lower-cased, values trimmed, duplicates overwrite
//! - Lines in the header block without a colon are ignored
//! - Response headers come from a map, so their order is not stable
//! - `Content-Length` is always synthesised; user-set values are dropped

use std::collections::HashMap;

use url::Url;

use crate::error::ParseError;
use crate::http::request::RequestContext;
use crate::net::connection::Signal;

const TERMINATOR: &[u8] = b"\r\n\r\n";
const BASE_URL: &str = "http://localhost";

/// Result of scanning buffered input for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// More bytes are needed.
    Incomplete,
    /// The first `n` bytes hold one complete request.
    Complete(usize),
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR.len()).position(|w| w == TERMINATOR)
}

/// Decide whether `buf` starts with a complete request.
pub fn frame(buf: &[u8], max_request_bytes: usize) -> Result<Frame, ParseError> {
    let Some(head_end) = find_terminator(buf) else {
        if buf.len() > max_request_bytes {
            return Err(ParseError::TooLarge {
                size: buf.len(),
                limit: max_request_bytes,
            });
        }
        return Ok(Frame::Incomplete);
    };

    let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| ParseError::Encoding)?;
    let body_len = content_length(head)?;
    let too_large = |size| ParseError::TooLarge {
        size,
        limit: max_request_bytes,
    };
    if body_len > max_request_bytes {
        return Err(too_large(body_len));
    }
    let total = (head_end + TERMINATOR.len())
        .checked_add(body_len)
        .ok_or(too_large(usize::MAX))?;
    if total > max_request_bytes {
        return Err(too_large(total));
    }

    if buf.len() >= total {
        Ok(Frame::Complete(total))
    } else {
        Ok(Frame::Incomplete)
    }
}

fn content_length(head: &str) -> Result<usize, ParseError> {
    let mut length = 0;
    for line in head.split("\r\n").skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            length = value
                .parse::<usize>()
                .map_err(|_| ParseError::ContentLength(value.to_string()))?;
        }
    }
    Ok(length)
}

/// Parse one framed request into `ctx`.
///
/// `ctx` is expected to be freshly reset; fields are filled stage by stage,
/// so a failure leaves the earlier stages' results in place.
pub fn parse_into(raw: &[u8], ctx: &mut RequestContext) -> Result<(), ParseError> {
    let head_end = find_terminator(raw).ok_or(ParseError::MissingTerminator)?;
    let head = std::str::from_utf8(&raw[..head_end]).map_err(|_| ParseError::Encoding)?;

    let mut lines = head.split("\r\n");
    let (method, target, version) = request_line(lines.next().unwrap_or_default())?;
    ctx.method.push_str(method);
    ctx.version.push_str(version);

    let target = Url::parse(BASE_URL)
        .and_then(|base| base.join(target))
        .map_err(|err| ParseError::Target(format!("{target}: {err}")))?;
    ctx.path.push_str(target.path());
    for (key, value) in target.query_pairs() {
        ctx.query
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }

    parse_headers(lines, &mut ctx.headers);
    if ctx
        .headers
        .get("connection")
        .is_some_and(|v| v.eq_ignore_ascii_case("close"))
    {
        ctx.set_signal(Signal::Close);
    }

    ctx.body
        .extend_from_slice(&raw[head_end + TERMINATOR.len()..]);
    Ok(())
}

fn request_line(line: &str) -> Result<(&str, &str, &str), ParseError> {
    let tokens: Vec<&str> = line.split(' ').collect();
    match tokens.as_slice() {
        [method, target, version] => Ok((*method, *target, *version)),
        _ => Err(ParseError::RequestLine {
            tokens: tokens.len(),
        }),
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>, headers: &mut HashMap<String, String>) {
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
}

/// Append a serialised response to `out`.
pub fn write_response(
    out: &mut Vec<u8>,
    version: &str,
    status: u16,
    headers: &HashMap<String, String>,
    body: &[u8],
) {
    out.extend_from_slice(version.as_bytes());
    out.push(b' ');
    out.extend_from_slice(status.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    if !body.is_empty() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1024;

    fn parse(raw: &[u8]) -> (RequestContext, Result<(), ParseError>) {
        let mut ctx = RequestContext::new();
        let result = parse_into(raw, &mut ctx);
        (ctx, result)
    }

    #[test]
    fn frames_head_only_request() {
        let raw = b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(frame(raw, LIMIT), Ok(Frame::Complete(raw.len())));
        assert_eq!(frame(&raw[..10], LIMIT), Ok(Frame::Incomplete));
    }

    #[test]
    fn frames_wait_for_declared_body() {
        let raw = b"POST /a HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel";
        assert_eq!(frame(raw, LIMIT), Ok(Frame::Incomplete));

        let raw = b"POST /a HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET";
        assert_eq!(frame(raw, LIMIT), Ok(Frame::Complete(raw.len() - 3)));
    }

    #[test]
    fn oversized_declared_length_is_rejected_without_overflow() {
        let raw = b"GET / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n";
        assert!(matches!(frame(raw, LIMIT), Err(ParseError::TooLarge { limit: LIMIT, .. })));

        let raw = b"POST / HTTP/1.1\r\nContent-Length: 2000\r\n\r\n";
        assert_eq!(
            frame(raw, LIMIT),
            Err(ParseError::TooLarge {
                size: 2000,
                limit: LIMIT
            })
        );
    }

    #[test]
    fn frame_rejects_oversized_and_bad_lengths() {
        let raw = b"POST /a HTTP/1.1\r\nContent-Length: 4096\r\n\r\n";
        assert!(matches!(frame(raw, LIMIT), Err(ParseError::TooLarge { .. })));

        let raw = b"POST /a HTTP/1.1\r\nContent-Length: -1\r\n\r\n";
        assert_eq!(
            frame(raw, LIMIT),
            Err(ParseError::ContentLength("-1".to_string()))
        );

        let endless = vec![b'a'; LIMIT + 1];
        assert!(matches!(frame(&endless, LIMIT), Err(ParseError::TooLarge { .. })));
    }

    #[test]
    fn parses_request_line_headers_query_and_body() {
        let raw = b"POST /v1/Items?tag=a&tag=b&q=x+y HTTP/1.1\r\n\
                    Host: example\r\n\
                    X-Token:  first \r\n\
                    x-token: second\r\n\
                    garbage line\r\n\
                    Content-Length: 4\r\n\r\nbody";
        let (ctx, result) = parse(raw);
        result.unwrap();

        assert_eq!(ctx.method(), "POST");
        assert_eq!(ctx.path(), "/v1/Items");
        assert_eq!(ctx.version(), "HTTP/1.1");
        assert_eq!(ctx.header("x-token"), Some("second"));
        assert_eq!(ctx.headers().len(), 3);
        assert_eq!(ctx.query_all("tag"), ["a", "b"]);
        assert_eq!(ctx.get_query("q", ""), "x y");
        assert_eq!(ctx.body(), b"body");
    }

    #[test]
    fn request_line_needs_exactly_three_tokens() {
        let (_, result) = parse(b"GET /ping\r\n\r\n");
        assert_eq!(result, Err(ParseError::RequestLine { tokens: 2 }));

        let (_, result) = parse(b"GET /a b HTTP/1.1\r\n\r\n");
        assert_eq!(result, Err(ParseError::RequestLine { tokens: 4 }));

        let (_, result) = parse(b"GET  /a HTTP/1.1\r\n\r\n");
        assert_eq!(result, Err(ParseError::RequestLine { tokens: 4 }));
    }

    #[test]
    fn missing_terminator_and_bad_encoding_are_tagged() {
        let (_, result) = parse(b"GET / HTTP/1.1\r\n");
        assert_eq!(result, Err(ParseError::MissingTerminator));

        let (_, result) = parse(b"GET /\xff HTTP/1.1\r\n\r\n");
        assert_eq!(result, Err(ParseError::Encoding));
    }

    #[test]
    fn connection_close_header_sets_signal() {
        let (ctx, result) = parse(b"GET / HTTP/1.1\r\nConnection: Close\r\n\r\n");
        result.unwrap();
        assert_eq!(ctx.signal(), Signal::Close);
    }

    #[test]
    fn content_length_matches_body() {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "text/plain".to_string());
        headers.insert("content-length".to_string(), "999".to_string());

        let mut out = Vec::new();
        write_response(&mut out, "HTTP/1.1", 200, &headers, b"hello");
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("HTTP/1.1 200\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(!text.contains("999"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn empty_body_has_no_content_length() {
        let mut out = Vec::new();
        write_response(&mut out, "HTTP/1.1", 204, &HashMap::new(), b"");
        assert_eq!(out, b"HTTP/1.1 204\r\n\r\n");
    }
}
