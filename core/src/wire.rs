//! HTTP/1.1 wire helpers: request serialization and raw response splitting.
//!
//! The transport hands back everything it read from the socket, header blocks
//! included. A single payload can carry several stacked header blocks (a proxy
//! `CONNECT` answer, `100 Continue`), so the final headers are found by
//! peeling blocks off the front until the body starts.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::http::HttpMethod;

const MAX_HEADERS_COUNT: usize = 100;

/// Pieces needed to serialize one request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RequestHead<'a> {
    pub method: HttpMethod,
    /// Origin-form path, or the absolute URL when talking to a plain proxy.
    pub target: &'a str,
    pub host: &'a str,
    pub headers: &'a [(String, String)],
    pub authorization: Option<&'a str>,
    pub proxy_authorization: Option<&'a str>,
}

/// `Basic` credentials header value.
pub(crate) fn basic_credentials(login: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{login}:{password}")))
}

/// Serialize a request. Connections are never reused, so every request
/// carries `Connection: close`.
pub(crate) fn encode_request(head: &RequestHead<'_>, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(head.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(head.target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    push_header(&mut out, "Host", head.host);

    let mut has_authorization = false;
    for (name, value) in head.headers {
        if ["host", "connection", "content-length"]
            .iter()
            .any(|skip| name.eq_ignore_ascii_case(skip))
        {
            continue;
        }
        has_authorization |= name.eq_ignore_ascii_case("authorization");
        push_header(&mut out, name, value);
    }
    if let (Some(auth), false) = (head.authorization, has_authorization) {
        push_header(&mut out, "Authorization", auth);
    }
    if let Some(auth) = head.proxy_authorization {
        push_header(&mut out, "Proxy-Authorization", auth);
    }
    if !body.is_empty() || matches!(head.method, HttpMethod::Post | HttpMethod::Put) {
        push_header(&mut out, "Content-Length", &body.len().to_string());
    }
    push_header(&mut out, "Connection", "close");
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// Serialize a proxy tunnel request for `authority` (`host:port`).
pub(crate) fn encode_connect(authority: &str, proxy_authorization: Option<&str>) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(format!("CONNECT {authority} HTTP/1.1\r\n").as_bytes());
    push_header(&mut out, "Host", authority);
    if let Some(auth) = proxy_authorization {
        push_header(&mut out, "Proxy-Authorization", auth);
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Length of the header block at the front of `buf`, terminator included.
pub(crate) fn head_len(buf: &[u8]) -> Option<usize> {
    find(buf, b"\r\n\r\n").map(|pos| pos + 4)
}

/// Status code from the first line of a header block.
pub fn status_code(head: &str) -> Option<u16> {
    let line = head.lines().next()?;
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Whether `buf` holds a complete final response, so reading can stop before
/// the server closes the socket.
pub(crate) fn message_complete(buf: &[u8]) -> bool {
    let mut rest = buf;
    loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
        let mut response = httparse::Response::new(&mut headers);
        let len = match response.parse(rest) {
            Ok(httparse::Status::Complete(len)) => len,
            _ => return false,
        };
        let code = response.code.unwrap_or(0);
        if (100..200).contains(&code) {
            rest = &rest[len..];
            continue;
        }
        if matches!(code, 204 | 304) {
            return true;
        }

        let body = &rest[len..];
        let header = |name: &str| {
            response
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .and_then(|h| std::str::from_utf8(h.value).ok())
        };
        if header("transfer-encoding").is_some_and(is_chunked) {
            return dechunk(body).is_some();
        }
        return match header("content-length").and_then(|v| v.trim().parse::<usize>().ok()) {
            Some(length) => body.len() >= length,
            None => false,
        };
    }
}

/// Split a raw payload into its last header block and the body.
///
/// Leading header blocks are peeled off while the remainder still starts with
/// a status line; only the last one is kept.
pub fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
    let mut headers = String::new();
    let mut rest = raw;
    while rest.starts_with(b"HTTP/") {
        let Some(len) = head_len(rest) else { break };
        let block = String::from_utf8_lossy(&rest[..len]);
        if status_code(&block).is_none() {
            break;
        }
        headers = block.into_owned();
        rest = &rest[len..];
    }
    (headers, rest.to_vec())
}

/// Undo chunked transfer coding when the headers announce it. Bodies that do
/// not parse as chunked are returned untouched.
pub fn decode_body(headers: &str, body: Vec<u8>) -> Vec<u8> {
    let chunked = headers.lines().skip(1).any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("transfer-encoding") && is_chunked(value)
        })
    });
    if !chunked {
        return body;
    }
    dechunk(&body).unwrap_or(body)
}

fn is_chunked(value: &str) -> bool {
    value
        .split(',')
        .next_back()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

/// Decode a chunked body; `None` until the terminating chunk and trailer
/// section are present.
fn dechunk(mut rest: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(rest.len());
    loop {
        let line_end = find(rest, b"\r\n")?;
        let line = std::str::from_utf8(&rest[..line_end]).ok()?;
        let size = usize::from_str_radix(line.split(';').next()?.trim(), 16).ok()?;
        rest = &rest[line_end + 2..];
        if size == 0 {
            let trailers_done = rest.starts_with(b"\r\n") || find(rest, b"\r\n\r\n").is_some();
            return trailers_done.then_some(out);
        }
        let end = size.checked_add(2)?;
        if rest.len() < end {
            return None;
        }
        out.extend_from_slice(&rest[..size]);
        rest = &rest[end..];
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
