//! Request and response data model.
//!
//! # Design
//! `RequestOptions` is the caller-facing bag handed to
//! `Multiplexer::add_request`. It mixes transport settings with the reserved
//! per-request hooks (validator, body and completion callbacks); the
//! multiplexer splits the two on submission and keeps the transport half in an
//! immutable `Arc` so every retry re-sends exactly the submitted options.
//!
//! `Response` is a plain value produced once per terminal attempt.

use std::borrow::Cow;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::validator::{Validation, Validator};

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Forward proxy used for a request.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Post-processing applied to the body at first consumption.
pub type BodyHook = Box<dyn FnOnce(Vec<u8>) -> Vec<u8>>;

/// Post-processing applied to the whole response at first consumption.
pub type ResponseHook = Box<dyn FnOnce(Response) -> Response>;

/// Everything needed to submit one logical request.
pub struct RequestOptions {
    pub url: String,
    pub method: HttpMethod,
    /// Sent in insertion order.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Deadline for the whole exchange. `None` means unbounded.
    pub timeout: Option<Duration>,
    /// Deadline for DNS, TCP, proxy tunnel and TLS. `None` means unbounded.
    pub connect_timeout: Option<Duration>,
    pub verify_tls: bool,
    pub proxy: Option<ProxyConfig>,
    pub basic_auth: Option<(String, String)>,
    /// Replaces the `Host` header derived from the URL.
    pub host_override: Option<String>,
    pub validator: Option<Rc<dyn Validator>>,
    pub on_body: Option<BodyHook>,
    pub on_complete: Option<ResponseHook>,
}

impl RequestOptions {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: Vec::new(),
            body: Vec::new(),
            timeout: None,
            connect_timeout: None,
            verify_tls: true,
            proxy: None,
            basic_auth: None,
            host_override: None,
            validator: None,
            on_body: None,
            on_complete: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new(HttpMethod::Post, url).body(body)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn basic_auth(mut self, login: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((login.into(), password.into()));
        self
    }

    pub fn host_override(mut self, host: impl Into<String>) -> Self {
        self.host_override = Some(host.into());
        self
    }

    pub fn validator(mut self, validator: Rc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn on_body(mut self, hook: impl FnOnce(Vec<u8>) -> Vec<u8> + 'static) -> Self {
        self.on_body = Some(Box::new(hook));
        self
    }

    pub fn on_complete(mut self, hook: impl FnOnce(Response) -> Response + 'static) -> Self {
        self.on_complete = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("verify_tls", &self.verify_tls)
            .field("proxy", &self.proxy)
            .field("host_override", &self.host_override)
            .field("validator", &self.validator.is_some())
            .field("on_body", &self.on_body.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Which phase of the exchange exceeded its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    None,
    /// Nothing of the request had been sent yet.
    Connect,
    /// The request was sent; the response never (fully) arrived.
    Data,
}

/// Low-level result code of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Ok,
    TimedOut,
    CouldntResolveHost,
    CouldntConnect,
    ProxyError,
    TlsError,
    SendError,
    RecvError,
}

/// Timing and size metadata gathered for a transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferInfo {
    pub url: String,
    /// Status code of the final header block, if one was received.
    pub http_code: Option<u16>,
    /// Attempt number (1-based) that produced this transfer.
    pub attempt: u32,
    pub total_time: Duration,
    pub connect_time: Option<Duration>,
    /// Request bytes written to the socket (zero means nothing was sent).
    pub request_size: u64,
    pub header_size: u64,
    pub size_download: u64,
    /// Transport error message, if the transfer failed.
    pub error: Option<String>,
}

/// Terminal outcome of one logical request.
#[derive(Debug, Clone)]
pub struct Response {
    pub info: TransferInfo,
    /// Raw text of the last header block, status line included.
    pub headers: String,
    pub body: Vec<u8>,
    pub timeout: TimeoutKind,
    pub status: TransferStatus,
    pub validation: Validation,
}

impl Response {
    pub fn status_code(&self) -> Option<u16> {
        self.info.http_code
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Header lines after the status line, as `(name, value)` pairs.
    pub fn header_lines(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.lines().skip(1).filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim(), value.trim()))
        })
    }

    /// First header with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_lines()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}
