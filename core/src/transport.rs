//! One HTTP/1.1 exchange per attempt.
//!
//! Every attempt dials a brand-new connection, optionally tunnels through a
//! proxy, optionally wraps the socket in TLS, writes the request and reads
//! until the response is complete or the server closes. Nothing here raises:
//! failures are folded into the returned `Transfer` as a `TransferStatus` so
//! the multiplexer can classify them when it discovers the completion.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::client::TlsStream;
use url::Url;

use crate::error::Error;
use crate::http::{HttpMethod, ProxyConfig, TransferInfo, TransferStatus};
use crate::tls::TlsConnectors;
use crate::wire::{self, RequestHead};

const READ_CHUNK: usize = 8192;
const WRITE_CHUNK: usize = 16 * 1024;

/// Immutable transport half of a submitted request, shared by all attempts.
#[derive(Debug)]
pub(crate) struct TransportRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub verify_tls: bool,
    pub proxy: Option<ProxyConfig>,
    pub basic_auth: Option<(String, String)>,
    pub host_override: Option<String>,
}

/// Parse and check a request target.
pub(crate) fn parse_target(raw: &str) -> Result<Url, Error> {
    let url = Url::parse(raw)?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(Error::UnsupportedScheme(other.to_string())),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(Error::InvalidUrl(url::ParseError::EmptyHost));
    }
    Ok(url)
}

impl TransportRequest {
    /// The earlier of the two configured deadlines.
    pub(crate) fn earliest_timeout(&self) -> Option<Duration> {
        match (self.timeout, self.connect_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }

    fn host(&self) -> &str {
        self.url
            .host_str()
            .unwrap_or_default()
            .trim_start_matches('[')
            .trim_end_matches(']')
    }

    fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    /// `host[:port]` as it appears in the URL (default port omitted).
    fn authority(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    fn proxy_authorization(&self) -> Option<String> {
        let proxy = self.proxy.as_ref()?;
        let username = proxy.username.as_deref()?;
        Some(wire::basic_credentials(username, proxy.password.as_deref().unwrap_or_default()))
    }

    /// Full request bytes, head and body.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let plain_proxy = self.proxy.is_some() && !self.is_https();
        let target = if plain_proxy {
            let mut absolute = self.url.clone();
            absolute.set_fragment(None);
            absolute.to_string()
        } else {
            match self.url.query() {
                Some(query) => format!("{}?{query}", self.url.path()),
                None => self.url.path().to_string(),
            }
        };
        let host = self.host_override.clone().unwrap_or_else(|| self.authority());
        let authorization = self
            .basic_auth
            .as_ref()
            .map(|(login, password)| wire::basic_credentials(login, password));
        let proxy_authorization = if plain_proxy { self.proxy_authorization() } else { None };

        wire::encode_request(
            &RequestHead {
                method: self.method,
                target: &target,
                host: &host,
                headers: &self.headers,
                authorization: authorization.as_deref(),
                proxy_authorization: proxy_authorization.as_deref(),
            },
            &self.body,
        )
    }
}

/// Live progress of one attempt, readable while it runs.
#[derive(Debug, Default)]
pub(crate) struct Progress {
    request_sent: AtomicBool,
    bytes_sent: AtomicU64,
}

impl Progress {
    /// Whether the whole request has been written to the socket.
    pub(crate) fn request_sent(&self) -> bool {
        self.request_sent.load(Ordering::Acquire)
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Acquire)
    }
}

/// What one attempt produced.
#[derive(Debug)]
pub(crate) struct Transfer {
    pub status: TransferStatus,
    /// Every byte read back: header blocks followed by the body.
    pub raw: Vec<u8>,
    pub info: TransferInfo,
}

struct Failure {
    status: TransferStatus,
    message: String,
}

impl Failure {
    fn new(status: TransferStatus, message: impl std::fmt::Display) -> Self {
        Self {
            status,
            message: message.to_string(),
        }
    }
}

/// Run one attempt to completion. `on_sent` fires once the full request has
/// been written.
pub(crate) async fn perform(
    request: &TransportRequest,
    progress: &Progress,
    tls: &TlsConnectors,
    on_sent: impl FnOnce(),
) -> Transfer {
    let started = Instant::now();
    let mut raw = Vec::new();
    let mut connect_time = None;

    let exchange = exchange(request, progress, tls, on_sent, &mut raw, &mut connect_time, started);
    let result = match request.timeout {
        Some(limit) => match tokio::time::timeout(limit, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Failure::new(
                TransferStatus::TimedOut,
                format!("operation timed out after {limit:?}"),
            )),
        },
        None => exchange.await,
    };

    let (status, error) = match result {
        Ok(()) => (TransferStatus::Ok, None),
        Err(failure) => {
            tracing::trace!(url = %request.url, status = ?failure.status, error = %failure.message, "transfer failed");
            (failure.status, Some(failure.message))
        }
    };

    Transfer {
        status,
        info: TransferInfo {
            url: request.url.to_string(),
            total_time: started.elapsed(),
            connect_time,
            request_size: progress.bytes_sent(),
            size_download: raw.len() as u64,
            error,
            ..TransferInfo::default()
        },
        raw,
    }
}

async fn exchange(
    request: &TransportRequest,
    progress: &Progress,
    tls: &TlsConnectors,
    on_sent: impl FnOnce(),
    raw: &mut Vec<u8>,
    connect_time: &mut Option<Duration>,
    started: Instant,
) -> Result<(), Failure> {
    let connecting = connect(request, tls);
    let (mut stream, tunnel_head) = match request.connect_timeout {
        Some(limit) => tokio::time::timeout(limit, connecting).await.map_err(|_| {
            Failure::new(TransferStatus::TimedOut, format!("connection timed out after {limit:?}"))
        })??,
        None => connecting.await?,
    };
    *connect_time = Some(started.elapsed());
    if let Some(head) = tunnel_head {
        raw.extend_from_slice(&head);
    }

    let bytes = request.encode();
    for chunk in bytes.chunks(WRITE_CHUNK) {
        stream
            .write_all(chunk)
            .await
            .map_err(|e| Failure::new(TransferStatus::SendError, format!("failed to send request: {e}")))?;
        progress.bytes_sent.fetch_add(chunk.len() as u64, Ordering::AcqRel);
    }
    stream
        .flush()
        .await
        .map_err(|e| Failure::new(TransferStatus::SendError, format!("failed to flush request: {e}")))?;
    progress.request_sent.store(true, Ordering::Release);
    tracing::trace!(url = %request.url, bytes = bytes.len(), "request sent");
    on_sent();

    let start = raw.len();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| Failure::new(TransferStatus::RecvError, format!("failed to read response: {e}")))?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
        if wire::message_complete(&raw[start..]) {
            break;
        }
    }
    Ok(())
}

/// Dial the origin or the proxy, tunnel if needed, then wrap in TLS for
/// https targets. Returns the proxy's `CONNECT` answer when a tunnel was set
/// up.
async fn connect(request: &TransportRequest, tls: &TlsConnectors) -> Result<(Stream, Option<Vec<u8>>), Failure> {
    let (dial_host, dial_port) = match &request.proxy {
        Some(proxy) => (proxy.host.as_str(), proxy.port),
        None => (request.host(), request.port()),
    };
    let mut tcp = dial(dial_host, dial_port).await?;
    tracing::trace!(host = dial_host, port = dial_port, "connected");

    if !request.is_https() {
        return Ok((Stream::Plain(tcp), None));
    }

    let tunnel_head = match request.proxy {
        Some(_) => {
            let authority = format!("{}:{}", request.url.host_str().unwrap_or_default(), request.port());
            Some(tunnel(&mut tcp, &authority, request.proxy_authorization().as_deref()).await?)
        }
        None => None,
    };

    let name = ServerName::try_from(request.host().to_string())
        .map_err(|e| Failure::new(TransferStatus::TlsError, format!("invalid server name: {e}")))?;
    let stream = tls
        .get(request.verify_tls)
        .connect(name, tcp)
        .await
        .map_err(|e| Failure::new(TransferStatus::TlsError, format!("TLS handshake failed: {e}")))?;
    Ok((Stream::Tls(Box::new(stream)), tunnel_head))
}

async fn dial(host: &str, port: u16) -> Result<TcpStream, Failure> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| Failure::new(TransferStatus::CouldntResolveHost, format!("could not resolve {host}: {e}")))?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    let message = match last_error {
        Some(e) => format!("could not connect to {host}:{port}: {e}"),
        None => format!("no addresses found for {host}"),
    };
    Err(Failure::new(TransferStatus::CouldntConnect, message))
}

/// Ask the proxy for a tunnel and return its raw answer head.
async fn tunnel(tcp: &mut TcpStream, authority: &str, auth: Option<&str>) -> Result<Vec<u8>, Failure> {
    tcp.write_all(&wire::encode_connect(authority, auth))
        .await
        .map_err(|e| Failure::new(TransferStatus::ProxyError, format!("failed to send CONNECT: {e}")))?;

    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while wire::head_len(&head).is_none() {
        let n = tcp
            .read(&mut buf)
            .await
            .map_err(|e| Failure::new(TransferStatus::ProxyError, format!("failed to read CONNECT answer: {e}")))?;
        if n == 0 {
            return Err(Failure::new(TransferStatus::ProxyError, "proxy closed the connection during CONNECT"));
        }
        head.extend_from_slice(&buf[..n]);
    }

    let text = String::from_utf8_lossy(&head);
    match wire::status_code(&text) {
        Some(code) if (200..300).contains(&code) => Ok(head),
        _ => Err(Failure::new(
            TransferStatus::ProxyError,
            format!("proxy refused tunnel: {}", text.lines().next().unwrap_or_default()),
        )),
    }
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(&mut **s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(&mut **s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(&mut **s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(&mut **s).poll_shutdown(cx),
        }
    }
}
