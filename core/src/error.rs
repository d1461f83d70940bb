//! Error types for the multiplexer and the protocol-client facade.
//!
//! # Design
//! Transport outcomes are classified eagerly while completions are
//! discovered, but they only become an `Error` when the caller collects the
//! result. `Error` is the plain failure kind; `CallError` wraps it with the
//! diagnostics a failed call carries (target, arguments, raw response).

use std::fmt;
use std::io;

use crate::http::Response;
use crate::multiplexer::RequestKey;

/// Result type alias using the crate's `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the multiplexer, the transport and the codec.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The deadline passed before any request byte was transmitted.
    #[error("connect timeout: no request bytes were sent before the deadline")]
    ConnectTimeout,

    /// The deadline passed after the request was sent, while waiting for or
    /// reading the response. Never retried.
    #[error("data timeout: the server did not answer before the deadline")]
    DataTimeout,

    /// The transfer finished without a body (DNS failure, refused connection,
    /// server closed the socket early).
    #[error("empty response{}", .0.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    EmptyResponse(Option<String>),

    /// The validator kept asking for a retry until the attempt ceiling.
    #[error("response rejected by validator after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// The validator raised its own terminal failure.
    #[error("validator aborted the request: {0}")]
    ValidatorAborted(String),

    /// The codec could not build the outbound payload.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The codec could not decode the inbound payload.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The remote side answered with a protocol-level fault.
    #[error("remote fault {code}: {message}")]
    Remote { code: i64, message: String },

    /// The request target is not a valid URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The request target uses a scheme other than http or https.
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// The key was never issued by this multiplexer, or its result was
    /// already consumed.
    #[error("unknown request {0}")]
    UnknownRequest(RequestKey),

    /// The polling runtime or the TLS stack could not be created.
    #[error("multiplexer initialization failed: {0}")]
    Init(#[source] io::Error),

    /// TLS configuration error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Create an encode error.
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode(message.into())
    }

    /// Whether this failure came from a deadline expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ConnectTimeout | Error::DataTimeout)
    }
}

/// A failed call, with everything needed to diagnose it.
#[derive(Debug)]
pub struct CallError {
    /// URL the request was sent to.
    pub target: String,
    /// Debug rendering of the arguments the call was made with.
    pub arguments: String,
    /// Terminal response, when the transfer got that far.
    pub response: Option<Response>,
    /// What went wrong.
    pub kind: Error,
}

impl CallError {
    pub fn new(target: impl Into<String>, arguments: impl Into<String>, kind: Error) -> Self {
        Self {
            target: target.into(),
            arguments: arguments.into(),
            response: None,
            kind,
        }
    }

    pub fn with_response(mut self, response: Response) -> Self {
        self.response = Some(response);
        self
    }

    pub fn kind(&self) -> &Error {
        &self.kind
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call to {} failed: {}", self.target, self.kind)
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_response_message_includes_reason() {
        let err = Error::EmptyResponse(Some("connection refused".to_string()));
        assert_eq!(err.to_string(), "empty response: connection refused");
        assert_eq!(Error::EmptyResponse(None).to_string(), "empty response");
    }

    #[test]
    fn call_error_exposes_kind_as_source() {
        let err = CallError::new("http://localhost/rpc", "echo", Error::DataTimeout);
        assert!(err.to_string().contains("http://localhost/rpc"));
        assert!(err.kind().is_timeout());
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), Error::DataTimeout.to_string());
    }
}
