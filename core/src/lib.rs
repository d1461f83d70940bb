//! Request multiplexer and protocol client core.
//!
//! # Overview
//! A `Multiplexer` accepts many HTTP requests from one thread, runs them
//! concurrently over a private single-threaded tokio runtime and hands back
//! each terminal response by key, in whatever order the caller asks. On top of
//! it, `Client` turns protocol calls into requests through a `Codec` and
//! returns `PendingCall`s whose results are decoded lazily.
//!
//! # Design
//! - The runtime is the polling primitive: nothing makes progress unless the
//!   caller is inside `get_result`, `get_available_results` or
//!   `wait_for_connect`.
//! - Every attempt is classified as a connect timeout, a data timeout or a
//!   completed exchange. Data timeouts are never retried; everything else is
//!   shown to the request's `Validator`, which may ask for another attempt up
//!   to `MAX_TRIES`.
//! - Failures are recorded on the `Response` and only turned into errors when a
//!   result is collected.
//! - DTOs are defined independently from the mock-server crate; integration
//!   tests catch schema drift.

pub mod client;
pub mod codec;
pub mod config;
pub mod cookie;
pub mod error;
pub mod http;
pub mod multiplexer;
pub mod types;
pub mod validator;
pub mod wire;

mod tls;
mod transport;

pub use client::{AsyncClient, Client, PendingCall, SharedMultiplexer};
pub use codec::{Codec, Envelope, JsonCodec};
pub use config::{ClientConfig, MultiplexerConfig};
pub use cookie::CookieJar;
pub use error::{CallError, Error, Result};
pub use http::{HttpMethod, ProxyConfig, RequestOptions, Response, TimeoutKind, TransferInfo, TransferStatus};
pub use multiplexer::{Multiplexer, RequestKey};
pub use types::{Call, Fault, Reply};
pub use validator::{RetryOnFailure, Validation, Validator, Verdict, MAX_TRIES};
