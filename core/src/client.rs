//! Protocol-client facade over the multiplexer.
//!
//! # Design
//! A `Client` pairs a codec with a transport configuration, a cookie session
//! and a shared `Multiplexer`. Calls are submitted as requests on the
//! multiplexer and come back as `PendingCall`s; nothing is decoded until a
//! caller collects the result, and the outcome is cached so a pending call can
//! be consulted from several places without re-sending anything.
//!
//! The facade is single-threaded (`Rc`/`RefCell`): the multiplexer drives all
//! transfers from the calling thread, so there is nothing to lock. Several
//! clients can share one multiplexer through `Client::with_multiplexer`.
//!
//! `AsyncClient` is the same client seen through an entry point whose `call`
//! always returns a `PendingCall` instead of blocking.

use std::cell::{OnceCell, RefCell};
use std::rc::Rc;

use crate::codec::Codec;
use crate::config::ClientConfig;
use crate::cookie::CookieJar;
use crate::error::{CallError, Error, Result};
use crate::http::{RequestOptions, Response, TimeoutKind};
use crate::multiplexer::{Multiplexer, RequestKey};
use crate::validator::{Validation, Validator};

/// A multiplexer shared by several clients on one thread.
pub type SharedMultiplexer = Rc<RefCell<Multiplexer>>;

struct Session<C> {
    codec: C,
    config: RefCell<ClientConfig>,
    validator: RefCell<Option<Rc<dyn Validator>>>,
    cookies: RefCell<CookieJar>,
    mux: SharedMultiplexer,
    last_request: RefCell<Option<Vec<u8>>>,
    last_response: RefCell<Option<Response>>,
}

/// Blocking protocol client. Cheap to clone; clones share the session.
pub struct Client<C: Codec> {
    session: Rc<Session<C>>,
}

impl<C: Codec> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            session: Rc::clone(&self.session),
        }
    }
}

impl<C: Codec> Client<C> {
    /// Create a client with its own multiplexer.
    pub fn new(codec: C, config: ClientConfig) -> Result<Self> {
        let mux = Rc::new(RefCell::new(Multiplexer::new()?));
        Ok(Self::with_multiplexer(codec, config, mux))
    }

    /// Create a client that submits through an existing multiplexer.
    pub fn with_multiplexer(codec: C, config: ClientConfig, mux: SharedMultiplexer) -> Self {
        Self {
            session: Rc::new(Session {
                codec,
                config: RefCell::new(config),
                validator: RefCell::new(None),
                cookies: RefCell::new(CookieJar::new()),
                mux,
                last_request: RefCell::new(None),
                last_response: RefCell::new(None),
            }),
        }
    }

    /// Install the validator consulted after every attempt of every call.
    pub fn with_validator(self, validator: impl Validator + 'static) -> Self {
        self.set_validator(Some(Rc::new(validator)));
        self
    }

    pub fn set_validator(&self, validator: Option<Rc<dyn Validator>>) {
        *self.session.validator.borrow_mut() = validator;
    }

    pub fn multiplexer(&self) -> SharedMultiplexer {
        Rc::clone(&self.session.mux)
    }

    /// Cap concurrent transfers on the underlying multiplexer.
    pub fn throttle(&self, max_concurrency: Option<usize>) {
        self.session.mux.borrow_mut().throttle(max_concurrency);
    }

    pub fn location(&self) -> String {
        self.session.config.borrow().location.clone()
    }

    pub fn set_location(&self, location: impl Into<String>) {
        self.session.config.borrow_mut().location = location.into();
    }

    /// Set a session cookie, or remove it with `None`.
    pub fn set_cookie(&self, name: impl Into<String>, value: Option<String>) {
        self.session.cookies.borrow_mut().set(name, value);
    }

    pub fn cookies(&self) -> CookieJar {
        self.session.cookies.borrow().clone()
    }

    /// Body of the most recently submitted request.
    pub fn last_request(&self) -> Option<Vec<u8>> {
        self.session.last_request.borrow().clone()
    }

    /// Most recently collected terminal response.
    pub fn last_response(&self) -> Option<Response> {
        self.session.last_response.borrow().clone()
    }

    /// The entry point whose calls never block.
    pub fn async_api(&self) -> AsyncClient<C> {
        AsyncClient { client: self.clone() }
    }

    /// Submit a call and block until its result is decoded.
    pub fn call(&self, args: C::Args) -> std::result::Result<C::Output, CallError> {
        self.submit(args)?.into_result()
    }

    /// Submit a call and return a handle to collect it later.
    pub fn submit(&self, args: C::Args) -> std::result::Result<PendingCall<C>, CallError> {
        let options = self.prepare(&args)?;
        let target = options.url.clone();
        *self.session.last_request.borrow_mut() = Some(options.body.clone());

        let key = self
            .session
            .mux
            .borrow_mut()
            .add_request(options)
            .map_err(|kind| CallError::new(&target, format!("{args:?}"), kind))?;

        Ok(PendingCall {
            session: Rc::clone(&self.session),
            key,
            target,
            args,
            outcome: OnceCell::new(),
        })
    }

    /// Build the request a call would send, without sending it.
    pub fn prepare(&self, args: &C::Args) -> std::result::Result<RequestOptions, CallError> {
        let config = self.session.config.borrow();
        let envelope = self
            .session
            .codec
            .encode(args)
            .map_err(|kind| CallError::new(&config.location, format!("{args:?}"), kind))?;

        let url = match &envelope.path {
            Some(path) => format!(
                "{}/{}",
                config.location.trim_end_matches('/'),
                path.trim_start_matches('/')
            ),
            None => config.location.clone(),
        };

        let mut options = RequestOptions::post(url, envelope.body)
            .header("Content-Type", envelope.content_type)
            .header("User-Agent", config.user_agent.as_str());
        for (name, value) in envelope.headers.into_iter().chain(config.headers.iter().cloned()) {
            options = options.header(name, value);
        }
        if let Some(cookie) = self.session.cookies.borrow().header_value() {
            options = options.header("Cookie", cookie);
        }

        options.timeout = config.timeout();
        options.connect_timeout = config.connect_timeout();
        options.verify_tls = config.verify_tls;
        options.proxy = config.proxy.clone();
        options.basic_auth = config.basic_auth();
        options.host_override = config.host_override.clone();
        options.validator = self.session.validator.borrow().clone();
        Ok(options)
    }

    /// Decode a payload that did not come through this client's transport.
    pub fn decode(&self, body: &[u8], args: &C::Args) -> Result<C::Output> {
        self.session.codec.decode(body, args)
    }
}

/// Non-blocking view of a `Client`: every call returns a `PendingCall`.
pub struct AsyncClient<C: Codec> {
    client: Client<C>,
}

impl<C: Codec> AsyncClient<C> {
    pub fn call(&self, args: C::Args) -> std::result::Result<PendingCall<C>, CallError> {
        self.client.submit(args)
    }

    /// The blocking client this view wraps.
    pub fn client(&self) -> &Client<C> {
        &self.client
    }
}

/// A submitted call whose result has not necessarily been collected yet.
pub struct PendingCall<C: Codec> {
    session: Rc<Session<C>>,
    key: RequestKey,
    target: String,
    args: C::Args,
    outcome: OnceCell<std::result::Result<C::Output, CallError>>,
}

impl<C: Codec> PendingCall<C> {
    pub fn key(&self) -> RequestKey {
        self.key
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn args(&self) -> &C::Args {
        &self.args
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// Block until the request has been fully sent.
    pub fn wait_for_connect(&self) {
        if !self.is_resolved() {
            self.session.mux.borrow_mut().wait_for_connect(self.key);
        }
    }

    /// Block until the result is available and decode it. Later calls return
    /// the same cached outcome.
    pub fn await_result(&self) -> std::result::Result<&C::Output, &CallError> {
        self.outcome.get_or_init(|| self.resolve()).as_ref()
    }

    pub fn into_result(mut self) -> std::result::Result<C::Output, CallError> {
        match self.outcome.take() {
            Some(outcome) => outcome,
            None => self.resolve(),
        }
    }

    fn fail(&self, kind: Error) -> CallError {
        CallError::new(&self.target, format!("{:?}", self.args), kind)
    }

    fn resolve(&self) -> std::result::Result<C::Output, CallError> {
        let response = self
            .session
            .mux
            .borrow_mut()
            .get_result(self.key)
            .map_err(|kind| self.fail(kind))?;
        *self.session.last_response.borrow_mut() = Some(response.clone());

        let failure = match (response.timeout, &response.validation) {
            (TimeoutKind::Data, _) => Some(Error::DataTimeout),
            (TimeoutKind::Connect, _) => Some(Error::ConnectTimeout),
            (_, Validation::Aborted(reason)) => Some(Error::ValidatorAborted(reason.clone())),
            (_, Validation::Exhausted) => Some(Error::RetriesExhausted {
                attempts: response.info.attempt,
            }),
            _ if response.is_empty() => Some(Error::EmptyResponse(response.info.error.clone())),
            _ => None,
        };
        if let Some(kind) = failure {
            return Err(self.fail(kind).with_response(response));
        }

        self.session.cookies.borrow_mut().update_from_headers(&response.headers);
        self.session
            .codec
            .decode(&response.body, &self.args)
            .map_err(|kind| self.fail(kind).with_response(response))
    }
}

impl<C: Codec> Drop for PendingCall<C> {
    /// An unresolved call that goes away takes its result with it.
    fn drop(&mut self) {
        if self.is_resolved() {
            return;
        }
        if let Ok(mut mux) = self.session.mux.try_borrow_mut() {
            mux.forget(self.key);
        }
    }
}
