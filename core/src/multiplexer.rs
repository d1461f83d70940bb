//! The multiplexing engine.
//!
//! # Design
//! A `Multiplexer` owns a single-threaded tokio runtime: the shared polling
//! primitive every transfer is multiplexed over. Transfers only make progress
//! while the multiplexer drives that runtime, which happens inside the blocking
//! calls (`get_result`, `wait_for_connect`) and the one-step peek
//! (`get_available_results`). Each attempt runs as its own task on its own
//! connection and reports back over a channel; the multiplexer drains that
//! channel, classifies the outcome, consults the validator and either
//! re-launches the slot or parks the response in `completed`.
//!
//! Every key lives in exactly one of `running`, `waiting` and `completed`
//! until it is consumed. With a concurrency cap set, `running` never exceeds
//! it; excess slots queue in `waiting` and are started FIFO at the end of each
//! drive iteration, once the completions of that iteration freed capacity.
//!
//! The multiplexer must not be used from inside another tokio runtime.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Runtime;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::MultiplexerConfig;
use crate::error::{Error, Result};
use crate::http::{BodyHook, RequestOptions, Response, ResponseHook, TimeoutKind, TransferInfo, TransferStatus};
use crate::tls::TlsConnectors;
use crate::transport::{self, Progress, Transfer, TransportRequest};
use crate::validator::{Validation, Validator, Verdict};
use crate::wire;

/// Shortest wait for socket activity, so an overdue deadline cannot spin.
const MIN_POLL_WAIT: Duration = Duration::from_millis(5);

/// Longest single wait; the loop re-checks its state at least this often.
const MAX_POLL_WAIT: Duration = Duration::from_secs(1);

/// Upper bound on scheduler passes in one non-blocking step.
const MAX_STEP_PASSES: usize = 16;

/// Stable identifier of a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey(Uuid);

impl RequestKey {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Hooks applied once, when the response is first consumed.
#[derive(Default)]
struct Hooks {
    on_body: Option<BodyHook>,
    on_complete: Option<ResponseHook>,
}

impl Hooks {
    fn apply(self, mut response: Response) -> Response {
        if let Some(hook) = self.on_body {
            response.body = hook(std::mem::take(&mut response.body));
        }
        match self.on_complete {
            Some(hook) => hook(response),
            None => response,
        }
    }
}

/// The live network operation behind one attempt.
struct TransferHandle {
    task: JoinHandle<()>,
    progress: Arc<Progress>,
    started_at: Instant,
    deadline: Option<Instant>,
}

/// Bookkeeping for one logical request.
struct Slot {
    request: Arc<TransportRequest>,
    attempt: u32,
    validator: Option<Rc<dyn Validator>>,
    hooks: Hooks,
    /// `None` while the slot is waiting for capacity.
    handle: Option<TransferHandle>,
}

struct Completed {
    response: Response,
    hooks: Hooks,
}

enum EventKind {
    Sent,
    Finished(Transfer),
}

struct Event {
    key: RequestKey,
    attempt: u32,
    kind: EventKind,
}

/// Runs many HTTP exchanges concurrently over one polling runtime.
pub struct Multiplexer {
    runtime: Runtime,
    tls: Arc<TlsConnectors>,
    events_tx: UnboundedSender<Event>,
    events: UnboundedReceiver<Event>,
    running: HashMap<RequestKey, Slot>,
    waiting: VecDeque<(RequestKey, Slot)>,
    completed: HashMap<RequestKey, Completed>,
    /// Running keys whose result nobody will collect.
    abandoned: HashSet<RequestKey>,
    max_concurrency: Option<usize>,
    max_tries: u32,
}

impl Multiplexer {
    /// Create a multiplexer with the default configuration.
    ///
    /// Fails when the polling runtime or the TLS stack cannot be created.
    pub fn new() -> Result<Self> {
        Self::with_config(MultiplexerConfig::default())
    }

    pub fn with_config(config: MultiplexerConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Init)?;
        let tls = Arc::new(TlsConnectors::new()?);
        let (events_tx, events) = unbounded_channel();
        Ok(Self {
            runtime,
            tls,
            events_tx,
            events,
            running: HashMap::new(),
            waiting: VecDeque::new(),
            completed: HashMap::new(),
            abandoned: HashSet::new(),
            max_concurrency: config.max_concurrency.map(|max| max.max(1)),
            max_tries: config.max_tries.max(1),
        })
    }

    /// Set or clear the concurrency cap. Already running transfers are left
    /// alone; queued ones start as capacity allows.
    pub fn throttle(&mut self, max_concurrency: Option<usize>) {
        self.max_concurrency = max_concurrency.map(|max| max.max(1));
    }

    pub fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Whether `key` is running, waiting or completed but not yet consumed.
    pub fn is_tracked(&self, key: RequestKey) -> bool {
        self.running.contains_key(&key)
            || self.completed.contains_key(&key)
            || self.waiting.iter().any(|(k, _)| *k == key)
    }

    /// Submit a request. It starts right away when capacity allows and is
    /// queued otherwise; no I/O happens until the multiplexer is driven.
    pub fn add_request(&mut self, options: RequestOptions) -> Result<RequestKey> {
        let RequestOptions {
            url,
            method,
            headers,
            body,
            timeout,
            connect_timeout,
            verify_tls,
            proxy,
            basic_auth,
            host_override,
            validator,
            on_body,
            on_complete,
        } = options;

        let request = Arc::new(TransportRequest {
            method,
            url: transport::parse_target(&url)?,
            headers,
            body,
            timeout,
            connect_timeout,
            verify_tls,
            proxy,
            basic_auth,
            host_override,
        });
        let slot = Slot {
            request,
            attempt: 1,
            validator,
            hooks: Hooks { on_body, on_complete },
            handle: None,
        };

        let key = RequestKey::new();
        if self.waiting.is_empty() && self.has_capacity() {
            self.launch(key, slot);
        } else {
            debug!(%key, url = %slot.request.url, waiting = self.waiting.len() + 1, "request queued");
            self.waiting.push_back((key, slot));
        }
        Ok(key)
    }

    /// Block until `key` has a terminal response and consume it.
    ///
    /// Completions of other requests discovered on the way stay in
    /// `completed` for their own callers.
    pub fn get_result(&mut self, key: RequestKey) -> Result<Response> {
        loop {
            if let Some(done) = self.completed.remove(&key) {
                return Ok(done.hooks.apply(done.response));
            }
            if !self.is_tracked(key) {
                return Err(Error::UnknownRequest(key));
            }
            self.drive(true);
        }
    }

    /// Drive the runtime one non-blocking step and return what has completed.
    ///
    /// With `consume`, the returned responses are removed and their hooks
    /// applied; otherwise they stay pending for a later `get_result`.
    /// Returns `None` when nothing is running, waiting or completed.
    pub fn get_available_results(&mut self, consume: bool) -> Option<HashMap<RequestKey, Response>> {
        if self.running.is_empty() && self.waiting.is_empty() && self.completed.is_empty() {
            return None;
        }
        self.drive(false);

        let results = if consume {
            self.completed
                .drain()
                .map(|(key, done)| (key, done.hooks.apply(done.response)))
                .collect()
        } else {
            self.completed
                .iter()
                .map(|(key, done)| (*key, done.response.clone()))
                .collect()
        };
        Some(results)
    }

    /// Block until the request for `key` has been fully transmitted, or until
    /// it is no longer in flight. Connect failures surface later through
    /// `get_result`.
    pub fn wait_for_connect(&mut self, key: RequestKey) {
        loop {
            match self.running.get(&key) {
                Some(slot) => {
                    if slot.handle.as_ref().is_some_and(|h| h.progress.request_sent()) {
                        return;
                    }
                }
                None if self.waiting.iter().any(|(k, _)| *k == key) => {}
                None => return,
            }
            self.drive(true);
        }
    }

    /// Stop tracking `key`. A completed or queued entry is dropped at once; a
    /// running transfer is left to finish and its result is discarded.
    pub fn forget(&mut self, key: RequestKey) {
        if self.completed.remove(&key).is_some() {
            debug!(%key, "completed result discarded");
        } else if let Some(pos) = self.waiting.iter().position(|(k, _)| *k == key) {
            self.waiting.remove(pos);
            debug!(%key, "queued request discarded");
        } else if self.running.contains_key(&key) {
            self.abandoned.insert(key);
        }
    }

    fn has_capacity(&self) -> bool {
        self.max_concurrency.map_or(true, |max| self.running.len() < max)
    }

    /// Start a fresh attempt for `slot` on a brand-new transfer.
    fn launch(&mut self, key: RequestKey, mut slot: Slot) {
        let progress = Arc::new(Progress::default());
        let started_at = Instant::now();
        let deadline = slot.request.earliest_timeout().map(|limit| started_at + limit);
        let attempt = slot.attempt;

        let request = Arc::clone(&slot.request);
        let tls = Arc::clone(&self.tls);
        let task_progress = Arc::clone(&progress);
        let events = self.events_tx.clone();
        let task = self.runtime.spawn(async move {
            let sent_events = events.clone();
            let on_sent = move || {
                let _ = sent_events.send(Event {
                    key,
                    attempt,
                    kind: EventKind::Sent,
                });
            };
            let transfer = transport::perform(&request, &task_progress, &tls, on_sent).await;
            let _ = events.send(Event {
                key,
                attempt,
                kind: EventKind::Finished(transfer),
            });
        });

        debug!(%key, attempt, url = %slot.request.url, "transfer started");
        slot.handle = Some(TransferHandle {
            task,
            progress,
            started_at,
            deadline,
        });
        self.running.insert(key, slot);
    }

    /// How long to wait for activity: until the earliest running deadline,
    /// clamped to `[MIN_POLL_WAIT, MAX_POLL_WAIT]`.
    fn poll_wait(&self) -> Duration {
        let now = Instant::now();
        self.running
            .values()
            .filter_map(|slot| slot.handle.as_ref()?.deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(MAX_POLL_WAIT)
            .clamp(MIN_POLL_WAIT, MAX_POLL_WAIT)
    }

    /// One iteration of the polling loop: gather events, process
    /// completions, reap tasks that died without reporting, then refill from
    /// the waiting queue.
    fn drive(&mut self, block: bool) -> usize {
        self.refill();
        let wait = block.then(|| self.poll_wait());
        let events = &mut self.events;
        let mut batch: Vec<Event> = self.runtime.block_on(async {
            let mut batch = Vec::new();
            match wait {
                Some(wait) => {
                    if let Ok(Some(first)) = tokio::time::timeout(wait, events.recv()).await {
                        batch.push(first);
                    }
                }
                None => {
                    for _ in 0..MAX_STEP_PASSES {
                        tokio::task::yield_now().await;
                        let before = batch.len();
                        while let Ok(next) = events.try_recv() {
                            batch.push(next);
                        }
                        if batch.len() == before {
                            break;
                        }
                    }
                }
            }
            while let Ok(next) = events.try_recv() {
                batch.push(next);
            }
            batch
        });

        // A finished task has already sent its last event, so draining after
        // this snapshot leaves only tasks that died without one.
        let ended: Vec<(RequestKey, u32)> = self
            .running
            .iter()
            .filter(|(_, slot)| slot.handle.as_ref().is_some_and(|h| h.task.is_finished()))
            .map(|(key, slot)| (*key, slot.attempt))
            .collect();
        while let Ok(next) = self.events.try_recv() {
            batch.push(next);
        }

        let mut finished = 0;
        for event in batch {
            match event.kind {
                EventKind::Sent => trace!(key = %event.key, attempt = event.attempt, "request sent"),
                EventKind::Finished(transfer) => {
                    finished += 1;
                    self.complete(event.key, event.attempt, transfer);
                }
            }
        }
        finished += self.reap(ended);
        self.refill();
        finished
    }

    /// Complete slots whose attempt task ended without a `Finished` event.
    fn reap(&mut self, ended: Vec<(RequestKey, u32)>) -> usize {
        let mut reaped = 0;
        for (key, attempt) in ended {
            let Some(slot) = self.running.get_mut(&key) else {
                continue;
            };
            if slot.attempt != attempt {
                continue;
            }
            let Some(handle) = slot.handle.take() else {
                continue;
            };
            let url = slot.request.url.to_string();

            let message = match self.runtime.block_on(handle.task) {
                Ok(()) => "transfer ended without a result".to_string(),
                Err(e) if e.is_panic() => format!("transfer panicked: {}", panic_message(e.into_panic())),
                Err(e) => e.to_string(),
            };
            warn!(%key, attempt, error = %message, "transfer task died");

            let transfer = Transfer {
                status: TransferStatus::RecvError,
                raw: Vec::new(),
                info: TransferInfo {
                    url,
                    total_time: handle.started_at.elapsed(),
                    request_size: handle.progress.bytes_sent(),
                    error: Some(message),
                    ..TransferInfo::default()
                },
            };
            self.complete(key, attempt, transfer);
            reaped += 1;
        }
        reaped
    }

    /// Start queued slots, oldest first, while capacity allows.
    fn refill(&mut self) {
        while self.has_capacity() {
            let Some((key, slot)) = self.waiting.pop_front() else {
                break;
            };
            self.launch(key, slot);
        }
    }

    fn complete(&mut self, key: RequestKey, attempt: u32, transfer: Transfer) {
        let Some(mut slot) = self.running.remove(&key) else {
            warn!(%key, attempt, "completion for untracked request");
            return;
        };
        if let Some(handle) = slot.handle.take() {
            trace!(%key, elapsed = ?handle.started_at.elapsed(), "releasing transfer");
            drop(handle.task);
        }
        if self.abandoned.remove(&key) {
            debug!(%key, attempt, "abandoned request finished, result discarded");
            return;
        }

        let mut response = classify(transfer, attempt);
        if response.timeout != TimeoutKind::Data {
            if let Some(validator) = slot.validator.clone() {
                response.validation = match validator.validate(&response, attempt) {
                    Verdict::Accept => Validation::Accepted,
                    Verdict::Retry if attempt < self.max_tries => {
                        debug!(%key, attempt, "validator asked for a retry");
                        slot.attempt += 1;
                        self.launch(key, slot);
                        return;
                    }
                    Verdict::Retry => {
                        warn!(%key, attempt, "retry ceiling reached");
                        Validation::Exhausted
                    }
                    Verdict::Abort(reason) => Validation::Aborted(reason),
                };
            }
        }

        debug!(
            %key,
            attempt,
            status = ?response.status,
            http_code = ?response.info.http_code,
            timeout = ?response.timeout,
            "request completed"
        );
        self.completed.insert(
            key,
            Completed {
                response,
                hooks: slot.hooks,
            },
        );
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("running", &self.running.len())
            .field("waiting", &self.waiting.len())
            .field("completed", &self.completed.len())
            .field("max_concurrency", &self.max_concurrency)
            .field("max_tries", &self.max_tries)
            .finish()
    }
}

/// Turn a finished transfer into a response: timeout classification, header
/// peeling and body decoding.
fn classify(transfer: Transfer, attempt: u32) -> Response {
    let Transfer { status, raw, mut info } = transfer;

    let timeout = match status {
        TransferStatus::TimedOut if info.request_size == 0 => TimeoutKind::Connect,
        TransferStatus::TimedOut => TimeoutKind::Data,
        _ => TimeoutKind::None,
    };

    let (headers, body) = wire::split_response(&raw);
    info.attempt = attempt;
    info.http_code = wire::status_code(&headers);
    info.header_size = (raw.len() - body.len()) as u64;
    let body = wire::decode_body(&headers, body);

    Response {
        info,
        headers,
        body,
        timeout,
        status,
        validation: Validation::Unchecked,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast_ref::<&str>() {
            Some(message) => (*message).to_string(),
            None => "unknown panic".to_string(),
        },
    }
}
