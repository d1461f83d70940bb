//! JSON RPC mock endpoint used by the integration tests.
//!
//! Every call is a `POST /rpc` with `{"method", "params"}`. The methods exist
//! to provoke the situations a multiplexing client has to cope with: slow
//! replies, replies that never come, transient failures, protocol faults and
//! session cookies. `GET /stats` reports how many calls were served and how
//! many ran at once.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{ConnectInfo, FromRequest, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

/// How long `stall` sleeps when no delay is given.
pub const DEFAULT_STALL_MS: u64 = 30_000;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Call {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stats {
    pub hits: u64,
    pub in_flight: u64,
    pub max_in_flight: u64,
}

#[derive(Default)]
pub struct ServerState {
    hits: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
    /// Peer port of every call seen so far per `flaky` token; 0 when the
    /// router runs without connection info.
    flaky: RwLock<HashMap<String, Vec<u16>>>,
}

impl ServerState {
    fn stats(&self) -> Stats {
        Stats {
            hits: self.hits.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            max_in_flight: self.max_in_flight.load(Ordering::SeqCst),
        }
    }

    fn enter(self: &Arc<Self>) -> InFlight {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(Arc::clone(self))
    }
}

/// Keeps `in_flight` accurate even when the client hangs up mid-call.
struct InFlight(Arc<ServerState>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub type Shared = Arc<ServerState>;

pub fn app() -> Router {
    let state: Shared = Arc::new(ServerState::default());
    Router::new()
        .route("/rpc", post(rpc))
        .route("/stats", get(stats))
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app().into_make_service_with_connect_info::<SocketAddr>()).await
}

async fn stats(State(state): State<Shared>) -> Json<Stats> {
    Json(state.stats())
}

async fn rpc(State(state): State<Shared>, request: Request) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.port());
    let headers = request.headers().clone();
    let call = match Json::<Call>::from_request(request, &state).await {
        Ok(Json(call)) => call,
        Err(rejection) => return rejection.into_response(),
    };
    let _guard = state.enter();
    tracing::debug!(method = %call.method, "rpc call");

    match call.method.as_str() {
        "echo" => {
            sleep_for(&call.params, 0).await;
            let message = match call.params.get("id") {
                Some(id) => format!("Request #{id} done"),
                None => "done".to_string(),
            };
            reply(json!({ "message": message, "echo": call.params }))
        }
        "stall" => {
            sleep_for(&call.params, DEFAULT_STALL_MS).await;
            reply(Value::Null)
        }
        "fail" => {
            let code = call.params.get("code").and_then(Value::as_i64).unwrap_or(500);
            let message = call.params.get("message").and_then(Value::as_str).unwrap_or("failure requested");
            fault(code, message)
        }
        "flaky" => flaky(&state, &call.params, peer.unwrap_or(0)).await,
        "login" => {
            let session = Uuid::new_v4();
            let cookie = format!("session={session}; Path=/; HttpOnly");
            ([(header::SET_COOKIE, cookie)], reply(json!({ "session": session }))).into_response()
        }
        "whoami" => {
            let cookie = headers.get(header::COOKIE).and_then(|v| v.to_str().ok());
            reply(json!({ "cookie": cookie }))
        }
        other => fault(-32601, &format!("unknown method {other}")),
    }
}

/// Fails with an empty 503 until the token has been seen `failures` times,
/// then reports how many calls it took and the peer port of each.
async fn flaky(state: &Shared, params: &Value, peer: u16) -> Response {
    let token = params.get("token").and_then(Value::as_str).unwrap_or_default().to_string();
    let failures = params.get("failures").and_then(Value::as_u64).unwrap_or(1);

    let peers = {
        let mut flaky = state.flaky.write().await;
        let peers = flaky.entry(token).or_default();
        peers.push(peer);
        peers.clone()
    };
    let seen = peers.len() as u64;
    if seen <= failures {
        tracing::debug!(seen, failures, peer, "flaky call failing");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    reply(json!({ "attempts": seen, "peers": peers }))
}

async fn sleep_for(params: &Value, default_ms: u64) {
    let ms = params.get("delay_ms").and_then(Value::as_u64).unwrap_or(default_ms);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

fn reply(result: Value) -> Response {
    Json(json!({ "result": result })).into_response()
}

fn fault(code: i64, message: &str) -> Response {
    Json(json!({ "error": { "code": code, "message": message } })).into_response()
}
