//! End-to-end tests against the live mock server.
//!
//! # Design
//! Each test starts its own mock server on a random port in a background
//! thread, so call counts reported by `/stats` belong to that test alone.
//! Requests go through the real multiplexer and transport; `/stats` is read
//! with ureq, outside the code under test.

use std::cell::Cell;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use callmux_core::{
    Call, Client, ClientConfig, Error, JsonCodec, Multiplexer, MultiplexerConfig, RequestOptions, Response,
    RetryOnFailure, TimeoutKind, TransferStatus, Validation, Verdict, MAX_TRIES,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

/// Route multiplexer logs to the test output; `RUST_LOG=callmux_core=trace`
/// shows every transfer.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn start_server() -> SocketAddr {
    init_tracing();
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::run(listener).await
        })
        .unwrap();
    });
    addr
}

fn stats(addr: SocketAddr) -> mock_server::Stats {
    let mut response = ureq::get(&format!("http://{addr}/stats")).call().expect("stats request");
    let body = response.body_mut().read_to_string().unwrap();
    serde_json::from_str(&body).unwrap()
}

fn client(addr: SocketAddr) -> Client<JsonCodec> {
    let config = ClientConfig::new(format!("http://{addr}/rpc")).with_timeout(Duration::from_secs(10));
    Client::new(JsonCodec, config).unwrap()
}

fn rpc(addr: SocketAddr, method: &str, params: Value) -> RequestOptions {
    let body = serde_json::to_vec(&Call::new(method, params)).unwrap();
    RequestOptions::post(format!("http://{addr}/rpc"), body)
        .header("Content-Type", "application/json")
        .timeout(Duration::from_secs(10))
}

fn result_of(response: &Response) -> Value {
    let reply: Value = serde_json::from_slice(&response.body).unwrap();
    reply["result"].clone()
}

// --- multiplexer ---

#[test]
fn results_are_collected_in_any_order() {
    let addr = start_server();
    let mut mux = Multiplexer::new().unwrap();

    let slow = mux.add_request(rpc(addr, "echo", json!({"id": 1, "delay_ms": 300}))).unwrap();
    let fast = mux.add_request(rpc(addr, "echo", json!({"id": 2}))).unwrap();
    assert_eq!(mux.running_count(), 2);

    let first = mux.get_result(slow).unwrap();
    assert_eq!(result_of(&first)["message"], "Request #1 done");
    assert_eq!(first.status_code(), Some(200));
    assert_eq!(first.timeout, TimeoutKind::None);
    // the fast one finished while we waited for the slow one
    assert_eq!(mux.completed_count(), 1);

    let second = mux.get_result(fast).unwrap();
    assert_eq!(result_of(&second)["message"], "Request #2 done");

    assert!(matches!(mux.get_result(fast), Err(Error::UnknownRequest(key)) if key == fast));
    assert!(!mux.is_tracked(slow));
}

#[test]
fn completed_result_is_returned_without_waiting() {
    let addr = start_server();
    let mut mux = Multiplexer::new().unwrap();

    let fast = mux.add_request(rpc(addr, "echo", json!({"id": 1}))).unwrap();
    let slow = mux.add_request(rpc(addr, "echo", json!({"id": 2, "delay_ms": 300}))).unwrap();
    let stalled = mux.add_request(rpc(addr, "stall", json!({"delay_ms": 5000}))).unwrap();

    mux.get_result(slow).unwrap();
    assert_eq!(mux.completed_count(), 1);
    assert_eq!(mux.running_count(), 1);

    // any wait on the stalled transfer would take up to a full poll interval
    let started = Instant::now();
    let response = mux.get_result(fast).unwrap();
    assert!(started.elapsed() < Duration::from_millis(200), "took {:?}", started.elapsed());
    assert_eq!(result_of(&response)["message"], "Request #1 done");
    assert_eq!(mux.completed_count(), 0);
    assert_eq!(mux.running_count(), 1);
    assert!(mux.is_tracked(stalled));
}

#[test]
fn hostile_chunk_length_still_completes() {
    init_tracing();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => head.extend_from_slice(&buf[..n]),
            }
        }
        let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabc\r\n");
    });

    let mut mux = Multiplexer::new().unwrap();
    let key = mux
        .add_request(RequestOptions::get(format!("http://{addr}/")).timeout(Duration::from_secs(2)))
        .unwrap();

    let started = Instant::now();
    let response = mux.get_result(key).unwrap();
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(response.status_code(), Some(200));
    assert_eq!(response.body, b"ffffffffffffffff\r\nabc\r\n");
}

#[test]
fn throttle_caps_concurrent_transfers() {
    let addr = start_server();
    let mut mux = Multiplexer::with_config(MultiplexerConfig {
        max_concurrency: Some(3),
        ..MultiplexerConfig::default()
    })
    .unwrap();

    let keys: Vec<_> = (0..8)
        .map(|id| mux.add_request(rpc(addr, "echo", json!({"id": id, "delay_ms": 100}))).unwrap())
        .collect();
    assert_eq!(mux.running_count(), 3);
    assert_eq!(mux.waiting_count(), 5);

    for (id, key) in keys.into_iter().enumerate() {
        let response = mux.get_result(key).unwrap();
        assert_eq!(result_of(&response)["message"], format!("Request #{id} done"));
    }

    let stats = stats(addr);
    assert_eq!(stats.hits, 8);
    assert!(stats.max_in_flight <= 3, "max in flight was {}", stats.max_in_flight);
}

#[test]
fn available_results_can_be_peeked_then_consumed() {
    let addr = start_server();
    let mut mux = Multiplexer::new().unwrap();
    let a = mux.add_request(rpc(addr, "echo", json!({"id": "a"}))).unwrap();
    let b = mux.add_request(rpc(addr, "echo", json!({"id": "b"}))).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let peeked = mux.get_available_results(false).unwrap();
        if peeked.len() == 2 {
            break;
        }
        assert!(Instant::now() < deadline, "requests never completed");
        std::thread::sleep(Duration::from_millis(10));
    }

    // peeking left everything in place
    assert_eq!(mux.completed_count(), 2);
    let consumed = mux.get_available_results(true).unwrap();
    assert_eq!(consumed.len(), 2);
    assert!(consumed.contains_key(&a) && consumed.contains_key(&b));
    assert_eq!(mux.completed_count(), 0);
    assert!(mux.get_available_results(true).is_none());
}

#[test]
fn wait_for_connect_returns_before_the_reply() {
    let addr = start_server();
    let mut mux = Multiplexer::new().unwrap();
    let key = mux.add_request(rpc(addr, "echo", json!({"id": 1, "delay_ms": 500}))).unwrap();

    mux.wait_for_connect(key);
    assert_eq!(mux.completed_count(), 0);
    assert_eq!(mux.running_count(), 1);

    let response = mux.get_result(key).unwrap();
    assert!(response.info.request_size > 0);
    assert!(response.info.connect_time.is_some());
}

#[test]
fn hooks_run_when_the_result_is_consumed() {
    let addr = start_server();
    let mut mux = Multiplexer::new().unwrap();
    let options = rpc(addr, "echo", json!({"id": 1}))
        .on_body(|body| body.to_ascii_uppercase())
        .on_complete(|mut response| {
            response.headers.clear();
            response
        });
    let key = mux.add_request(options).unwrap();

    let response = mux.get_result(key).unwrap();
    assert!(response.body_text().contains("REQUEST #1 DONE"));
    assert!(response.headers.is_empty());
}

#[test]
fn validator_retries_until_accepted() {
    let addr = start_server();
    let mut mux = Multiplexer::new().unwrap();
    let options = rpc(addr, "flaky", json!({"token": "retry", "failures": 2})).validator(Rc::new(RetryOnFailure));
    let key = mux.add_request(options).unwrap();

    let response = mux.get_result(key).unwrap();
    assert_eq!(response.validation, Validation::Accepted);
    assert_eq!(response.info.attempt, 3);
    assert_eq!(result_of(&response)["attempts"], 3);
    assert_eq!(stats(addr).hits, 3);
}

#[test]
fn every_retry_uses_a_new_connection() {
    let addr = start_server();
    let mut mux = Multiplexer::new().unwrap();
    let options = rpc(addr, "flaky", json!({"token": "fresh", "failures": 3})).validator(Rc::new(RetryOnFailure));
    let key = mux.add_request(options).unwrap();

    let response = mux.get_result(key).unwrap();
    let peers: Vec<u64> = result_of(&response)["peers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|port| port.as_u64().unwrap())
        .collect();
    assert_eq!(peers.len(), 4);
    let distinct: HashSet<u64> = peers.iter().copied().collect();
    assert_eq!(distinct.len(), 4, "ports were {peers:?}");
}

#[test]
fn data_timeout_is_never_retried() {
    let addr = start_server();
    let seen = Rc::new(Cell::new(0));
    let counter = Rc::clone(&seen);
    let validator = move |_: &Response, _: u32| {
        counter.set(counter.get() + 1);
        Verdict::Retry
    };

    let mut mux = Multiplexer::new().unwrap();
    let options = rpc(addr, "stall", json!({"delay_ms": 5000}))
        .timeout(Duration::from_millis(300))
        .validator(Rc::new(validator));
    let key = mux.add_request(options).unwrap();

    let response = mux.get_result(key).unwrap();
    assert_eq!(response.timeout, TimeoutKind::Data);
    assert_eq!(response.status, TransferStatus::TimedOut);
    assert_eq!(response.validation, Validation::Unchecked);
    assert_eq!(seen.get(), 0);
    assert_eq!(stats(addr).hits, 1);
}

#[test]
fn handshake_stall_is_a_connect_timeout() {
    init_tracing();
    // accepts at the TCP level but never speaks TLS
    let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = silent.local_addr().unwrap();

    let mut mux = Multiplexer::new().unwrap();
    let options = RequestOptions::post(format!("https://{addr}/rpc"), b"{}".to_vec())
        .connect_timeout(Duration::from_millis(300))
        .timeout(Duration::from_secs(5));
    let key = mux.add_request(options).unwrap();

    let started = Instant::now();
    let response = mux.get_result(key).unwrap();
    assert_eq!(response.timeout, TimeoutKind::Connect);
    assert_eq!(response.info.request_size, 0);
    assert!(response.is_empty());
    assert!(started.elapsed() < Duration::from_secs(3));
    drop(silent);
}

// --- client facade ---

#[test]
fn throttled_calls_resolve_in_submission_order() {
    let addr = start_server();
    let client = client(addr);
    client.throttle(Some(2));
    let api = client.async_api();

    let started = Instant::now();
    let calls: Vec<_> = [(1, 800), (2, 400), (3, 200)]
        .into_iter()
        .map(|(id, delay)| api.call(Call::new("echo", json!({"id": id, "delay_ms": delay}))).unwrap())
        .collect();
    assert_eq!(client.multiplexer().borrow().running_count(), 2);
    assert_eq!(client.multiplexer().borrow().waiting_count(), 1);

    for (id, call) in (1..).zip(&calls) {
        let result = call.await_result().unwrap();
        assert_eq!(result["message"], format!("Request #{id} done"));
    }
    assert!(started.elapsed() < Duration::from_secs(3));

    let stats = stats(addr);
    assert_eq!(stats.hits, 3);
    assert!(stats.max_in_flight <= 2);
}

#[test]
fn await_result_is_cached() {
    let addr = start_server();
    let client = client(addr);
    let call = client.submit(Call::new("echo", json!({"id": 9}))).unwrap();
    assert!(!call.is_resolved());

    let first = call.await_result().unwrap() as *const Value;
    let second = call.await_result().unwrap() as *const Value;
    assert_eq!(first, second);
    assert!(call.is_resolved());
    assert_eq!(stats(addr).hits, 1);
    assert_eq!(call.into_result().unwrap()["message"], "Request #9 done");
}

#[test]
fn abandoned_calls_leave_nothing_behind() {
    let addr = start_server();
    let client = client(addr);
    let mux = client.multiplexer();

    let finished_early = client.submit(Call::new("echo", json!({"id": 1}))).unwrap();
    let still_running = client.submit(Call::new("echo", json!({"id": 2, "delay_ms": 300}))).unwrap();
    let kept = client.submit(Call::new("echo", json!({"id": 3, "delay_ms": 100}))).unwrap();

    kept.await_result().unwrap();
    assert_eq!(mux.borrow().completed_count(), 1);
    drop(finished_early);
    assert_eq!(mux.borrow().completed_count(), 0);

    drop(still_running);
    let deadline = Instant::now() + Duration::from_secs(10);
    while mux.borrow().running_count() > 0 {
        assert!(Instant::now() < deadline, "abandoned transfer never finished");
        mux.borrow_mut().get_available_results(false);
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(mux.borrow().completed_count(), 0);
}

#[test]
fn retry_ceiling_is_reported() {
    let addr = start_server();
    let client = client(addr).with_validator(RetryOnFailure);

    let err = client
        .call(Call::new("flaky", json!({"token": "never", "failures": 100})))
        .unwrap_err();
    assert!(matches!(err.kind(), Error::RetriesExhausted { attempts } if *attempts == MAX_TRIES));
    assert_eq!(err.response.as_ref().unwrap().status_code(), Some(503));
    assert_eq!(stats(addr).hits, u64::from(MAX_TRIES));
}

#[test]
fn validator_can_abort() {
    let addr = start_server();
    let client = client(addr).with_validator(|response: &Response, _: u32| match response.status_code() {
        Some(503) => Verdict::Abort("service unavailable".to_string()),
        _ => Verdict::Accept,
    });

    let err = client
        .call(Call::new("flaky", json!({"token": "abort", "failures": 1})))
        .unwrap_err();
    assert!(matches!(err.kind(), Error::ValidatorAborted(reason) if reason == "service unavailable"));
    assert_eq!(stats(addr).hits, 1);
}

#[test]
fn fault_becomes_remote_error() {
    let addr = start_server();
    let err = client(addr)
        .call(Call::new("fail", json!({"code": 7, "message": "bad input"})))
        .unwrap_err();
    assert!(matches!(err.kind(), Error::Remote { code: 7, message } if message == "bad input"));
    assert!(err.target.ends_with("/rpc"));
    assert!(err.arguments.contains("fail"));
    assert!(err.response.is_some());
}

#[test]
fn data_timeout_surfaces_as_error() {
    let addr = start_server();
    let config = ClientConfig::new(format!("http://{addr}/rpc")).with_timeout(Duration::from_millis(300));
    let client = Client::new(JsonCodec, config).unwrap();

    let err = client.call(Call::new("stall", json!({"delay_ms": 5000}))).unwrap_err();
    assert!(matches!(err.kind(), Error::DataTimeout));
    assert!(err.kind().is_timeout());
}

#[test]
fn refused_connection_is_an_empty_response() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = Client::new(JsonCodec, ClientConfig::new(format!("http://127.0.0.1:{port}/rpc"))).unwrap();

    let err = client.call(Call::new("echo", json!({}))).unwrap_err();
    match err.kind() {
        Error::EmptyResponse(Some(message)) => assert!(message.contains("could not connect")),
        other => panic!("expected an empty response, got {other:?}"),
    }
    assert_eq!(err.response.unwrap().status, TransferStatus::CouldntConnect);
}

#[test]
fn session_cookie_round_trips() {
    let addr = start_server();
    let client = client(addr);

    let login = client.call(Call::new("login", json!({}))).unwrap();
    let session = login["session"].as_str().unwrap().to_string();
    assert_eq!(client.cookies().get("session"), Some(session.as_str()));

    let whoami = client.call(Call::new("whoami", json!({}))).unwrap();
    assert_eq!(whoami["cookie"], format!("session={session}"));

    client.set_cookie("session", None);
    let whoami = client.call(Call::new("whoami", json!({}))).unwrap();
    assert_eq!(whoami["cookie"], Value::Null);
}

#[test]
fn last_request_and_response_are_kept() {
    let addr = start_server();
    let client = client(addr);
    client.call(Call::new("echo", json!({"id": 4}))).unwrap();

    let sent: Value = serde_json::from_slice(&client.last_request().unwrap()).unwrap();
    assert_eq!(sent, json!({"method": "echo", "params": {"id": 4}}));
    let received = client.last_response().unwrap();
    assert_eq!(received.header("content-type"), Some("application/json"));
}
