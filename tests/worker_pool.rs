//! End-to-end tests for the worker-pool server.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use stackserve::config::ServerMode;
use stackserve::{ServerError, Shutdown, WorkerPoolServer};

mod common;

use common::{test_config, test_router, try_parse, RawResponse};

async fn start() -> (SocketAddr, Shutdown, JoinHandle<Result<(), ServerError>>) {
    let shutdown = Shutdown::new();
    let server = WorkerPoolServer::bind(test_config(ServerMode::WorkerPool), test_router(), shutdown.clone())
        .await
        .expect("bind worker pool");
    let addr = server.local_addr().unwrap();
    let handle = tokio::spawn(server.run());
    (addr, shutdown, handle)
}

/// One request per connection: write, then read until the server closes.
async fn exchange(addr: SocketAddr, raw: &[u8]) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    let mut buf = Vec::new();
    tokio::time::timeout(common::IO_TIMEOUT, stream.read_to_end(&mut buf))
        .await
        .expect("server closes the connection")
        .unwrap();
    let (response, used) = try_parse(&buf).expect("complete response");
    assert_eq!(used, buf.len(), "exactly one response per connection");
    response
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn serves_json_and_closes() {
    let (addr, shutdown, handle) = start().await;

    let response = exchange(addr, b"GET /ping HTTP/1.1\r\nHost: test\r\n\r\n").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("application/json"));
    assert_eq!(response.body, r#"{"message":"pong"}"#);

    shutdown.trigger();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reads_body_by_content_length() {
    let (addr, shutdown, handle) = start().await;

    let response = exchange(addr, b"POST /echo HTTP/1.1\r\nContent-Length: 7\r\n\r\npayload").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "payload");

    shutdown.trigger();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn default_handlers_answer_errors() {
    let (addr, shutdown, handle) = start().await;

    let bad = exchange(addr, b"GET /ping\r\n\r\n").await;
    assert_eq!(bad.status, 403);
    assert_eq!(bad.body, "Bad request");

    let missing = exchange(addr, b"GET /nowhere HTTP/1.1\r\n\r\n").await;
    assert_eq!(missing.status, 404);
    assert_eq!(missing.body, "Page not found");

    shutdown.trigger();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_and_timeout_strategies_apply() {
    let (addr, shutdown, handle) = start().await;

    let response = exchange(addr, b"GET /async HTTP/1.1\r\n\r\n").await;
    assert_eq!(response.body, "async done");

    let started = Instant::now();
    let response = exchange(addr, b"GET /slow HTTP/1.1\r\n\r\n").await;
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "this router timeout");

    shutdown.trigger();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_clients_are_all_served() {
    let (addr, shutdown, handle) = start().await;

    let clients: Vec<_> = (0..16)
        .map(|i| {
            tokio::spawn(async move {
                let body = format!("client-{i}");
                let raw = format!("POST /echo HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
                (body, exchange(addr, raw.as_bytes()).await)
            })
        })
        .collect();

    for client in clients {
        let (sent, response) = client.await.unwrap();
        assert_eq!(response.body, sent);
    }

    shutdown.trigger();
    handle.await.unwrap().unwrap();
}
