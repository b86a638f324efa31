//! Shared utilities for the server integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::json;
use stackserve::config::{ServerConfig, ServerMode};
use stackserve::net::ConnectionTracker;
use stackserve::resilience::Strategy;
use stackserve::routing::{handler, Router};
use stackserve::{EventLoopServer, ServerError, Shutdown};

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Routes exercised by both server models.
pub fn test_router() -> Arc<Router> {
    let mut builder = Router::builder();
    builder.register(
        "GET",
        "/ping",
        [handler(|ctx| ctx.json(200, &json!({ "message": "pong" })))],
    );
    builder.register(
        "POST",
        "/echo",
        [handler(|ctx| {
            let body = String::from_utf8_lossy(ctx.body()).into_owned();
            ctx.text(200, body);
        })],
    );
    builder.register(
        "GET",
        "/slow",
        [
            handler(|ctx| ctx.register_strategy(Strategy::new().with_timeout(Duration::from_millis(50)))),
            handler(|ctx| {
                thread::sleep(Duration::from_millis(200));
                ctx.text(200, "late");
            }),
        ],
    );
    builder.register(
        "GET",
        "/async",
        [
            handler(|ctx| ctx.register_strategy(Strategy::new().with_async(true))),
            handler(|ctx| {
                thread::sleep(Duration::from_millis(30));
                ctx.text(200, "async done");
            }),
        ],
    );
    builder.register(
        "GET",
        "/hold",
        [
            handler(|ctx| ctx.register_strategy(Strategy::new().with_async(true))),
            handler(|ctx| {
                thread::sleep(Duration::from_millis(200));
                ctx.text(200, "held");
            }),
        ],
    );
    builder.register("GET", "/panic", [handler(|_| panic!("handler failure"))]);
    builder.register(
        "GET",
        "/bye",
        [handler(|ctx| {
            ctx.text(200, "bye");
            ctx.close_connection();
        })],
    );
    builder.register(
        "GET",
        "/detach",
        [handler(|ctx| {
            ctx.text(200, "detaching");
            ctx.detach_connection();
        })],
    );
    Arc::new(builder.build())
}

pub fn test_config(mode: ServerMode) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.listener.mode = mode;
    config.event_loop.shards = 2;
    config.worker_pool.workers = 2;
    config.observability.access_log = false;
    config
}

/// An event-loop server running on background threads.
pub struct RunningEventLoop {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub tracker: ConnectionTracker,
    thread: JoinHandle<Result<(), ServerError>>,
}

impl RunningEventLoop {
    /// Trigger shutdown and wait for every shard to stop.
    pub fn stop(self) -> Result<(), ServerError> {
        self.shutdown.trigger();
        self.thread.join().expect("event loop thread panicked")
    }
}

pub fn start_event_loop() -> RunningEventLoop {
    start_event_loop_with(|server| server)
}

pub fn start_event_loop_with(configure: impl FnOnce(EventLoopServer) -> EventLoopServer) -> RunningEventLoop {
    start_event_loop_from(test_config(ServerMode::EventLoop), configure)
}

pub fn start_event_loop_from(
    config: ServerConfig,
    configure: impl FnOnce(EventLoopServer) -> EventLoopServer,
) -> RunningEventLoop {
    let shutdown = Shutdown::new();
    let server = EventLoopServer::bind(config, test_router(), shutdown.clone()).expect("bind event loop");
    let server = configure(server);
    let addr = server.local_addr().unwrap();
    let tracker = server.tracker();
    let thread = thread::spawn(move || server.run());
    RunningEventLoop {
        addr,
        shutdown,
        tracker,
        thread,
    }
}

/// A parsed response as seen on the wire.
#[derive(Debug)]
pub struct RawResponse {
    pub version: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Parse one response from the front of `buf`, returning it and the bytes used.
pub fn try_parse(buf: &[u8]) -> Option<(RawResponse, usize)> {
    let head_end = buf.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = std::str::from_utf8(&buf[..head_end]).ok()?;
    let mut lines = head.split("\r\n");
    let mut status_line = lines.next()?.splitn(2, ' ');
    let version = status_line.next()?.to_string();
    let status = status_line.next()?.trim().parse().ok()?;

    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let body_start = head_end + 4;
    if buf.len() < body_start + length {
        return None;
    }
    let body = String::from_utf8_lossy(&buf[body_start..body_start + length]).into_owned();
    Some((
        RawResponse {
            version,
            status,
            headers,
            body,
        },
        body_start + length,
    ))
}

/// Blocking keep-alive client that reads responses one at a time.
pub struct Client {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect");
        stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.stream.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn send(&mut self, raw: &[u8]) {
        self.stream.write_all(raw).expect("write request");
    }

    pub fn response(&mut self) -> RawResponse {
        let deadline = Instant::now() + IO_TIMEOUT;
        loop {
            if let Some((response, used)) = try_parse(&self.pending) {
                self.pending.drain(..used);
                return response;
            }
            assert!(Instant::now() < deadline, "timed out waiting for a response");
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).expect("read response");
            assert!(n > 0, "connection closed before a full response");
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    pub fn request(&mut self, raw: &[u8]) -> RawResponse {
        self.send(raw);
        self.response()
    }

    /// Everything left on the connection until the server closes it.
    pub fn read_to_close(&mut self) -> Vec<u8> {
        let mut rest = std::mem::take(&mut self.pending);
        self.stream.read_to_end(&mut rest).expect("read until close");
        rest
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
