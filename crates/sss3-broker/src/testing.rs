//! Test utilities for the control channel
//!
//! [`FakeBroker`] is a scripted broker listening on `127.0.0.1:0`. It records
//! every request it receives, answers from per-route response queues, and can
//! push messages onto the live connection.
//!
//! ```rust,ignore
//! use sss3_broker::testing::{FakeBroker, ScriptedResponse};
//!
//! let broker = FakeBroker::start()?;
//! broker.respond("POST", "/client/register", ScriptedResponse::new(201, "Created"));
//! // point a ControlChannel at broker.address() ...
//! broker.push(&FakeBroker::teardown_push())?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::http::{parse_message, Message, PushedRequest, Response};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A request as received by the fake broker
pub type RecordedRequest = PushedRequest;

/// One scripted answer
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    status: u16,
    reason: String,
    body: Vec<u8>,
    then_push: Option<Vec<u8>>,
    hang_up: bool,
}

impl ScriptedResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            body: Vec::new(),
            then_push: None,
            hang_up: false,
        }
    }

    /// Response with a JSON body and the canonical reason phrase for 200
    pub fn json(status: u16, body: &Value) -> Self {
        let reason = if status == 200 { "OK" } else { "Status" };
        Self::new(status, reason).body(body.to_string().into_bytes())
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Write `push` right after the response
    pub fn then_push(mut self, push: Vec<u8>) -> Self {
        self.then_push = Some(push);
        self
    }

    /// Close the connection instead of answering
    pub fn hang_up(mut self) -> Self {
        self.hang_up = true;
        self
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            self.status,
            self.reason,
            self.body.len()
        )
        .into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

#[derive(Default)]
struct BrokerState {
    routes: HashMap<(String, String), VecDeque<ScriptedResponse>>,
    requests: Vec<RecordedRequest>,
    replies: Vec<Response>,
    connections: usize,
    live: Option<TcpStream>,
}

/// A scripted broker that shuts down when dropped
pub struct FakeBroker {
    addr: SocketAddr,
    state: Arc<Mutex<BrokerState>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeBroker {
    /// Bind to an ephemeral port and start accepting connections
    pub fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let state = Arc::new(Mutex::new(BrokerState::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = {
            let state = state.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("fake-broker".into())
                .spawn(move || accept_loop(listener, state, shutdown))?
        };

        Ok(Self {
            addr,
            state,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address in the `host:port` form used by the client configuration
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Queue a response for `method target`
    ///
    /// Unscripted requests are answered with `200 OK` and an empty body.
    pub fn respond(&self, method: &str, target: &str, response: ScriptedResponse) {
        self.state
            .lock()
            .routes
            .entry((method.to_string(), target.to_string()))
            .or_default()
            .push_back(response);
    }

    /// Write `message` onto the most recent connection
    pub fn push(&self, message: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        let stream = state
            .live
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        stream.write_all(message)?;
        stream.flush()
    }

    /// Every request received so far, in arrival order
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    /// `(method, target)` of every request received so far
    pub fn request_lines(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|r| (r.method.clone(), r.target.clone()))
            .collect()
    }

    /// Responses the client wrote back to pushes
    pub fn replies(&self) -> Vec<Response> {
        self.state.lock().replies.clone()
    }

    /// Number of accepted connections
    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    /// Wait until at least `count` requests have arrived
    pub fn wait_for_requests(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.requests.len() >= count)
    }

    /// Wait until at least `count` push replies have arrived
    pub fn wait_for_replies(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.replies.len() >= count)
    }

    /// Wait until a connection is live
    pub fn wait_for_connection(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.live.is_some())
    }

    fn wait_until(&self, timeout: Duration, done: impl Fn(&BrokerState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done(&self.state.lock()) {
                return true;
            }
            thread::sleep(POLL_INTERVAL);
        }
        done(&self.state.lock())
    }

    /// JSON body of a recorded request
    pub fn json_body(request: &RecordedRequest) -> Option<Value> {
        serde_json::from_slice(&request.body).ok()
    }

    /// A pushed request with the given method and body
    pub fn push_message(method: &str, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "{} / HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            method,
            body.len()
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    /// Setup push carrying `document`
    pub fn setup_push(document: &Value) -> Vec<u8> {
        Self::push_message("POST", document.to_string().as_bytes())
    }

    /// Teardown push
    pub fn teardown_push() -> Vec<u8> {
        Self::push_message("DELETE", b"")
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(stream) = self.state.lock().live.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(listener: TcpListener, state: Arc<Mutex<BrokerState>>, shutdown: Arc<AtomicBool>) {
    let mut workers = Vec::new();
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "Fake broker accepted connection");
                let state = state.clone();
                let shutdown = shutdown.clone();
                workers.push(thread::spawn(move || serve(stream, state, shutdown)));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                debug!(error = %e, "Fake broker accept failed");
                break;
            }
        }
    }
    for worker in workers {
        let _ = worker.join();
    }
}

fn serve(stream: TcpStream, state: Arc<Mutex<BrokerState>>, shutdown: Arc<AtomicBool>) {
    let setup = stream
        .set_nonblocking(false)
        .and_then(|()| stream.set_read_timeout(Some(Duration::from_millis(20))))
        .and_then(|()| stream.try_clone());
    let mut writer = match setup {
        Ok(writer) => writer,
        Err(_) => return,
    };
    let mut reader = stream;

    {
        let mut state = state.lock();
        state.connections += 1;
        state.live = writer.try_clone().ok();
    }

    let mut buffer = BytesMut::new();
    let mut chunk = [0u8; 4096];
    while !shutdown.load(Ordering::SeqCst) {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue
            }
            Err(_) => break,
        }

        loop {
            match parse_message(&mut buffer) {
                Ok(Some(Message::Request(request))) => {
                    if !answer(&mut writer, request, &state) {
                        let _ = writer.shutdown(Shutdown::Both);
                        return;
                    }
                }
                Ok(Some(Message::Response(response))) => state.lock().replies.push(response),
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
}

/// Record and answer one request; `false` when the connection should close
fn answer(writer: &mut TcpStream, request: RecordedRequest, state: &Mutex<BrokerState>) -> bool {
    let scripted = {
        let mut state = state.lock();
        let key = (request.method.clone(), request.target.clone());
        state.requests.push(request);
        state
            .routes
            .get_mut(&key)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| ScriptedResponse::new(200, "OK"))
    };

    if scripted.hang_up {
        return false;
    }
    if writer.write_all(&scripted.encode()).is_err() {
        return false;
    }
    if let Some(push) = &scripted.then_push {
        if writer.write_all(push).is_err() {
            return false;
        }
    }
    true
}
