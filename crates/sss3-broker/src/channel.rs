//! Persistent duplex connection to the broker
//!
//! [`ControlChannel`] sends our requests strictly one at a time and reads
//! their responses by waiting on the shared [`Reactor`]. The broker may push
//! its own requests on the same connection at any point; pushes that arrive
//! while a response is awaited are queued and handed out later.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::RwLock;
use sss3_core::{
    decode_device_list, DeviceDescriptor, Identity, RegistrationBody, SchemaValidator,
    SessionParameters, SessionRequest,
};
use sss3_transport::{EventHandler, Handle, Interest, Reactor};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::{BrokerError, Result};
use crate::http::{encode_reply, parse_message, Message, PushedRequest, Request, Response};
use crate::push::{interpret, is_embedded_setup, PushEvent};

pub const REGISTER_PATH: &str = "/client/register";
pub const DEVICES_PATH: &str = "/sss3";
pub const SESSION_REQUEST_PATH: &str = "/client/session";
pub const SESSION_PATH: &str = "/session";

const READ_CHUNK: usize = 4096;

/// Connection settings
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Broker address as `host:port`
    pub broker: String,
    pub connect_timeout: Duration,
    /// Bound on each response wait; `None` waits indefinitely
    pub response_timeout: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            broker: "localhost:80".to_string(),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Result of `POST /client/session`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The response carried the setup document
    Established(SessionParameters),
    /// Devices allocated; the setup arrives as a separate push
    AwaitingPush,
    /// The broker refused the request, usually because a device is taken
    Rejected { status: u16, reason: String },
}

/// The control connection and the session bookkeeping derived from it
pub struct ControlChannel {
    config: ChannelConfig,
    reactor: Arc<Reactor>,
    validator: Arc<dyn SchemaValidator>,
    session: Arc<RwLock<Option<SessionParameters>>>,
    stream: Option<TcpStream>,
    buffer: BytesMut,
    pending: VecDeque<PushedRequest>,
    push_handler: Option<Arc<dyn EventHandler>>,
    eof: bool,
    close_requested: bool,
}

impl ControlChannel {
    pub fn new(
        config: ChannelConfig,
        reactor: Arc<Reactor>,
        validator: Arc<dyn SchemaValidator>,
    ) -> Self {
        Self {
            config,
            reactor,
            validator,
            session: Arc::new(RwLock::new(None)),
            stream: None,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            pending: VecDeque::new(),
            push_handler: None,
            eof: false,
            close_requested: false,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Current session parameters, `None` while no session is set up
    pub fn session_parameters(&self) -> Option<SessionParameters> {
        *self.session.read()
    }

    /// Shared handle to the session parameters
    pub fn session_handle(&self) -> Arc<RwLock<Option<SessionParameters>>> {
        Arc::clone(&self.session)
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn handle(&self) -> Option<Handle> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    /// Set when a push failed validation or the broker hung up
    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    /// Callback for readiness on the connection outside of request waits
    ///
    /// Applied to the current connection and to any later reconnect.
    pub fn set_push_handler(&mut self, handler: Option<Arc<dyn EventHandler>>) -> Result<()> {
        self.push_handler = handler;
        if let Some(handle) = self.handle() {
            self.reactor
                .modify(handle, Interest::READABLE, self.push_handler.clone())?;
        }
        Ok(())
    }

    /// Open the connection, retrying once
    #[instrument(skip(self), fields(broker = %self.config.broker))]
    pub fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        match self.connect_once() {
            Ok(()) => Ok(()),
            Err(first) => {
                error!(error = %first, "Unable to connect to broker");
                info!("Retrying connection to broker");
                self.connect_once().map_err(|e| {
                    error!(error = %e, "Broker unreachable");
                    BrokerError::BrokerUnreachable {
                        broker: self.config.broker.clone(),
                        reason: e.to_string(),
                    }
                })
            }
        }
    }

    fn connect_once(&mut self) -> Result<()> {
        let addrs: Vec<SocketAddr> = self
            .config
            .broker
            .to_socket_addrs()
            .map_err(BrokerError::Transport)?
            .collect();

        let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no address resolved");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => return self.attach(stream),
                Err(e) => {
                    debug!(%addr, error = %e, "Connect attempt failed");
                    last_error = e;
                }
            }
        }
        Err(BrokerError::from_io(last_error))
    }

    fn attach(&mut self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let handle = stream.as_raw_fd();
        self.reactor
            .register(handle, Interest::READABLE, self.push_handler.clone())?;

        info!(peer = ?stream.peer_addr().ok(), "Connected to broker");
        self.stream = Some(stream);
        self.buffer.clear();
        self.pending.clear();
        self.eof = false;
        self.close_requested = false;
        Ok(())
    }

    /// Register `identity`, retrying once with a fresh attempt
    #[instrument(skip(self), fields(mac = %identity))]
    pub fn register(&mut self, identity: &Identity) -> Result<()> {
        info!("Registering with broker");
        let first = match self.try_register(identity) {
            Ok(()) => return Ok(()),
            Err(BrokerError::Cancelled) => return Err(BrokerError::Cancelled),
            Err(e) => e,
        };

        error!(error = %first, "Bad registration response, retrying");
        if !self.is_connected() {
            if let Err(e) = self.connect_once() {
                error!(error = %e, "Reconnect for registration retry failed");
                return Err(registration_failure(e));
            }
        }

        self.try_register(identity).map_err(|e| {
            let e = registration_failure(e);
            error!(error = %e, "Failed to register with broker");
            e
        })
    }

    fn try_register(&mut self, identity: &Identity) -> Result<()> {
        let request = Request::post(REGISTER_PATH)?.json(&RegistrationBody::new(identity))?;
        let response = self.exchange(&request)?;
        if response.is_accepted() {
            info!(status = response.status, "Registered with broker");
            Ok(())
        } else {
            Err(BrokerError::registration_failed(
                Some(response.status),
                response.reason,
            ))
        }
    }

    /// Fetch the available devices
    ///
    /// A refused request or an invalid body yields an empty list; only
    /// transport failures are returned as errors.
    #[instrument(skip(self))]
    pub fn list_devices(&mut self) -> Result<Vec<DeviceDescriptor>> {
        info!("Requesting available devices");
        let response = self.exchange(&Request::get(DEVICES_PATH)?)?;

        if !response.is_accepted() {
            error!(
                status = response.status,
                reason = %response.reason,
                "Request for available devices failed"
            );
            return Ok(Vec::new());
        }

        match decode_device_list(&response.body, self.validator.as_ref()) {
            Ok(devices) => {
                info!(count = devices.len(), "Received device list");
                Ok(devices)
            }
            Err(e) => {
                error!(error = %e, "Device list rejected");
                Ok(Vec::new())
            }
        }
    }

    /// Ask for the devices in `available` whose id is in `requested`
    ///
    /// A setup document embedded in the response is applied right away.
    #[instrument(skip(self, available), fields(mac = %identity))]
    pub fn request_session(
        &mut self,
        identity: &Identity,
        requested: &[u32],
        available: &[DeviceDescriptor],
    ) -> Result<SessionOutcome> {
        let body = SessionRequest::new(identity, requested, available);
        info!(devices = ?body.device_ids(), "Requesting devices");

        let request = Request::post(SESSION_REQUEST_PATH)?.json(&body)?;
        let response = self.exchange(&request)?;

        if !response.is_success() {
            error!(
                status = response.status,
                reason = %response.reason,
                "Request for selected devices failed"
            );
            return Ok(SessionOutcome::Rejected {
                status: response.status,
                reason: response.reason,
            });
        }

        info!(status = response.status, "Requested devices allocated");
        if !is_embedded_setup(&response.body) {
            return Ok(SessionOutcome::AwaitingPush);
        }

        let embedded = PushedRequest {
            method: crate::push::SETUP_METHOD.to_string(),
            target: SESSION_REQUEST_PATH.to_string(),
            headers: response.headers,
            body: response.body,
        };
        match self.apply_push(&embedded)? {
            PushEvent::Setup(parameters) => Ok(SessionOutcome::Established(parameters)),
            PushEvent::Teardown => Ok(SessionOutcome::AwaitingPush),
        }
    }

    /// Handle one raw pushed message
    pub fn handle_push(&mut self, raw: &[u8]) -> Result<PushEvent> {
        let mut buffer = BytesMut::from(raw);
        match parse_message(&mut buffer) {
            Ok(Some(Message::Request(request))) => self.apply_push(&request),
            Ok(Some(Message::Response(response))) => Err(BrokerError::ImproperConnectionState(
                format!("unsolicited response {}", response.status),
            )),
            Ok(None) => {
                self.close_requested = true;
                Err(BrokerError::MalformedPush("incomplete message".into()))
            }
            Err(e) => {
                self.close_requested = true;
                Err(BrokerError::MalformedPush(e.to_string()))
            }
        }
    }

    fn apply_push(&mut self, request: &PushedRequest) -> Result<PushEvent> {
        debug!(method = %request.method, target = %request.target, "Received push");
        match interpret(request, self.validator.as_ref()) {
            Ok(PushEvent::Setup(parameters)) => {
                *self.session.write() = Some(parameters);
                info!(%parameters, "Received session setup");
                Ok(PushEvent::Setup(parameters))
            }
            Ok(PushEvent::Teardown) => {
                *self.session.write() = None;
                info!("Broker closed the current session");
                Ok(PushEvent::Teardown)
            }
            Err(BrokerError::UnsupportedPush(method)) => {
                warn!(%method, "Rejecting unsupported push");
                if let Err(e) = self.write_all(&encode_reply(501, "Not Implemented")) {
                    debug!(error = %e, "Failed to reply to unsupported push");
                }
                Err(BrokerError::UnsupportedPush(method))
            }
            Err(e) => {
                error!(error = %e, "Session setup push rejected");
                self.close_requested = true;
                Err(e)
            }
        }
    }

    /// Read what is available and apply every complete push
    ///
    /// Used from the readiness callback; never blocks.
    pub fn receive_pushes(&mut self) -> Vec<Result<PushEvent>> {
        let mut events = Vec::new();
        if let Err(e) = self.fill() {
            self.close_requested = true;
            events.push(Err(e));
            return events;
        }

        loop {
            match self.take_push() {
                Ok(Some(request)) => events.push(self.apply_push(&request)),
                Ok(None) => break,
                Err(e) => {
                    self.close_requested = true;
                    self.buffer.clear();
                    events.push(Err(BrokerError::MalformedPush(e.to_string())));
                    break;
                }
            }
        }

        if self.eof {
            error!("Broker closed the connection");
            self.close_requested = true;
            events.push(Err(BrokerError::RemoteDisconnected));
        }
        events
    }

    /// Wait up to `timeout` for the next push
    ///
    /// Returns `Ok(None)` when the wait elapses without one.
    pub fn next_push(&mut self, timeout: Option<Duration>) -> Result<Option<PushEvent>> {
        let handle = self.handle().ok_or(BrokerError::NotConnected)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            self.fill()?;
            if let Some(request) = self.take_push().map_err(|e| {
                self.close_requested = true;
                BrokerError::MalformedPush(e.to_string())
            })? {
                return self.apply_push(&request).map(Some);
            }
            if self.eof {
                self.close_requested = true;
                return Err(BrokerError::RemoteDisconnected);
            }

            let remaining = match remaining(deadline) {
                Some(Duration::ZERO) => return Ok(None),
                other => other,
            };
            if !self.reactor.wait_for(handle, remaining)? {
                if self.reactor.is_cancelled() {
                    return Err(BrokerError::Cancelled);
                }
                return Ok(None);
            }
        }
    }

    /// Best-effort `DELETE path`
    ///
    /// With `close_after` the connection is closed and the session
    /// parameters cleared whether or not the request succeeded. Without a
    /// connection a single fresh one is opened for the request.
    #[instrument(skip(self))]
    pub fn send_teardown(&mut self, path: &str, close_after: bool) -> Option<Response> {
        info!("Sending DELETE");
        let response = match self.teardown_exchange(path) {
            Ok(response) => {
                info!(status = response.status, reason = %response.reason, "DELETE answered");
                Some(response)
            }
            Err(e) => {
                error!(error = %e, "DELETE request failed");
                None
            }
        };

        if close_after {
            self.close();
            *self.session.write() = None;
        }
        response
    }

    fn teardown_exchange(&mut self, path: &str) -> Result<Response> {
        let request = Request::delete(path)?;
        if !self.is_connected() {
            debug!("Opening connection for teardown");
            self.connect_once()?;
        }
        self.exchange(&request)
    }

    /// Unregister, shut down and drop the connection
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!("Unregistering control connection");
            self.reactor.unregister(stream.as_raw_fd());
            debug!("Shutting down control connection");
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                if e.kind() != io::ErrorKind::NotConnected {
                    debug!(error = %e, "Shutdown failed");
                }
            }
            info!("Closed broker connection");
        }
        self.buffer.clear();
        self.pending.clear();
        self.eof = false;
        self.close_requested = false;
    }

    /// Send one request and wait for its response
    ///
    /// Any failure drops the connection, cancellation included, since a late
    /// response could otherwise be taken for the next one.
    fn exchange(&mut self, request: &Request) -> Result<Response> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }

        let result = self
            .write_all(&request.encode(&self.config.broker))
            .and_then(|()| {
                debug!(method = request.method(), target = request.target(), "-> Request sent");
                self.read_response()
            });

        match result {
            Ok(response) => {
                debug!(status = response.status, "<- Response received");
                Ok(response)
            }
            Err(BrokerError::Cancelled) => {
                debug!(target = request.target(), "Exchange cancelled, dropping connection");
                self.close();
                Err(BrokerError::Cancelled)
            }
            Err(e) => {
                warn!(
                    method = request.method(),
                    target = request.target(),
                    error = %e,
                    "Exchange failed, dropping connection"
                );
                self.close();
                Err(e)
            }
        }
    }

    fn read_response(&mut self) -> Result<Response> {
        let handle = self.handle().ok_or(BrokerError::NotConnected)?;
        let deadline = self.config.response_timeout.map(|t| Instant::now() + t);

        loop {
            self.fill()?;
            if let Some(response) = self.take_response()? {
                return Ok(response);
            }
            if self.eof {
                return Err(BrokerError::RemoteDisconnected);
            }

            let remaining = match remaining(deadline) {
                Some(Duration::ZERO) => return Err(BrokerError::Timeout),
                other => other,
            };
            if !self.reactor.wait_for(handle, remaining)? {
                if self.reactor.is_cancelled() {
                    return Err(BrokerError::Cancelled);
                }
                error!("Timed out waiting for a broker response");
                return Err(BrokerError::Timeout);
            }
        }
    }

    /// Next response in the buffer; pushes in front of it are queued
    fn take_response(&mut self) -> Result<Option<Response>> {
        loop {
            match parse_message(&mut self.buffer)? {
                Some(Message::Response(response)) => return Ok(Some(response)),
                Some(Message::Request(request)) => {
                    debug!(method = %request.method, "Queued push received during exchange");
                    self.pending.push_back(request);
                }
                None => return Ok(None),
            }
        }
    }

    /// Next push, queued or buffered; stray responses are discarded
    fn take_push(&mut self) -> std::result::Result<Option<PushedRequest>, crate::http::ParseError> {
        if let Some(request) = self.pending.pop_front() {
            return Ok(Some(request));
        }
        loop {
            match parse_message(&mut self.buffer)? {
                Some(Message::Request(request)) => return Ok(Some(request)),
                Some(Message::Response(response)) => {
                    warn!(status = response.status, "Discarding unsolicited response");
                }
                None => return Ok(None),
            }
        }
    }

    /// Drain the socket into the buffer without blocking
    fn fill(&mut self) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(BrokerError::NotConnected)?;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    trace!(bytes = n, "Read from control connection");
                    self.buffer.extend_from_slice(&chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(BrokerError::from_io(e)),
            }
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let timeout = self.config.connect_timeout;
        let stream = self.stream.as_mut().ok_or(BrokerError::NotConnected)?;

        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(timeout))?;
        let written = stream.write_all(data).and_then(|()| stream.flush());
        stream.set_nonblocking(true)?;

        written.map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => BrokerError::Timeout,
            _ => BrokerError::from_io(e),
        })
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("broker", &self.config.broker)
            .field("connected", &self.is_connected())
            .field("session", &self.session_parameters())
            .field("pending_pushes", &self.pending.len())
            .field("close_requested", &self.close_requested)
            .finish()
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

fn registration_failure(error: BrokerError) -> BrokerError {
    match error {
        e @ BrokerError::RegistrationFailed { .. } => e,
        e @ BrokerError::Cancelled => e,
        other => BrokerError::registration_failed(None, other.to_string()),
    }
}
