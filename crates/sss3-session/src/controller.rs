//! Session controller
//!
//! Drives one client through the broker protocol:
//! connect, register, pick devices, wait for the setup push, run the data
//! plane, and tear everything down again.
//!
//! Control-channel requests run on the thread that calls [`SessionController::run`].
//! Once the session is active a worker thread dispatches the shared reactor,
//! which also delivers broker pushes to a [`PushListener`]; the controller
//! thread then only waits for those pushes or a stop request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sss3_broker::{
    BrokerError, ControlChannel, PushEvent, PushListener, SessionOutcome, REGISTER_PATH,
    SESSION_PATH,
};
use sss3_core::{
    ClockSource, Frame, Identity, IdentityProvider, ReceivedFrame, SchemaValidator,
    SessionParameters, StaticIdentity, SystemClock, TypedSchemaValidator,
};
use sss3_transport::{
    DataPlane, DataPlaneStats, EventHandler, FrameConsumer, Reactor, StatsSnapshot,
};
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::{SessionError, SessionResult};
use crate::observer::{DeviceSelector, LogObserver, SessionObserver, StatusLevel};
use crate::state::ConnectionState;

/// How often an active session checks for a stop request
const SERVE_POLL: Duration = Duration::from_millis(100);

type PushResult = sss3_broker::Result<PushEvent>;

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    /// The broker offered no devices
    NoDevices,
    /// The selector gave up
    SelectionAborted,
    /// The setup push did not arrive in time
    SetupTimedOut,
    /// The broker pushed a teardown
    BrokerTeardown,
    /// Local stop or operator interrupt
    Stopped,
    /// The control connection or the data-plane worker failed
    ConnectionLost,
}

/// Outcome of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub end: SessionEnd,
    /// Parameters of the session, if one became active
    pub parameters: Option<SessionParameters>,
    pub stats: StatsSnapshot,
}

/// Requests a running session to stop from another thread
#[derive(Clone)]
pub struct StopHandle {
    reactor: Arc<Reactor>,
    stop_requested: Arc<AtomicBool>,
}

impl StopHandle {
    /// Abort any wait in progress and let the session tear down
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.reactor.cancel();
    }

    /// Whether a stop was requested since the last run started
    pub fn is_stopped(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("stop_requested", &self.stop_requested.load(Ordering::SeqCst))
            .finish()
    }
}

enum Negotiated {
    Active(SessionParameters),
    Ended(SessionEnd),
}

struct Worker {
    keep_running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Builder for [`SessionController`]
pub struct SessionBuilder {
    config: ClientConfig,
    selector: Arc<dyn DeviceSelector>,
    identity: Option<Arc<dyn IdentityProvider>>,
    observer: Arc<dyn SessionObserver>,
    consumer: Arc<dyn FrameConsumer>,
    clock: Arc<dyn ClockSource>,
    validator: Arc<dyn SchemaValidator>,
}

impl SessionBuilder {
    /// Identity source; defaults to the `mac` from the configuration
    pub fn identity(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(provider);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Destination of inbound frames
    pub fn consumer(mut self, consumer: Arc<dyn FrameConsumer>) -> Self {
        self.consumer = consumer;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn build(self) -> SessionResult<SessionController> {
        let identity = match &self.identity {
            Some(provider) => provider.identity(),
            None => StaticIdentity::new(self.config.mac.clone()).identity(),
        };

        let reactor = Arc::new(Reactor::new()?);
        let channel = ControlChannel::new(self.config.channel(), reactor.clone(), self.validator);
        let session = channel.session_handle();
        let stats = Arc::new(DataPlaneStats::new());
        let data_plane = Arc::new(DataPlane::new(
            reactor.clone(),
            self.config.data_plane.clone(),
            stats,
            self.consumer,
            self.clock,
        ));

        Ok(SessionController {
            config: self.config,
            identity,
            reactor,
            channel: Arc::new(Mutex::new(channel)),
            session,
            data_plane,
            selector: self.selector,
            observer: self.observer,
            state: RwLock::new(ConnectionState::Disconnected),
            worker: Mutex::new(None),
            stop_requested: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Runs the session protocol for one client
pub struct SessionController {
    config: ClientConfig,
    identity: Identity,
    reactor: Arc<Reactor>,
    channel: Arc<Mutex<ControlChannel>>,
    session: Arc<RwLock<Option<SessionParameters>>>,
    data_plane: Arc<DataPlane>,
    selector: Arc<dyn DeviceSelector>,
    observer: Arc<dyn SessionObserver>,
    state: RwLock<ConnectionState>,
    worker: Mutex<Option<Worker>>,
    stop_requested: Arc<AtomicBool>,
}

impl SessionController {
    pub fn builder(config: ClientConfig, selector: Arc<dyn DeviceSelector>) -> SessionBuilder {
        SessionBuilder {
            config,
            selector,
            identity: None,
            observer: Arc::new(LogObserver),
            consumer: Arc::new(|frame: ReceivedFrame| trace!(frame = %frame.frame, "Frame received")),
            clock: Arc::new(SystemClock),
            validator: Arc::new(TypedSchemaValidator),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Parameters of the current session, `None` when unset
    pub fn session_parameters(&self) -> Option<SessionParameters> {
        *self.session.read()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.data_plane.stats().snapshot()
    }

    pub fn data_plane(&self) -> &Arc<DataPlane> {
        &self.data_plane
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            reactor: self.reactor.clone(),
            stop_requested: self.stop_requested.clone(),
        }
    }

    /// Transmit a frame on the active session
    pub fn send_frame(&self, frame: &Frame) -> SessionResult<bool> {
        let state = self.state();
        if state != ConnectionState::SessionActive {
            return Err(SessionError::invalid_state("send a frame", state));
        }
        Ok(self.data_plane.send(frame)?)
    }

    /// Run the whole protocol until the session ends
    ///
    /// Blocks the calling thread. Connect and registration failures end the
    /// run in [`ConnectionState::Disconnected`] without teardown requests;
    /// every other ending goes through [`stop`](Self::stop).
    pub fn run(&self) -> SessionResult<SessionSummary> {
        let state = self.state();
        if state != ConnectionState::Disconnected {
            return Err(SessionError::invalid_state("start a session", state));
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        self.reactor.clear_cancel();

        let end = match self.negotiate() {
            Ok(Negotiated::Active(parameters)) => match self.activate(parameters) {
                Ok(pushes) => self.serve(&pushes),
                Err(e) => {
                    self.observer
                        .status(StatusLevel::Error, &format!("Could not start the session: {}", e));
                    self.stop();
                    return Err(e);
                }
            },
            Ok(Negotiated::Ended(end)) => end,
            Err(SessionError::Broker(BrokerError::Cancelled)) => SessionEnd::Stopped,
            Err(e @ SessionError::Broker(BrokerError::BrokerUnreachable { .. }))
            | Err(e @ SessionError::Broker(BrokerError::RegistrationFailed { .. })) => {
                return Err(e);
            }
            Err(SessionError::Broker(BrokerError::MalformedPush(reason))) => {
                self.observer.status(
                    StatusLevel::Error,
                    "Received an invalid setup message; closing the connection.",
                );
                self.channel.lock().close();
                self.transition(ConnectionState::Disconnected);
                return Err(BrokerError::MalformedPush(reason).into());
            }
            Err(e) => {
                self.observer
                    .status(StatusLevel::Error, &format!("Session negotiation failed: {}", e));
                self.stop();
                return Err(e);
            }
        };

        let parameters = self.data_plane.parameters();
        self.stop();
        let summary = SessionSummary {
            end,
            parameters,
            stats: self.stats(),
        };
        info!(end = ?summary.end, "Session finished");
        Ok(summary)
    }

    fn negotiate(&self) -> SessionResult<Negotiated> {
        self.observer.status(
            StatusLevel::Info,
            &format!("Connecting to broker at {}", self.config.broker),
        );
        if let Err(e) = self.channel.lock().connect() {
            self.observer
                .status(StatusLevel::Error, "Could not connect to the server.");
            self.transition(ConnectionState::Disconnected);
            return Err(e.into());
        }
        self.transition(ConnectionState::Connected);

        self.transition(ConnectionState::Registering);
        let registered = self.channel.lock().register(&self.identity);
        if let Err(e) = registered {
            if matches!(e, BrokerError::Cancelled) {
                return Err(e.into());
            }
            self.observer
                .status(StatusLevel::Error, "Request to register with server failed.");
            self.channel.lock().close();
            self.transition(ConnectionState::Disconnected);
            return Err(e.into());
        }
        self.transition(ConnectionState::Registered);

        loop {
            if self.stop_requested() {
                return Ok(Negotiated::Ended(SessionEnd::Stopped));
            }

            self.transition(ConnectionState::AwaitingDevices);
            let devices = self.channel.lock().list_devices()?;
            self.observer.devices(&devices);
            if devices.is_empty() {
                self.observer.status(
                    StatusLevel::Warning,
                    "Unfortunately, there are no available ECUs right now. Please check back later.",
                );
                return Ok(Negotiated::Ended(SessionEnd::NoDevices));
            }

            let Some(selection) = self.selector.select(&devices) else {
                info!("Device selection aborted");
                return Ok(Negotiated::Ended(SessionEnd::SelectionAborted));
            };

            let outcome =
                self.channel
                    .lock()
                    .request_session(&self.identity, &selection, &devices)?;
            match outcome {
                SessionOutcome::Established(parameters) => {
                    self.observer.status(
                        StatusLevel::Success,
                        "Requested devices were successfully allocated.",
                    );
                    return Ok(Negotiated::Active(parameters));
                }
                SessionOutcome::AwaitingPush => {
                    self.observer.status(
                        StatusLevel::Success,
                        "Requested devices were successfully allocated.",
                    );
                    self.transition(ConnectionState::AwaitingPush);
                    return self.await_setup();
                }
                SessionOutcome::Rejected { status, reason } => {
                    debug!(status, %reason, "Session request refused");
                    self.observer.status(
                        StatusLevel::Warning,
                        "One or more of the requested devices are no longer available. Please select new device(s).",
                    );
                }
            }
        }
    }

    fn await_setup(&self) -> SessionResult<Negotiated> {
        self.observer
            .status(StatusLevel::Info, "Waiting for setup message from server...");
        let deadline = self.config.setup_timeout().map(|t| Instant::now() + t);
        let slice = self.config.push_poll_interval();

        loop {
            if self.stop_requested() || self.reactor.is_cancelled() {
                return Ok(Negotiated::Ended(SessionEnd::Stopped));
            }

            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.observer.status(
                            StatusLevel::Error,
                            "Timed out waiting for the setup message.",
                        );
                        return Ok(Negotiated::Ended(SessionEnd::SetupTimedOut));
                    }
                    remaining.min(slice)
                }
                None => slice,
            };

            let push = self.channel.lock().next_push(Some(wait));
            match push {
                Ok(Some(PushEvent::Setup(parameters))) => {
                    self.observer.status(
                        StatusLevel::Info,
                        "Received session setup information from the server.",
                    );
                    return Ok(Negotiated::Active(parameters));
                }
                Ok(Some(PushEvent::Teardown)) => {
                    self.observer
                        .status(StatusLevel::Warning, "Server ended the session before setup.");
                    return Ok(Negotiated::Ended(SessionEnd::BrokerTeardown));
                }
                Ok(None) => debug!("Still waiting for session setup"),
                Err(BrokerError::UnsupportedPush(method)) => {
                    warn!(%method, "Ignoring unsupported push")
                }
                Err(BrokerError::Cancelled) => return Ok(Negotiated::Ended(SessionEnd::Stopped)),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn activate(&self, announced: SessionParameters) -> SessionResult<Receiver<PushResult>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let listener: Arc<dyn EventHandler> = Arc::new(PushListener::new(&self.channel, tx.clone()));

        let (parameters, early) = {
            let mut channel = self.channel.lock();
            channel.set_push_handler(Some(listener))?;
            // Pushes already buffered will not raise another readiness edge
            let early = channel.receive_pushes();
            (channel.session_parameters().unwrap_or(announced), early)
        };
        for push in early {
            let _ = tx.send(push);
        }

        self.observer
            .status(StatusLevel::Info, &format!("Starting the session on {}", parameters));
        self.data_plane.start(&parameters)?;

        let keep_running = Arc::new(AtomicBool::new(true));
        let handle = self
            .data_plane
            .spawn(keep_running.clone())
            .map_err(SessionError::Worker)?;
        *self.worker.lock() = Some(Worker {
            keep_running,
            handle,
        });

        self.transition(ConnectionState::SessionActive);
        self.observer.status(StatusLevel::Success, "Session started!");
        Ok(rx)
    }

    fn serve(&self, pushes: &Receiver<PushResult>) -> SessionEnd {
        loop {
            if self.stop_requested() || self.reactor.is_cancelled() {
                return SessionEnd::Stopped;
            }
            if self.worker_finished() {
                self.observer
                    .status(StatusLevel::Error, "Data plane stopped unexpectedly.");
                return SessionEnd::ConnectionLost;
            }

            match pushes.recv_timeout(SERVE_POLL) {
                Ok(Ok(PushEvent::Teardown)) => {
                    self.observer
                        .status(StatusLevel::Warning, "Server ended the session.");
                    return SessionEnd::BrokerTeardown;
                }
                Ok(Ok(PushEvent::Setup(parameters))) => {
                    warn!(%parameters, "Setup push during an active session, restarting data plane");
                    if let Err(e) = self.data_plane.start(&parameters) {
                        self.observer
                            .status(StatusLevel::Error, &format!("Could not restart the session: {}", e));
                        return SessionEnd::ConnectionLost;
                    }
                }
                Ok(Err(BrokerError::UnsupportedPush(method))) => {
                    warn!(%method, "Ignoring unsupported push")
                }
                Ok(Err(e)) => {
                    self.observer
                        .status(StatusLevel::Error, &format!("Lost the broker connection: {}", e));
                    return SessionEnd::ConnectionLost;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return SessionEnd::ConnectionLost,
            }
        }
    }

    /// Tear the session down
    ///
    /// Stops the data plane, then sends `DELETE /session` and a
    /// connection-closing `DELETE /client/register`. Safe to call in any
    /// state and any number of times; each call issues the same two requests.
    pub fn stop(&self) {
        self.transition(ConnectionState::Closing);
        self.stop_worker();
        self.data_plane.stop();
        self.reactor.clear_cancel();

        {
            let mut channel = self.channel.lock();
            if let Err(e) = channel.set_push_handler(None) {
                debug!(error = %e, "Failed to detach push listener");
            }
            channel.send_teardown(SESSION_PATH, false);
            channel.send_teardown(REGISTER_PATH, true);
        }

        self.transition(ConnectionState::Disconnected);
        self.observer.status(StatusLevel::Info, "Session stopped.");
    }

    fn stop_worker(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        worker.keep_running.store(false, Ordering::SeqCst);
        self.reactor.interrupt();
        if worker.handle.join().is_err() {
            error!("Data plane worker panicked");
        }
    }

    fn worker_finished(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|worker| worker.handle.is_finished())
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn transition(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        if previous != next {
            info!(from = %previous, to = %next, "State transition");
            self.observer.state_changed(previous, next);
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.stop_worker();
        self.data_plane.stop();
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("broker", &self.config.broker)
            .field("identity", &self.identity)
            .field("state", &self.state())
            .field("session", &self.session_parameters())
            .finish()
    }
}
