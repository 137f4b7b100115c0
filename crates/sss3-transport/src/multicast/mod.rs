//! Multicast data plane
//!
//! Owns the two UDP multicast sockets of an active session:
//! - the inbound CAN socket, decoded into frames for a [`FrameConsumer`]
//! - the outbound CARLA socket, fed by [`DataPlane::send`]
//!
//! Both sockets are registered with the shared [`Reactor`]; a dedicated
//! worker thread drives the reactor while the session is live.

mod consumer;
mod receiver;
mod sender;
mod socket;
mod stats;
mod timeout;

pub use consumer::{ChannelConsumer, FrameConsumer};
pub use receiver::CanReceiver;
pub use sender::CarlaSender;
pub use socket::open_multicast;
pub use stats::{DataPlaneStats, StatsSnapshot};
pub use timeout::ReceiveTimeout;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sss3_core::{ClockSource, Frame, SessionParameters};
use tracing::{debug, error, info};

use crate::error::{DataPlaneError, DataPlaneResult};
use crate::reactor::{Handle, Interest, Reactor};

/// Data plane timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPlaneConfig {
    /// Base receive timeout on the CAN socket (milliseconds)
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    /// Lower bound the timeout is tightened to after repeated losses
    #[serde(default = "default_min_receive_timeout_ms")]
    pub min_receive_timeout_ms: u64,
}

fn default_receive_timeout_ms() -> u64 {
    400
}

fn default_min_receive_timeout_ms() -> u64 {
    40
}

impl Default for DataPlaneConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: default_receive_timeout_ms(),
            min_receive_timeout_ms: default_min_receive_timeout_ms(),
        }
    }
}

impl DataPlaneConfig {
    pub fn receive_timeout(&self) -> ReceiveTimeout {
        ReceiveTimeout::new(
            Duration::from_millis(self.receive_timeout_ms),
            Duration::from_millis(self.min_receive_timeout_ms),
        )
    }
}

#[derive(Default)]
struct Sockets {
    parameters: Option<SessionParameters>,
    can: Option<Arc<CanReceiver>>,
    carla: Option<Arc<CarlaSender>>,
}

/// The session's pair of multicast sockets
pub struct DataPlane {
    reactor: Arc<Reactor>,
    config: DataPlaneConfig,
    stats: Arc<DataPlaneStats>,
    consumer: Arc<dyn FrameConsumer>,
    clock: Arc<dyn ClockSource>,
    sockets: Mutex<Sockets>,
}

impl DataPlane {
    pub fn new(
        reactor: Arc<Reactor>,
        config: DataPlaneConfig,
        stats: Arc<DataPlaneStats>,
        consumer: Arc<dyn FrameConsumer>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            reactor,
            config,
            stats,
            consumer,
            clock,
            sockets: Mutex::new(Sockets::default()),
        }
    }

    /// Open, join and register both sockets for `parameters`
    ///
    /// On failure every socket opened so far is closed again.
    pub fn start(&self, parameters: &SessionParameters) -> DataPlaneResult<()> {
        if self.is_running() {
            debug!("Data plane already running, restarting");
            self.stop();
        }

        info!(%parameters, "Starting data plane");
        if let Err(e) = self.open(parameters) {
            error!(error = %e, "Data plane start failed");
            self.stop();
            return Err(e);
        }
        Ok(())
    }

    fn open(&self, parameters: &SessionParameters) -> DataPlaneResult<()> {
        let timeout = self.config.receive_timeout();
        self.sockets.lock().parameters = Some(*parameters);

        let port = parameters.can_port;
        let socket = open_multicast(parameters.group, port, timeout.current())
            .map_err(|e| DataPlaneError::start_failed(port, e))?;
        let can = Arc::new(
            CanReceiver::new(
                socket,
                timeout,
                self.consumer.clone(),
                self.stats.clone(),
                self.clock.clone(),
            )
            .map_err(|e| DataPlaneError::start_failed(port, e))?,
        );
        self.sockets.lock().can = Some(can.clone());
        self.reactor
            .register(can.handle(), Interest::READABLE, Some(can.clone()))
            .map_err(|e| DataPlaneError::start_failed(port, e))?;

        let port = parameters.carla_port;
        let socket = open_multicast(parameters.group, port, timeout.current())
            .map_err(|e| DataPlaneError::start_failed(port, e))?;
        let carla = Arc::new(CarlaSender::new(
            socket,
            parameters.carla_endpoint(),
            self.reactor.clone(),
            self.stats.clone(),
        ));
        self.sockets.lock().carla = Some(carla.clone());
        self.reactor
            .register(carla.handle(), Interest::READABLE, Some(carla.clone()))
            .map_err(|e| DataPlaneError::start_failed(port, e))?;

        Ok(())
    }

    /// Unregister, shut down and close whichever sockets exist
    pub fn stop(&self) {
        let (can, carla) = {
            let mut sockets = self.sockets.lock();
            sockets.parameters = None;
            (sockets.can.take(), sockets.carla.take())
        };

        if let Some(can) = can {
            debug!("Unregistering CAN socket");
            self.reactor.unregister(can.handle());
            socket::shutdown(can.socket());
        }
        if let Some(carla) = carla {
            debug!("Unregistering CARLA socket");
            self.reactor.unregister(carla.handle());
            socket::shutdown(carla.socket());
        }
    }

    /// Transmit a frame to the session's CARLA endpoint
    pub fn send(&self, frame: &Frame) -> DataPlaneResult<bool> {
        let carla = self
            .sockets
            .lock()
            .carla
            .clone()
            .ok_or(DataPlaneError::NotStarted)?;
        carla.send(frame)
    }

    pub fn is_running(&self) -> bool {
        let sockets = self.sockets.lock();
        sockets.can.is_some() || sockets.carla.is_some()
    }

    pub fn parameters(&self) -> Option<SessionParameters> {
        self.sockets.lock().parameters
    }

    pub fn can_handle(&self) -> Option<Handle> {
        self.sockets.lock().can.as_ref().map(|c| c.handle())
    }

    pub fn carla_handle(&self) -> Option<Handle> {
        self.sockets.lock().carla.as_ref().map(|c| c.handle())
    }

    pub fn stats(&self) -> &Arc<DataPlaneStats> {
        &self.stats
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Current CAN receive timeout, or the configured base when stopped
    pub fn receive_timeout(&self) -> Duration {
        match &self.sockets.lock().can {
            Some(can) => can.current_timeout(),
            None => self.config.receive_timeout().current(),
        }
    }

    /// Drive the reactor until `keep_running` is cleared or the reactor is cancelled
    ///
    /// The CAN socket's receive deadline is checked after every poll, so
    /// traffic on the CARLA or control sockets never hides CAN silence.
    pub fn run(&self, keep_running: &AtomicBool) {
        debug!("Data plane loop started");
        while keep_running.load(Ordering::SeqCst) && !self.reactor.is_cancelled() {
            let wait = match self.can() {
                Some(can) => can.time_to_deadline(Instant::now()),
                None => self.config.receive_timeout().current(),
            };
            if let Err(e) = self.reactor.dispatch(Some(wait)) {
                error!(error = %e, "Reactor failure in data plane loop");
                break;
            }
            if !keep_running.load(Ordering::SeqCst) || self.reactor.is_cancelled() {
                break;
            }
            if let Some(can) = self.can() {
                can.check_deadline(Instant::now());
            }
        }
        debug!("Data plane loop finished");
    }

    fn can(&self) -> Option<Arc<CanReceiver>> {
        self.sockets.lock().can.clone()
    }

    /// Run [`run`](Self::run) on a dedicated thread
    pub fn spawn(
        self: &Arc<Self>,
        keep_running: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        let plane = Arc::clone(self);
        thread::Builder::new()
            .name("sss3-data-plane".into())
            .spawn(move || plane.run(&keep_running))
    }
}

impl std::fmt::Debug for DataPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPlane")
            .field("config", &self.config)
            .field("parameters", &self.parameters())
            .field("running", &self.is_running())
            .finish()
    }
}
