//! Readiness callback for pushes while a session is active

use std::sync::{Arc, Weak};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use sss3_transport::{EventHandler, Handle, Readiness};
use tracing::{debug, error};

use crate::channel::ControlChannel;
use crate::error::Result;
use crate::push::PushEvent;

/// Forwards pushes read on the control connection into a channel
///
/// Registered as the control connection's reactor callback, so it runs on
/// whichever thread dispatches the reactor. Holds the channel weakly; the
/// channel in turn keeps this listener registered across reconnects.
pub struct PushListener {
    channel: Weak<Mutex<ControlChannel>>,
    events: Sender<Result<PushEvent>>,
}

impl PushListener {
    pub fn new(channel: &Arc<Mutex<ControlChannel>>, events: Sender<Result<PushEvent>>) -> Self {
        Self {
            channel: Arc::downgrade(channel),
            events,
        }
    }
}

impl EventHandler for PushListener {
    fn on_ready(&self, handle: Handle, readiness: Readiness) {
        let Some(channel) = self.channel.upgrade() else {
            debug!(handle, "Push on a dropped control channel");
            return;
        };
        let mut channel = channel.lock();

        if readiness.readable || readiness.closed {
            for event in channel.receive_pushes() {
                if self.events.send(event).is_err() {
                    debug!("Push receiver gone");
                }
            }
        }

        if channel.close_requested() {
            error!("Closing broker connection");
            channel.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use serde_json::json;
    use sss3_core::TypedSchemaValidator;
    use sss3_transport::Reactor;
    use std::time::Duration;

    use crate::channel::ChannelConfig;
    use crate::error::BrokerError;
    use crate::testing::FakeBroker;

    fn connected(broker: &FakeBroker, reactor: Arc<Reactor>) -> Arc<Mutex<ControlChannel>> {
        let config = ChannelConfig {
            broker: broker.address(),
            connect_timeout: Duration::from_secs(2),
            response_timeout: Some(Duration::from_secs(2)),
        };
        let channel = Arc::new(Mutex::new(ControlChannel::new(
            config,
            reactor,
            Arc::new(TypedSchemaValidator),
        )));
        channel.lock().connect().unwrap();
        channel
    }

    fn dispatch_until<T>(reactor: &Reactor, rx: &crossbeam_channel::Receiver<T>) -> Option<T> {
        for _ in 0..100 {
            reactor.dispatch(Some(Duration::from_millis(20))).unwrap();
            if let Ok(value) = rx.try_recv() {
                return Some(value);
            }
        }
        None
    }

    #[test]
    fn test_setup_and_teardown_forwarded() {
        let broker = FakeBroker::start().unwrap();
        let reactor = Arc::new(Reactor::new().unwrap());
        let channel = connected(&broker, reactor.clone());
        let (tx, rx) = unbounded();

        let listener: Arc<dyn EventHandler> = Arc::new(PushListener::new(&channel, tx));
        channel.lock().set_push_handler(Some(listener)).unwrap();
        assert!(broker.wait_for_connection(Duration::from_secs(2)));

        broker
            .push(&FakeBroker::setup_push(&json!({
                "IP": "239.0.0.3", "CAN_PORT": 5100, "CARLA_PORT": 5101
            })))
            .unwrap();
        let event = dispatch_until(&reactor, &rx).unwrap().unwrap();
        assert!(matches!(event, PushEvent::Setup(_)));
        assert!(channel.lock().session_parameters().is_some());

        broker.push(&FakeBroker::teardown_push()).unwrap();
        let event = dispatch_until(&reactor, &rx).unwrap().unwrap();
        assert_eq!(event, PushEvent::Teardown);
        assert!(channel.lock().session_parameters().is_none());
    }

    #[test]
    fn test_malformed_push_closes_connection() {
        let broker = FakeBroker::start().unwrap();
        let reactor = Arc::new(Reactor::new().unwrap());
        let channel = connected(&broker, reactor.clone());
        let (tx, rx) = unbounded();

        let listener: Arc<dyn EventHandler> = Arc::new(PushListener::new(&channel, tx));
        channel.lock().set_push_handler(Some(listener)).unwrap();
        assert!(broker.wait_for_connection(Duration::from_secs(2)));

        broker
            .push(&FakeBroker::setup_push(&json!({"IP": "239.0.0.3"})))
            .unwrap();
        let event = dispatch_until(&reactor, &rx).unwrap();
        assert!(matches!(event, Err(BrokerError::MalformedPush(_))));
        assert!(!channel.lock().is_connected());
        assert!(reactor.is_empty());
    }
}
