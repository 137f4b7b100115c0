//! Control-channel scenarios for the session controller
//!
//! Every test here ends before the data plane starts, so no multicast
//! support is needed.
//!
//! Run with: cargo test -p sss3-tests --test negotiation_test

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use sss3_broker::testing::{FakeBroker, ScriptedResponse};
use sss3_broker::{BrokerError, DEVICES_PATH, REGISTER_PATH, SESSION_PATH, SESSION_REQUEST_PATH};
use sss3_core::DeviceDescriptor;
use sss3_session::{
    ClientConfig, ConnectionState, DeviceSelector, SessionController, SessionEnd, SessionError,
    SessionResult, SessionSummary,
};

const WAIT: Duration = Duration::from_secs(5);

/// Hands out scripted picks and remembers which ids it was offered
#[derive(Default)]
struct ScriptedSelector {
    picks: Mutex<VecDeque<Vec<u32>>>,
    offered: Mutex<Vec<Vec<u32>>>,
}

impl ScriptedSelector {
    fn new(picks: Vec<Vec<u32>>) -> Arc<Self> {
        Arc::new(Self {
            picks: Mutex::new(picks.into()),
            offered: Mutex::new(Vec::new()),
        })
    }

    fn offered(&self) -> Vec<Vec<u32>> {
        self.offered.lock().clone()
    }
}

impl DeviceSelector for ScriptedSelector {
    fn select(&self, devices: &[DeviceDescriptor]) -> Option<Vec<u32>> {
        self.offered
            .lock()
            .push(devices.iter().map(|d| d.id).collect());
        self.picks.lock().pop_front()
    }
}

fn device(id: u32, kind: &str) -> Value {
    json!({"ID": id, "type": kind, "year": "2020", "make": "Bendix", "model": "EC-80"})
}

fn config(broker: &FakeBroker) -> ClientConfig {
    ClientConfig {
        response_timeout_ms: 2000,
        push_poll_interval_ms: 20,
        setup_timeout_ms: Some(3000),
        ..ClientConfig::default().with_broker(broker.address())
    }
}

fn controller(config: ClientConfig, selector: Arc<ScriptedSelector>) -> Arc<SessionController> {
    Arc::new(
        SessionController::builder(config, selector)
            .build()
            .expect("controller"),
    )
}

fn spawn_run(controller: &Arc<SessionController>) -> JoinHandle<SessionResult<SessionSummary>> {
    let controller = controller.clone();
    thread::spawn(move || controller.run())
}

fn lines(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(m, t)| (m.to_string(), t.to_string()))
        .collect()
}

#[test]
fn test_session_request_carries_only_selected_device() {
    let broker = FakeBroker::start().unwrap();
    broker.respond(
        "GET",
        DEVICES_PATH,
        ScriptedResponse::json(200, &json!([device(1, "Engine"), device(2, "Brake")])),
    );
    let mut config = config(&broker);
    config.setup_timeout_ms = Some(100);
    let controller = controller(config, ScriptedSelector::new(vec![vec![2]]));

    let summary = controller.run().unwrap();
    assert_eq!(summary.end, SessionEnd::SetupTimedOut);

    let requests = broker.requests();
    assert_eq!(
        FakeBroker::json_body(&requests[0]).unwrap(),
        json!({"MAC": sss3_core::DEFAULT_MAC})
    );
    let session = requests
        .iter()
        .find(|r| r.target == SESSION_REQUEST_PATH)
        .unwrap();
    assert_eq!(
        FakeBroker::json_body(session).unwrap(),
        json!({"MAC": sss3_core::DEFAULT_MAC, "ECUs": [device(2, "Brake")]})
    );
}

#[test]
fn test_unavailable_devices_trigger_reselection() {
    let broker = FakeBroker::start().unwrap();
    broker.respond(
        "GET",
        DEVICES_PATH,
        ScriptedResponse::json(200, &json!([device(1, "Engine"), device(2, "Brake")])),
    );
    broker.respond(
        "GET",
        DEVICES_PATH,
        ScriptedResponse::json(200, &json!([device(1, "Engine")])),
    );
    broker.respond("POST", SESSION_REQUEST_PATH, ScriptedResponse::new(409, "Conflict"));
    broker.respond(
        "POST",
        SESSION_REQUEST_PATH,
        ScriptedResponse::new(200, "OK").then_push(FakeBroker::teardown_push()),
    );

    let selector = ScriptedSelector::new(vec![vec![2], vec![1]]);
    let controller = controller(config(&broker), selector.clone());

    let summary = controller.run().unwrap();
    assert_eq!(summary.end, SessionEnd::BrokerTeardown);
    assert_eq!(selector.offered(), vec![vec![1, 2], vec![1]]);
    assert_eq!(
        broker.request_lines(),
        lines(&[
            ("POST", REGISTER_PATH),
            ("GET", DEVICES_PATH),
            ("POST", SESSION_REQUEST_PATH),
            ("GET", DEVICES_PATH),
            ("POST", SESSION_REQUEST_PATH),
            ("DELETE", SESSION_PATH),
            ("DELETE", REGISTER_PATH),
        ])
    );
}

#[test]
fn test_registration_retry_recovers() {
    let broker = FakeBroker::start().unwrap();
    broker.respond(
        "POST",
        REGISTER_PATH,
        ScriptedResponse::new(500, "Internal Server Error"),
    );
    broker.respond("POST", REGISTER_PATH, ScriptedResponse::new(201, "Created"));
    broker.respond("GET", DEVICES_PATH, ScriptedResponse::json(200, &json!([])));
    let controller = controller(config(&broker), ScriptedSelector::new(vec![]));

    let summary = controller.run().unwrap();
    assert_eq!(summary.end, SessionEnd::NoDevices);
    assert_eq!(
        broker.request_lines()[..3].to_vec(),
        lines(&[
            ("POST", REGISTER_PATH),
            ("POST", REGISTER_PATH),
            ("GET", DEVICES_PATH),
        ])
    );
}

#[test]
fn test_teardown_push_before_setup() {
    let broker = FakeBroker::start().unwrap();
    broker.respond(
        "GET",
        DEVICES_PATH,
        ScriptedResponse::json(200, &json!([device(1, "Engine")])),
    );
    let mut config = config(&broker);
    config.setup_timeout_ms = None;
    let controller = controller(config, ScriptedSelector::new(vec![vec![1]]));

    let runner = spawn_run(&controller);
    assert!(broker.wait_for_requests(3, WAIT));
    broker.push(&FakeBroker::teardown_push()).unwrap();

    let summary = runner.join().unwrap().unwrap();
    assert_eq!(summary.end, SessionEnd::BrokerTeardown);
    assert_eq!(summary.parameters, None);
    assert_eq!(controller.session_parameters(), None);
    assert_eq!(controller.state(), ConnectionState::Disconnected);
}

#[test]
fn test_malformed_setup_push_leaves_parameters_unset() {
    let broker = FakeBroker::start().unwrap();
    broker.respond(
        "GET",
        DEVICES_PATH,
        ScriptedResponse::json(200, &json!([device(1, "Engine")])),
    );
    let controller = controller(config(&broker), ScriptedSelector::new(vec![vec![1]]));

    let runner = spawn_run(&controller);
    assert!(broker.wait_for_requests(3, WAIT));
    broker
        .push(&FakeBroker::setup_push(
            &json!({"IP": "239.255.0.1", "CAN_PORT": "5000", "CARLA_PORT": 5001}),
        ))
        .unwrap();

    let err = runner.join().unwrap().unwrap_err();
    assert!(matches!(
        err,
        SessionError::Broker(BrokerError::MalformedPush(_))
    ));
    assert_eq!(controller.session_parameters(), None);
    assert_eq!(controller.state(), ConnectionState::Disconnected);
}

#[test]
fn test_unsupported_push_is_refused() {
    let broker = FakeBroker::start().unwrap();
    broker.respond(
        "GET",
        DEVICES_PATH,
        ScriptedResponse::json(200, &json!([device(1, "Engine")])),
    );
    let controller = controller(config(&broker), ScriptedSelector::new(vec![vec![1]]));

    let runner = spawn_run(&controller);
    assert!(broker.wait_for_requests(3, WAIT));
    broker
        .push(&FakeBroker::push_message("PUT", b"{}"))
        .unwrap();
    assert!(broker.wait_for_replies(1, WAIT));
    assert_eq!(broker.replies()[0].status, 501);

    broker.push(&FakeBroker::teardown_push()).unwrap();
    let summary = runner.join().unwrap().unwrap();
    assert_eq!(summary.end, SessionEnd::BrokerTeardown);
}

#[test]
fn test_broker_loss_while_awaiting_setup() {
    let broker = FakeBroker::start().unwrap();
    broker.respond(
        "GET",
        DEVICES_PATH,
        ScriptedResponse::json(200, &json!([device(1, "Engine")])),
    );
    let mut config = config(&broker);
    config.setup_timeout_ms = None;
    config.connect_timeout_ms = 200;
    let controller = controller(config, ScriptedSelector::new(vec![vec![1]]));

    let runner = spawn_run(&controller);
    assert!(broker.wait_for_requests(3, WAIT));
    drop(broker);

    let err = runner.join().unwrap().unwrap_err();
    assert!(matches!(
        err,
        SessionError::Broker(BrokerError::RemoteDisconnected)
    ));
    assert_eq!(controller.state(), ConnectionState::Disconnected);
}

#[test]
fn test_repeated_stop_reissues_teardown() {
    let broker = FakeBroker::start().unwrap();
    broker.respond("GET", DEVICES_PATH, ScriptedResponse::json(200, &json!([])));
    let controller = controller(config(&broker), ScriptedSelector::new(vec![]));

    controller.run().unwrap();
    let after_run = broker.request_lines();
    controller.stop();
    let after_stop = broker.request_lines();

    let teardown = lines(&[("DELETE", SESSION_PATH), ("DELETE", REGISTER_PATH)]);
    assert_eq!(after_run[after_run.len() - 2..].to_vec(), teardown);
    assert_eq!(after_stop[after_run.len()..].to_vec(), teardown);
    assert_eq!(broker.connections(), 2);
}
