//! Integration tests for flush and the fatal-error path
//!
//! - Flush completes every request submitted before it returns
//! - A stalled lane is force-stopped and restarted by flush
//! - A stalled lane while running ends in exactly one device error

mod common;

use campipe::pipeline::{DeviceState, RequestKey, RequestStatus, StageId};
use campipe::types::StreamKind;
use common::builders::{ConfigBuilder, RequestBuilder};
use common::mock_helpers::{Seen, SimRig};
use serial_test::serial;
use std::time::Duration;

#[test]
#[serial]
fn test_flush_completes_everything_submitted() {
    let mut rig = SimRig::running(ConfigBuilder::new().build());

    let keys: Vec<RequestKey> = (0..5)
        .map(|_| rig.session.submit_request(RequestBuilder::preview().build()).unwrap())
        .collect();
    rig.tick(2);
    rig.session.flush().unwrap();

    // Everything is already queued on the bridge when flush returns.
    rig.drain();
    let done = rig.completions();
    assert_eq!(done.iter().map(|(k, _)| *k).collect::<Vec<_>>(), keys);
    assert!(done[2..].iter().all(|(_, s)| *s == RequestStatus::Aborted));
    assert_eq!(rig.session.state(), DeviceState::Running);

    // And the session keeps working afterwards.
    let next = rig.session.submit_request(RequestBuilder::preview().build()).unwrap();
    rig.tick(1);
    assert_eq!(rig.wait_completions(6).last(), Some(&(next, RequestStatus::Complete)));
}

#[test]
#[serial]
fn test_flush_forces_stalled_lane() {
    let mut rig = SimRig::running(ConfigBuilder::new().flush_timeout_ms(200).build());
    let sensor = rig.sim.driver(StageId::Sensor).unwrap().clone();
    sensor.configure(|f| f.stall = true);

    let keys: Vec<RequestKey> = (0..2)
        .map(|_| rig.session.submit_request(RequestBuilder::preview().build()).unwrap())
        .collect();
    rig.tick(2);
    rig.wait_until(|_| sensor.held() == 2);

    rig.session.flush().unwrap();
    rig.drain();
    assert_eq!(
        rig.completions(),
        keys.iter().map(|&k| (k, RequestStatus::Aborted)).collect::<Vec<_>>()
    );
    assert_eq!(sensor.held(), 0);
    assert!(sensor.is_started(), "lane should be restarted after a forced flush");

    sensor.configure(|f| f.stall = false);
    let next = rig.session.submit_request(RequestBuilder::preview().build()).unwrap();
    rig.tick(1);
    assert_eq!(rig.wait_completions(3).last(), Some(&(next, RequestStatus::Complete)));
}

#[test]
#[serial]
fn test_stalled_lane_is_fatal_once() {
    let mut rig = SimRig::running(ConfigBuilder::new().eager_monitor().flush_timeout_ms(200).build());
    rig.sim
        .driver(StageId::Sensor)
        .unwrap()
        .configure(|f| f.stall = true);

    let key = rig.session.submit_request(RequestBuilder::preview().build()).unwrap();
    rig.tick(1);

    assert!(rig.session.wait_for_state(DeviceState::Error, Duration::from_secs(3)));
    rig.wait_until(|seen| seen.iter().any(|s| matches!(s, Seen::Complete { .. })));

    // Requests submitted after the error are refused with an abort.
    let late = rig.session.submit_request(RequestBuilder::preview().build()).unwrap();
    rig.session.close();
    rig.drain();

    let errors = rig
        .seen
        .iter()
        .filter(|s| matches!(s, Seen::DeviceError(_)))
        .count();
    assert_eq!(errors, 1);
    assert_eq!(
        rig.completions(),
        vec![(key, RequestStatus::Aborted), (late, RequestStatus::Aborted)]
    );
    assert_eq!(rig.sim.pool.stats().outstanding, 0);
}

#[test]
#[serial]
fn test_buffer_error_gives_partial_complete() {
    let mut rig = SimRig::running(ConfigBuilder::new().build());
    // The scaler runs on the front-end lane; callback is its second port.
    rig.sim
        .driver(StageId::Bayer)
        .unwrap()
        .configure(|f| f.error_ports.push((StageId::Mcsc, 1)));

    let key = rig
        .session
        .submit_request(
            RequestBuilder::preview()
                .stream(StreamKind::Callback)
                .build(),
        )
        .unwrap();
    rig.tick(1);

    assert_eq!(rig.wait_completions(1), vec![(key, RequestStatus::PartialComplete)]);
    assert!(rig.seen.iter().any(|s| matches!(
        s,
        Seen::BufferError {
            stream: StreamKind::Callback,
            ..
        }
    )));
    assert!(rig.seen.iter().any(|s| matches!(
        s,
        Seen::Buffer {
            stream: StreamKind::Preview,
            ..
        }
    )));
}

#[test]
#[serial]
fn test_health_snapshot_serializes() {
    let mut rig = SimRig::running(ConfigBuilder::new().build());
    rig.session.submit_request(RequestBuilder::preview().build()).unwrap();
    rig.tick(1);
    rig.wait_completions(1);

    let health = rig.session.health().unwrap();
    assert_eq!(health.state, DeviceState::Running);
    assert!(health.lanes.iter().any(|l| l.stage == StageId::Sensor));
    assert_eq!(health.completed_requests, 1);

    let json = serde_json::to_value(&health).unwrap();
    assert_eq!(json["state"], "running");
    assert!(json["timestamp"].is_string());
}
