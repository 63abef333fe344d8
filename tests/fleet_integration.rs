//! ---
//! vfab_section: "15-testing-qa-runbook"
//! vfab_subsection: "integration-tests"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "End-to-end fleet feedback-loop tests."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;
use v_fab_common::{AppConfig, DeviceConfig, SimulationConfig};
use v_fab_core::{FleetCollaborators, FleetHandle, FleetSupervisor};
use v_fab_msg::{command, node, shadow, DeviceErrorFlags};
use v_fab_net::{
    FleetShadowClient, InMemoryEventChannel, InMemoryQueue, InMemoryShadowHub, RecordingNotifier,
    TelemetrySource,
};
use v_fab_sim::{BridgeSettings, PlcSettings, SignalBridge, SimulatedPlc};

struct Fleet {
    plc: Arc<SimulatedPlc>,
    hub: Arc<InMemoryShadowHub>,
    notifier: Arc<RecordingNotifier>,
    handle: FleetHandle,
    bridge_task: tokio::task::JoinHandle<()>,
}

impl Fleet {
    async fn shutdown(self) {
        self.handle.shutdown().await.expect("fleet shutdown");
        self.bridge_task.await.expect("bridge task");
    }
}

/// Wire a two-device fleet exactly the way the daemon does: simulated PLC,
/// in-memory shadow hub, event channel, queues, and the signal bridge.
async fn launch(bad_ratio: f64, bridge_window: Duration) -> Fleet {
    let mut fleet = IndexMap::new();
    fleet.insert("press-1".to_owned(), DeviceConfig::default());
    fleet.insert("press-2".to_owned(), DeviceConfig::default());
    let config = AppConfig {
        fleet,
        poll_interval: Duration::from_millis(20),
        simulation: SimulationConfig {
            fault_rate: 0.0,
            bad_ratio,
            bridge_window,
            ..SimulationConfig::default()
        },
        ..AppConfig::default()
    };

    let plc = Arc::new(SimulatedPlc::new(PlcSettings {
        seed: config.simulation.seed,
        fault_rate: config.simulation.fault_rate,
        bad_ratio: config.simulation.bad_ratio,
    }));
    for (device_id, device_cfg) in &config.fleet {
        plc.register_device(device_cfg.node_prefix_or(device_id), device_cfg.initial_rate);
    }

    let hub = Arc::new(InMemoryShadowHub::new());
    let events = Arc::new(InMemoryEventChannel::new());
    let queues = Arc::new(InMemoryQueue::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let bridge = SignalBridge::new(
        queues.clone(),
        BridgeSettings {
            window: config.simulation.bridge_window,
            production_queue: config.escalation.production_queue.clone(),
            error_queue: config.escalation.error_queue.clone(),
        },
    );

    let supervisor = FleetSupervisor::new(
        config,
        FleetCollaborators {
            telemetry: plc.clone(),
            shadow: hub.clone(),
            fleet_shadow: hub.clone(),
            events: events.clone(),
            queues: queues.clone(),
            notifier: notifier.clone(),
        },
    );
    let handle = supervisor.start().await.expect("fleet start");
    let bridge_task = bridge.spawn(events.subscribe(), handle.subscribe_shutdown());

    Fleet {
        plc,
        hub,
        notifier,
        handle,
        bridge_task,
    }
}

async fn wait_for_reported(
    hub: &InMemoryShadowHub,
    device_id: &str,
    field: &str,
    what: &str,
    predicate: impl Fn(&Value) -> bool,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(view) = hub.get_reported(device_id).await {
            if view.field(field).map(&predicate).unwrap_or(false) {
                return;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn contains_flag(value: &Value, flag: &str) -> bool {
    value
        .as_str()
        .map(|rendering| rendering.split(',').any(|name| name == flag))
        .unwrap_or(false)
}

#[tokio::test]
async fn error_burst_stops_one_device_and_reset_recovers_it() {
    // long window so the whole burst counts together; no bad production
    let fleet = launch(0.0, Duration::from_secs(60)).await;

    // burst: two single faults, a clear, then a double fault. Window total
    // 1 + 1 + 2 = 4 > 3, which must trigger the emergency stop.
    fleet
        .plc
        .inject_error("press-1", DeviceErrorFlags::POWER_FAILURE);
    tokio::time::sleep(Duration::from_millis(60)).await;
    fleet
        .plc
        .inject_error("press-1", DeviceErrorFlags::SENSOR_FAILURE);
    tokio::time::sleep(Duration::from_millis(60)).await;
    fleet
        .plc
        .call_method("press-1", "press-1/ResetErrorStatus")
        .await
        .expect("clear errors");
    tokio::time::sleep(Duration::from_millis(60)).await;
    fleet.plc.inject_error(
        "press-1",
        DeviceErrorFlags::POWER_FAILURE | DeviceErrorFlags::SENSOR_FAILURE,
    );

    wait_for_reported(
        &fleet.hub,
        "press-1",
        shadow::DEVICE_ERROR,
        "press-1 emergency stop",
        |value| contains_flag(value, "EmergencyStop"),
    )
    .await;

    // the sibling device keeps running untouched
    let press_2 = fleet.hub.get_reported("press-2").await.expect("press-2");
    assert_eq!(
        press_2.field(shadow::DEVICE_ERROR),
        Some(&Value::String("None".to_owned()))
    );

    let delivered = fleet.notifier.delivered();
    assert!(!delivered.is_empty(), "a notification must be attempted");
    assert!(delivered.iter().all(|(device, _)| device == "press-1"));

    // operator resets the device through the command channel
    let response = fleet
        .hub
        .invoke_command(
            "press-1",
            command::RESET_ERROR_STATUS,
            Value::Null,
            Duration::from_secs(5),
        )
        .await
        .expect("reset response");
    assert_eq!(response.status, 200);

    wait_for_reported(
        &fleet.hub,
        "press-1",
        shadow::DEVICE_ERROR,
        "press-1 error state cleared",
        |value| value == &Value::String("None".to_owned()),
    )
    .await;

    // the controller register is cleared and production resumes
    let register = fleet
        .plc
        .read_node(&node::path("press-1", node::DEVICE_ERROR))
        .await
        .expect("error register");
    assert_eq!(register.as_i64(), Some(0));
    let status = fleet
        .plc
        .read_node(&node::path("press-1", node::PRODUCTION_STATUS))
        .await
        .expect("status");
    assert_eq!(status.as_i64(), Some(1));

    fleet.shutdown().await;
}

#[tokio::test]
async fn degraded_production_quality_throttles_the_rate() {
    // half the units are rejected: 50% good is far below the 90% threshold
    let fleet = launch(0.5, Duration::from_millis(150)).await;

    // the feedback loop closes: bridge window -> production signal ->
    // desired rate decrease -> reconciler applies it -> reported rate drops
    wait_for_reported(
        &fleet.hub,
        "press-1",
        shadow::PRODUCTION_RATE,
        "press-1 throttled at least twice",
        |value| value.as_i64().map(|rate| rate <= 40).unwrap_or(false),
    )
    .await;

    // the applied rate reached the controller as well
    let rate = fleet
        .plc
        .read_node(&node::path("press-1", node::PRODUCTION_RATE))
        .await
        .expect("rate");
    assert!(rate.as_i64().expect("integer rate") <= 40);

    fleet.shutdown().await;
}
