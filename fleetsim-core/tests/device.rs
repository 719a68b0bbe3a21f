mod common;

use common::*;
use fleetsim_core::Device;
use fleetsim_error::transport::TransportError;
use fleetsim_models::settings::SimulationConfig;
use fleetsim_sdk::{C2dMessage, ConnectionString};
use serde_json::{json, Value};
use std::{collections::HashMap, sync::atomic::Ordering, time::Duration};

const DEVICE_ID: &str = "sim1-tgt1-thermostat-1";

#[tokio::test(start_paused = true)]
async fn test_telemetry_batch_is_sent_newest_first() {
    let h = Harness::new(config(), MockRegistrationApi::new(0, None));
    let ctx = h.run_context(simulation(json!({"telemetryBatchSize": 3, "telemetryInterval": 31})));
    let device = Device::new(DEVICE_ID, thermostat_model());

    device.send_telemetry(&ctx).await;

    assert!(device.is_connected());
    assert_eq!(h.transport.state.sends_for(DEVICE_ID), 3);
    let messages = h.transport.state.messages.lock().unwrap().clone();
    let times: Vec<_> = messages.iter().map(|(_, m)| m.creation_time).collect();
    assert_eq!(times[0] - times[1], chrono::Duration::seconds(10));
    assert_eq!(times[1] - times[2], chrono::Duration::seconds(10));
    for (_, message) in &messages {
        assert_eq!(message.content_type, "application/json");
        assert_eq!(message.content_encoding, "utf-8");
        assert_eq!(message.data_point_count, 2);
        let body: Value = serde_json::from_slice(&message.body).unwrap();
        assert!(body["temperature"].is_f64());
        assert!(body["location"]["lat"].is_f64());
    }
    assert_ne!(messages[0].1.message_id, messages[1].1.message_id);

    assert_eq!(h.metrics.count("telemetry_message_success"), 3);
    assert_eq!(h.metrics.count("telemetry_batch_success"), 1);
    assert_eq!(h.metrics.connected(HUB_NAME), 1);
    assert!(device.last_telemetry_ms() > 0);
}

#[tokio::test(start_paused = true)]
async fn test_empty_batch_does_not_connect() {
    let h = Harness::new(config(), MockRegistrationApi::new(0, None));
    let ctx = h.run_context(simulation(json!({"telemetryBatchSize": 0})));
    let device = Device::new(DEVICE_ID, thermostat_model());

    device.send_telemetry(&ctx).await;

    assert!(!device.is_connected());
    assert_eq!(h.transport.state.connects.load(Ordering::SeqCst), 0);
    assert_eq!(h.transport.state.total_sends(), 0);
    assert_eq!(h.metrics.count("telemetry_batch_success"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_telemetry_request_is_skipped() {
    let h = Harness::new(config(), MockRegistrationApi::new(0, None));
    *h.transport.state.send_delay.lock().unwrap() = Duration::from_secs(1);
    let ctx = h.run_context(simulation(json!({})));
    let device = Device::new(DEVICE_ID, thermostat_model());

    tokio::join!(device.send_telemetry(&ctx), device.send_telemetry(&ctx));

    assert_eq!(h.transport.state.sends_for(DEVICE_ID), 1);
    assert_eq!(h.metrics.count("telemetry_batch_skipped"), 1);

    device.send_telemetry(&ctx).await;
    assert_eq!(h.transport.state.sends_for(DEVICE_ID), 2);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_send_failures_fail_over_to_new_hub() {
    let h = Harness::new(config(), MockRegistrationApi::new(0, None));
    let ctx = h.run_context(simulation(json!({})));
    let device = Device::new(DEVICE_ID, thermostat_model());
    h.transport.state.send_failures.store(2, Ordering::SeqCst);

    device.send_telemetry(&ctx).await;
    assert_eq!(device.retry_count(), 1);
    device.send_telemetry(&ctx).await;
    assert_eq!(device.retry_count(), 2);
    assert_eq!(h.metrics.count("telemetry_message_failure:connection closed"), 2);
    assert_eq!(h.metrics.connected(HUB_NAME), 1);
    assert_eq!(h.registration.registers.load(Ordering::SeqCst), 1);

    h.registration.set_hub("hub2.azure-devices.net");
    device.send_telemetry(&ctx).await;

    assert_eq!(h.registration.registers.load(Ordering::SeqCst), 2);
    assert_eq!(h.metrics.count("failover"), 1);
    assert_eq!(device.retry_count(), 0);
    assert_eq!(h.transport.state.sends_for(DEVICE_ID), 1);
    let connection: ConnectionString = device.connection_string().unwrap().parse().unwrap();
    assert_eq!(connection.host_name, "hub2.azure-devices.net");
    assert_eq!(h.metrics.connected(HUB_NAME), 0);
    assert_eq!(h.metrics.connected("hub2"), 1);

    let cached = h.stores.get_target_device(TARGET_ID, DEVICE_ID).await.unwrap().unwrap();
    assert!(cached.connection_string.contains("hub2.azure-devices.net"));
}

#[tokio::test(start_paused = true)]
async fn test_failover_rejected_by_new_endpoint_is_counted_once() {
    let h = Harness::new(config(), MockRegistrationApi::new(0, None));
    let ctx = h.run_context(simulation(json!({})));
    let device = Device::new(DEVICE_ID, thermostat_model());
    h.transport.state.send_failures.store(2, Ordering::SeqCst);
    device.send_telemetry(&ctx).await;
    device.send_telemetry(&ctx).await;
    assert_eq!(device.retry_count(), 2);

    h.transport
        .state
        .connect_errors
        .lock()
        .unwrap()
        .push_back(TransportError::Unauthorized("stale sas".into()));
    device.send_telemetry(&ctx).await;

    assert!(device.is_connected());
    assert_eq!(h.registration.registers.load(Ordering::SeqCst), 3);
    assert_eq!(h.transport.state.connects.load(Ordering::SeqCst), 3);
    assert_eq!(h.metrics.count("failover"), 1);
    assert_eq!(h.transport.state.sends_for(DEVICE_ID), 1);
    assert_eq!(h.metrics.connected(HUB_NAME), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_connect_reprovisions_once() {
    let h = Harness::new(config(), MockRegistrationApi::new(0, None));
    h.transport
        .state
        .connect_errors
        .lock()
        .unwrap()
        .push_back(TransportError::Unauthorized("bad sas".into()));
    let ctx = h.run_context(simulation(json!({})));
    let device = Device::new(DEVICE_ID, thermostat_model());

    device.connect(&ctx).await.unwrap();

    assert!(device.is_connected());
    assert_eq!(h.transport.state.connects.load(Ordering::SeqCst), 2);
    assert_eq!(h.registration.registers.load(Ordering::SeqCst), 2);
    assert_eq!(h.metrics.count("failover"), 1);
    assert_eq!(h.metrics.count("connect_failure:not authorized"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_other_connect_errors_are_counted_without_failover() {
    let h = Harness::new(config(), MockRegistrationApi::new(0, None));
    h.transport
        .state
        .connect_errors
        .lock()
        .unwrap()
        .push_back(TransportError::ConnectionClosed("reset by peer".into()));
    let ctx = h.run_context(simulation(json!({})));
    let device = Device::new(DEVICE_ID, thermostat_model());

    device.send_telemetry(&ctx).await;

    assert!(!device.is_connected());
    assert_eq!(device.retry_count(), 0);
    assert_eq!(h.registration.registers.load(Ordering::SeqCst), 1);
    assert_eq!(h.metrics.count("connect_failure:connection closed"), 1);
    assert_eq!(h.metrics.count("failover"), 0);
    assert_eq!(h.transport.state.total_sends(), 0);

    device.send_telemetry(&ctx).await;
    assert!(device.is_connected());
    assert_eq!(h.registration.registers.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.state.sends_for(DEVICE_ID), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_keeps_connection_string() {
    let h = Harness::new(config(), MockRegistrationApi::new(0, None));
    let ctx = h.run_context(simulation(json!({})));
    let device = Device::new(DEVICE_ID, thermostat_model());

    device.connect(&ctx).await.unwrap();
    assert_eq!(h.metrics.connected(HUB_NAME), 1);
    assert!(h.transport.state.desired.contains_key(DEVICE_ID));
    assert!(h.transport.state.c2d.contains_key(DEVICE_ID));

    device.disconnect(&ctx).await;
    assert!(!device.is_connected());
    assert!(device.connection_string().is_some());
    assert_eq!(h.transport.state.closes.load(Ordering::SeqCst), 1);
    assert!(h.transport.state.desired.is_empty());
    assert!(h.transport.state.c2d.is_empty());
    assert!(h.transport.state.methods.is_empty());
    assert_eq!(h.metrics.connected(HUB_NAME), 0);

    // second disconnect is a no-op
    device.disconnect(&ctx).await;
    assert_eq!(h.transport.state.closes.load(Ordering::SeqCst), 1);

    device.connect(&ctx).await.unwrap();
    assert_eq!(h.registration.registers.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.state.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_desired_properties_are_acknowledged() {
    let h = Harness::new(config(), MockRegistrationApi::new(0, None));
    let ctx = h.run_context(simulation(json!({})));
    let device = Device::new(DEVICE_ID, thermostat_model());
    device.connect(&ctx).await.unwrap();

    let desired = h.transport.state.desired.get(DEVICE_ID).unwrap().clone();
    let patch = json!({"targetTemperature": 21.5, "$version": 4});
    desired.send(patch.as_object().unwrap().clone()).await.unwrap();

    let state = &h.transport.state;
    wait_until(Duration::from_secs(5), || !state.reported.lock().unwrap().is_empty()).await;
    let (device_id, ack) = state.reported.lock().unwrap()[0].clone();
    assert_eq!(device_id, DEVICE_ID);
    assert_eq!(
        Value::Object(ack),
        json!({"targetTemperature": {"value": 21.5, "ac": 200, "ad": "completed", "av": 4}})
    );
    wait_until(Duration::from_secs(5), || h.metrics.count("twin_update_success") == 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_commands_are_acknowledged() {
    let h = Harness::new(config(), MockRegistrationApi::new(0, None));
    let ctx = h.run_context(simulation(json!({})));
    let device = Device::new(DEVICE_ID, thermostat_model());
    device.connect(&ctx).await.unwrap();

    let handler = h
        .transport
        .state
        .methods
        .get(&(DEVICE_ID.to_string(), "reboot".to_string()))
        .map(|entry| entry.clone())
        .unwrap();
    assert_eq!(handler(json!({"delay": 1})).unwrap(), json!({}));
    assert_eq!(h.metrics.count("command_success"), 1);
    assert!(!h
        .transport
        .state
        .methods
        .contains_key(&(DEVICE_ID.to_string(), "refresh".to_string())));

    let c2d = h.transport.state.c2d.get(DEVICE_ID).unwrap().clone();
    c2d.send(C2dMessage {
        topic: format!("devices/{DEVICE_ID}/messages/devicebound/method-name=refresh"),
        payload: b"{}".to_vec(),
        properties: HashMap::from([("method-name".to_string(), "refresh".to_string())]),
    })
    .await
    .unwrap();
    wait_until(Duration::from_secs(5), || h.metrics.count("command_success") == 2).await;
}

#[tokio::test(start_paused = true)]
async fn test_disabled_acks_skip_subscriptions() {
    let config = SimulationConfig {
        enable_twin_update_acks: false,
        enable_command_acks: false,
        ..config()
    };
    let h = Harness::new(config, MockRegistrationApi::new(0, None));
    let ctx = h.run_context(simulation(json!({})));
    let device = Device::new(DEVICE_ID, thermostat_model());

    device.connect(&ctx).await.unwrap();
    assert!(h.transport.state.desired.is_empty());
    assert!(h.transport.state.c2d.is_empty());
    assert!(h.transport.state.methods.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_after_telemetry() {
    let h = Harness::new(config(), MockRegistrationApi::new(0, None));
    let ctx = h.run_context(simulation(json!({"disconnectBehavior": "telemetry"})));
    let device = Device::new(DEVICE_ID, thermostat_model());

    device.send_telemetry(&ctx).await;
    device.send_telemetry(&ctx).await;

    assert!(!device.is_connected());
    assert_eq!(h.transport.state.sends_for(DEVICE_ID), 2);
    assert_eq!(h.transport.state.connects.load(Ordering::SeqCst), 2);
    assert_eq!(h.transport.state.closes.load(Ordering::SeqCst), 2);
    assert_eq!(h.registration.registers.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reported_properties_carry_read_only_values() {
    let h = Harness::new(config(), MockRegistrationApi::new(0, None));
    let ctx = h.run_context(simulation(json!({})));
    let device = Device::new(DEVICE_ID, thermostat_model());

    device.send_reported_properties(&ctx).await;

    let reported = h.transport.state.reported.lock().unwrap().clone();
    assert_eq!(reported.len(), 1);
    let (_, document) = &reported[0];
    assert!(document["serialNumber"].is_string());
    assert!(!document.contains_key("targetTemperature"));
    assert_eq!(h.metrics.count("reported_props_success"), 1);
}
