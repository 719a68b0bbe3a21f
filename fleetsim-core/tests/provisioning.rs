mod common;

use common::*;
use fleetsim_core::Registration;
use fleetsim_error::provision::ProvisionError;
use fleetsim_models::settings::SimulationConfig;
use fleetsim_sdk::{ConnectionString, MetricLabels};
use std::{sync::atomic::Ordering, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const DEVICE_ID: &str = "sim1-tgt1-thermostat-1";

fn labels() -> MetricLabels {
    MetricLabels::new(SIM_ID, TARGET_ID, MODEL_ID)
}

#[tokio::test(start_paused = true)]
async fn test_registration_polls_until_assigned_honoring_retry_after() {
    let h = Harness::new(config(), MockRegistrationApi::new(3, Some(Duration::from_secs(1))));
    let target = target();
    let labels = labels();
    let registration = Registration {
        target: &target,
        device_id: DEVICE_ID,
        model_id: "dtmi:com:example:Thermostat;1",
        labels: &labels,
    };

    let started = Instant::now();
    let connection = h
        .engine
        .provisioner
        .provision(registration, &CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(h.registration.registers.load(Ordering::SeqCst), 1);
    assert_eq!(h.registration.polls.load(Ordering::SeqCst), 4);
    let parsed: ConnectionString = connection.parse().unwrap();
    assert_eq!(parsed.host_name, HUB);
    assert_eq!(parsed.device_id, DEVICE_ID);
    assert!(!parsed.shared_access_key.is_empty());
    assert_eq!(h.metrics.count("provision_success"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_retry_after_uses_default_interval() {
    let h = Harness::new(config(), MockRegistrationApi::new(1, None));
    let target = target();
    let labels = labels();
    let registration = Registration {
        target: &target,
        device_id: DEVICE_ID,
        model_id: MODEL_ID,
        labels: &labels,
    };

    let started = Instant::now();
    h.engine
        .provisioner
        .provision(registration, &CancellationToken::new())
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(h.registration.polls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cached_connection_skips_registration() {
    let h = Harness::new(config(), MockRegistrationApi::new(0, None));
    let target = target();
    let labels = labels();
    let registration = Registration {
        target: &target,
        device_id: DEVICE_ID,
        model_id: MODEL_ID,
        labels: &labels,
    };
    let cancel = CancellationToken::new();

    let first = h.engine.provisioner.provision_cached(registration, &cancel).await.unwrap();
    let second = h.engine.provisioner.provision_cached(registration, &cancel).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.registration.registers.load(Ordering::SeqCst), 1);
    let stored = h.stores.get_target_device(TARGET_ID, DEVICE_ID).await.unwrap();
    assert_eq!(stored.map(|d| d.connection_string), Some(first));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_polling() {
    let h = Harness::new(config(), MockRegistrationApi::new(1_000, Some(Duration::from_secs(10))));
    let target = target();
    let labels = labels();
    let registration = Registration {
        target: &target,
        device_id: DEVICE_ID,
        model_id: MODEL_ID,
        labels: &labels,
    };
    let cancel = CancellationToken::new();

    let started = Instant::now();
    let (result, _) = tokio::join!(
        h.engine.provisioner.provision(registration, &cancel),
        async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        }
    );

    assert_eq!(result, Err(ProvisionError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(h.registration.polls.load(Ordering::SeqCst), 1);
    assert_eq!(h.metrics.count("provision_failure:timeout"), 0);
    assert_eq!(h.metrics.count("provision_success"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_registration_times_out_after_max_attempts() {
    let config = SimulationConfig {
        max_registration_attempts: 3,
        ..config()
    };
    let h = Harness::new(config, MockRegistrationApi::new(1_000, None));
    let target = target();
    let labels = labels();
    let registration = Registration {
        target: &target,
        device_id: DEVICE_ID,
        model_id: MODEL_ID,
        labels: &labels,
    };

    let result = h
        .engine
        .provisioner
        .provision(registration, &CancellationToken::new())
        .await;

    assert_eq!(result, Err(ProvisionError::RegistrationTimeout { attempts: 3 }));
    assert_eq!(h.registration.polls.load(Ordering::SeqCst), 3);
    assert_eq!(h.metrics.count("provision_failure:timeout"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_throttled_submit_is_retried() {
    let registration_api = MockRegistrationApi::new(0, None);
    registration_api
        .register_failures
        .lock()
        .unwrap()
        .extend([429, 429]);
    let h = Harness::new(config(), registration_api);
    let target = target();
    let labels = labels();
    let registration = Registration {
        target: &target,
        device_id: DEVICE_ID,
        model_id: MODEL_ID,
        labels: &labels,
    };

    h.engine
        .provisioner
        .provision(registration, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.registration.registers.load(Ordering::SeqCst), 3);
    assert_eq!(h.metrics.count("provision_success"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_submit_is_not_retried() {
    let registration_api = MockRegistrationApi::new(0, None);
    registration_api.register_failures.lock().unwrap().push_back(401);
    let h = Harness::new(config(), registration_api);
    let target = target();
    let labels = labels();
    let registration = Registration {
        target: &target,
        device_id: DEVICE_ID,
        model_id: MODEL_ID,
        labels: &labels,
    };

    let result = h
        .engine
        .provisioner
        .provision_cached(registration, &CancellationToken::new())
        .await;

    assert!(result.is_err());
    assert_eq!(h.registration.registers.load(Ordering::SeqCst), 1);
    assert_eq!(h.metrics.count("provision_failure:not authorized"), 1);
    let stored = h.stores.get_target_device(TARGET_ID, DEVICE_ID).await.unwrap();
    assert!(stored.is_none());
}
