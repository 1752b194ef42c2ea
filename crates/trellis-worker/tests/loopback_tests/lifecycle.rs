//! Lifecycle stories against the live platform registry

use std::sync::Arc;
use std::time::Duration;

use zeroize::Zeroizing;

use trellis_common::protocol::WorkerStatus;
use trellis_worker::{ControllerClient, ControllerClientConfig, HttpControllerClient, StopReason, Worker, WorkerPhase};

use super::helpers::{fast_options, mesh_url, wait_for_phase, Fixture};

/// Scenario C: heartbeats time out three times, the worker degrades and keeps serving
#[tokio::test]
async fn story_heartbeat_timeouts_degrade_but_keep_serving() {
    let fixture = Fixture::start().await;
    let mut config = fixture.worker_config("c");
    config.heartbeat_interval = Duration::from_millis(150);
    let worker_id = config.worker_id();

    let running = Worker::with_options(config, fast_options())
        .start()
        .await
        .unwrap();
    assert_eq!(running.lifecycle().phase(), WorkerPhase::Healthy);

    fixture.state().set_heartbeat_delay(Duration::from_secs(2));
    wait_for_phase(
        running.lifecycle().subscribe(),
        WorkerPhase::Degraded,
        Duration::from_secs(10),
    )
    .await;
    assert!(running.lifecycle().consecutive_failures() >= 3);

    let response = fixture
        .mesh_client()
        .get(mesh_url(running.local_addr(), "/v1/capabilities"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let ready = reqwest::get(format!("http://{}/health/ready", running.health_addr()))
        .await
        .unwrap();
    assert_eq!(ready.status(), reqwest::StatusCode::OK);

    fixture.state().set_heartbeat_delay(Duration::ZERO);
    running.shutdown().await;
    assert_eq!(
        fixture.state().worker(&worker_id).map(|w| w.status),
        Some(WorkerStatus::Deregistered)
    );
    fixture.authority.shutdown().await;
}

/// Deregistering twice is acknowledged both times
#[tokio::test]
async fn deregister_is_idempotent() {
    let fixture = Fixture::start().await;
    let config = fixture.worker_config("d");
    let worker_id = config.worker_id();

    let running = Worker::with_options(config, fast_options())
        .start()
        .await
        .unwrap();

    let mut client_config =
        ControllerClientConfig::new(fixture.authority.url(), Zeroizing::new(fixture.token.clone()));
    client_config.authority_ca_pem = Some(fixture.state().ca_cert_pem().to_string());
    let client = HttpControllerClient::new(client_config, running.store().clone()).unwrap();

    let first = client.deregister(&worker_id).await.unwrap();
    let second = client.deregister(&worker_id).await.unwrap();
    assert_eq!(first.worker_id, worker_id);
    assert_eq!(second.worker_id, worker_id);

    let lifecycle = Arc::clone(running.lifecycle());
    lifecycle.deregister().await;
    lifecycle.deregister().await;
    assert_eq!(lifecycle.phase(), WorkerPhase::Stopped);

    running.shutdown().await;
    fixture.authority.shutdown().await;
}

/// The platform tells the worker to leave through the heartbeat reply
#[tokio::test]
async fn story_platform_instructs_deregistration() {
    let fixture = Fixture::start().await;
    let mut config = fixture.worker_config("e");
    config.heartbeat_interval = Duration::from_millis(100);
    let worker_id = config.worker_id();

    let running = Worker::with_options(config, fast_options())
        .start()
        .await
        .unwrap();
    let lifecycle = Arc::clone(running.lifecycle());

    fixture.state().instruct_deregister(&worker_id);
    let reason = tokio::time::timeout(Duration::from_secs(10), running.wait())
        .await
        .unwrap();

    assert_eq!(reason, StopReason::PlatformInstruction);
    assert_eq!(lifecycle.phase(), WorkerPhase::Stopped);
    assert_eq!(
        fixture.state().worker(&worker_id).map(|w| w.status),
        Some(WorkerStatus::Deregistered)
    );
    fixture.authority.shutdown().await;
}

/// Registry calls without the worker's own certificate leave the record alone
#[tokio::test]
async fn story_registry_refuses_callers_without_the_workers_certificate() {
    let fixture = Fixture::start().await;
    let config = fixture.worker_config("p");
    let worker_id = config.worker_id();

    let running = Worker::with_options(config, fast_options())
        .start()
        .await
        .unwrap();
    let worker_url = format!("{}/v1/workers/{}", fixture.authority.url(), worker_id);

    let anonymous = reqwest::Client::builder()
        .use_rustls_tls()
        .tls_built_in_root_certs(false)
        .add_root_certificate(
            reqwest::Certificate::from_pem(fixture.state().ca_cert_pem().as_bytes()).unwrap(),
        )
        .build()
        .unwrap();
    let response = anonymous.delete(&worker_url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    let listed = anonymous
        .get(format!("{}/v1/workers", fixture.authority.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(listed.status(), reqwest::StatusCode::UNAUTHORIZED);

    // A valid certificate for another service is not enough
    let response = fixture.mesh_client().delete(&worker_url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

    let status = fixture.state().worker(&worker_id).map(|w| w.status);
    assert!(status.is_some());
    assert_ne!(status, Some(WorkerStatus::Deregistered));
    assert_eq!(running.lifecycle().phase(), WorkerPhase::Healthy);

    running.shutdown().await;
    assert_eq!(
        fixture.state().worker(&worker_id).map(|w| w.status),
        Some(WorkerStatus::Deregistered)
    );
    fixture.authority.shutdown().await;
}
