//! Startup stories

use std::time::Duration;

use trellis_common::protocol::WorkerStatus;
use trellis_common::AcquisitionStep;
use trellis_worker::{Worker, WorkerPhase};

use super::helpers::{config_for, fast_options, install_crypto_provider, unused_addr, Fixture};

/// Scenario A: reachable authority, certificate, listener, registration, Healthy
#[tokio::test]
async fn story_worker_joins_the_mesh() {
    let fixture = Fixture::start().await;
    let mut config = fixture.worker_config("a");
    config.heartbeat_interval = Duration::from_millis(100);
    let worker_id = config.worker_id();

    let running = Worker::with_options(config, fast_options())
        .start()
        .await
        .unwrap();

    assert_eq!(running.lifecycle().phase(), WorkerPhase::Healthy);
    assert_eq!(fixture.state().certificates_issued(), 1);

    let installed = running.store().current().unwrap();
    assert_eq!(installed.bundle().subject_identity(), "classifier");

    let record = fixture.state().worker(&worker_id).unwrap();
    assert_eq!(record.service_type, "classifier");
    assert_eq!(record.capabilities[0].operation, "classify");

    // Registration reports Starting; the first heartbeat reports Healthy
    tokio::time::timeout(Duration::from_secs(5), async {
        while fixture.state().worker(&worker_id).map(|w| w.status) != Some(WorkerStatus::Healthy) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let ready = reqwest::get(format!(
        "http://{}/health/ready",
        running.health_addr()
    ))
    .await
    .unwrap();
    assert_eq!(ready.status(), reqwest::StatusCode::OK);

    running.shutdown().await;
    assert_eq!(
        fixture.state().worker(&worker_id).map(|w| w.status),
        Some(WorkerStatus::Deregistered)
    );
    fixture.authority.shutdown().await;
}

/// Scenario B: unreachable authority fails at submission, nothing listens
#[tokio::test]
async fn story_unreachable_authority_is_fatal() {
    install_crypto_provider();
    let authority = unused_addr();
    let listen = unused_addr();

    let mut config = config_for(
        &format!("https://localhost:{}", authority.port()),
        "some-token",
        None,
        "b",
    );
    config.listen_addr = listen;

    let err = Worker::with_options(config, fast_options())
        .start()
        .await
        .unwrap_err();

    assert_eq!(err.acquisition_step(), Some(AcquisitionStep::Submission));
    assert!(tokio::net::TcpStream::connect(listen).await.is_err());
}

/// A token bound to another service is rejected, not retried
#[tokio::test]
async fn story_wrong_bootstrap_token_is_rejected() {
    let fixture = Fixture::start().await;
    let other = fixture.state().issue_token("ocr").unwrap().to_string();

    let mut config = fixture.worker_config("c");
    config.bootstrap_token = other.into();

    let started = tokio::time::Instant::now();
    let err = Worker::with_options(config, fast_options())
        .start()
        .await
        .unwrap_err();

    assert_eq!(err.acquisition_step(), Some(AcquisitionStep::Rejected));
    assert!(err.to_string().contains("identity_conflict"));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(fixture.state().certificates_issued(), 0);
    fixture.authority.shutdown().await;
}

/// A service type the binary does not serve is a configuration error
#[tokio::test]
async fn unknown_service_type_fails_before_network() {
    install_crypto_provider();
    let mut config = config_for("https://localhost:1", "t", None, "d");
    config.service_type = "ocr".into();

    let err = Worker::new(config).start().await.unwrap_err();
    assert!(matches!(err, trellis_common::Error::Config { .. }));
}
