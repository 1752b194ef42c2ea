//! Mesh requests over mTLS

use serde_json::{json, Value};

use trellis_worker::Worker;

use super::helpers::{fast_options, mesh_url, Fixture, CALLER_TOKEN};

/// Scenario D over the wire, plus a successful call
#[tokio::test]
async fn story_process_over_mtls() {
    let fixture = Fixture::start().await;
    let running = Worker::with_options(fixture.worker_config("m"), fast_options())
        .start()
        .await
        .unwrap();
    let client = fixture.mesh_client();
    let url = mesh_url(running.local_addr(), "/v1/process");

    let unsupported: Value = client
        .post(&url)
        .bearer_auth(CALLER_TOKEN)
        .json(&json!({
            "job_id": "job-1",
            "service_type": "classifier",
            "operation": "convert",
            "input_data": {}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(unsupported["success"], false);
    assert_eq!(unsupported["error"], "UnsupportedOperation");
    assert!(unsupported["receipt_id"].as_str().is_some_and(|id| !id.is_empty()));

    let classified: Value = client
        .post(&url)
        .bearer_auth(CALLER_TOKEN)
        .json(&json!({
            "job_id": "job-2",
            "service_type": "classifier",
            "operation": "classify",
            "input_data": {"text": "Receipt: paid in full"}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(classified["success"], true);
    assert_eq!(classified["result"]["label"], "receipt");
    assert_ne!(classified["receipt_id"], unsupported["receipt_id"]);

    let denied = client
        .post(&url)
        .json(&json!({"job_id": "job-3", "service_type": "classifier", "operation": "classify"}))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);

    running.shutdown().await;
    fixture.authority.shutdown().await;
}

/// Without a mesh client certificate the handshake fails
#[tokio::test]
async fn mesh_listener_requires_client_certificate() {
    let fixture = Fixture::start().await;
    let running = Worker::with_options(fixture.worker_config("n"), fast_options())
        .start()
        .await
        .unwrap();

    let anonymous = reqwest::Client::builder()
        .use_rustls_tls()
        .tls_built_in_root_certs(false)
        .add_root_certificate(
            reqwest::Certificate::from_pem(fixture.state().ca_cert_pem().as_bytes()).unwrap(),
        )
        .build()
        .unwrap();
    let result = anonymous
        .get(mesh_url(running.local_addr(), "/v1/capabilities"))
        .send()
        .await;
    assert!(result.is_err());

    running.shutdown().await;
    fixture.authority.shutdown().await;
}
