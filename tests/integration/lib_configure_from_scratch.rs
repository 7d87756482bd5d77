use std::time::Duration;

use clap::Parser;
use http::StatusCode;
use portcullis::{ApplicationConfig, ServerError, entrypoint};
use tokio::{fs, time::sleep};

use crate::common::{PortcullisHandle, connect_tunnel, http_get, wait_for_port};

/// This test ensures that the entrypoint runs from command-line flags,
/// picking up users from the auth file as it changes.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn lib_configure_from_scratch() {
    // 1. Write the auth file
    let directory = tempfile::tempdir().unwrap();
    let authfile = directory.path().join("users.json");
    fs::write(&authfile, r#"{"bob:hunter2": [""]}"#)
        .await
        .unwrap();

    // 2. Initialize portcullis
    let config = ApplicationConfig::parse_from([
        "portcullis",
        "--host=127.0.0.1",
        "--port=18380",
        "--key=configure from scratch",
        "--keepalive=5s",
        "--authfile",
        authfile.to_str().unwrap(),
    ]);
    let _portcullis_handle = PortcullisHandle(tokio::spawn(async move { entrypoint(config).await }));
    wait_for_port("127.0.0.1:18380").await;
    let address = "127.0.0.1:18380".parse().unwrap();
    let (status, _) = http_get(address, "/health", "gateway.tld").await;
    assert_eq!(status, StatusCode::OK);

    // 3. Users from the auth file can authenticate
    let fingerprint = portcullis::ServerIdentity::derive("configure from scratch")
        .unwrap()
        .fingerprint()
        .to_string();
    let mut session = connect_tunnel(address, &fingerprint)
        .await
        .expect("Failed to connect to tunnel");
    assert!(
        session
            .authenticate_password("bob", "hunter2")
            .await
            .expect("SSH authentication failed")
            .success()
    );

    // 4. Changes to the auth file are picked up
    fs::write(&authfile, r#"{"carol:pw": [""]}"#).await.unwrap();
    let mut reloaded = false;
    for _ in 0..50 {
        sleep(Duration::from_millis(200)).await;
        let mut session = connect_tunnel(address, &fingerprint)
            .await
            .expect("Failed to connect to tunnel");
        if session
            .authenticate_password("carol", "pw")
            .await
            .expect("SSH authentication failed")
            .success()
        {
            reloaded = true;
            break;
        }
    }
    assert!(reloaded, "auth file should have been reloaded");
}

/// This test ensures that an invalid fallback target aborts startup.
#[test_log::test(tokio::test)]
async fn lib_rejects_invalid_backend() {
    let config = ApplicationConfig::parse_from([
        "portcullis",
        "--host=127.0.0.1",
        "--port=18381",
        "--backend=http:///no-host",
    ]);
    let error = entrypoint(config)
        .await
        .expect_err("startup should fail");
    assert!(matches!(
        error.downcast_ref::<ServerError>(),
        Some(ServerError::InvalidProxyTarget(_))
    ));
}
