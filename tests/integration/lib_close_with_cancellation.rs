use std::time::Duration;

use tokio::{net::TcpStream, time::timeout};
use tokio_util::sync::CancellationToken;

use crate::common::{config, http_get};

/// This test ensures that a cancelled start stops accepting connections,
/// while connections already in progress keep working.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn lib_close_with_cancellation() {
    // 1. Initialize portcullis with a cancellation token
    let server = portcullis::GatewayServer::new(config(&[])).await.unwrap();
    let token = CancellationToken::new();
    let address = server
        .start_with_cancellation("127.0.0.1", 0, token.clone())
        .await
        .unwrap();
    let (status, _) = http_get(address, "/health", "gateway.tld").await;
    assert!(status.is_success());
    let in_flight = TcpStream::connect(address).await.unwrap();

    // 2. Cancel and wait for the accept loop to stop
    token.cancel();
    timeout(Duration::from_secs(5), server.wait())
        .await
        .expect("Timed out waiting for server to stop")
        .expect("Server stopped with an error");
    assert!(TcpStream::connect(address).await.is_err());
    drop(in_flight);
}
