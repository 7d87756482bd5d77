use http::StatusCode;
use portcullis::VERSION;

use crate::common::{http_get, start_server};

/// This test ensures that ordinary requests are answered by the built-in routes
/// when no fallback is configured.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn router_builtin_routes() {
    // 1. Initialize portcullis
    let (server, address) = start_server(&[]).await;

    // 2. Query the built-in routes
    let (status, body) = http_get(address, "/health", "gateway.tld").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK\n");
    let (status, body) = http_get(address, "/version", "gateway.tld").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, VERSION);

    // 3. Everything else is not found
    let (status, body) = http_get(address, "/some/page", "gateway.tld").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "Not found");
    server.close();
}
