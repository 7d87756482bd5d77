use axum::{Router, http::HeaderMap, routing::get};
use http::StatusCode;
use tokio::net::TcpListener;

use crate::common::{http_get, start_server};

/// This test ensures that ordinary requests are proxied to the fallback,
/// with the destination host rewritten and the original one kept in X-Forwarded-Host.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn fallback_rewrite_host() {
    // 1. Start the fallback backend
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    let app = Router::new().route(
        "/api/{*rest}",
        get(|headers: HeaderMap| async move {
            let header = |name: &str| {
                headers
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            };
            format!(
                "host={};forwarded-host={};forwarded-proto={}",
                header("host"),
                header("x-forwarded-host"),
                header("x-forwarded-proto"),
            )
        }),
    );
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    // 2. Initialize portcullis in front of it
    let target = format!("--backend=http://{backend}");
    let (server, address) = start_server(&[&target]).await;

    // 3. Requests are relayed with the host rewritten
    let (status, body) = http_get(address, "/api/users?page=2", "gateway.tld").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        format!("host={backend};forwarded-host=gateway.tld;forwarded-proto=http")
    );

    // 4. Built-in routes are shadowed by the fallback
    let (status, _) = http_get(address, "/health", "gateway.tld").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    server.close();
}
