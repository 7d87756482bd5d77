use std::{error::Error, fmt::Debug, net::SocketAddr, sync::Arc};

use axum::{body::Body as AxumBody, response::IntoResponse};
use bon::Builder;
use hyper::{Method, Request, Response, StatusCode, body::Body};
use hyper_util::rt::TokioIo;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use russh::server::Config;
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::protocol::{Role, WebSocketConfig},
};

use crate::{
    fallback::FallbackProxy,
    ssh::{SshContext, handle_tunnel_connection},
    telemetry::TELEMETRY_COUNTER_TUNNEL_UPGRADES_TOTAL,
    ws::{UpgradeKind, WebSocketIo, accept_response, upgrade_kind, websocket_config},
};

/// The crate version reported by `/version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Single entry point for every inbound HTTP request.
#[derive(Builder)]
pub(crate) struct ConnectionRouter {
    // Where ordinary traffic goes, if anywhere.
    pub(crate) fallback: Option<FallbackProxy>,
    // SSH settings for upgraded connections.
    pub(crate) ssh_config: Arc<Config>,
    // Shared services for tunnel sessions, carrying the SOCKS5 and reverse flags.
    pub(crate) ssh: Arc<SshContext>,
    #[builder(default = websocket_config(None))]
    pub(crate) websocket_config: WebSocketConfig,
    // Renders `/metrics` when set.
    pub(crate) metrics: Option<PrometheusHandle>,
    // Scheme that clients used to reach us.
    #[builder(default = "http")]
    pub(crate) proto: &'static str,
}

impl ConnectionRouter {
    // Dispatch a request to the tunnel handshake, the fallback proxy, or the built-in routes.
    pub(crate) async fn route<B>(&self, mut request: Request<B>, peer: SocketAddr) -> Response<AxumBody>
    where
        B: Body + Debug + Send + Unpin + 'static,
        <B as Body>::Data: Send + Sync + 'static,
        <B as Body>::Error: Error + Send + Sync + 'static,
    {
        match upgrade_kind(request.headers()) {
            UpgradeKind::Tunnel => return self.upgrade(&mut request, peer),
            UpgradeKind::Foreign => {
                #[cfg(not(coverage_nightly))]
                tracing::debug!(
                    %peer,
                    protocol = ?request.headers().get(hyper::header::SEC_WEBSOCKET_PROTOCOL),
                    "Upgrade request for another protocol, handling as ordinary traffic."
                );
            }
            UpgradeKind::None => (),
        }
        if let Some(ref fallback) = self.fallback {
            return fallback.proxy(request, peer, self.proto).await;
        }
        match (request.method(), request.uri().path()) {
            (_, "/health") => (StatusCode::OK, "OK\n").into_response(),
            (_, "/version") => (StatusCode::OK, VERSION).into_response(),
            (&Method::GET, "/metrics") => match self.metrics {
                Some(ref handle) => (StatusCode::OK, handle.render()).into_response(),
                None => not_found(),
            },
            _ => not_found(),
        }
    }

    // Accept a tunnel upgrade and start the SSH session once the connection switches protocols.
    fn upgrade<B>(&self, request: &mut Request<B>, peer: SocketAddr) -> Response<AxumBody> {
        let response = match accept_response(request.headers()) {
            Ok(response) => response,
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                tracing::debug!(%peer, %error, "Invalid tunnel upgrade request.");
                return (StatusCode::BAD_REQUEST, error.to_string()).into_response();
            }
        };
        counter!(TELEMETRY_COUNTER_TUNNEL_UPGRADES_TOTAL).increment(1);
        let on_upgrade = hyper::upgrade::on(request);
        let config = Arc::clone(&self.ssh_config);
        let context = Arc::clone(&self.ssh);
        let websocket_config = self.websocket_config;
        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(error) => {
                    #[cfg(not(coverage_nightly))]
                    tracing::warn!(%peer, %error, "Tunnel upgrade failed.");
                    return;
                }
            };
            let stream = WebSocketStream::from_raw_socket(
                TokioIo::new(upgraded),
                Role::Server,
                Some(websocket_config),
            )
            .await;
            handle_tunnel_connection(WebSocketIo::new(stream), peer, config, &context);
        });
        response
    }
}

fn not_found() -> Response<AxumBody> {
    (StatusCode::NOT_FOUND, "Not found").into_response()
}
