use std::{error::Error, fmt::Debug, net::SocketAddr, str::FromStr, sync::Arc};

use axum::{body::Body as AxumBody, response::IntoResponse};
use http::{
    HeaderMap, HeaderName, HeaderValue, Uri, Version,
    header::{
        CONNECTION, HOST, InvalidHeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
        TRAILER, TRANSFER_ENCODING, ToStrError, UPGRADE,
    },
    uri::{InvalidUri, Scheme},
};
use hyper::{Request, Response, StatusCode, body::Body};
use hyper_util::rt::TokioIo;
use metrics::counter;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncWrite, copy_bidirectional_with_sizes},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;

use crate::{
    error::ServerError,
    multiplexer::DEFAULT_BUFFER_SIZE,
    telemetry::{TELEMETRY_COUNTER_FALLBACK_REQUESTS_TOTAL, TELEMETRY_KEY_OUTCOME},
};

const X_FORWARDED_FOR: &str = "X-Forwarded-For";
const X_FORWARDED_HOST: &str = "X-Forwarded-Host";
const X_FORWARDED_PROTO: &str = "X-Forwarded-Proto";
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

#[derive(thiserror::Error, Debug)]
pub(crate) enum HttpError {
    #[error("Hyper error: {0}")]
    HyperError(#[from] hyper::Error),
    #[error("Unable to reach fallback target: {0}")]
    BackendUnreachable(#[from] std::io::Error),
    #[error("Header to string error: {0}")]
    HeaderToStrError(#[from] ToStrError),
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] InvalidHeaderValue),
    #[error("Invalid request URI: {0}")]
    InvalidUri(#[from] InvalidUri),
    #[error("Missing Upgrade header")]
    MissingUpgradeHeader,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        #[cfg(not(coverage_nightly))]
        tracing::debug!(error = %self, "Fallback proxy error.");
        match self {
            HttpError::HeaderToStrError(_)
            | HttpError::InvalidHeaderValue(_)
            | HttpError::InvalidUri(_)
            | HttpError::MissingUpgradeHeader => StatusCode::BAD_REQUEST,
            HttpError::HyperError(_) | HttpError::BackendUnreachable(_) => StatusCode::BAD_GATEWAY,
        }
        .into_response()
    }
}

/// Reverse proxy for ordinary HTTP traffic that isn't a tunnel attempt.
pub struct FallbackProxy {
    target: Uri,
    scheme: Scheme,
    host: String,
    port: u16,
    tls: Option<TlsConnector>,
    buffer_size: usize,
}

impl Debug for FallbackProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackProxy")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl FallbackProxy {
    /// Parse the fallback target.
    ///
    /// A target without a scheme defaults to `http://`. Targets without a host are rejected.
    pub fn new(target: &str) -> Result<Self, ServerError> {
        let invalid = || ServerError::InvalidProxyTarget(target.into());
        let url = if target.contains("://") {
            target.to_string()
        } else {
            format!("http://{target}")
        };
        let uri = Uri::from_str(&url).map_err(|_| invalid())?;
        let host = uri
            .host()
            .filter(|host| !host.is_empty())
            .ok_or_else(invalid)?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let scheme = uri.scheme().cloned().ok_or_else(invalid)?;
        let (port, tls) = if scheme == Scheme::HTTP {
            (uri.port_u16().unwrap_or(80), None)
        } else if scheme == Scheme::HTTPS {
            (uri.port_u16().unwrap_or(443), Some(tls_connector()?))
        } else {
            return Err(invalid());
        };
        Ok(FallbackProxy {
            target: uri,
            scheme,
            host,
            port,
            tls,
            buffer_size: DEFAULT_BUFFER_SIZE,
        })
    }

    pub fn target(&self) -> &Uri {
        &self.target
    }

    // Rewrite an inbound request so that it's addressed to the target, in origin form.
    fn rewrite<B>(
        &self,
        request: &mut Request<B>,
        peer: SocketAddr,
        proto: &'static str,
    ) -> Result<(), HttpError> {
        let original_host = request
            .headers()
            .get(HOST)
            .map(|host| host.to_str())
            .transpose()?
            .map(String::from)
            .or_else(|| request.uri().authority().map(|authority| authority.to_string()));
        let path = request
            .uri()
            .path_and_query()
            .map(|path| path.as_str())
            .unwrap_or("/")
            .to_string();
        let headers = request.headers_mut();
        strip_hop_by_hop(headers);
        let forwarded_for = match headers.get(X_FORWARDED_FOR) {
            Some(previous) => format!("{}, {}", previous.to_str()?, peer.ip().to_canonical()),
            None => peer.ip().to_canonical().to_string(),
        };
        headers.insert(X_FORWARDED_FOR, forwarded_for.try_into()?);
        if let Some(original_host) = original_host {
            headers.insert(X_FORWARDED_HOST, original_host.try_into()?);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
        if let Some(authority) = self.target.authority() {
            headers.insert(HOST, authority.as_str().try_into()?);
        }
        *request.uri_mut() = Uri::from_str(&path)?;
        *request.version_mut() = Version::HTTP_11;
        Ok(())
    }

    /// Relay a request to the fallback target, returning its response.
    #[cfg_attr(
        not(coverage_nightly),
        tracing::instrument(skip(self, request), fields(backend = %self.target), level = "debug")
    )]
    pub async fn proxy<B>(
        &self,
        request: Request<B>,
        peer: SocketAddr,
        proto: &'static str,
    ) -> Response<AxumBody>
    where
        B: Body + Debug + Send + Unpin + 'static,
        <B as Body>::Data: Send + Sync + 'static,
        <B as Body>::Error: Error + Send + Sync + 'static,
    {
        match self.proxy_inner(request, peer, proto).await {
            Ok(response) => {
                counter!(TELEMETRY_COUNTER_FALLBACK_REQUESTS_TOTAL, TELEMETRY_KEY_OUTCOME => "proxied")
                    .increment(1);
                response
            }
            Err(error) => {
                counter!(TELEMETRY_COUNTER_FALLBACK_REQUESTS_TOTAL, TELEMETRY_KEY_OUTCOME => "error")
                    .increment(1);
                error.into_response()
            }
        }
    }

    async fn proxy_inner<B>(
        &self,
        mut request: Request<B>,
        peer: SocketAddr,
        proto: &'static str,
    ) -> Result<Response<AxumBody>, HttpError>
    where
        B: Body + Debug + Send + Unpin + 'static,
        <B as Body>::Data: Send + Sync + 'static,
        <B as Body>::Error: Error + Send + Sync + 'static,
    {
        self.rewrite(&mut request, peer, proto)?;
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        if let Err(error) = stream.set_nodelay(true) {
            #[cfg(not(coverage_nightly))]
            tracing::warn!(%error, "Error setting nodelay.");
        }
        match self.tls {
            Some(ref connector) => {
                let server_name = ServerName::try_from(self.host.clone())
                    .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidInput, error))?;
                let stream = connector.connect(server_name, stream).await?;
                send_request(stream, request, self.buffer_size).await
            }
            None => send_request(stream, request, self.buffer_size).await,
        }
    }

    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }
}

// Send the request over a fresh HTTP/1.1 connection, piping the connection if it's upgraded.
async fn send_request<IO, B>(
    io: IO,
    mut request: Request<B>,
    buffer_size: usize,
) -> Result<Response<AxumBody>, HttpError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: Body + Debug + Send + Unpin + 'static,
    <B as Body>::Data: Send + Sync + 'static,
    <B as Body>::Error: Error + Send + Sync + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    let Some(request_upgrade) = request.headers().get(UPGRADE) else {
        tokio::spawn(async move {
            if let Err(error) = conn.await {
                #[cfg(not(coverage_nightly))]
                tracing::warn!(%error, "Fallback connection failed.");
            }
        });
        return Ok(sender.send_request(request).await?.into_response());
    };
    let request_type = request_upgrade.to_str()?.to_string();
    tokio::spawn(async move {
        if let Err(error) = conn.with_upgrades().await {
            #[cfg(not(coverage_nightly))]
            tracing::warn!(%error, "Fallback connection with upgrades failed.");
        }
    });
    let upgraded_request = hyper::upgrade::on(&mut request);
    let mut response = sender.send_request(request).await?;
    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        let response_type = response
            .headers()
            .get(UPGRADE)
            .ok_or(HttpError::MissingUpgradeHeader)?
            .to_str()?;
        if response_type.eq_ignore_ascii_case(&request_type) {
            let upgraded_response = hyper::upgrade::on(&mut response).await?;
            tokio::spawn(async move {
                let upgraded_request = match upgraded_request.await {
                    Ok(upgraded) => upgraded,
                    Err(error) => {
                        #[cfg(not(coverage_nightly))]
                        tracing::warn!(%error, "Client upgrade failed.");
                        return;
                    }
                };
                let mut upgraded_request = TokioIo::new(upgraded_request);
                let mut upgraded_response = TokioIo::new(upgraded_response);
                let _ = copy_bidirectional_with_sizes(
                    &mut upgraded_response,
                    &mut upgraded_request,
                    buffer_size,
                    buffer_size,
                )
                .await;
            });
        }
    }
    Ok(response.into_response())
}

fn tls_connector() -> Result<TlsConnector, ServerError> {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let mut config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|error| ServerError::TlsConfig(error.to_string()))?
            .with_root_certificates(root_store)
            .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsConnector::from(Arc::new(config)))
}

// Remove hop-by-hop headers. Upgrade requests keep `Connection` and `Upgrade`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let is_upgrade = headers.contains_key(UPGRADE);
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty() && !(is_upgrade && name == "upgrade"))
        .collect();
    for name in named {
        headers.remove(name.as_str());
    }
    for name in [
        KEEP_ALIVE,
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
    ] {
        headers.remove(name);
    }
    if !is_upgrade {
        headers.remove(CONNECTION);
    }
}
