use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use clap::Parser;
use http::{Request, StatusCode, header::HOST};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use portcullis::{ApplicationConfig, GatewayServer, PROTOCOL_VERSION, WebSocketIo, fingerprint};
use russh::{
    Channel,
    client::{self, Handle, Msg, Session},
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    client_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderValue, header::SEC_WEBSOCKET_PROTOCOL},
    },
};

pub(crate) struct PortcullisHandle(pub(crate) tokio::task::JoinHandle<color_eyre::Result<()>>);

impl Drop for PortcullisHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) fn config(args: &[&str]) -> ApplicationConfig {
    let mut argv = vec!["portcullis", "--key=integration tests"];
    argv.extend_from_slice(args);
    ApplicationConfig::parse_from(argv)
}

// Start a gateway on a random loopback port.
pub(crate) async fn start_server(args: &[&str]) -> (GatewayServer, SocketAddr) {
    let server = GatewayServer::new(config(args))
        .await
        .expect("Failed to build server");
    let address = server
        .start("127.0.0.1", 0)
        .await
        .expect("Failed to start server");
    (server, address)
}

pub(crate) async fn wait_for_port(address: &str) {
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect(address).await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for portcullis to start.")
    };
}

// Send a plain GET request, returning the status and body.
pub(crate) async fn http_get(address: SocketAddr, path: &str, host: &str) -> (StatusCode, String) {
    let stream = TcpStream::connect(address)
        .await
        .expect("TCP connection failed");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .expect("HTTP handshake failed");
    tokio::spawn(async move {
        let _ = conn.await;
    });
    let request = Request::builder()
        .method("GET")
        .uri(path)
        .header(HOST, host)
        .body(Empty::<Bytes>::new())
        .expect("Invalid request");
    let response = sender
        .send_request(request)
        .await
        .expect("Error sending HTTP request");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("Error collecting response")
        .to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

// TCP server that writes back everything it reads.
pub(crate) async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let address = listener.local_addr().expect("Missing echo server address");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    address
}

// A port that nothing is listening on right now.
pub(crate) fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .expect("Failed to find a free port")
        .port()
}

pub(crate) struct TunnelClient {
    // Fingerprint the server key must match.
    pub(crate) fingerprint: String,
}

impl client::Handler for TunnelClient {
    type Error = color_eyre::eyre::Error;

    async fn check_server_key(
        &mut self,
        key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(fingerprint(key) == self.fingerprint)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tokio::spawn(async move {
            let mut stream = channel.into_stream();
            stream.write_all(b"Hello, world!").await.unwrap();
            stream.shutdown().await.unwrap();
        });
        Ok(())
    }
}

// Open an SSH session over a tunnel upgrade, without authenticating yet.
pub(crate) async fn connect_tunnel(
    address: SocketAddr,
    fingerprint: &str,
) -> color_eyre::Result<Handle<TunnelClient>> {
    let stream = TcpStream::connect(address).await?;
    let mut request = format!("ws://{address}/").into_client_request()?;
    request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(PROTOCOL_VERSION),
    );
    let (websocket, _) = client_async(request, stream).await?;
    let client = TunnelClient {
        fingerprint: fingerprint.to_string(),
    };
    let session = client::connect_stream(
        Arc::new(client::Config::default()),
        WebSocketIo::new(websocket),
        client,
    )
    .await?;
    Ok(session)
}
