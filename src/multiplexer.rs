use std::net::SocketAddr;

use ahash::RandomState;
use color_eyre::eyre::Context;
use dashmap::DashMap;
use metrics::counter;
use russh::{Channel, server::Msg};
use tokio::{
    io::copy_bidirectional_with_sizes,
    net::{TcpListener, TcpStream},
};

use crate::{
    droppable_handle::DroppableHandle,
    error::ServerError,
    sessions::SessionId,
    telemetry::{TELEMETRY_COUNTER_TUNNELS_TOTAL, TELEMETRY_KEY_KIND},
};

/// Buffer size used when copying between tunnel channels and sockets.
pub const DEFAULT_BUFFER_SIZE: usize = 32_768;

/// A `direct-tcpip` channel that has been authorized for its destination.
pub struct ForwardTunnel {
    pub session_id: SessionId,
    pub peer: SocketAddr,
    pub host: String,
    pub port: u16,
    pub channel: Channel<Msg>,
}

/// A remote forwarding request that has been authorized for its bind address.
pub struct ReverseRequest {
    pub session_id: SessionId,
    pub peer: SocketAddr,
    pub address: String,
    pub port: u16,
    // Handle used to open `forwarded-tcpip` channels back to the client.
    pub handle: russh::server::Handle,
}

/// The engine moving bytes for authenticated tunnels.
///
/// The SSH front door only decides whether a tunnel may be opened; everything after that
/// is handed to an implementation of this trait.
pub trait TunnelMultiplexer: Send + Sync {
    /// Start piping a forward tunnel to its destination.
    fn open_forward(&self, tunnel: ForwardTunnel) -> color_eyre::Result<()>;

    /// Start serving SOCKS5 over a tunnel channel.
    fn open_socks(&self, tunnel: ForwardTunnel) -> color_eyre::Result<()>;

    /// Start listening for a reverse tunnel, returning the port that was bound.
    fn open_reverse(&self, request: ReverseRequest) -> color_eyre::Result<u16>;

    /// Stop listening for a reverse tunnel. Returns whether it existed.
    fn close_reverse(&self, session_id: &SessionId, address: &str, port: u16) -> bool;

    /// Release everything held on behalf of a session.
    fn close_session(&self, session_id: &SessionId);
}

// Key identifying a reverse listener.
type ListenerKey = (SessionId, String, u16);

// Multiplexer piping tunnels to plain TCP sockets.
#[derive(Debug)]
pub struct TcpForwarder {
    // Buffer size for bidirectional copying.
    buffer_size: usize,
    // Accept loops for reverse tunnels.
    listeners: DashMap<ListenerKey, DroppableHandle<()>, RandomState>,
}

impl Default for TcpForwarder {
    fn default() -> Self {
        TcpForwarder::new(DEFAULT_BUFFER_SIZE)
    }
}

impl TcpForwarder {
    pub fn new(buffer_size: usize) -> Self {
        TcpForwarder {
            buffer_size,
            listeners: DashMap::default(),
        }
    }
}

impl TunnelMultiplexer for TcpForwarder {
    fn open_forward(&self, tunnel: ForwardTunnel) -> color_eyre::Result<()> {
        let ForwardTunnel {
            session_id,
            peer,
            host,
            port,
            channel,
        } = tunnel;
        let buffer_size = self.buffer_size;
        counter!(TELEMETRY_COUNTER_TUNNELS_TOTAL, TELEMETRY_KEY_KIND => "forward").increment(1);
        tokio::spawn(async move {
            let mut stream = match TcpStream::connect((host.as_str(), port)).await {
                Ok(stream) => stream,
                Err(error) => {
                    #[cfg(not(coverage_nightly))]
                    tracing::warn!(%peer, session = %session_id, %host, port, %error, "Unable to reach tunnel destination.");
                    let _ = channel.close().await;
                    return;
                }
            };
            if let Err(error) = stream.set_nodelay(true) {
                #[cfg(not(coverage_nightly))]
                tracing::warn!(%peer, %error, "Error setting nodelay.");
            }
            #[cfg(not(coverage_nightly))]
            tracing::debug!(%peer, session = %session_id, %host, port, "Forward tunnel opened.");
            let mut channel = channel.into_stream();
            let _ =
                copy_bidirectional_with_sizes(&mut stream, &mut channel, buffer_size, buffer_size)
                    .await;
            #[cfg(not(coverage_nightly))]
            tracing::debug!(%peer, session = %session_id, %host, port, "Forward tunnel closed.");
        });
        Ok(())
    }

    fn open_socks(&self, _tunnel: ForwardTunnel) -> color_eyre::Result<()> {
        Err(ServerError::SocksUnavailable.into())
    }

    fn open_reverse(&self, request: ReverseRequest) -> color_eyre::Result<u16> {
        let ReverseRequest {
            session_id,
            peer,
            address,
            port,
            handle,
        } = request;
        let key = (session_id.clone(), address.clone(), port);
        if self.listeners.contains_key(&key) {
            return Ok(port);
        }
        let bind_address = match address.as_str() {
            "" | "localhost" => "127.0.0.1",
            "*" => "0.0.0.0",
            address => address,
        };
        let listener = std::net::TcpListener::bind((bind_address, port))
            .with_context(|| format!("Error binding {bind_address}:{port}"))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let bound_port = listener
            .local_addr()
            .with_context(|| "Missing local address when binding port")?
            .port();
        counter!(TELEMETRY_COUNTER_TUNNELS_TOTAL, TELEMETRY_KEY_KIND => "reverse").increment(1);
        #[cfg(not(coverage_nightly))]
        tracing::info!(%peer, session = %session_id, %address, port = bound_port, "Reverse tunnel listening.");
        let buffer_size = self.buffer_size;
        let forwarded_address = address.clone();
        let join_handle = DroppableHandle(tokio::spawn(async move {
            loop {
                let (mut stream, originator) = match listener.accept().await {
                    Ok(connection) => connection,
                    Err(error) => {
                        #[cfg(not(coverage_nightly))]
                        tracing::error!(%peer, %error, "Unable to accept reverse tunnel connection.");
                        break;
                    }
                };
                if let Err(error) = stream.set_nodelay(true) {
                    #[cfg(not(coverage_nightly))]
                    tracing::warn!(%originator, %error, "Error setting nodelay.");
                }
                let handle = handle.clone();
                let forwarded_address = forwarded_address.clone();
                tokio::spawn(async move {
                    let channel = match handle
                        .channel_open_forwarded_tcpip(
                            forwarded_address,
                            bound_port.into(),
                            originator.ip().to_canonical().to_string(),
                            originator.port().into(),
                        )
                        .await
                    {
                        Ok(channel) => channel,
                        Err(error) => {
                            #[cfg(not(coverage_nightly))]
                            tracing::warn!(%peer, %originator, %error, "Unable to open forwarded channel.");
                            return;
                        }
                    };
                    let mut channel = channel.into_stream();
                    let _ = copy_bidirectional_with_sizes(
                        &mut stream,
                        &mut channel,
                        buffer_size,
                        buffer_size,
                    )
                    .await;
                });
            }
        }));
        // Requests for port 0 are stored under the port that was actually bound.
        self.listeners
            .insert((session_id, address, bound_port), join_handle);
        Ok(bound_port)
    }

    fn close_reverse(&self, session_id: &SessionId, address: &str, port: u16) -> bool {
        self.listeners
            .remove(&(session_id.clone(), address.to_string(), port))
            .is_some()
    }

    fn close_session(&self, session_id: &SessionId) {
        self.listeners.retain(|(id, _, _), _| id != session_id);
    }
}
