use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use russh::{
    Channel, MethodKind, MethodSet, SshId,
    server::{Auth, Config, Handler, Msg, Session},
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    auth::{AuthenticationGate, Grant},
    error::ServerError,
    identity::ServerIdentity,
    multiplexer::{ForwardTunnel, ReverseRequest, TunnelMultiplexer},
    sessions::SessionId,
    users::User,
    ws::PROTOCOL_VERSION,
};

/// Destination host that requests a SOCKS5 tunnel instead of a plain TCP one.
pub const SOCKS_HOST: &str = "socks";

// What an authorized direct-tcpip channel should be handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ForwardKind {
    Tcp,
    Socks,
}

// Decide whether a forward tunnel to host:port may be opened.
// Without a bound user (open mode) every address is allowed.
pub(crate) fn authorize_forward(
    user: Option<&User>,
    host: &str,
    port: u16,
    socks5: bool,
) -> Result<ForwardKind, ServerError> {
    let (kind, address) = if host == SOCKS_HOST {
        if !socks5 {
            return Err(ServerError::SocksUnavailable);
        }
        (ForwardKind::Socks, SOCKS_HOST.to_string())
    } else {
        (ForwardKind::Tcp, format!("{host}:{port}"))
    };
    match user {
        Some(user) if !user.has_access(&address) => Err(ServerError::TunnelNotAllowed(address)),
        _ => Ok(kind),
    }
}

// Decide whether a reverse tunnel may listen on address:port.
pub(crate) fn authorize_reverse(
    user: Option<&User>,
    address: &str,
    port: u16,
    reverse: bool,
) -> Result<(), ServerError> {
    if !reverse {
        return Err(ServerError::ReverseDisabled);
    }
    let address = format!("R:{address}:{port}");
    match user {
        Some(user) if !user.has_access(&address) => Err(ServerError::TunnelNotAllowed(address)),
        _ => Ok(()),
    }
}

/// Build the SSH server configuration for tunnel connections.
///
/// A zero keep-alive interval disables keep-alive messages.
pub(crate) fn ssh_config(identity: &ServerIdentity, keepalive: Duration) -> Config {
    Config {
        server_id: SshId::Standard(format!("SSH-2.0-{PROTOCOL_VERSION}-server").into()),
        methods: MethodSet::from([MethodKind::None, MethodKind::Password].as_slice()),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keepalive_interval: (!keepalive.is_zero()).then_some(keepalive),
        keys: vec![identity.key().clone()],
        ..Default::default()
    }
}

// Services shared by every tunnel connection.
pub(crate) struct SshContext {
    // Password check and session bookkeeping.
    pub(crate) gate: AuthenticationGate,
    // Engine handling the tunnels once they are authorized.
    pub(crate) multiplexer: Arc<dyn TunnelMultiplexer>,
    // Whether SOCKS5 tunnels may be requested.
    pub(crate) socks5: bool,
    // Whether reverse tunnels may be requested.
    pub(crate) reverse: bool,
    // Counter for session numbers.
    next_session: AtomicU64,
}

impl SshContext {
    pub(crate) fn new(
        gate: AuthenticationGate,
        multiplexer: Arc<dyn TunnelMultiplexer>,
        socks5: bool,
        reverse: bool,
    ) -> Self {
        SshContext {
            gate,
            multiplexer,
            socks5,
            reverse,
            next_session: AtomicU64::new(1),
        }
    }

    // Create a new handler for a tunnel connection.
    pub(crate) fn new_client(self: &Arc<Self>, peer: SocketAddr) -> ServerHandler {
        let number = self.next_session.fetch_add(1, Ordering::AcqRel);
        #[cfg(not(coverage_nightly))]
        tracing::info!(%peer, session = number, "Tunnel client connected.");
        ServerHandler {
            number,
            session_id: SessionId::from(number),
            peer,
            user: None,
            grant: None,
            context: Arc::clone(self),
        }
    }
}

// Per-connection state for the SSH server.
pub(crate) struct ServerHandler {
    // Session number, for logging.
    number: u64,
    // Identifier the session is bound under.
    session_id: SessionId,
    // Address of the client.
    peer: SocketAddr,
    // The username claimed during authentication.
    user: Option<String>,
    // Set once authentication succeeds.
    grant: Option<Grant>,
    context: Arc<SshContext>,
}

impl ServerHandler {
    // The user to authorize tunnels against, or None in open mode.
    fn bound_user(&self) -> Result<Option<Arc<User>>, russh::Error> {
        match self.grant {
            Some(Grant::Open) => Ok(None),
            Some(Grant::User(_)) => match self.context.gate.sessions().get(&self.session_id) {
                Some(user) => Ok(Some(user)),
                None => Err(russh::Error::Disconnect),
            },
            None => Err(russh::Error::Disconnect),
        }
    }
}

impl Handler for ServerHandler {
    type Error = russh::Error;

    // Accept anonymous logins only when no users are registered.
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.context.gate.authentication_required() {
            return Ok(Auth::Reject {
                proceed_with_methods: Some(MethodSet::from([MethodKind::Password].as_slice())),
                partial_success: false,
            });
        }
        self.user = Some(user.into());
        self.grant = Some(Grant::Open);
        Ok(Auth::Accept)
    }

    #[cfg_attr(
        not(coverage_nightly),
        tracing::instrument(skip(self, password), fields(peer = %self.peer), level = "debug")
    )]
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.user = Some(user.into());
        match self
            .context
            .gate
            .authenticate(user, password, &self.session_id)
        {
            Ok(grant) => {
                #[cfg(not(coverage_nightly))]
                match grant {
                    Grant::Open => {
                        tracing::debug!(peer = %self.peer, session = self.number, "Tunnel client accepted in open mode.")
                    }
                    Grant::User(_) => {
                        tracing::info!(peer = %self.peer, session = self.number, %user, "Tunnel client authenticated with password.")
                    }
                }
                self.grant = Some(grant);
                Ok(Auth::Accept)
            }
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                tracing::debug!(peer = %self.peer, %error, "Failed password authentication.");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    // Handle a forward tunnel request.
    #[cfg_attr(
        not(coverage_nightly),
        tracing::instrument(skip(self, _session), fields(peer = %self.peer), level = "debug")
    )]
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // Reject invalid ports
        let Ok(port) = u16::try_from(port_to_connect) else {
            return Err(russh::Error::Disconnect);
        };
        let host = host_to_connect.trim();
        let user = self.bound_user()?;
        let kind = match authorize_forward(user.as_deref(), host, port, self.context.socks5) {
            Ok(kind) => kind,
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                tracing::info!(peer = %self.peer, user = ?self.user, %error, "Rejected forward tunnel.");
                return Ok(false);
            }
        };
        let tunnel = ForwardTunnel {
            session_id: self.session_id.clone(),
            peer: self.peer,
            host: host.into(),
            port,
            channel,
        };
        let result = match kind {
            ForwardKind::Tcp => self.context.multiplexer.open_forward(tunnel),
            ForwardKind::Socks => self.context.multiplexer.open_socks(tunnel),
        };
        match result {
            Ok(()) => Ok(true),
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                tracing::warn!(peer = %self.peer, %error, "Unable to open forward tunnel.");
                Ok(false)
            }
        }
    }

    // Handle a reverse tunnel request.
    #[cfg_attr(
        not(coverage_nightly),
        tracing::instrument(skip(self, session), fields(peer = %self.peer), level = "debug")
    )]
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Ok(requested_port) = u16::try_from(*port) else {
            return Err(russh::Error::Disconnect);
        };
        let address = address.trim();
        let user = self.bound_user()?;
        if let Err(error) =
            authorize_reverse(user.as_deref(), address, requested_port, self.context.reverse)
        {
            #[cfg(not(coverage_nightly))]
            tracing::info!(peer = %self.peer, user = ?self.user, %error, "Rejected reverse tunnel.");
            return Ok(false);
        }
        match self.context.multiplexer.open_reverse(ReverseRequest {
            session_id: self.session_id.clone(),
            peer: self.peer,
            address: address.into(),
            port: requested_port,
            handle: session.handle(),
        }) {
            Ok(bound_port) => {
                *port = bound_port.into();
                Ok(true)
            }
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                tracing::warn!(peer = %self.peer, %error, "Unable to open reverse tunnel.");
                Ok(false)
            }
        }
    }

    #[cfg_attr(
        not(coverage_nightly),
        tracing::instrument(skip(self, _session), fields(peer = %self.peer), level = "debug")
    )]
    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Ok(port) = u16::try_from(port) else {
            return Err(russh::Error::Disconnect);
        };
        self.bound_user()?;
        Ok(self
            .context
            .multiplexer
            .close_reverse(&self.session_id, address.trim(), port))
    }
}

// Clean up session data on drop (i.e. disconnected from server)
impl Drop for ServerHandler {
    fn drop(&mut self) {
        let user = self.user.as_deref().unwrap_or("unknown");
        #[cfg(not(coverage_nightly))]
        tracing::info!(peer = %self.peer, session = self.number, %user, "Tunnel client disconnected.");
        self.context.gate.sessions().remove(&self.session_id);
        self.context.multiplexer.close_session(&self.session_id);
    }
}

// Run an SSH server session over an upgraded tunnel connection.
pub(crate) fn handle_tunnel_connection<S>(
    stream: S,
    peer: SocketAddr,
    config: Arc<Config>,
    context: &Arc<SshContext>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handler = context.new_client(peer);
    tokio::spawn(async move {
        let session = match russh::server::run_stream(config, stream, handler).await {
            Ok(session) => session,
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                tracing::warn!(%peer, %error, "Tunnel handshake failed.");
                return;
            }
        };
        if let Err(error) = session.await {
            #[cfg(not(coverage_nightly))]
            tracing::debug!(%peer, %error, "Tunnel connection closed.");
        }
    });
}
