use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use color_eyre::eyre::Context;
use hyper::{Request, body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::Mutex,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::{
    auth::AuthenticationGate,
    config::ApplicationConfig,
    droppable_handle::DroppableHandle,
    error::ServerError,
    fallback::FallbackProxy,
    identity::ServerIdentity,
    multiplexer::{TcpForwarder, TunnelMultiplexer},
    router::ConnectionRouter,
    sessions::SessionStore,
    ssh::{SshContext, ssh_config},
    telemetry::prometheus_handle,
    tls::tls_acceptor,
    users::{User, UserRegistry},
    watcher::AuthFileWatcher,
    ws::websocket_config_from_env,
};

/// The gateway: one listener serving tunnel upgrades, fallback traffic, and built-in routes.
pub struct GatewayServer {
    identity: ServerIdentity,
    users: Arc<UserRegistry>,
    sessions: Arc<SessionStore>,
    router: Arc<ConnectionRouter>,
    tls: Option<TlsAcceptor>,
    host: String,
    port: u16,
    // Stops the accept loop on close.
    cancellation_token: CancellationToken,
    started: AtomicBool,
    join_handle: Mutex<Option<DroppableHandle<std::io::Result<()>>>>,
    // Keeps the registry in sync with the auth file, if any.
    _auth_file_watcher: Option<AuthFileWatcher>,
}

impl GatewayServer {
    /// Build a gateway that forwards tunnels to TCP sockets.
    pub async fn new(config: ApplicationConfig) -> color_eyre::Result<Self> {
        Self::with_multiplexer(config, Arc::new(TcpForwarder::default())).await
    }

    /// Build a gateway that hands authorized tunnels to the given multiplexer.
    pub async fn with_multiplexer(
        config: ApplicationConfig,
        multiplexer: Arc<dyn TunnelMultiplexer>,
    ) -> color_eyre::Result<Self> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let identity = ServerIdentity::derive(&config.key)?;
        #[cfg(not(coverage_nightly))]
        tracing::info!(fingerprint = identity.fingerprint(), "Server key ready.");

        // Users from the auth file and the inline credential end up in the same registry.
        let users = Arc::new(UserRegistry::new());
        let auth_file_watcher = match config.authfile {
            Some(path) => Some(
                AuthFileWatcher::watch(path, Arc::clone(&users), config.auth.clone())
                    .await
                    .with_context(|| "Error loading auth file")?,
            ),
            None => {
                if let Some(ref auth) = config.auth {
                    users.add_inline(auth);
                }
                None
            }
        };
        if users.authentication_required() {
            #[cfg(not(coverage_nightly))]
            tracing::info!(count = users.len(), "User authentication enabled.");
        } else {
            #[cfg(not(coverage_nightly))]
            tracing::warn!("No users registered, accepting every tunnel client.");
        }

        let fallback = config
            .backend
            .as_deref()
            .map(FallbackProxy::new)
            .transpose()?;
        if let Some(ref fallback) = fallback {
            #[cfg(not(coverage_nightly))]
            tracing::info!(backend = %fallback.target(), "Fallback proxy enabled.");
        }
        if config.reverse {
            #[cfg(not(coverage_nightly))]
            tracing::info!("Reverse tunnelling enabled.");
        }
        if config.socks5 {
            #[cfg(not(coverage_nightly))]
            tracing::info!("SOCKS5 tunnels enabled.");
        }

        let tls = tls_acceptor(&config.tls).with_context(|| "Error setting up TLS")?;
        // /metrics would shadow the fallback, so only serve it without one
        let metrics = (config.metrics && fallback.is_none())
            .then(prometheus_handle)
            .flatten();

        let sessions = Arc::new(SessionStore::new());
        let gate = AuthenticationGate::new(Arc::clone(&users), Arc::clone(&sessions));
        let ssh = Arc::new(SshContext::new(
            gate,
            multiplexer,
            config.socks5,
            config.reverse,
        ));
        let router = ConnectionRouter::builder()
            .maybe_fallback(fallback)
            .ssh_config(Arc::new(ssh_config(&identity, *config.keepalive)))
            .ssh(ssh)
            .websocket_config(websocket_config_from_env())
            .maybe_metrics(metrics)
            .proto(if tls.is_some() { "https" } else { "http" })
            .build();

        Ok(GatewayServer {
            identity,
            users,
            sessions,
            router: Arc::new(router),
            tls,
            host: config.host,
            port: config.port,
            cancellation_token: CancellationToken::new(),
            started: AtomicBool::new(false),
            join_handle: Mutex::new(None),
            _auth_file_watcher: auth_file_watcher,
        })
    }

    /// Start on the host and port from the configuration.
    pub async fn run(&self) -> color_eyre::Result<SocketAddr> {
        self.start(&self.host, self.port).await
    }

    /// Start accepting connections, returning the address that was bound.
    pub async fn start(&self, host: &str, port: u16) -> color_eyre::Result<SocketAddr> {
        self.start_with_cancellation(host, port, CancellationToken::new())
            .await
    }

    /// Start accepting connections until either `close` is called or the token is cancelled.
    pub async fn start_with_cancellation(
        &self,
        host: &str,
        port: u16,
        cancellation_token: CancellationToken,
    ) -> color_eyre::Result<SocketAddr> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyStarted.into());
        }
        let listener = match TcpListener::bind((host, port)).await {
            Ok(listener) => listener,
            Err(error) => {
                self.started.store(false, Ordering::Release);
                return Err(error).with_context(|| format!("Error listening on {host}:{port}"));
            }
        };
        let address = listener.local_addr()?;
        #[cfg(not(coverage_nightly))]
        tracing::info!(%address, "Listening for connections.");
        let router = Arc::clone(&self.router);
        let tls = self.tls.clone();
        let closed = self.cancellation_token.clone();
        let join_handle = DroppableHandle::spawn(async move {
            loop {
                tokio::select! {
                    conn = listener.accept() => {
                        let (stream, peer) = match conn {
                            Ok((stream, peer)) => (stream, peer),
                            Err(error) => {
                                #[cfg(not(coverage_nightly))]
                                tracing::error!(%error, "Unable to accept connection.");
                                return Err(error);
                            }
                        };
                        if let Err(error) = stream.set_nodelay(true) {
                            #[cfg(not(coverage_nightly))]
                            tracing::warn!(%error, %peer, "Error setting nodelay.");
                        }
                        handle_connection(stream, peer, Arc::clone(&router), tls.clone());
                    }
                    _ = closed.cancelled() => break,
                    _ = cancellation_token.cancelled() => break,
                }
            }
            #[cfg(not(coverage_nightly))]
            tracing::info!(%address, "Stopped accepting connections.");
            Ok(())
        });
        *self.join_handle.lock().await = Some(join_handle);
        Ok(address)
    }

    /// Block until the server stops accepting connections.
    pub async fn wait(&self) -> color_eyre::Result<()> {
        let mut join_handle = self.join_handle.lock().await;
        let Some(ref mut handle) = *join_handle else {
            return Err(ServerError::NotStarted.into());
        };
        // Keep the handle until the accept loop has finished
        let result = (&mut handle.0).await;
        join_handle.take();
        result
            .with_context(|| "Accept loop panicked")?
            .with_context(|| "Accept loop failed")
    }

    /// Stop accepting new connections. Tunnels already in progress are left running.
    pub fn close(&self) {
        self.cancellation_token.cancel();
    }

    /// Fingerprint of the server key, for clients to pin.
    pub fn fingerprint(&self) -> &str {
        self.identity.fingerprint()
    }

    pub fn add_user<S: AsRef<str>>(
        &self,
        name: &str,
        password: &str,
        addresses: &[S],
    ) -> Result<(), ServerError> {
        self.users.add_user(name, password, addresses)
    }

    pub fn delete_user(&self, name: &str) {
        self.users.delete_user(name);
    }

    pub fn reset_users(&self, users: Vec<User>) {
        self.users.reset(users);
    }

    pub fn users(&self) -> &Arc<UserRegistry> {
        &self.users
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Whether tunnel clients must authenticate. False in open mode.
    pub fn authentication_required(&self) -> bool {
        self.users.authentication_required()
    }
}

impl Drop for GatewayServer {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

// Serve HTTP on an accepted connection, terminating TLS first if configured.
fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<ConnectionRouter>,
    tls: Option<TlsAcceptor>,
) {
    tokio::spawn(async move {
        match tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(stream) => serve_connection(stream, peer, router).await,
                Err(error) => {
                    #[cfg(not(coverage_nightly))]
                    tracing::warn!(%error, %peer, "Error establishing TLS connection.");
                }
            },
            None => serve_connection(stream, peer, router).await,
        }
    });
}

async fn serve_connection<S>(stream: S, peer: SocketAddr, router: Arc<ConnectionRouter>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |request: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { Ok::<_, Infallible>(router.route(request, peer).await) }
    });
    let server = auto::Builder::new(TokioExecutor::new());
    if let Err(error) = server
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
    {
        #[cfg(not(coverage_nightly))]
        tracing::debug!(%error, %peer, "Connection closed with error.");
    }
}
