#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub use crate::{
    auth::{AuthenticationGate, Grant},
    config::{ApplicationConfig, TlsArgs},
    entrypoint::entrypoint,
    error::ServerError,
    fallback::FallbackProxy,
    identity::{ServerIdentity, fingerprint},
    multiplexer::{
        DEFAULT_BUFFER_SIZE, ForwardTunnel, ReverseRequest, TcpForwarder, TunnelMultiplexer,
    },
    router::VERSION,
    server::GatewayServer,
    sessions::{SessionId, SessionStore},
    ssh::SOCKS_HOST,
    users::{ALLOW_ALL, AddressPattern, User, UserRegistry, parse_auth, parse_auth_file},
    ws::{BUFFER_SIZE_ENV, PROTOCOL_VERSION, WebSocketIo, websocket_config},
};

mod auth;
mod config;
mod droppable_handle;
mod entrypoint;
mod error;
mod fallback;
mod identity;
mod multiplexer;
mod router;
mod server;
mod sessions;
mod ssh;
mod telemetry;
mod tls;
mod users;
mod watcher;
mod ws;
