use std::path::PathBuf;

/// Errors raised by the gateway's identity, user and authentication services.
#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("Failed to generate key: {0}")]
    KeyGeneration(String),
    #[error("Failed to parse key: {0}")]
    KeyParse(String),
    #[error("Invalid proxy target {0:?}: missing protocol or host")]
    InvalidProxyTarget(String),
    #[error("Invalid address pattern {pattern:?}")]
    PatternSyntax {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("Unable to load auth file {path:?}: {reason}")]
    AuthFileLoad { path: PathBuf, reason: String },
    #[error("Invalid authentication for username: {0}")]
    InvalidCredentials(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid TLS configuration: {0}")]
    TlsConfig(String),
    #[error("Missing Sec-WebSocket-Key header")]
    MissingUpgradeKey,
    #[error("Tunnel to {0} is not allowed")]
    TunnelNotAllowed(String),
    #[error("SOCKS5 tunnels are not available")]
    SocksUnavailable,
    #[error("Reverse tunnels are not enabled")]
    ReverseDisabled,
    #[error("Server has already been started")]
    AlreadyStarted,
    #[error("Server has not been started")]
    NotStarted,
}
