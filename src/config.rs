use std::path::PathBuf;

use clap::{Args, Parser};

/// TLS settings for the listener.
#[derive(Debug, Default, Clone, Args)]
pub struct TlsArgs {
    /// Private key in PEM format, enabling TLS along with --tls-cert.
    #[arg(long, value_name = "FILE")]
    pub tls_key: Option<PathBuf>,

    /// Certificate chain in PEM format, enabling TLS along with --tls-key.
    #[arg(long, value_name = "FILE")]
    pub tls_cert: Option<PathBuf>,

    /// CA bundle in PEM format. If set, clients must present a certificate signed by it.
    #[arg(long, value_name = "FILE")]
    pub tls_ca: Option<PathBuf>,
}

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// Interface to listen on.
    #[arg(long, env = "PORTCULLIS_HOST", default_value_t = String::from("0.0.0.0"), value_name = "ADDRESS")]
    pub host: String,

    /// Port to listen on for HTTP, WebSocket and tunnel connections.
    #[arg(short, long, env = "PORTCULLIS_PORT", default_value_t = 8080, value_name = "PORT")]
    pub port: u16,

    /// Seed for the server's SSH key. The same seed always yields the same fingerprint.
    /// If empty, a random key is generated on every start.
    #[arg(long, env = "PORTCULLIS_KEY", default_value_t = String::new(), hide_env_values = true)]
    pub key: String,

    /// JSON file mapping "user:pass" to lists of address patterns.
    /// The file is reloaded whenever it changes.
    #[arg(long, value_name = "FILE")]
    pub authfile: Option<PathBuf>,

    /// Single "user:pass" credential with access to every address.
    /// Without any users, authentication is disabled.
    #[arg(long, env = "PORTCULLIS_AUTH", value_name = "USER:PASS", hide_env_values = true)]
    pub auth: Option<String>,

    /// Interval between SSH keep-alive messages. 0s disables them.
    #[arg(long, default_value = "25s", value_name = "DURATION")]
    pub keepalive: humantime::Duration,

    /// Where to proxy requests that aren't tunnel connections.
    #[arg(long, value_name = "URL")]
    pub backend: Option<String>,

    /// Allow clients to request SOCKS5 tunnels.
    #[arg(long, default_value_t = false)]
    pub socks5: bool,

    /// Allow clients to request reverse tunnels.
    #[arg(long, default_value_t = false)]
    pub reverse: bool,

    /// Expose Prometheus metrics on /metrics. Ignored when --backend is set.
    #[arg(long, default_value_t = false)]
    pub metrics: bool,

    #[command(flatten)]
    pub tls: TlsArgs,
}
