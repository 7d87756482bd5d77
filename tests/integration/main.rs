mod common;

mod fallback_rewrite_host;
mod lib_close_with_cancellation;
mod lib_configure_from_scratch;
mod router_builtin_routes;
mod ssh_open_mode;
mod ssh_password_authentication;
mod ssh_reverse_tunnels;
mod ssh_server_fingerprint;
