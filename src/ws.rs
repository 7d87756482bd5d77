use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use axum::body::Body;
use bytes::{Buf, Bytes};
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, HeaderValue, Response, StatusCode, header};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Message, handshake::derive_accept_key, protocol::WebSocketConfig},
};

use crate::error::ServerError;

/// Version of the tunnel protocol, negotiated as the WebSocket subprotocol.
pub const PROTOCOL_VERSION: &str = "portcullis-v1";

/// Environment variable overriding the WebSocket read and write buffer sizes.
pub const BUFFER_SIZE_ENV: &str = "WS_BUFF_SIZE";

// Kind of connection attempt, judged from the request headers alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpgradeKind {
    // Not a WebSocket upgrade.
    None,
    // A WebSocket upgrade for some other protocol.
    Foreign,
    // A tunnel connection attempt.
    Tunnel,
}

pub(crate) fn upgrade_kind(headers: &HeaderMap) -> UpgradeKind {
    let is_websocket = headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));
    if !is_websocket {
        return UpgradeKind::None;
    }
    let protocol = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok());
    if protocol.is_some_and(|protocol| protocol.trim() == PROTOCOL_VERSION) {
        UpgradeKind::Tunnel
    } else {
        UpgradeKind::Foreign
    }
}

// Build the 101 response accepting a tunnel upgrade.
pub(crate) fn accept_response(headers: &HeaderMap) -> Result<Response<Body>, ServerError> {
    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(ServerError::MissingUpgradeKey)?;
    let accept = derive_accept_key(key.as_bytes());
    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, HeaderValue::from_static("websocket"))
        .header(header::CONNECTION, HeaderValue::from_static("Upgrade"))
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .header(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(PROTOCOL_VERSION),
        )
        .body(Body::empty())
        .map_err(|error| ServerError::InvalidConfig(error.to_string()))?;
    Ok(response)
}

/// WebSocket settings for upgraded connections.
///
/// When the buffer size override is unset or not a number, the library defaults are used.
pub fn websocket_config(buffer_size: Option<&str>) -> WebSocketConfig {
    match buffer_size.and_then(|size| size.trim().parse::<usize>().ok()) {
        Some(size) => WebSocketConfig::default()
            .read_buffer_size(size)
            .write_buffer_size(size),
        None => WebSocketConfig::default(),
    }
}

pub(crate) fn websocket_config_from_env() -> WebSocketConfig {
    websocket_config(std::env::var(BUFFER_SIZE_ENV).ok().as_deref())
}

/// Byte stream carried over binary WebSocket messages.
///
/// Each write becomes one binary message; reads drain incoming binary messages in order.
pub struct WebSocketIo<S> {
    inner: WebSocketStream<S>,
    read_buffer: Bytes,
    pending_write: Option<usize>,
}

impl<S> WebSocketIo<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        WebSocketIo {
            inner,
            read_buffer: Bytes::new(),
            pending_write: None,
        }
    }
}

impl<S> AsyncRead for WebSocketIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.read_buffer.has_remaining() {
                let len = self.read_buffer.len().min(buf.remaining());
                buf.put_slice(&self.read_buffer[..len]);
                self.read_buffer.advance(len);
                return Poll::Ready(Ok(()));
            }
            match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => self.read_buffer = data,
                // EOF
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(Message::Text(_)))) => {
                    #[cfg(not(coverage_nightly))]
                    tracing::debug!("Ignoring text message on tunnel connection.");
                }
                Poll::Ready(Some(Ok(_))) => (),
                Poll::Ready(Some(Err(error))) => {
                    return Poll::Ready(Err(io::Error::other(error)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WebSocketIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // Finish flushing the previous message before accepting a new one
        if let Some(len) = self.pending_write {
            return match self.inner.poll_flush_unpin(cx) {
                Poll::Ready(Ok(())) => {
                    self.pending_write = None;
                    Poll::Ready(Ok(len))
                }
                Poll::Ready(Err(error)) => {
                    self.pending_write = None;
                    Poll::Ready(Err(io::Error::other(error)))
                }
                Poll::Pending => Poll::Pending,
            };
        }
        match self.inner.poll_ready_unpin(cx) {
            Poll::Ready(Ok(())) => (),
            Poll::Ready(Err(error)) => return Poll::Ready(Err(io::Error::other(error))),
            Poll::Pending => return Poll::Pending,
        }
        self.inner
            .start_send_unpin(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(io::Error::other)?;
        match self.inner.poll_flush_unpin(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(buf.len())),
            Poll::Ready(Err(error)) => Poll::Ready(Err(io::Error::other(error))),
            Poll::Pending => {
                self.pending_write = Some(buf.len());
                Poll::Pending
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = self.inner.poll_flush_unpin(cx).map_err(io::Error::other);
        if result.is_ready() {
            self.pending_write = None;
        }
        result
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_close_unpin(cx).map_err(io::Error::other)
    }
}
