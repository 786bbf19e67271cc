//! One established data/error channel pair for the forwarded port

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio::net::TcpStream;

use crate::errors::{Result, TunnelError};
use super::protocol::{Demux, Inbound};

/// Grace period for the close handshake of an unused channel
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Stop reading an idle channel once this much remote data is buffered
pub const IDLE_BUFFER_LIMIT: usize = 1 << 20;

/// What happened on a channel that has no local connection yet
#[derive(Debug, PartialEq, Eq)]
pub enum IdleEvent {
    /// Remote bytes were buffered for the next local connection
    Buffered(usize),
    /// The server closed the channel
    Closed,
}

/// Upgraded stream whose port headers have been received
pub struct PortChannel<S = MaybeTlsStream<TcpStream>> {
    ws: WebSocketStream<S>,
    demux: Demux,
    pending: BytesMut,
}

impl<S> PortChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wait for the server to open both channels for `remote_port`
    pub async fn establish(mut ws: WebSocketStream<S>, remote_port: u16) -> Result<Self> {
        let mut demux = Demux::new(remote_port);
        let mut pending = BytesMut::new();

        while !demux.is_established() {
            let message = match ws.next().await {
                Some(message) => message.map_err(stream_error)?,
                None => return Err(closed_early(remote_port)),
            };
            match demux.feed(message)? {
                Inbound::Data(bytes) => pending.extend_from_slice(&bytes),
                Inbound::Error(text) => return Err(remote_error(remote_port, &text)),
                Inbound::Closed => return Err(closed_early(remote_port)),
                Inbound::Ignored => {}
            }
        }

        tracing::debug!(remote_port, buffered = pending.len(), "port channel established");
        Ok(Self { ws, demux, pending })
    }

    /// Read the next frame while no local connection is attached.
    ///
    /// Cancel safe, so it can sit in a `select!` next to the accept loop.
    pub async fn idle_event(&mut self) -> Result<IdleEvent> {
        loop {
            let message = match self.ws.next().await {
                Some(Ok(message)) => message,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    return Ok(IdleEvent::Closed)
                }
                Some(Err(e)) => return Err(stream_error(e)),
            };
            match self.demux.feed(message)? {
                Inbound::Data(bytes) => {
                    self.pending.extend_from_slice(&bytes);
                    return Ok(IdleEvent::Buffered(bytes.len()));
                }
                Inbound::Error(text) => return Err(remote_error(self.remote_port(), &text)),
                Inbound::Closed => return Ok(IdleEvent::Closed),
                Inbound::Ignored => {}
            }
        }
    }

    pub fn remote_port(&self) -> u16 {
        self.demux.remote_port()
    }

    /// Remote bytes received before a local connection attached
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// The idle buffer reached [`IDLE_BUFFER_LIMIT`]; callers should stop
    /// polling [`PortChannel::idle_event`] so the server is throttled.
    pub fn is_full(&self) -> bool {
        self.pending.len() >= IDLE_BUFFER_LIMIT
    }

    /// Close without attaching a local connection
    pub async fn close(mut self) {
        let port = self.remote_port();
        match tokio::time::timeout(CLOSE_GRACE, self.ws.close(None)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(remote_port = port, error = %e, "close handshake failed"),
            Err(_) => tracing::debug!(remote_port = port, "close handshake timed out"),
        }
    }

    pub fn into_parts(self) -> (WebSocketStream<S>, Demux, Bytes) {
        (self.ws, self.demux, self.pending.freeze())
    }
}

pub(crate) fn stream_error(err: WsError) -> TunnelError {
    TunnelError::Stream(format!("Tunnel connection failed: {}", err))
}

pub(crate) fn remote_error(remote_port: u16, text: &str) -> TunnelError {
    TunnelError::Stream(format!("Error forwarding port {} to pod: {}", remote_port, text))
}

fn closed_early(remote_port: u16) -> TunnelError {
    TunnelError::Stream(format!(
        "Tunnel closed before port {} was opened",
        remote_port
    ))
}
