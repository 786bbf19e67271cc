//! Port-forward session: local listener, accept loop and byte relay

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::WebSocketStream;

use crate::errors::{Result, TunnelError};
use super::channel::{remote_error, stream_error, IdleEvent, PortChannel};
use super::coordinator::{ForwardContext, Forwarder};
use super::dialer::TunnelDialer;
use super::protocol::{encode_data, Demux, Inbound};
use super::types::{ForwardSpec, IoStreams, TunnelRequest};

/// Read buffer for the local side of a relay
const RELAY_BUFFER: usize = 32 * 1024;

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Forwards one local port to one pod port
#[derive(Debug, Clone)]
pub struct PortForwardSession {
    dialer: TunnelDialer,
    ports: ForwardSpec,
    bind_address: IpAddr,
    streams: IoStreams,
}

impl PortForwardSession {
    pub fn new(request: &TunnelRequest) -> Self {
        Self {
            dialer: request.dialer().clone(),
            ports: request.ports(),
            bind_address: request.bind_address(),
            streams: request.streams().clone(),
        }
    }

    async fn serve(&self, listener: TcpListener, first: PortChannel, ctx: &ForwardContext) -> Result<()> {
        let mut idle = Some(first);
        let mut relays: JoinSet<Result<()>> = JoinSet::new();
        let mut connections: u64 = 0;

        let outcome = loop {
            tokio::select! {
                biased;

                _ = ctx.stopped() => {
                    tracing::debug!(local_port = self.ports.local, "stop requested");
                    break Ok(());
                }

                Some(joined) = relays.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(e),
                    Err(e) if e.is_panic() => {
                        break Err(TunnelError::Stream("Connection relay panicked".to_string()))
                    }
                    Err(_) => {}
                },

                event = watch_idle(&mut idle) => match event {
                    Ok(IdleEvent::Buffered(bytes)) => {
                        tracing::trace!(bytes, "buffered data on idle channel");
                        if idle.as_ref().is_some_and(|c| c.is_full()) {
                            tracing::debug!(remote_port = self.ports.remote, "idle buffer full, pausing reads");
                        }
                    }
                    Ok(IdleEvent::Closed) => {
                        tracing::debug!(remote_port = self.ports.remote, "idle channel closed by server");
                        idle = None;
                    }
                    Err(e) => break Err(e),
                },

                accepted = listener.accept() => {
                    if let Some((socket, peer)) = accepted_or_backoff(accepted).await {
                        connections += 1;
                        tracing::debug!(connection = connections, peer = %peer, "accepted local connection");
                        self.streams.out_line(format_args!("Handling connection for {}", self.ports.local));
                        relays.spawn(handle_connection(
                            connections,
                            socket,
                            peer,
                            idle.take(),
                            self.dialer.clone(),
                            self.ports.remote,
                            self.streams.clone(),
                        ));
                    }
                }
            }
        };

        drop(listener);
        relays.shutdown().await;
        if let Some(channel) = idle {
            channel.close().await;
        }

        match &outcome {
            Ok(()) => tracing::info!(connections, "tunnel closed"),
            Err(e) => tracing::error!(connections, error = %e, "tunnel failed"),
        }
        outcome
    }
}

impl Forwarder for PortForwardSession {
    async fn run(self, ctx: ForwardContext) -> Result<()> {
        ctx.mark_dialing();
        tracing::info!(
            target = %self.dialer.target_url(),
            ports = %self.ports,
            "opening tunnel"
        );

        let first = tokio::select! {
            biased;
            _ = ctx.stopped() => return Err(TunnelError::Cancelled),
            channel = dial_channel(&self.dialer, self.ports.remote) => channel?,
        };

        let address = SocketAddr::new(self.bind_address, self.ports.local);
        let listener = match TcpListener::bind(address).await {
            Ok(listener) => listener,
            Err(source) => {
                first.close().await;
                return Err(TunnelError::Listen {
                    address: address.to_string(),
                    source,
                });
            }
        };
        let local_addr = listener.local_addr()?;

        self.streams.out_line(format_args!(
            "Forwarding from {} -> {}",
            local_addr, self.ports.remote
        ));
        ctx.mark_ready(local_addr);
        tracing::info!(local = %local_addr, remote_port = self.ports.remote, "tunnel ready");

        self.serve(listener, first, &ctx).await
    }
}

async fn dial_channel(dialer: &TunnelDialer, remote_port: u16) -> Result<PortChannel> {
    let ws = dialer.dial().await?;
    PortChannel::establish(ws, remote_port).await
}

/// Next event of the idle channel; never resolves once the channel is gone
/// or its buffer is full, so the server stops being read.
async fn watch_idle<S>(idle: &mut Option<PortChannel<S>>) -> Result<IdleEvent>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match idle {
        Some(channel) if !channel.is_full() => channel.idle_event().await,
        _ => std::future::pending().await,
    }
}

async fn accepted_or_backoff<T>(accepted: io::Result<T>) -> Option<T> {
    match accepted {
        Ok(accepted) => Some(accepted),
        Err(e) => {
            tracing::warn!(error = %e, "failed to accept local connection");
            tokio::time::sleep(ACCEPT_BACKOFF).await;
            None
        }
    }
}

async fn handle_connection(
    id: u64,
    socket: TcpStream,
    peer: SocketAddr,
    channel: Option<PortChannel>,
    dialer: TunnelDialer,
    remote_port: u16,
    streams: IoStreams,
) -> Result<()> {
    let channel = match channel {
        Some(channel) => channel,
        None => match dial_channel(&dialer, remote_port).await {
            Ok(channel) => channel,
            Err(e) => {
                streams.err_line(format_args!(
                    "error: failed to open tunnel for connection from {}: {}",
                    peer, e
                ));
                tracing::warn!(connection = id, error = %e, "per-connection dial failed");
                return Ok(());
            }
        },
    };

    let _ = socket.set_nodelay(true);
    let result = relay(channel, socket).await;
    tracing::debug!(connection = id, ok = result.is_ok(), "connection finished");
    result
}

enum Upstream {
    /// Local side finished writing
    Eof,
    /// Remote stopped accepting frames
    RemoteClosed,
    /// Local socket failed
    LocalError,
}

/// Copy bytes both ways between an established channel and a local socket.
///
/// Errors reported by the remote end fail the relay; local socket errors only
/// end it.
pub(crate) async fn relay<S, L>(channel: PortChannel<S>, local: L) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    L: AsyncRead + AsyncWrite + Unpin,
{
    let (ws, demux, pending) = channel.into_parts();
    let (sink, stream) = ws.split();
    let (reader, mut writer) = tokio::io::split(local);

    if !pending.is_empty() {
        if let Err(e) = writer.write_all(&pending).await {
            tracing::debug!(error = %e, "local connection closed before buffered data was delivered");
            return Ok(());
        }
    }

    let upstream = pump_upstream(reader, sink);
    let downstream = pump_downstream(stream, writer, demux);
    tokio::pin!(upstream, downstream);

    let mut upstream_open = true;
    loop {
        tokio::select! {
            end = &mut upstream, if upstream_open => match end? {
                Upstream::Eof | Upstream::RemoteClosed => upstream_open = false,
                Upstream::LocalError => return Ok(()),
            },
            result = &mut downstream => return result,
        }
    }
}

async fn pump_upstream<S, L>(
    mut reader: ReadHalf<L>,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
) -> Result<Upstream>
where
    S: AsyncRead + AsyncWrite + Unpin,
    L: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                // No half-close in the channel protocol; EOF ends the stream
                let _ = sink.close().await;
                return Ok(Upstream::Eof);
            }
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "local read failed");
                return Ok(Upstream::LocalError);
            }
        };

        match sink.send(encode_data(&buf[..n])).await {
            Ok(()) => {}
            Err(e) if is_closed(&e) => return Ok(Upstream::RemoteClosed),
            Err(e) => return Err(stream_error(e)),
        }
    }
}

async fn pump_downstream<S, L>(
    mut stream: SplitStream<WebSocketStream<S>>,
    mut writer: WriteHalf<L>,
    mut demux: Demux,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    L: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) if is_closed(&e) => break,
            Err(e) => return Err(stream_error(e)),
        };

        match demux.feed(message)? {
            Inbound::Data(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    tracing::debug!(error = %e, "local write failed");
                    return Ok(());
                }
            }
            Inbound::Error(text) => return Err(remote_error(demux.remote_port(), &text)),
            Inbound::Closed => break,
            Inbound::Ignored => {}
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

fn is_closed(err: &WsError) -> bool {
    matches!(
        err,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::SendAfterClosing)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::channel::IDLE_BUFFER_LIMIT;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn established(port: u16) -> (PortChannel<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(4 << 20);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let mut server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        let header = port.to_le_bytes();
        server.send(Message::Binary(vec![0, header[0], header[1]].into())).await.unwrap();
        server.send(Message::Binary(vec![1, header[0], header[1]].into())).await.unwrap();
        let channel = PortChannel::establish(client, port).await.unwrap();
        (channel, server)
    }

    fn data(payload: &[u8]) -> Message {
        let mut v = vec![0];
        v.extend_from_slice(payload);
        Message::Binary(v.into())
    }

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (channel, mut server) = established(80).await;
        let (local, mut client) = tokio::io::duplex(64 * 1024);
        let relay = tokio::spawn(relay(channel, local));

        client.write_all(b"GET /").await.unwrap();
        match server.next().await.unwrap().unwrap() {
            Message::Binary(b) => assert_eq!(&b[..], b"\x00GET /"),
            other => panic!("unexpected frame: {:?}", other),
        }

        server.send(data(b"200 OK")).await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"200 OK");

        server.close(None).await.unwrap();
        assert!(relay.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_relay_delivers_buffered_bytes_first() {
        let (mut channel, mut server) = established(80).await;
        server.send(data(b"banner\n")).await.unwrap();
        assert_eq!(channel.idle_event().await.unwrap(), IdleEvent::Buffered(7));

        let (local, mut client) = tokio::io::duplex(64 * 1024);
        let relay = tokio::spawn(relay(channel, local));
        server.send(data(b"more")).await.unwrap();

        let mut buf = [0u8; 11];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"banner\nmore");

        server.close(None).await.unwrap();
        assert!(relay.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_relay_remote_error_is_fatal() {
        let (channel, mut server) = established(80).await;
        let (local, _client) = tokio::io::duplex(64 * 1024);
        let relay = tokio::spawn(relay(channel, local));

        server
            .send(Message::Binary(b"\x01connection refused".to_vec().into()))
            .await
            .unwrap();
        let err = relay.await.unwrap().unwrap_err();
        assert!(matches!(err, TunnelError::Stream(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_full_idle_channel_is_not_read() {
        let (mut channel, mut server) = established(80).await;
        let chunk = vec![b'x'; 64 * 1024];
        for _ in 0..IDLE_BUFFER_LIMIT / chunk.len() {
            server.send(data(&chunk)).await.unwrap();
            channel.idle_event().await.unwrap();
        }
        assert!(channel.is_full());

        // More data is waiting, but a full channel is left alone
        server.send(data(b"overflow")).await.unwrap();
        let mut idle = Some(channel);
        let polled = tokio::time::timeout(Duration::from_millis(100), watch_idle(&mut idle)).await;
        assert!(polled.is_err());
        assert_eq!(idle.as_ref().unwrap().pending().len(), IDLE_BUFFER_LIMIT);

        // Attaching a connection delivers the buffer, then the rest
        let (local, mut client) = tokio::io::duplex(4 * IDLE_BUFFER_LIMIT);
        let relay = tokio::spawn(relay(idle.take().unwrap(), local));
        let mut received = vec![0u8; IDLE_BUFFER_LIMIT + 8];
        client.read_exact(&mut received).await.unwrap();
        assert!(received.ends_with(b"overflow"));

        server.close(None).await.unwrap();
        assert!(relay.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_accept_error_backs_off() {
        let started = std::time::Instant::now();
        let failed: io::Result<()> = Err(io::Error::from_raw_os_error(24));
        assert!(accepted_or_backoff(failed).await.is_none());
        assert!(started.elapsed() >= ACCEPT_BACKOFF);

        assert_eq!(accepted_or_backoff(Ok(7)).await, Some(7));
    }

    #[tokio::test]
    async fn test_relay_local_close_ends_quietly() {
        let (channel, mut server) = established(80).await;
        let (local, client) = tokio::io::duplex(64 * 1024);
        let relay = tokio::spawn(relay(channel, local));

        drop(client);
        // The relay closes its side, which the server sees as a close frame
        match server.next().await {
            Some(Ok(Message::Close(_))) | None => {}
            other => panic!("expected close, got {:?}", other),
        }
        // Reading again sends the close reply
        while let Some(Ok(_)) = server.next().await {}
        assert!(relay.await.unwrap().is_ok());
    }
}
