//! Channel framing for the `v4.channel.k8s.io` port-forward subprotocol
//!
//! Every binary frame starts with a channel byte. For a single forwarded port
//! channel 0 carries data and channel 1 carries error text. The server opens
//! each channel by sending the port number as a little-endian `u16`.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::errors::{Result, TunnelError};

/// Subprotocol requested in `Sec-WebSocket-Protocol`
pub const PORT_FORWARD_PROTOCOL: &str = "v4.channel.k8s.io";

pub const DATA_CHANNEL: u8 = 0;
pub const ERROR_CHANNEL: u8 = 1;

/// Frame a chunk of local bytes for the data channel
pub fn encode_data(payload: &[u8]) -> Message {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_u8(DATA_CHANNEL);
    buf.put_slice(payload);
    Message::Binary(buf.freeze())
}

/// What a received frame means to the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Bytes from the remote port
    Data(Bytes),
    /// The server reported a failure for this port
    Error(String),
    /// The server closed the stream
    Closed,
    /// Control frames, port headers and anything else with no payload
    Ignored,
}

/// Tracks the per-channel port headers of one connection and turns frames
/// into [`Inbound`] events.
#[derive(Debug, Clone)]
pub struct Demux {
    remote_port: u16,
    data_header: bool,
    error_header: bool,
}

impl Demux {
    pub fn new(remote_port: u16) -> Self {
        Self {
            remote_port,
            data_header: false,
            error_header: false,
        }
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Both channels have announced their port
    pub fn is_established(&self) -> bool {
        self.data_header && self.error_header
    }

    pub fn feed(&mut self, message: Message) -> Result<Inbound> {
        let frame = match message {
            Message::Binary(frame) => frame,
            Message::Close(_) => return Ok(Inbound::Closed),
            _ => return Ok(Inbound::Ignored),
        };

        let Some((&channel, _)) = frame.split_first() else {
            return Ok(Inbound::Ignored);
        };
        let mut payload = frame.slice(1..);

        match channel {
            DATA_CHANNEL => {
                if !self.data_header {
                    payload = self.strip_header(payload, "data")?;
                    self.data_header = true;
                }
                if payload.is_empty() {
                    Ok(Inbound::Ignored)
                } else {
                    Ok(Inbound::Data(payload))
                }
            }
            ERROR_CHANNEL => {
                if !self.error_header {
                    payload = self.strip_header(payload, "error")?;
                    self.error_header = true;
                }
                if payload.is_empty() {
                    Ok(Inbound::Ignored)
                } else {
                    let text = String::from_utf8_lossy(&payload).trim().to_string();
                    Ok(Inbound::Error(text))
                }
            }
            other => {
                tracing::debug!(channel = other, "ignoring frame on unknown channel");
                Ok(Inbound::Ignored)
            }
        }
    }

    fn strip_header(&self, payload: Bytes, channel: &str) -> Result<Bytes> {
        let port = parse_port_header(&payload).ok_or_else(|| {
            TunnelError::Stream(format!(
                "Malformed port header on {} channel ({} bytes)",
                channel,
                payload.len()
            ))
        })?;
        if port != self.remote_port {
            return Err(TunnelError::Stream(format!(
                "Server opened {} channel for port {}, expected {}",
                channel, port, self.remote_port
            )));
        }
        Ok(payload.slice(2..))
    }
}

/// Read the little-endian port number that opens a channel
pub fn parse_port_header(payload: &[u8]) -> Option<u16> {
    match payload {
        [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(channel: u8, payload: &[u8]) -> Message {
        let mut v = vec![channel];
        v.extend_from_slice(payload);
        Message::Binary(v.into())
    }

    #[test]
    fn test_encode_data_prefixes_channel() {
        match encode_data(b"ping") {
            Message::Binary(b) => assert_eq!(&b[..], b"\x00ping"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_port_header() {
        assert_eq!(parse_port_header(&[0x50, 0x00]), Some(80));
        assert_eq!(parse_port_header(&[0x90, 0x1f, 0xff]), Some(8080));
        assert_eq!(parse_port_header(&[0x50]), None);
    }

    #[test]
    fn test_headers_then_data() {
        let mut demux = Demux::new(80);
        assert!(!demux.is_established());
        assert_eq!(demux.feed(frame(DATA_CHANNEL, &[80, 0])).unwrap(), Inbound::Ignored);
        assert_eq!(demux.feed(frame(ERROR_CHANNEL, &[80, 0])).unwrap(), Inbound::Ignored);
        assert!(demux.is_established());

        assert_eq!(
            demux.feed(frame(DATA_CHANNEL, b"hello")).unwrap(),
            Inbound::Data(Bytes::from_static(b"hello"))
        );
    }

    #[test]
    fn test_header_frame_may_carry_data() {
        let mut demux = Demux::new(80);
        assert_eq!(
            demux.feed(frame(DATA_CHANNEL, &[80, 0, b'h', b'i'])).unwrap(),
            Inbound::Data(Bytes::from_static(b"hi"))
        );
    }

    #[test]
    fn test_port_mismatch_is_stream_error() {
        let mut demux = Demux::new(80);
        let err = demux.feed(frame(DATA_CHANNEL, &[81, 0])).unwrap_err();
        assert!(matches!(err, TunnelError::Stream(_)));
        assert!(err.to_string().contains("expected 80"));
    }

    #[test]
    fn test_short_header_is_stream_error() {
        let mut demux = Demux::new(80);
        assert!(matches!(
            demux.feed(frame(ERROR_CHANNEL, &[80])),
            Err(TunnelError::Stream(_))
        ));
    }

    #[test]
    fn test_error_channel_text() {
        let mut demux = Demux::new(80);
        demux.feed(frame(ERROR_CHANNEL, &[80, 0])).unwrap();
        assert_eq!(
            demux.feed(frame(ERROR_CHANNEL, b"connection refused\n")).unwrap(),
            Inbound::Error("connection refused".to_string())
        );
    }

    #[test]
    fn test_control_frames() {
        let mut demux = Demux::new(80);
        assert_eq!(demux.feed(Message::Close(None)).unwrap(), Inbound::Closed);
        assert_eq!(demux.feed(Message::Ping(Bytes::new())).unwrap(), Inbound::Ignored);
        assert_eq!(demux.feed(Message::Binary(Bytes::new())).unwrap(), Inbound::Ignored);
        assert_eq!(demux.feed(frame(7, b"x")).unwrap(), Inbound::Ignored);
    }
}
