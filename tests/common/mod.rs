//! Common test utilities for podforward integration tests
//!
//! This module provides shared test infrastructure including:
//! - A mock API server that accepts port-forward upgrades
//! - Request builders and output capture for the library API
//! - CLI invocation helpers

#![allow(dead_code)]

use std::io::Write;
use std::net::SocketAddr;
use std::process::{Command, Output, Stdio};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::Message;

use podforward::config::ConnectionConfig;
use podforward::tunnel::protocol::PORT_FORWARD_PROTOCOL;
use podforward::{ForwardSpec, IoStreams, PodTarget, TunnelRequest};

/// Token the tests authenticate with
pub const TEST_TOKEN: &str = "test-token";

/// How the mock API server treats each upgraded connection
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Echo every data frame back
    Echo,
    /// Send these bytes as soon as the channels are open, then echo
    Greeting(&'static [u8]),
    /// Answer the first data frame with this text on the error channel
    ErrorOnData(&'static str),
    /// Accept the first upgrade and echo; reject all later ones with 500
    FirstOnly,
}

/// An upgrade request seen by the mock server
#[derive(Debug, Clone)]
pub struct RecordedUpgrade {
    /// Path and query of the request
    pub uri: String,
    pub authorization: Option<String>,
    pub protocol: Option<String>,
}

/// Minimal stand-in for the API server's port-forward subresource
pub struct MockApiServer {
    pub addr: SocketAddr,
    upgrades: Arc<Mutex<Vec<RecordedUpgrade>>>,
    task: JoinHandle<()>,
}

impl MockApiServer {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");
        let upgrades = Arc::new(Mutex::new(Vec::new()));

        let recorded = upgrades.clone();
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve_upgrade(socket, behavior, recorded.clone()));
            }
        });

        Self { addr, upgrades, task }
    }

    /// `http://` URL of the server
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn upgrades(&self) -> Vec<RecordedUpgrade> {
        self.upgrades.lock().unwrap().clone()
    }
}

impl Drop for MockApiServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn frame(channel: u8, payload: &[u8]) -> Message {
    let mut v = Vec::with_capacity(payload.len() + 1);
    v.push(channel);
    v.extend_from_slice(payload);
    Message::Binary(v.into())
}

fn requested_port(uri: &str) -> u16 {
    uri.split_once("ports=")
        .and_then(|(_, rest)| rest.split('&').next())
        .and_then(|p| p.parse().ok())
        .unwrap_or(0)
}

async fn serve_upgrade(socket: TcpStream, behavior: Behavior, recorded: Arc<Mutex<Vec<RecordedUpgrade>>>) {
    let mut port = 0u16;
    let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        let header = |name: HeaderName| {
            req.headers()
                .get(name)
                .and_then(|v: &HeaderValue| v.to_str().ok())
                .map(str::to_string)
        };
        let upgrade = RecordedUpgrade {
            uri: req.uri().to_string(),
            authorization: header(AUTHORIZATION),
            protocol: header(SEC_WEBSOCKET_PROTOCOL),
        };
        port = requested_port(&upgrade.uri);

        let seen = {
            let mut log = recorded.lock().unwrap();
            log.push(upgrade);
            log.len()
        };

        if matches!(behavior, Behavior::FirstOnly) && seen > 1 {
            let mut reject = ErrorResponse::new(Some("no more streams".to_string()));
            *reject.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            return Err(reject);
        }

        resp.headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(PORT_FORWARD_PROTOCOL));
        Ok(resp)
    };

    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(socket, callback).await else {
        return;
    };

    let header = port.to_le_bytes();
    if ws.send(frame(0, &header)).await.is_err() || ws.send(frame(1, &header)).await.is_err() {
        return;
    }
    if let Behavior::Greeting(bytes) = behavior {
        if ws.send(frame(0, bytes)).await.is_err() {
            return;
        }
    }

    // Keep reading after a close frame so the reply gets flushed
    while let Some(Ok(message)) = ws.next().await {
        let Message::Binary(data) = message else { continue };
        if data.first() != Some(&0) {
            continue;
        }
        let reply = match behavior {
            Behavior::ErrorOnData(text) => frame(1, text.as_bytes()),
            _ => Message::Binary(data),
        };
        if ws.send(reply).await.is_err() {
            break;
        }
    }
}

/// Cloneable in-memory writer for capturing tunnel output
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Captured out/err streams of one request
pub struct Captured {
    pub out: SharedBuf,
    pub err: SharedBuf,
}

impl Captured {
    pub fn streams(&self) -> IoStreams {
        IoStreams::new(self.out.clone(), self.err.clone())
    }
}

/// Ask the OS for a free local port
pub fn find_available_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("no free port")
}

/// A host URL where nothing is listening
pub fn unreachable_host() -> String {
    format!("http://127.0.0.1:{}", find_available_port())
}

/// Request for `default/web-0` on `local_port:80`, output captured
pub fn request(host: &str, local_port: u16) -> (TunnelRequest, Captured) {
    let captured = Captured {
        out: SharedBuf::default(),
        err: SharedBuf::default(),
    };
    let connection = ConnectionConfig::new(host).with_bearer_token(TEST_TOKEN);
    let request = TunnelRequest::new(
        connection,
        PodTarget::new("default", "web-0").unwrap(),
        ForwardSpec::new(local_port, 80).unwrap(),
    )
    .unwrap()
    .with_streams(captured.streams());
    (request, captured)
}

/// Result of running the CLI
#[derive(Debug)]
pub struct CliResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Run the CLI to completion with the given arguments
pub fn podforward(args: &[&str]) -> CliResponse {
    let output = Command::new(env!("CARGO_BIN_EXE_podforward"))
        .args(args)
        .env_remove("KUBECONFIG")
        .env_remove("PODFORWARD_SERVER")
        .env_remove("PODFORWARD_TOKEN")
        .env_remove("PODFORWARD_LOG")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("Failed to execute command");
    parse_output(output)
}

fn parse_output(output: Output) -> CliResponse {
    CliResponse {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(1),
    }
}
