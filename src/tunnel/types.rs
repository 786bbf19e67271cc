//! Tunnel request types and data structures

use std::fmt;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::ConnectionConfig;
use crate::errors::{Result, TunnelError};
use crate::signals::{ReadySignal, StopSignal};
use super::dialer::TunnelDialer;

/// One `local:remote` port pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardSpec {
    pub local: u16,
    pub remote: u16,
}

impl ForwardSpec {
    pub fn new(local: u16, remote: u16) -> Result<Self> {
        if local == 0 || remote == 0 {
            return Err(TunnelError::Validation(format!(
                "Port numbers must be positive, got {}:{}",
                local, remote
            )));
        }
        Ok(Self { local, remote })
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

impl FromStr for ForwardSpec {
    type Err = TunnelError;

    /// Accepts `LOCAL:REMOTE`, or a single port forwarded to the same number
    fn from_str(s: &str) -> Result<Self> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|_| TunnelError::Validation(format!("Invalid port '{}' in '{}'", part, s)))
        };

        match s.split_once(':') {
            Some((local, remote)) => ForwardSpec::new(parse(local)?, parse(remote)?),
            None => {
                let port = parse(s)?;
                ForwardSpec::new(port, port)
            }
        }
    }
}

/// The pod a tunnel points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTarget {
    pub namespace: String,
    pub pod: String,
}

impl PodTarget {
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let pod = pod.into();
        check_name("namespace", &namespace)?;
        check_name("pod name", &pod)?;
        Ok(Self { namespace, pod })
    }

    /// Parse `NAME`, `pod/NAME` or `pods/NAME`
    pub fn parse(namespace: impl Into<String>, resource: &str) -> Result<Self> {
        let name = match resource.split_once('/') {
            Some(("pod" | "pods" | "po", name)) => name,
            Some((kind, _)) => {
                return Err(TunnelError::Validation(format!(
                    "Only pods can be forwarded to, got resource type '{}'",
                    kind
                )))
            }
            None => resource,
        };
        PodTarget::new(namespace, name)
    }
}

impl fmt::Display for PodTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod)
    }
}

fn check_name(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(TunnelError::Validation(format!("The {} must not be empty", what)));
    }
    if value.contains('/') {
        return Err(TunnelError::Validation(format!("Invalid {} '{}'", what, value)));
    }
    Ok(())
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Sinks for the tunnel's own diagnostic and error output
#[derive(Clone)]
pub struct IoStreams {
    out: SharedWriter,
    err: SharedWriter,
}

impl fmt::Debug for IoStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoStreams").finish_non_exhaustive()
    }
}

impl Default for IoStreams {
    fn default() -> Self {
        Self::stdio()
    }
}

impl IoStreams {
    pub fn new(out: impl Write + Send + 'static, err: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(out))),
            err: Arc::new(Mutex::new(Box::new(err))),
        }
    }

    pub fn stdio() -> Self {
        Self::new(std::io::stdout(), std::io::stderr())
    }

    /// Discard everything
    pub fn null() -> Self {
        Self::new(std::io::sink(), std::io::sink())
    }

    pub(crate) fn out_line(&self, line: fmt::Arguments<'_>) {
        write_line(&self.out, line);
    }

    pub(crate) fn err_line(&self, line: fmt::Arguments<'_>) {
        write_line(&self.err, line);
    }
}

fn write_line(writer: &SharedWriter, line: fmt::Arguments<'_>) {
    // Output is best effort; a closed stdout must not bring the tunnel down
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

/// Everything needed for one forward attempt.
///
/// Building the request validates the target and ports and prepares the
/// upgrade transport, so configuration mistakes surface here rather than in
/// the background task.
#[derive(Debug)]
pub struct TunnelRequest {
    connection: ConnectionConfig,
    target: PodTarget,
    ports: ForwardSpec,
    bind_address: IpAddr,
    streams: IoStreams,
    dialer: TunnelDialer,
    stop: StopSignal,
    ready: ReadySignal,
    launched: AtomicBool,
}

impl TunnelRequest {
    pub fn new(connection: ConnectionConfig, target: PodTarget, ports: ForwardSpec) -> Result<Self> {
        // Re-check in case the caller built the structs by hand
        let target = PodTarget::new(target.namespace, target.pod)?;
        let ports = ForwardSpec::new(ports.local, ports.remote)?;
        let dialer = TunnelDialer::new(&connection, &target, ports.remote)?;

        Ok(Self {
            connection,
            target,
            ports,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            streams: IoStreams::stdio(),
            dialer,
            stop: StopSignal::new(),
            ready: ReadySignal::new(),
            launched: AtomicBool::new(false),
        })
    }

    /// Local address to listen on (default `127.0.0.1`)
    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn with_streams(mut self, streams: IoStreams) -> Self {
        self.streams = streams;
        self
    }

    /// Share an existing stop gate, e.g. one wired to Ctrl+C
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }

    pub fn target(&self) -> &PodTarget {
        &self.target
    }

    pub fn ports(&self) -> ForwardSpec {
        self.ports
    }

    pub fn bind_address(&self) -> IpAddr {
        self.bind_address
    }

    pub fn streams(&self) -> &IoStreams {
        &self.streams
    }

    pub fn dialer(&self) -> &TunnelDialer {
        &self.dialer
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn ready_signal(&self) -> &ReadySignal {
        &self.ready
    }

    /// Reserve this request for its one and only session
    pub(crate) fn claim(&self) -> Result<()> {
        if self.launched.swap(true, Ordering::SeqCst) {
            return Err(TunnelError::Validation(format!(
                "A session was already started for {} ({})",
                self.target, self.ports
            )));
        }
        Ok(())
    }
}
