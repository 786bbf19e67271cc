//! podforward library interface
//!
//! Forwards one local TCP port to a port of a Kubernetes pod over an
//! upgraded, channel-multiplexed connection to the cluster API server.
//!
//! # Module Organization
//!
//! - [`tunnel`] - Upgrade transport, dialer, session and lifecycle coordination
//! - [`config`] - Connection descriptor and kubeconfig loading
//! - [`signals`] - Ready/stop signals and interrupt handling
//! - [`errors`] - Error types (TunnelError, ErrorKind, Result)
//! - [`status`] - Exit status codes (ExitStatus)
//! - [`logging`] - tracing subscriber setup
//! - [`core`] - Main execution logic

pub mod cli;
pub mod config;
pub mod core;
pub mod errors;
pub mod logging;
pub mod signals;
pub mod status;
pub mod tunnel;

pub use errors::{ErrorKind, Result, TunnelError};
pub use signals::{ReadySignal, StopSignal, TunnelState};
pub use tunnel::{
    wait_for_forwarding, FailurePolicy, ForwardSpec, ForwardingHandle, IoStreams,
    LifecycleCoordinator, PodTarget, TunnelRequest,
};
