use clap::Parser;

use crate::cli::Args;
use crate::config::{self, ConnectionConfig, Credentials, Kubeconfig};
use crate::errors::{Result, TunnelError};
use crate::logging;
use crate::signals::{self, StopSignal};
use crate::status::ExitStatus;
use crate::tunnel::{FailurePolicy, IoStreams, LifecycleCoordinator, PodTarget, TunnelRequest};

/// Namespace used when neither the flag nor the context names one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Main entry point for the CLI.
///
/// Parses arguments, sets up logging and Ctrl+C handling, then forwards
/// until stopped or failed.
pub fn run(args: Vec<String>) -> ExitStatus {
    let parsed = match Args::try_parse_from(&args) {
        Ok(args) => args,
        Err(e) => {
            e.print().ok();
            return if e.kind() == clap::error::ErrorKind::DisplayHelp
                || e.kind() == clap::error::ErrorKind::DisplayVersion {
                ExitStatus::Success
            } else {
                ExitStatus::Error
            };
        }
    };

    if let Err(e) = logging::init(parsed.log_level.as_deref(), parsed.log_format) {
        return handle_error(e);
    }

    let stop = StopSignal::new();
    if let Err(e) = signals::install_interrupt_handler(stop.clone()) {
        return handle_error(e);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => return handle_error(TunnelError::Io(e)),
    };

    match runtime.block_on(program(parsed, IoStreams::stdio(), stop)) {
        Ok(status) => status,
        Err(e) => handle_error(e),
    }
}

pub async fn program(args: Args, streams: IoStreams, stop: StopSignal) -> Result<ExitStatus> {
    tracing::debug!(?args, "starting");

    let (connection, context_namespace) = resolve_connection(&args)?;
    let namespace = args
        .namespace
        .clone()
        .or(context_namespace)
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    let target = PodTarget::parse(namespace, &args.pod)?;

    let request = TunnelRequest::new(connection, target, args.ports)?
        .with_bind_address(args.address)
        .with_streams(streams)
        .with_stop_signal(stop);

    let coordinator = match args.exit_on_failure {
        Some(code) => LifecycleCoordinator::with_policy(FailurePolicy::ExitProcess(code)),
        None => LifecycleCoordinator::new(),
    };

    let wait = coordinator.wait_for_forwarding(&request);
    let handle = match args.ready_timeout {
        Some(limit) => match tokio::time::timeout(limit, wait).await {
            Ok(handle) => handle?,
            Err(_) => {
                request.stop_signal().stop();
                return Err(TunnelError::Timeout(limit.as_secs_f64()));
            }
        },
        None => wait.await?,
    };

    tracing::info!(local = %handle.local_addr(), pod = %request.target(), "forwarding");
    let outcome = handle.finished().await;

    if signals::was_interrupted() {
        return Ok(ExitStatus::Interrupted);
    }
    outcome?;
    Ok(ExitStatus::Success)
}

/// Connection from `--server` or the kubeconfig, with flag overrides applied
fn resolve_connection(args: &Args) -> Result<(ConnectionConfig, Option<String>)> {
    let (mut connection, namespace) = match &args.server {
        Some(server) => (ConnectionConfig::new(server.clone()), None),
        None => {
            let path = config::locate(args.kubeconfig.as_deref())?;
            let resolved = Kubeconfig::load(&path)?.resolve(args.context.as_deref())?;
            tracing::debug!(context = %resolved.context_name, "using kubeconfig context");
            (resolved.connection, resolved.namespace)
        }
    };

    if let Some(token) = &args.token {
        connection.credentials = Credentials::Bearer(token.clone());
    }
    if args.insecure_skip_tls_verify {
        connection.tls.insecure_skip_verify = true;
    }
    if let Some(timeout) = args.request_timeout {
        connection.handshake_timeout = Some(timeout);
    }

    Ok((connection, namespace))
}

fn handle_error(error: TunnelError) -> ExitStatus {
    tracing::debug!(error = ?error, "exiting with error");
    eprintln!("error: {}", error);

    if signals::was_interrupted() {
        return ExitStatus::Interrupted;
    }
    // All errors return the same exit code (1) following Unix conventions
    ExitStatus::Error
}
