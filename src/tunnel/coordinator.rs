//! Runs a forwarding session in the background and reports how it started
//!
//! The caller blocks in [`LifecycleCoordinator::wait_for_forwarding`] until
//! the session is either ready or has failed, never both. Failures that
//! happen after the session became ready are reported by
//! [`ForwardingHandle::finished`].

use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::errors::{Result, TunnelError};
use crate::signals::{ReadySignal, StopSignal, TunnelState};
use super::session::PortForwardSession;
use super::types::TunnelRequest;

/// A long-running forwarding loop.
///
/// Implementations call [`ForwardContext::mark_ready`] once their data path
/// is live and return when stopped or on a terminal error.
pub trait Forwarder: Send + 'static {
    fn run(self, ctx: ForwardContext) -> impl Future<Output = Result<()>> + Send;
}

/// The task side of the lifecycle signals
#[derive(Debug)]
pub struct ForwardContext {
    ready: ReadySignal,
    stop: StopSignal,
}

impl ForwardContext {
    pub fn mark_dialing(&self) {
        self.ready.transition(TunnelState::Dialing);
    }

    /// Open the ready gate; only the first call has any effect
    pub fn mark_ready(&self, local_addr: SocketAddr) -> bool {
        self.ready.mark_ready(local_addr)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    pub async fn stopped(&self) {
        self.stop.stopped().await
    }
}

/// What to do when forwarding fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Return the error to the caller
    #[default]
    Report,
    /// Print the error and exit the process with this code
    ExitProcess(i32),
}

impl FailurePolicy {
    /// A requested stop is not a failure and is always returned
    fn escalate(self, err: TunnelError) -> TunnelError {
        if matches!(err, TunnelError::Cancelled) {
            return err;
        }
        if let FailurePolicy::ExitProcess(code) = self {
            tracing::error!(error = %err, code, "forwarding failed, exiting");
            eprintln!("error: {}", err);
            std::process::exit(code);
        }
        err
    }
}

/// Starts sessions and waits for them to become ready
#[derive(Debug, Clone, Default)]
pub struct LifecycleCoordinator {
    policy: FailurePolicy,
}

impl LifecycleCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: FailurePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Start forwarding for `request` and wait until it is ready or failed
    pub async fn wait_for_forwarding(&self, request: &TunnelRequest) -> Result<ForwardingHandle> {
        request.claim()?;
        let session = PortForwardSession::new(request);
        self.launch(
            session,
            request.ready_signal().clone(),
            request.stop_signal().clone(),
        )
        .await
    }

    /// Spawn `forwarder` and wait until it opens `ready` or fails
    pub async fn launch<F: Forwarder>(
        &self,
        forwarder: F,
        ready: ReadySignal,
        stop: StopSignal,
    ) -> Result<ForwardingHandle> {
        let (failure_tx, mut failure_rx) = oneshot::channel::<TunnelError>();
        let ctx = ForwardContext {
            ready: ready.clone(),
            stop: stop.clone(),
        };

        let gate = ready.clone();
        let task = tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(forwarder.run(ctx)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(TunnelError::Stream(format!(
                    "Forwarding task panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };

            let outcome = match outcome {
                Ok(()) if !gate.is_set() => Err(TunnelError::Cancelled),
                other => other,
            };
            gate.finish(outcome.as_ref().err());

            // The gate is terminal now, so is_set() can no longer change
            if gate.is_set() {
                return outcome;
            }
            if let Err(err) = outcome {
                tracing::debug!(error = %err, "forwarding failed before ready");
                let _ = failure_tx.send(err);
            }
            Ok(())
        });

        let failure = tokio::select! {
            biased;
            failure = &mut failure_rx => failure.ok(),
            local_addr = ready.wait_ready() => match local_addr {
                Some(_) => None,
                None => (&mut failure_rx).await.ok(),
            },
        };

        if let Some(err) = failure {
            return Err(self.policy.escalate(err));
        }

        match ready.local_addr() {
            Some(local_addr) => Ok(ForwardingHandle {
                local_addr,
                ready,
                stop,
                task,
                policy: self.policy,
            }),
            None => Err(self.policy.escalate(TunnelError::Stream(
                "Forwarding task ended without reporting a result".to_string(),
            ))),
        }
    }
}

/// Start forwarding with the default [`FailurePolicy`]
pub async fn wait_for_forwarding(request: &TunnelRequest) -> Result<ForwardingHandle> {
    LifecycleCoordinator::new().wait_for_forwarding(request).await
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A forwarding session that became ready.
///
/// Dropping the handle does not stop the session; call [`ForwardingHandle::stop`]
/// or set the request's stop signal.
#[derive(Debug)]
pub struct ForwardingHandle {
    local_addr: SocketAddr,
    ready: ReadySignal,
    stop: StopSignal,
    task: JoinHandle<Result<()>>,
    policy: FailurePolicy,
}

impl ForwardingHandle {
    /// Address the local listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> TunnelState {
        self.ready.state()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to end and return its terminal result
    pub async fn finished(self) -> Result<()> {
        let outcome = match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(TunnelError::Stream(format!("Forwarding task failed: {}", e))),
        };
        outcome.map_err(|e| self.policy.escalate(e))
    }

    /// Stop the session and wait for it to wind down
    pub async fn shutdown(self) -> Result<()> {
        self.stop();
        self.finished().await
    }
}
