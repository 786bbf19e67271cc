//! Lifecycle signals shared between a caller and its forwarding task
//!
//! - [`StopSignal`] is written by the caller and observed by the task.
//! - [`ReadySignal`] is written by the task and observed by any number of waiters.
//!
//! Also hosts the process-wide Ctrl+C handling used by the binary.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::errors::{Result, TunnelError};

/// Lifecycle state of one tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Created,
    Dialing,
    Ready,
    Closed,
    Failed(String),
}

impl TunnelState {
    /// Closed and Failed never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::Failed(_))
    }

    fn can_become(&self, next: &TunnelState) -> bool {
        use TunnelState::*;
        match (self, next) {
            (Created, Dialing) => true,
            (Created | Dialing, Ready) => true,
            (Created | Dialing | Ready, Closed | Failed(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct Lifecycle {
    state: TunnelState,
    local_addr: Option<SocketAddr>,
}

/// One-shot gate set when the tunnel's data path is live.
///
/// The gate is sticky: once set it stays set after the tunnel closes, and
/// [`ReadySignal::local_addr`] keeps reporting where the listener was bound.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    tx: Arc<watch::Sender<Lifecycle>>,
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadySignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Lifecycle {
            state: TunnelState::Created,
            local_addr: None,
        });
        Self { tx: Arc::new(tx) }
    }

    /// Current lifecycle state
    pub fn state(&self) -> TunnelState {
        self.tx.borrow().state.clone()
    }

    /// Whether the tunnel ever became ready
    pub fn is_set(&self) -> bool {
        self.tx.borrow().local_addr.is_some()
    }

    /// Address of the local listener once ready
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tx.borrow().local_addr
    }

    /// Wait until the tunnel is ready or has settled without becoming ready.
    ///
    /// Returns the listener address in the first case and `None` in the second.
    pub async fn wait_ready(&self) -> Option<SocketAddr> {
        let mut rx = self.tx.subscribe();
        let settled = rx
            .wait_for(|l| l.local_addr.is_some() || l.state.is_terminal())
            .await
            .ok()?
            .local_addr;
        settled
    }

    pub(crate) fn transition(&self, next: TunnelState) -> bool {
        self.tx.send_if_modified(|l| {
            if l.state.can_become(&next) {
                l.state = next;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn mark_ready(&self, local_addr: SocketAddr) -> bool {
        self.tx.send_if_modified(|l| {
            if l.local_addr.is_some() || !l.state.can_become(&TunnelState::Ready) {
                return false;
            }
            l.state = TunnelState::Ready;
            l.local_addr = Some(local_addr);
            true
        })
    }

    pub(crate) fn finish(&self, failure: Option<&TunnelError>) {
        let next = match failure {
            Some(err) => TunnelState::Failed(err.to_string()),
            None => TunnelState::Closed,
        };
        self.transition(next);
    }
}

/// One-shot stop gate; setting it more than once has no further effect
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request teardown
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`StopSignal::stop`] has been called
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

/// Global flag for Ctrl+C interrupt handling
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if the application was interrupted (Ctrl+C pressed)
#[inline]
pub fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Route Ctrl+C to `stop`.
///
/// The first interrupt stops the tunnel so sockets are closed properly; a
/// second one exits immediately with status 130.
pub fn install_interrupt_handler(stop: StopSignal) -> Result<()> {
    ctrlc::set_handler(move || {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            std::process::exit(crate::status::ExitStatus::Interrupted as i32);
        }
        eprintln!("\nInterrupted");
        stop.stop();
    })
    .map_err(|e| TunnelError::Config(format!("Failed to install Ctrl+C handler: {}", e)))
}
