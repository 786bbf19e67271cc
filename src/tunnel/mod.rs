//! Pod port-forward tunnel
//!
//! Layers, leaves first:
//! - [`upgrader`] - connection config to upgrade-capable transport
//! - [`dialer`] - port-forward URL bound to that transport
//! - [`protocol`] / [`channel`] - channel framing over the upgraded stream
//! - [`session`] - local listener and byte relay
//! - [`coordinator`] - background task, ready/stop signaling

pub mod channel;
pub mod coordinator;
pub mod dialer;
pub mod protocol;
pub mod session;
pub mod types;
pub mod upgrader;

pub use coordinator::{
    wait_for_forwarding, FailurePolicy, ForwardContext, Forwarder, ForwardingHandle,
    LifecycleCoordinator,
};
pub use dialer::{TunnelDialer, TunnelStream};
pub use session::PortForwardSession;
pub use types::{ForwardSpec, IoStreams, PodTarget, TunnelRequest};
pub use upgrader::{ConnectionUpgrader, UpgradedTransport};
