//! Connection configuration
//!
//! - [`connection`] - the resolved connection descriptor the tunnel consumes
//! - [`kubeconfig`] - loading that descriptor from a kubeconfig file

pub mod connection;
pub mod kubeconfig;

pub use connection::{ConnectionConfig, Credentials, SecretString, TlsMaterial};
pub use kubeconfig::{locate, Kubeconfig, ResolvedContext};
