//! Connection descriptor handed to the tunnel
//!
//! Everything the upgrade needs to reach the cluster API: host URL,
//! credentials and TLS material. Built either by hand or from a kubeconfig
//! (see [`super::kubeconfig`]).

use std::fmt;
use std::time::Duration;

use url::Url;

use crate::errors::{Result, TunnelError};

/// A string that redacts its value in Debug output to prevent credential leakage
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(pub String);

impl SecretString {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "SecretString(\"\")")
        } else {
            write!(f, "SecretString(\"[REDACTED]\")")
        }
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        SecretString(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        SecretString(s.to_string())
    }
}

impl std::str::FromStr for SecretString {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(SecretString(s.to_string()))
    }
}

/// How the upgrade request authenticates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    #[default]
    None,
    Bearer(SecretString),
    Basic {
        username: String,
        password: SecretString,
    },
}

/// PEM-encoded TLS material
#[derive(Clone, Default)]
pub struct TlsMaterial {
    /// CA bundle replacing the system roots
    pub ca_pem: Option<Vec<u8>>,
    /// Client certificate chain for mutual TLS
    pub client_cert_pem: Option<Vec<u8>>,
    /// Private key matching `client_cert_pem`
    pub client_key_pem: Option<Vec<u8>>,
    /// Accept any server certificate (insecure)
    pub insecure_skip_verify: bool,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = |v: &Option<Vec<u8>>| v.as_ref().map(|b| b.len());
        f.debug_struct("TlsMaterial")
            .field("ca_pem_bytes", &len(&self.ca_pem))
            .field("client_cert_pem_bytes", &len(&self.client_cert_pem))
            .field("client_key_pem", &self.client_key_pem.as_ref().map(|_| "[REDACTED]"))
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .finish()
    }
}

/// Resolved connection to a cluster API server
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    /// API server URL, e.g. `https://10.0.0.1:6443`
    pub host: String,
    pub credentials: Credentials,
    pub tls: TlsMaterial,
    /// Upper bound for connect + upgrade handshake
    pub handshake_timeout: Option<Duration>,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<SecretString>) -> Self {
        self.credentials = Credentials::Bearer(token.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsMaterial) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Parse and check the host URL.
    ///
    /// A host without a scheme is taken as `https`, matching how cluster
    /// clients treat bare `host:port` server entries.
    pub fn host_url(&self) -> Result<Url> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(TunnelError::Config("Cluster host URL is empty".to_string()));
        }

        let with_scheme = if host.contains("://") {
            host.to_string()
        } else {
            format!("https://{}", host)
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| TunnelError::Config(format!("Malformed cluster host URL '{}': {}", host, e)))?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(TunnelError::Config(format!(
                    "Unsupported scheme '{}' in cluster host URL (expected http or https)",
                    other
                )))
            }
        }

        if url.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(TunnelError::Config(format!("Cluster host URL '{}' has no host", host)));
        }

        Ok(url)
    }
}
