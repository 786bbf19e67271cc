//! Kubeconfig handling
//!
//! Locates a kubeconfig file, parses it, and resolves one context into a
//! [`ConnectionConfig`] plus the context's default namespace.
//!
//! # Location order
//!
//! 1. An explicit path (`--kubeconfig`)
//! 2. The first existing entry of `$KUBECONFIG`
//! 3. `~/.kube/config`
//!
//! Only static credentials are supported: bearer tokens, token files, basic
//! auth and client certificates. Exec plugins and auth providers are rejected.

use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::Deserialize;
use tracing::debug;

use super::connection::{ConnectionConfig, Credentials, SecretString, TlsMaterial};
use crate::errors::{Result, TunnelError};

/// Environment variable holding a list of kubeconfig paths
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub users: Vec<NamedUser>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    pub current_context: Option<String>,
    /// Directory relative file references resolve against
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    pub server: Option<String>,
    pub certificate_authority: Option<PathBuf>,
    pub certificate_authority_data: Option<String>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedUser {
    pub name: String,
    #[serde(default)]
    pub user: User,
}

#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct User {
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
    pub client_certificate: Option<PathBuf>,
    pub client_certificate_data: Option<String>,
    pub client_key: Option<PathBuf>,
    pub client_key_data: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub exec: Option<serde_yaml::Value>,
    pub auth_provider: Option<serde_yaml::Value>,
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("token_file", &self.token_file)
            .field("client_certificate", &self.client_certificate)
            .field("client_key", &self.client_key)
            .field("username", &self.username)
            .field("exec", &self.exec.is_some())
            .field("auth_provider", &self.auth_provider.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Context {
    pub cluster: String,
    pub user: Option<String>,
    pub namespace: Option<String>,
}

/// Outcome of resolving one context
#[derive(Debug, Clone)]
pub struct ResolvedContext {
    pub context_name: String,
    pub connection: ConnectionConfig,
    /// Namespace configured on the context, if any
    pub namespace: Option<String>,
}

impl Kubeconfig {
    /// Parse kubeconfig YAML
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Read and parse a kubeconfig file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            TunnelError::Config(format!("Failed to read kubeconfig '{}': {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml(&content)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        debug!(path = %path.display(), contexts = config.contexts.len(), "Loaded kubeconfig");
        Ok(config)
    }

    /// Resolve `context` (or the current context) into a connection
    pub fn resolve(&self, context: Option<&str>) -> Result<ResolvedContext> {
        let context_name = context
            .map(str::to_string)
            .or_else(|| self.current_context.clone().filter(|c| !c.is_empty()))
            .ok_or_else(|| {
                TunnelError::Config("No context given and kubeconfig has no current-context".to_string())
            })?;

        let ctx = self
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .map(|c| &c.context)
            .ok_or_else(|| TunnelError::Config(format!("Context '{}' not found in kubeconfig", context_name)))?;

        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == ctx.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| TunnelError::Config(format!("Cluster '{}' not found in kubeconfig", ctx.cluster)))?;

        let default_user = User::default();
        let user = match &ctx.user {
            Some(name) => self
                .users
                .iter()
                .find(|u| &u.name == name)
                .map(|u| &u.user)
                .ok_or_else(|| TunnelError::Config(format!("User '{}' not found in kubeconfig", name)))?,
            None => &default_user,
        };

        let host = cluster
            .server
            .clone()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| TunnelError::Config(format!("Cluster '{}' has no server", ctx.cluster)))?;

        let tls = TlsMaterial {
            ca_pem: self.read_material(
                "certificate-authority",
                cluster.certificate_authority.as_deref(),
                cluster.certificate_authority_data.as_deref(),
            )?,
            client_cert_pem: self.read_material(
                "client-certificate",
                user.client_certificate.as_deref(),
                user.client_certificate_data.as_deref(),
            )?,
            client_key_pem: self.read_material(
                "client-key",
                user.client_key.as_deref(),
                user.client_key_data.as_deref(),
            )?,
            insecure_skip_verify: cluster.insecure_skip_tls_verify,
        };

        let connection = ConnectionConfig {
            host,
            credentials: self.credentials(user)?,
            tls,
            handshake_timeout: None,
        };

        Ok(ResolvedContext {
            context_name,
            connection,
            namespace: ctx.namespace.clone().filter(|n| !n.is_empty()),
        })
    }

    fn credentials(&self, user: &User) -> Result<Credentials> {
        if user.exec.is_some() || user.auth_provider.is_some() {
            return Err(TunnelError::Config(
                "Exec and auth-provider credentials are not supported; use a token or client certificate"
                    .to_string(),
            ));
        }

        if let Some(token) = user.token.as_ref().filter(|t| !t.is_empty()) {
            return Ok(Credentials::Bearer(SecretString(token.clone())));
        }

        if let Some(path) = &user.token_file {
            let path = self.resolve_path(path);
            let token = fs::read_to_string(&path).map_err(|e| {
                TunnelError::Config(format!("Failed to read token file '{}': {}", path.display(), e))
            })?;
            return Ok(Credentials::Bearer(SecretString(token.trim().to_string())));
        }

        if let Some(username) = &user.username {
            return Ok(Credentials::Basic {
                username: username.clone(),
                password: SecretString(user.password.clone().unwrap_or_default()),
            });
        }

        Ok(Credentials::None)
    }

    /// Inline `*-data` (base64) wins over the file reference
    fn read_material(&self, field: &str, path: Option<&Path>, data: Option<&str>) -> Result<Option<Vec<u8>>> {
        if let Some(data) = data.filter(|d| !d.trim().is_empty()) {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(data.trim())
                .map_err(|e| TunnelError::Config(format!("Invalid base64 in {}-data: {}", field, e)))?;
            return Ok(Some(decoded));
        }

        match path {
            Some(path) => {
                let path = self.resolve_path(path);
                let bytes = fs::read(&path).map_err(|e| {
                    TunnelError::Config(format!("Failed to read {} '{}': {}", field, path.display(), e))
                })?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// Find the kubeconfig file to use
pub fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
    let env_value = std::env::var_os(KUBECONFIG_ENV);
    locate_with(explicit, env_value.as_deref(), home::home_dir())
}

fn locate_with(
    explicit: Option<&Path>,
    env_value: Option<&std::ffi::OsStr>,
    home: Option<PathBuf>,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Some(value) = env_value {
        if let Some(found) = std::env::split_paths(value).find(|p| !p.as_os_str().is_empty() && p.exists()) {
            return Ok(found);
        }
    }

    home.map(|h| h.join(".kube").join("config"))
        .ok_or_else(|| TunnelError::Config("Could not find home directory for kubeconfig".to_string()))
}
