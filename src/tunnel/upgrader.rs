//! Builds the transport that performs the protocol upgrade
//!
//! Turns a [`ConnectionConfig`] into everything the handshake needs: the
//! parsed host URL, a rustls client config for `https` hosts and the
//! `Authorization` header.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::Connector;
use url::Url;

use crate::config::{ConnectionConfig, Credentials, TlsMaterial};
use crate::errors::{Result, TunnelError};

/// Transport able to upgrade a connection to the cluster API
#[derive(Clone)]
pub struct UpgradedTransport {
    base: Url,
    tls: Option<Arc<ClientConfig>>,
    authorization: Option<HeaderValue>,
    handshake_timeout: Option<Duration>,
}

impl fmt::Debug for UpgradedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradedTransport")
            .field("base", &self.base.as_str())
            .field("tls", &self.tls.is_some())
            .field("authorization", &self.authorization.as_ref().map(|_| "[REDACTED]"))
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl UpgradedTransport {
    /// Host URL of the API server
    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn authorization(&self) -> Option<&HeaderValue> {
        self.authorization.as_ref()
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout
    }

    /// Connector for one handshake
    pub(crate) fn connector(&self) -> Option<Connector> {
        self.tls.clone().map(Connector::Rustls)
    }
}

/// Derives an [`UpgradedTransport`] from a connection descriptor
pub struct ConnectionUpgrader;

impl ConnectionUpgrader {
    pub fn upgrade(config: &ConnectionConfig) -> Result<UpgradedTransport> {
        let base = config.host_url()?;

        let tls = if base.scheme() == "https" {
            Some(Arc::new(tls_config(&config.tls)?))
        } else {
            if config.tls.insecure_skip_verify || config.tls.ca_pem.is_some() {
                tracing::warn!(host = %base, "TLS settings ignored for plain http host");
            }
            None
        };

        let authorization = authorization_header(&config.credentials)?;

        tracing::debug!(
            host = %base,
            tls = tls.is_some(),
            authenticated = authorization.is_some(),
            "prepared upgrade transport"
        );

        Ok(UpgradedTransport {
            base,
            tls,
            authorization,
            handshake_timeout: config.handshake_timeout,
        })
    }
}

fn authorization_header(credentials: &Credentials) -> Result<Option<HeaderValue>> {
    let value = match credentials {
        Credentials::None => return Ok(None),
        Credentials::Bearer(token) => format!("Bearer {}", token.as_str().trim()),
        Credentials::Basic { username, password } => {
            let raw = format!("{}:{}", username, password.as_str());
            format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(raw))
        }
    };

    let mut header = HeaderValue::from_str(&value)
        .map_err(|_| TunnelError::Config("Credentials contain invalid header characters".to_string()))?;
    header.set_sensitive(true);
    Ok(Some(header))
}

fn tls_config(tls: &TlsMaterial) -> Result<ClientConfig> {
    // Another provider may already be installed process-wide
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let builder = if tls.insecure_skip_verify {
        tracing::warn!("TLS certificate verification is disabled");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
    } else {
        ClientConfig::builder().with_root_certificates(root_store(tls)?)
    };

    match (&tls.client_cert_pem, &tls.client_key_pem) {
        (Some(cert), Some(key)) => {
            let chain = parse_certs(cert, "client certificate")?;
            let key = parse_key(key)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| TunnelError::Config(format!("Invalid client certificate: {}", e)))
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(TunnelError::Config(
            "Client certificate and key must be configured together".to_string(),
        )),
    }
}

fn root_store(tls: &TlsMaterial) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();

    if let Some(ca) = &tls.ca_pem {
        for cert in parse_certs(ca, "CA bundle")? {
            store
                .add(cert)
                .map_err(|e| TunnelError::Config(format!("Invalid CA certificate: {}", e)))?;
        }
        return Ok(store);
    }

    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        store.add(cert).ok();
    }
    if store.is_empty() {
        store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    Ok(store)
}

fn parse_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Config(format!("Malformed PEM in {}: {}", what, e)))?;
    if certs.is_empty() {
        return Err(TunnelError::Config(format!("No certificates found in {}", what)));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| TunnelError::Config(format!("Malformed PEM in client key: {}", e)))?
        .ok_or_else(|| TunnelError::Config("No private key found in client key data".to_string()))
}

/// Certificate verifier that accepts all certificates (insecure)
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
