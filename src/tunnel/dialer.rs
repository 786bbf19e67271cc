//! Dialable handle for the pod port-forward endpoint

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::config::ConnectionConfig;
use crate::errors::{Result, TunnelError};
use super::protocol::PORT_FORWARD_PROTOCOL;
use super::types::PodTarget;
use super::upgrader::{ConnectionUpgrader, UpgradedTransport};

/// Upgraded connection to the API server
pub type TunnelStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Target URL bound to an upgrade transport
#[derive(Debug, Clone)]
pub struct TunnelDialer {
    transport: UpgradedTransport,
    target: Url,
    authority: String,
}

impl TunnelDialer {
    pub fn new(config: &ConnectionConfig, target: &PodTarget, remote_port: u16) -> Result<Self> {
        if target.namespace.trim().is_empty() || target.pod.trim().is_empty() {
            return Err(TunnelError::Validation(
                "Namespace and pod name are required".to_string(),
            ));
        }

        let transport = ConnectionUpgrader::upgrade(config)?;
        let target = portforward_url(transport.base(), target, remote_port)?;
        let authority = authority_of(&target)?;

        Ok(Self {
            transport,
            target,
            authority,
        })
    }

    /// `host[:port]` the socket connects to
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Full `ws`/`wss` URL of the port-forward subresource
    pub fn target_url(&self) -> &Url {
        &self.target
    }

    pub fn transport(&self) -> &UpgradedTransport {
        &self.transport
    }

    /// Connect and perform the upgrade handshake
    pub async fn dial(&self) -> Result<TunnelStream> {
        let mut request = self
            .target
            .as_str()
            .into_client_request()
            .map_err(|e| TunnelError::dial(format!("Invalid upgrade request: {}", e)))?;

        let headers = request.headers_mut();
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(PORT_FORWARD_PROTOCOL));
        if let Some(auth) = self.transport.authorization() {
            headers.insert(AUTHORIZATION, auth.clone());
        }

        tracing::debug!(authority = %self.authority, path = self.target.path(), "dialing");

        let connect = connect_async_tls_with_config(request, None, false, self.transport.connector());
        let outcome = match self.transport.handshake_timeout() {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                TunnelError::dial(format!(
                    "Upgrade handshake with {} timed out after {:.1} seconds",
                    self.authority,
                    limit.as_secs_f64()
                ))
            })?,
            None => connect.await,
        };

        let (stream, response) = outcome.map_err(|e| dial_error(&self.authority, e))?;
        tracing::debug!(
            authority = %self.authority,
            status = response.status().as_u16(),
            "upgrade complete"
        );
        Ok(stream)
    }
}

fn portforward_url(base: &Url, target: &PodTarget, remote_port: u16) -> Result<Url> {
    let mut url = base.clone();
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| TunnelError::Config(format!("Cannot use '{}' for an upgrade", base)))?;
    url.set_query(None);
    url.set_fragment(None);

    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| TunnelError::Config(format!("Cluster host URL '{}' cannot carry a path", base)))?;
        segments.pop_if_empty().extend([
            "api",
            "v1",
            "namespaces",
            target.namespace.as_str(),
            "pods",
            target.pod.as_str(),
            "portforward",
        ]);
    }

    url.query_pairs_mut().append_pair("ports", &remote_port.to_string());
    Ok(url)
}

fn authority_of(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| TunnelError::Config(format!("URL '{}' has no host", url)))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn dial_error(authority: &str, err: WsError) -> TunnelError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).trim().to_string())
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("no reason").to_string());
            TunnelError::Dial {
                status: Some(status.as_u16()),
                message: body,
            }
        }
        other => TunnelError::dial(format!("Failed to connect to {}: {}", authority, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialer(host: &str, namespace: &str, pod: &str) -> TunnelDialer {
        let target = PodTarget {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
        };
        TunnelDialer::new(&ConnectionConfig::new(host), &target, 80).unwrap()
    }

    #[test]
    fn test_target_url() {
        let d = dialer("https://10.0.0.1:6443", "default", "web-0");
        assert_eq!(
            d.target_url().as_str(),
            "wss://10.0.0.1:6443/api/v1/namespaces/default/pods/web-0/portforward?ports=80"
        );
        assert_eq!(d.authority(), "10.0.0.1:6443");
    }

    #[test]
    fn test_plain_http_maps_to_ws() {
        let d = dialer("http://127.0.0.1:8001", "kube-system", "dns");
        assert_eq!(d.target_url().scheme(), "ws");
    }

    #[test]
    fn test_authority_keeps_full_hostname() {
        // Stripping "https://" as a character set would eat the leading "sh"
        let d = dialer("https://shop.example.com", "default", "web-0");
        assert_eq!(d.authority(), "shop.example.com");

        let d = dialer("https://stash.example.com:8443", "default", "web-0");
        assert_eq!(d.authority(), "stash.example.com:8443");
    }

    #[test]
    fn test_base_path_is_preserved() {
        let d = dialer("https://rancher.example.com/k8s/clusters/c-1/", "default", "web-0");
        assert_eq!(
            d.target_url().path(),
            "/k8s/clusters/c-1/api/v1/namespaces/default/pods/web-0/portforward"
        );
    }

    #[test]
    fn test_segments_are_encoded() {
        let d = dialer("https://10.0.0.1", "default", "web 0");
        assert!(d.target_url().path().ends_with("/pods/web%200/portforward"));
    }

    #[test]
    fn test_query_is_replaced() {
        let d = dialer("https://10.0.0.1/?timeout=5", "default", "web-0");
        assert_eq!(d.target_url().query(), Some("ports=80"));
    }

    #[test]
    fn test_missing_names_are_validation_errors() {
        let target = PodTarget {
            namespace: "default".to_string(),
            pod: String::new(),
        };
        let err = TunnelDialer::new(&ConnectionConfig::new("https://10.0.0.1"), &target, 80).unwrap_err();
        assert!(matches!(err, TunnelError::Validation(_)));
    }

    #[test]
    fn test_transport_errors_propagate() {
        let target = PodTarget {
            namespace: "default".to_string(),
            pod: "web-0".to_string(),
        };
        let err = TunnelDialer::new(&ConnectionConfig::new("ftp://10.0.0.1"), &target, 80).unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));
    }

    #[tokio::test]
    async fn test_dial_refused_is_dial_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let d = dialer(&format!("http://127.0.0.1:{}", port), "default", "web-0");
        let err = d.dial().await.unwrap_err();
        assert!(matches!(err, TunnelError::Dial { status: None, .. }));
    }
}
