//! CLI argument definitions using clap

use clap::{ArgAction, Parser, ValueEnum};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::SecretString;
use crate::tunnel::ForwardSpec;

/// podforward - forward one local port to a port of a Kubernetes pod
#[derive(Parser, Debug, Clone)]
#[command(name = "podforward", version, about, long_about = None)]
pub struct Args {
    // =========================================================================
    // POSITIONAL ARGUMENTS
    // =========================================================================

    /// Pod to forward to: NAME, pod/NAME or pods/NAME
    #[arg(value_name = "POD")]
    pub pod: String,

    /// Port pair LOCAL:REMOTE, or a single PORT used on both sides
    #[arg(value_name = "PORTS")]
    pub ports: ForwardSpec,

    // =========================================================================
    // CLUSTER
    // =========================================================================

    /// Namespace of the pod (defaults to the context's namespace, then "default")
    #[arg(short = 'n', long = "namespace", value_name = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Path to the kubeconfig file
    #[arg(long = "kubeconfig", value_name = "FILE")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use instead of the current one
    #[arg(long = "context", value_name = "NAME")]
    pub context: Option<String>,

    /// API server URL; skips the kubeconfig when given
    #[arg(long = "server", value_name = "URL", env = "PODFORWARD_SERVER")]
    pub server: Option<String>,

    /// Bearer token for the API server
    #[arg(long = "token", value_name = "TOKEN", env = "PODFORWARD_TOKEN", hide_env_values = true)]
    pub token: Option<SecretString>,

    /// Skip verification of the API server certificate (insecure)
    #[arg(long = "insecure-skip-tls-verify", action = ArgAction::SetTrue)]
    pub insecure_skip_tls_verify: bool,

    // =========================================================================
    // TUNNEL
    // =========================================================================

    /// Local address to listen on
    #[arg(long = "address", value_name = "IP", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub address: IpAddr,

    /// Timeout for the upgrade handshake, e.g. 30s or 1m
    #[arg(long = "request-timeout", value_name = "DURATION", value_parser = parse_duration)]
    pub request_timeout: Option<Duration>,

    /// Give up if the tunnel is not ready within this time
    #[arg(long = "ready-timeout", value_name = "DURATION", value_parser = parse_duration)]
    pub ready_timeout: Option<Duration>,

    /// Exit the process with CODE as soon as forwarding fails
    #[arg(
        long = "exit-on-failure",
        value_name = "CODE",
        num_args = 0..=1,
        default_missing_value = "1"
    )]
    pub exit_on_failure: Option<i32>,

    // =========================================================================
    // TROUBLESHOOTING
    // =========================================================================

    /// Log filter directive, e.g. debug or podforward=trace (overrides PODFORWARD_LOG)
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Output format for diagnostic logs on stderr
    #[arg(long = "log-format", value_name = "FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Log format for structured output (CI/CD)
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Plain text output (default)
    #[default]
    Text,
    /// JSON Lines format for parsing
    Json,
}

/// Parse `30s`, `1m30s` or a bare number of seconds
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(secs) = s.trim().parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Ok(Duration::from_secs_f64(secs));
        }
        return Err(format!("invalid duration '{}'", s));
    }
    humantime::parse_duration(s.trim()).map_err(|e| format!("invalid duration '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("podforward").chain(args.iter().copied()))
    }

    #[test]
    fn test_minimal() {
        let args = parse(&["web-0", "8080:80"]).unwrap();
        assert_eq!(args.pod, "web-0");
        assert_eq!(args.ports, ForwardSpec { local: 8080, remote: 80 });
        assert_eq!(args.address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(args.log_format, LogFormat::Text);
        assert!(args.exit_on_failure.is_none());
    }

    #[test]
    fn test_all_options() {
        let args = parse(&[
            "-n", "shop",
            "--context", "staging",
            "--address", "0.0.0.0",
            "--request-timeout", "30s",
            "--ready-timeout", "2.5",
            "--exit-on-failure",
            "--log-format", "json",
            "pod/web-0",
            "5432",
        ])
        .unwrap();
        assert_eq!(args.namespace.as_deref(), Some("shop"));
        assert_eq!(args.context.as_deref(), Some("staging"));
        assert_eq!(args.address.to_string(), "0.0.0.0");
        assert_eq!(args.request_timeout, Some(Duration::from_secs(30)));
        assert_eq!(args.ready_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(args.exit_on_failure, Some(1));
        assert_eq!(args.log_format, LogFormat::Json);
        assert_eq!(args.ports, ForwardSpec { local: 5432, remote: 5432 });
    }

    #[test]
    fn test_exit_code_value() {
        let args = parse(&["--exit-on-failure=3", "web-0", "80"]).unwrap();
        assert_eq!(args.exit_on_failure, Some(3));
    }

    #[test]
    fn test_bad_ports_rejected() {
        assert!(parse(&["web-0", "0:80"]).is_err());
        assert!(parse(&["web-0", "http"]).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert!(parse_duration("-1").is_err());
        assert!(parse_duration("soon").is_err());
    }
}
