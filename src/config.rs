//! Configuration document for the shepherd.
//!
//! Loaded from a single JSON file mounted into the pod. Everything the join
//! sequence, the event watcher and the engine launcher need comes from here;
//! nothing is read from ambient global state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, ShepherdError};
use crate::retry::RetryPolicy;

/// TLS material for both the members API client and the engine listeners.
///
/// When enabled, client/server traffic uses the provided certificate pair and
/// peers are verified against the CA; peer-to-peer traffic relies on the
/// engine's auto-TLS.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    /// Enable TLS. If false, all other TLS settings are ignored.
    #[serde(default)]
    pub enabled: bool,

    /// CA certificate (PEM) used to verify the control API endpoint.
    pub ca_cert_path: Option<PathBuf>,

    /// Server certificate (PEM) handed to the engine.
    pub cert_path: Option<PathBuf>,

    /// Private key matching the certificate.
    pub key_path: Option<PathBuf>,
}

impl TlsConfig {
    /// Check if TLS is properly configured with all required files.
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }
}

/// Consensus-engine launch settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Path to the engine binary.
    #[serde(default = "default_engine_binary")]
    pub binary: PathBuf,

    /// Heartbeat interval override in milliseconds.
    pub heartbeat_interval_ms: Option<u64>,

    /// Election timeout override in milliseconds.
    pub election_timeout_ms: Option<u64>,

    /// Add a plaintext loopback client listener next to the TLS listener so
    /// local health checks do not need the cluster certificates.
    #[serde(default = "default_true")]
    pub insecure_loopback: bool,

    /// Opaque `--key=value` passthrough appended to the engine command line.
    #[serde(default)]
    pub extra_args: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: default_engine_binary(),
            heartbeat_interval_ms: None,
            election_timeout_ms: None,
            insecure_loopback: true,
            extra_args: BTreeMap::new(),
        }
    }
}

/// Retry budget for members-API calls.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            delay_secs: default_retry_delay_secs(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            delay: Duration::from_secs(self.delay_secs),
        }
    }
}

/// Best-effort mitigation for the concurrent-bootstrap race.
///
/// Two nodes probing an empty cluster at the same time can both decide to
/// bootstrap. None of the gates makes that impossible; they only shrink the
/// window, so the choice is left to the operator.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BootstrapGate {
    /// No mitigation; probe and decide immediately.
    #[default]
    None,
    /// Sleep a random number of seconds before attempting to join.
    Jitter { min_secs: u64, max_secs: u64 },
    /// Ask an external leader-elector sidecar who should bootstrap; every
    /// other node refuses to bootstrap and waits for the designated one.
    LeaderElector { url: String },
}

/// Lifecycle-event watcher settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    /// Pause between reconnects to the event feed. Floored at one second so a
    /// persistently failing feed cannot turn the outer loop into a hot loop.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Event reasons that mark a pod as permanently gone.
    #[serde(default = "default_trigger_reasons")]
    pub trigger_reasons: Vec<String>,

    /// Bearer token for the event feed.
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,

    /// CA certificate (PEM) for verifying the feed endpoint.
    pub ca_file: Option<PathBuf>,

    /// Feed base URL. Defaults to the in-cluster API server address taken
    /// from the environment.
    pub api_url: Option<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: default_reconnect_delay_secs(),
            trigger_reasons: default_trigger_reasons(),
            token_file: default_token_file(),
            ca_file: None,
            api_url: None,
        }
    }
}

impl WatcherConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShepherdConfig {
    /// Cluster token shared by every member of the ring.
    pub token: String,

    /// Namespace the cluster runs in; also the event-feed filter.
    pub namespace: String,

    /// Service name fronting the cluster members.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// DNS suffix of the cluster domain.
    #[serde(default = "default_cluster_domain")]
    pub cluster_domain: String,

    #[serde(default = "default_client_port")]
    pub client_port: u16,

    #[serde(default = "default_server_port")]
    pub server_port: u16,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub bootstrap_gate: BootstrapGate,

    #[serde(default)]
    pub watcher: WatcherConfig,
}

impl ShepherdConfig {
    /// Load and validate the configuration file.
    pub async fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "loading configuration");
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            ShepherdError::Configuration(format!("cannot read {}: {}", path.display(), err))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|err| {
            ShepherdError::Configuration(format!("cannot parse {}: {}", path.display(), err))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(ShepherdError::Configuration(
                "cluster token must not be empty".to_string(),
            ));
        }
        if self.namespace.is_empty() {
            return Err(ShepherdError::Configuration(
                "namespace must not be empty".to_string(),
            ));
        }
        if self.tls.enabled && !self.tls.is_complete() {
            return Err(ShepherdError::Configuration(
                "tls is enabled but ca_cert_path, cert_path and key_path are not all set"
                    .to_string(),
            ));
        }
        if let BootstrapGate::Jitter { min_secs, max_secs } = &self.bootstrap_gate {
            if min_secs > max_secs {
                return Err(ShepherdError::Configuration(
                    "bootstrap_gate jitter min_secs must not exceed max_secs".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// URL scheme the cluster speaks on its client and peer ports.
    pub fn scheme(&self) -> &'static str {
        if self.tls.enabled {
            "https"
        } else {
            "http"
        }
    }

    /// FQDN of the service fronting the cluster.
    pub fn service_fqdn(&self) -> String {
        format!(
            "{}.{}.svc.{}",
            self.service_name, self.namespace, self.cluster_domain
        )
    }

    /// Members control API endpoint.
    pub fn members_url(&self) -> String {
        format!(
            "{}://{}:{}/v2/members",
            self.scheme(),
            self.service_fqdn(),
            self.client_port
        )
    }
}

fn default_engine_binary() -> PathBuf {
    PathBuf::from("/usr/local/bin/etcd")
}

fn default_true() -> bool {
    true
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_delay_secs() -> u64 {
    2
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_trigger_reasons() -> Vec<String> {
    vec!["NodeControllerEviction".to_string(), "Killing".to_string()]
}

fn default_token_file() -> PathBuf {
    PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token")
}

fn default_service_name() -> String {
    "etcd".to_string()
}

fn default_cluster_domain() -> String {
    "cluster.local".to_string()
}

fn default_client_port() -> u16 {
    2379
}

fn default_server_port() -> u16 {
    2380
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> ShepherdConfig {
        serde_json::from_str(r#"{"token": "etcd-cluster", "namespace": "ccp"}"#).unwrap()
    }

    #[test]
    fn defaults_fill_in() {
        let cfg = minimal();
        assert_eq!(cfg.service_name, "etcd");
        assert_eq!(cfg.cluster_domain, "cluster.local");
        assert_eq!(cfg.client_port, 2379);
        assert_eq!(cfg.server_port, 2380);
        assert!(!cfg.tls.enabled);
        assert_eq!(cfg.retry.attempts, 5);
        assert_eq!(cfg.retry.delay_secs, 2);
        assert_eq!(cfg.bootstrap_gate, BootstrapGate::None);
        assert_eq!(
            cfg.watcher.trigger_reasons,
            vec!["NodeControllerEviction", "Killing"]
        );
    }

    #[test]
    fn derived_urls() {
        let cfg = minimal();
        assert_eq!(cfg.service_fqdn(), "etcd.ccp.svc.cluster.local");
        assert_eq!(
            cfg.members_url(),
            "http://etcd.ccp.svc.cluster.local:2379/v2/members"
        );
    }

    #[test]
    fn tls_switches_scheme() {
        let mut cfg = minimal();
        cfg.tls.enabled = true;
        assert_eq!(cfg.scheme(), "https");
        assert!(cfg.members_url().starts_with("https://"));
    }

    #[test]
    fn validate_rejects_empty_token() {
        let mut cfg = minimal();
        cfg.token.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_incomplete_tls() {
        let mut cfg = minimal();
        cfg.tls.enabled = true;
        cfg.tls.cert_path = Some(PathBuf::from("/tls/cert.pem"));
        assert!(cfg.validate().is_err());

        cfg.tls.ca_cert_path = Some(PathBuf::from("/tls/ca.pem"));
        cfg.tls.key_path = Some(PathBuf::from("/tls/key.pem"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_jitter() {
        let mut cfg = minimal();
        cfg.bootstrap_gate = BootstrapGate::Jitter {
            min_secs: 20,
            max_secs: 2,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bootstrap_gate_parses_tagged_variants() {
        let cfg: ShepherdConfig = serde_json::from_str(
            r#"{
                "token": "t",
                "namespace": "ns",
                "bootstrap_gate": {"mode": "leader_elector", "url": "http://127.0.0.1:4040/"}
            }"#,
        )
        .unwrap();
        assert_eq!(
            cfg.bootstrap_gate,
            BootstrapGate::LeaderElector {
                url: "http://127.0.0.1:4040/".to_string()
            }
        );

        let cfg: ShepherdConfig = serde_json::from_str(
            r#"{
                "token": "t",
                "namespace": "ns",
                "bootstrap_gate": {"mode": "jitter", "min_secs": 2, "max_secs": 20}
            }"#,
        )
        .unwrap();
        assert_eq!(
            cfg.bootstrap_gate,
            BootstrapGate::Jitter {
                min_secs: 2,
                max_secs: 20
            }
        );
    }

    #[test]
    fn reconnect_delay_has_a_floor() {
        let mut cfg = minimal();
        cfg.watcher.reconnect_delay_secs = 0;
        assert_eq!(cfg.watcher.reconnect_delay(), Duration::from_secs(1));
        cfg.watcher.reconnect_delay_secs = 7;
        assert_eq!(cfg.watcher.reconnect_delay(), Duration::from_secs(7));
    }

    #[test]
    fn engine_extra_args_parse() {
        let cfg: ShepherdConfig = serde_json::from_str(
            r#"{
                "token": "t",
                "namespace": "ns",
                "engine": {"extra_args": {"snapshot-count": "5000"}}
            }"#,
        )
        .unwrap();
        assert_eq!(
            cfg.engine.extra_args.get("snapshot-count").map(String::as_str),
            Some("5000")
        );
        assert!(cfg.engine.insecure_loopback);
    }
}
