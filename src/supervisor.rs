//! Launching and minding the consensus engine.
//!
//! Translates a [`JoinPlan`] into the engine's startup arguments and runs the
//! binary in the foreground. The engine exiting for any reason is fatal: the
//! orchestrator observes our exit and restarts the whole node, which re-runs
//! the join sequence from scratch.

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::ShepherdConfig;
use crate::error::{Result, ShepherdError};
use crate::identity::NodeIdentity;
use crate::planner::JoinPlan;

pub struct ProcessSupervisor {
    pub config: ShepherdConfig,
    pub identity: NodeIdentity,
}

impl ProcessSupervisor {
    pub fn new(config: ShepherdConfig, identity: NodeIdentity) -> Self {
        Self { config, identity }
    }

    /// Engine command line for the given plan.
    pub fn engine_args(&self, plan: &JoinPlan) -> Vec<String> {
        let (name, peer_url) = match plan {
            JoinPlan::Bootstrap { name, peer_url } => (name, peer_url),
            JoinPlan::Join { name, peer_url, .. } => (name, peer_url),
        };
        let client_url = &self.identity.client_url;

        // Local health checks go through a plaintext loopback listener so
        // they do not need the cluster certificates.
        let mut listen_clients = client_url.clone();
        if self.config.tls.enabled && self.config.engine.insecure_loopback {
            listen_clients.push_str(&format!(",http://127.0.0.1:{}", self.config.client_port));
        }

        let mut args = vec![
            format!("--name={}", name),
            format!("--listen-peer-urls={}", peer_url),
            format!("--listen-client-urls={}", listen_clients),
            format!("--advertise-client-urls={}", client_url),
            format!("--initial-advertise-peer-urls={}", peer_url),
            format!("--initial-cluster-token={}", self.config.token),
        ];

        if self.config.tls.enabled {
            args.push("--peer-auto-tls".to_string());
            if let Some(cert) = &self.config.tls.cert_path {
                args.push(format!("--cert-file={}", cert.display()));
            }
            if let Some(key) = &self.config.tls.key_path {
                args.push(format!("--key-file={}", key.display()));
            }
        }

        if let Some(ms) = self.config.engine.heartbeat_interval_ms {
            args.push(format!("--heartbeat-interval={}", ms));
        }
        if let Some(ms) = self.config.engine.election_timeout_ms {
            args.push(format!("--election-timeout={}", ms));
        }

        match plan {
            JoinPlan::Bootstrap { name, peer_url } => {
                args.push(format!("--initial-cluster={}={}", name, peer_url));
            }
            JoinPlan::Join {
                initial_cluster, ..
            } => {
                args.push("--initial-cluster-state=existing".to_string());
                args.push(format!("--initial-cluster={}", initial_cluster));
            }
        }

        for (key, value) in &self.config.engine.extra_args {
            args.push(format!("--{}={}", key, value));
        }

        args
    }

    /// Run the engine until it exits or shutdown is requested.
    ///
    /// An engine exit of any kind while we are not shutting down is fatal.
    /// On shutdown the child is stopped and reaped so the node terminates
    /// promptly instead of blocking on the engine until the orchestrator
    /// escalates to SIGKILL.
    pub async fn run(&self, plan: JoinPlan, shutdown: CancellationToken) -> Result<()> {
        let args = self.engine_args(&plan);
        tracing::info!(
            binary = %self.config.engine.binary.display(),
            args = ?args,
            "launching consensus engine"
        );
        let mut child = Command::new(&self.config.engine.binary)
            .args(&args)
            .spawn()?;
        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    tracing::info!("consensus engine exited cleanly");
                    Ok(())
                } else {
                    Err(ShepherdError::EngineExited(status))
                }
            }
            _ = shutdown.cancelled() => {
                tracing::info!("shutdown requested, stopping consensus engine");
                child.kill().await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config(raw: &str) -> ShepherdConfig {
        serde_json::from_str(raw).unwrap()
    }

    fn supervisor(cfg: ShepherdConfig) -> ProcessSupervisor {
        let identity = NodeIdentity::from_hostname("etcd-0".to_string(), &cfg);
        ProcessSupervisor::new(cfg, identity)
    }

    fn bootstrap_plan(sup: &ProcessSupervisor) -> JoinPlan {
        JoinPlan::Bootstrap {
            name: sup.identity.name.clone(),
            peer_url: sup.identity.peer_url.clone(),
        }
    }

    #[test]
    fn bootstrap_args_carry_single_member_cluster() {
        let sup = supervisor(config(r#"{"token": "tok", "namespace": "ccp"}"#));
        let args = sup.engine_args(&bootstrap_plan(&sup));

        let name = "etcd-0.etcd.ccp.svc.cluster.local";
        assert!(args.contains(&format!("--name={}", name)));
        assert!(args.contains(&format!("--initial-cluster={}=http://{}:2380", name, name)));
        assert!(args.contains(&"--initial-cluster-token=tok".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--initial-cluster-state")));
    }

    #[test]
    fn join_args_carry_existing_state_and_peer_set() {
        let sup = supervisor(config(r#"{"token": "tok", "namespace": "ccp"}"#));
        let plan = JoinPlan::Join {
            name: sup.identity.name.clone(),
            peer_url: sup.identity.peer_url.clone(),
            initial_cluster: "n2=http://10.0.0.2:2380,n1=http://10.0.0.1:2380".to_string(),
        };
        let args = sup.engine_args(&plan);

        assert!(args.contains(&"--initial-cluster-state=existing".to_string()));
        assert!(args.contains(
            &"--initial-cluster=n2=http://10.0.0.2:2380,n1=http://10.0.0.1:2380".to_string()
        ));
    }

    #[test]
    fn tls_adds_certificates_and_loopback_listener() {
        let sup = supervisor(config(
            r#"{
                "token": "tok",
                "namespace": "ccp",
                "tls": {
                    "enabled": true,
                    "ca_cert_path": "/tls/ca.pem",
                    "cert_path": "/tls/cert.pem",
                    "key_path": "/tls/key.pem"
                }
            }"#,
        ));
        let args = sup.engine_args(&bootstrap_plan(&sup));

        assert!(args.contains(&"--peer-auto-tls".to_string()));
        assert!(args.contains(&"--cert-file=/tls/cert.pem".to_string()));
        assert!(args.contains(&"--key-file=/tls/key.pem".to_string()));
        let listen = args
            .iter()
            .find(|a| a.starts_with("--listen-client-urls="))
            .unwrap();
        assert!(listen.ends_with(",http://127.0.0.1:2379"));
        assert!(listen.contains("https://"));
    }

    #[test]
    fn loopback_listener_is_a_config_decision() {
        let sup = supervisor(config(
            r#"{
                "token": "tok",
                "namespace": "ccp",
                "tls": {
                    "enabled": true,
                    "ca_cert_path": "/tls/ca.pem",
                    "cert_path": "/tls/cert.pem",
                    "key_path": "/tls/key.pem"
                },
                "engine": {"insecure_loopback": false}
            }"#,
        ));
        let args = sup.engine_args(&bootstrap_plan(&sup));
        let listen = args
            .iter()
            .find(|a| a.starts_with("--listen-client-urls="))
            .unwrap();
        assert!(!listen.contains("127.0.0.1"));
    }

    #[test]
    fn timing_overrides_and_extra_args_pass_through() {
        let sup = supervisor(config(
            r#"{
                "token": "tok",
                "namespace": "ccp",
                "engine": {
                    "heartbeat_interval_ms": 250,
                    "election_timeout_ms": 1250,
                    "extra_args": {"snapshot-count": "5000", "data-dir": "/var/lib/etcd"}
                }
            }"#,
        ));
        let args = sup.engine_args(&bootstrap_plan(&sup));

        assert!(args.contains(&"--heartbeat-interval=250".to_string()));
        assert!(args.contains(&"--election-timeout=1250".to_string()));
        assert!(args.contains(&"--snapshot-count=5000".to_string()));
        assert!(args.contains(&"--data-dir=/var/lib/etcd".to_string()));
    }

    #[test]
    fn engine_binary_defaults_but_is_overridable() {
        let cfg = config(r#"{"token": "tok", "namespace": "ccp"}"#);
        assert_eq!(cfg.engine.binary, PathBuf::from("/usr/local/bin/etcd"));

        let cfg = config(
            r#"{"token": "tok", "namespace": "ccp", "engine": {"binary": "/opt/etcd/etcd"}}"#,
        );
        assert_eq!(cfg.engine.binary, PathBuf::from("/opt/etcd/etcd"));
    }
}
