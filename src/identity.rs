use crate::config::ShepherdConfig;
use crate::error::{Result, ShepherdError};

/// Who this node is, resolved once at startup and immutable afterwards.
///
/// The member `name` doubles as the DNS name other members dial, so it has to
/// be the service-qualified form rather than the bare pod hostname.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeIdentity {
    /// Bare pod hostname.
    pub hostname: String,
    /// Member name used in every membership operation.
    pub name: String,
    /// Address advertised for intra-cluster consensus traffic.
    pub peer_url: String,
    /// Address advertised for client traffic.
    pub client_url: String,
}

impl NodeIdentity {
    pub fn resolve(config: &ShepherdConfig) -> Result<Self> {
        let hostname = hostname::get()
            .map_err(|err| {
                ShepherdError::Configuration(format!("cannot resolve hostname: {}", err))
            })?
            .to_string_lossy()
            .into_owned();
        Ok(Self::from_hostname(hostname, config))
    }

    pub fn from_hostname(hostname: String, config: &ShepherdConfig) -> Self {
        let name = format!("{}.{}", hostname, config.service_fqdn());
        let peer_url = format!("{}://{}:{}", config.scheme(), name, config.server_port);
        let client_url = format!("{}://{}:{}", config.scheme(), name, config.client_port);
        Self {
            hostname,
            name,
            peer_url,
            client_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ShepherdConfig {
        serde_json::from_str(r#"{"token": "t", "namespace": "ccp"}"#).unwrap()
    }

    #[test]
    fn name_is_service_qualified() {
        let identity = NodeIdentity::from_hostname("etcd-0".to_string(), &config());
        assert_eq!(identity.hostname, "etcd-0");
        assert_eq!(identity.name, "etcd-0.etcd.ccp.svc.cluster.local");
        assert_eq!(
            identity.peer_url,
            "http://etcd-0.etcd.ccp.svc.cluster.local:2380"
        );
        assert_eq!(
            identity.client_url,
            "http://etcd-0.etcd.ccp.svc.cluster.local:2379"
        );
    }

    #[test]
    fn tls_identity_uses_https() {
        let mut cfg = config();
        cfg.tls.enabled = true;
        let identity = NodeIdentity::from_hostname("etcd-1".to_string(), &cfg);
        assert!(identity.peer_url.starts_with("https://"));
        assert!(identity.client_url.starts_with("https://"));
    }
}
