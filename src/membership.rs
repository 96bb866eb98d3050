//! Retrying client for the cluster's members control API.
//!
//! The API is the only shared mutable state in the whole design: every
//! decision re-fetches the member list instead of caching it, because a stale
//! snapshot is exactly what produces duplicate registrations and split brain.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ShepherdConfig;
use crate::error::{Result, ShepherdError};
use crate::retry::{with_retry, RetryPolicy};

/// One entry of the authoritative member list.
///
/// `id` is assigned by the control plane on registration; a freshly added
/// member that has not started yet also reports an empty `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "peerURLs", default)]
    pub peer_urls: Vec<String>,
}

impl Member {
    pub fn peer_url(&self) -> Option<&str> {
        self.peer_urls.first().map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    #[serde(default)]
    members: Vec<Member>,
}

#[derive(Debug, Serialize)]
struct AddMemberRequest {
    #[serde(rename = "peerURLs")]
    peer_urls: Vec<String>,
}

/// First id whose member name matches, scanning in list order.
///
/// The control plane keeps names unique, but if a duplicate ever shows up the
/// first match wins, deterministically.
pub fn find_member_id<'a>(members: &'a [Member], name: &str) -> Option<&'a str> {
    members
        .iter()
        .find(|m| m.name == name)
        .and_then(|m| m.id.as_deref())
}

/// `name=peerURL` pairs in list order. Members without a name are skipped:
/// a just-registered member can briefly appear with the server-side name
/// field still empty, and such an entry would corrupt the peer-set string.
pub fn peer_entries(members: &[Member]) -> Vec<String> {
    members
        .iter()
        .filter(|m| !m.name.is_empty())
        .filter_map(|m| m.peer_url().map(|url| format!("{}={}", m.name, url)))
        .collect()
}

/// Comma-joined peer set in the form the consensus engine expects.
pub fn initial_cluster_string(members: &[Member]) -> String {
    peer_entries(members).join(",")
}

/// Build an HTTP client, trusting `ca` in addition to the system roots when
/// one is given.
pub async fn http_client(ca: Option<&Path>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(ca_path) = ca {
        let pem = tokio::fs::read(ca_path).await.map_err(|err| {
            ShepherdError::Configuration(format!(
                "cannot read CA certificate {}: {}",
                ca_path.display(),
                err
            ))
        })?;
        let cert = reqwest::Certificate::from_pem(&pem).map_err(|err| {
            ShepherdError::Configuration(format!(
                "invalid CA certificate {}: {}",
                ca_path.display(),
                err
            ))
        })?;
        builder = builder.add_root_certificate(cert);
    }
    builder
        .build()
        .map_err(|err| ShepherdError::Configuration(format!("cannot build HTTP client: {}", err)))
}

/// Client over the members API with a bounded, fixed-delay retry budget.
#[derive(Debug, Clone)]
pub struct MembershipClient {
    http: reqwest::Client,
    members_url: String,
    retry: RetryPolicy,
}

impl MembershipClient {
    pub fn new(members_url: String, http: reqwest::Client, retry: RetryPolicy) -> Self {
        Self {
            http,
            members_url,
            retry,
        }
    }

    pub async fn from_config(config: &ShepherdConfig) -> Result<Self> {
        let ca = if config.tls.enabled {
            config.tls.ca_cert_path.as_deref()
        } else {
            None
        };
        let http = http_client(ca).await?;
        Ok(Self::new(config.members_url(), http, config.retry.policy()))
    }

    /// Copy of this client that gives every call exactly one attempt.
    ///
    /// For callers with "try once, log, move on" semantics instead of the
    /// join sequence's full retry budget.
    pub fn single_attempt(&self) -> Self {
        Self {
            http: self.http.clone(),
            members_url: self.members_url.clone(),
            retry: RetryPolicy {
                attempts: 1,
                delay: Duration::ZERO,
            },
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Fetch the current member list.
    pub async fn list(&self) -> Result<Vec<Member>> {
        with_retry(&self.retry, || async {
            let response = self
                .http
                .get(&self.members_url)
                .send()
                .await
                .map_err(ShepherdError::Unavailable)?;
            match response.status() {
                reqwest::StatusCode::OK => {
                    let body = response.text().await.map_err(ShepherdError::Unavailable)?;
                    let decoded: MembersResponse = serde_json::from_str(&body)?;
                    Ok(decoded.members)
                }
                status => Err(ShepherdError::ControlPlane { status }),
            }
        })
        .await
    }

    /// Register a new member. 201 is success; 500 means the cluster may still
    /// be converging and is retried; anything else is final.
    pub async fn add(&self, name: &str, peer_url: &str) -> Result<Member> {
        let result = with_retry(&self.retry, || async {
            let response = self
                .http
                .post(&self.members_url)
                .json(&AddMemberRequest {
                    peer_urls: vec![peer_url.to_string()],
                })
                .send()
                .await
                .map_err(ShepherdError::Unavailable)?;
            match response.status() {
                reqwest::StatusCode::CREATED => {
                    let body = response.text().await.map_err(ShepherdError::Unavailable)?;
                    let member: Member = serde_json::from_str(&body)?;
                    Ok(member)
                }
                status => Err(ShepherdError::ControlPlane { status }),
            }
        })
        .await;
        match &result {
            Ok(member) => {
                tracing::info!(name, peer_url, id = ?member.id, "registered member")
            }
            Err(err) => tracing::error!(name, peer_url, error = %err, "member registration failed"),
        }
        result
    }

    /// Remove a member by id. 204 is success. 404 surfaces as a
    /// `ControlPlane` error; the watcher path treats it as already-satisfied
    /// when racing another watcher replica.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let url = format!("{}/{}", self.members_url.trim_end_matches('/'), id);
        with_retry(&self.retry, || async {
            let response = self
                .http
                .delete(&url)
                .send()
                .await
                .map_err(ShepherdError::Unavailable)?;
            match response.status() {
                reqwest::StatusCode::NO_CONTENT => Ok(()),
                status => Err(ShepherdError::ControlPlane { status }),
            }
        })
        .await
    }

    /// Id of the member registered under `name`, if any.
    pub async fn resolve_id(&self, name: &str) -> Result<Option<String>> {
        let members = self.list().await?;
        Ok(find_member_id(&members, name).map(str::to_string))
    }
}
