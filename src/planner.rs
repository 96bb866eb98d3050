//! Bootstrap-vs-join decision logic.
//!
//! Run exactly once per process start. The probe result drives everything:
//! no reachable cluster means this node founds one, an existing cluster means
//! this node registers and joins with the full known peer set, and finding
//! our own name already registered means a previous incarnation of this node
//! died without being cleaned up and must be evicted before re-joining.

use serde::Deserialize;

use crate::config::BootstrapGate;
use crate::error::{Result, ShepherdError};
use crate::identity::NodeIdentity;
use crate::membership::{find_member_id, peer_entries, Member, MembershipClient};
use crate::retry::with_retry;

/// The one-shot outcome of the join sequence, consumed by the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinPlan {
    /// Found a brand-new single-member cluster that will accept joiners.
    Bootstrap { name: String, peer_url: String },
    /// Attach to an existing cluster with the full known peer set,
    /// serialized as comma-joined `name=peerURL` pairs, self last.
    Join {
        name: String,
        peer_url: String,
        initial_cluster: String,
    },
}

#[derive(Debug, Deserialize)]
struct LeaderResponse {
    name: String,
}

pub struct ClusterJoinPlanner {
    membership: MembershipClient,
    identity: NodeIdentity,
    gate: BootstrapGate,
}

impl ClusterJoinPlanner {
    pub fn new(membership: MembershipClient, identity: NodeIdentity, gate: BootstrapGate) -> Self {
        Self {
            membership,
            identity,
            gate,
        }
    }

    /// Probe the cluster and decide how this node starts.
    ///
    /// Network failures inside the sequence use the membership client's retry
    /// budget; once that is exhausted the error propagates fatally, because
    /// starting the engine against an inconsistent topology is worse than not
    /// starting at all.
    pub async fn plan(&self) -> Result<JoinPlan> {
        self.apply_jitter().await;
        let may_bootstrap = self.consult_gate().await?;
        let members = self.probe().await?;

        if members.is_empty() {
            if !may_bootstrap {
                return Err(ShepherdError::AwaitingBootstrap);
            }
            tracing::info!(name = %self.identity.name, "no existing cluster, bootstrapping");
            return Ok(JoinPlan::Bootstrap {
                name: self.identity.name.clone(),
                peer_url: self.identity.peer_url.clone(),
            });
        }

        let members = self.evict_stale_self(members).await?;
        self.join(members).await
    }

    /// Fetch the member list, treating an unreachable endpoint as an empty
    /// cluster. This probe is the only place where a transport failure is
    /// semantically meaningful (no cluster exists yet) rather than an
    /// operational fault; any non-success status still propagates.
    async fn probe(&self) -> Result<Vec<Member>> {
        match self.membership.list().await {
            Ok(members) => {
                tracing::info!(count = members.len(), "probed existing cluster");
                Ok(members)
            }
            Err(ShepherdError::Unavailable(err)) => {
                tracing::info!(error = %err, "no one answered the membership probe");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    /// If our name is already registered, a previous incarnation of this node
    /// crashed under a reused identity. The local data directory cannot be
    /// trusted to hold committed state, and the control plane only attaches
    /// data-less members in the "existing" state, so the stale entry is
    /// evicted unconditionally and the list re-fetched.
    async fn evict_stale_self(&self, members: Vec<Member>) -> Result<Vec<Member>> {
        let Some(stale_id) = find_member_id(&members, &self.identity.name).map(str::to_string)
        else {
            return Ok(members);
        };
        tracing::warn!(
            name = %self.identity.name,
            id = %stale_id,
            "found stale registration for this node, evicting before re-joining"
        );
        self.membership.delete(&stale_id).await?;
        self.membership.list().await
    }

    /// Randomized delay ahead of the probe. Sleeping first keeps nodes that
    /// start at the same moment from deciding against identical snapshots,
    /// and means the member list is fetched after the delay rather than
    /// going stale during it.
    async fn apply_jitter(&self) {
        let BootstrapGate::Jitter { min_secs, max_secs } = &self.gate else {
            return;
        };
        let delay = {
            use rand::Rng;
            rand::thread_rng().gen_range(*min_secs..=*max_secs)
        };
        tracing::debug!(delay_secs = delay, "sleeping before membership probe");
        tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
    }

    async fn join(&self, members: Vec<Member>) -> Result<JoinPlan> {
        self.membership
            .add(&self.identity.name, &self.identity.peer_url)
            .await?;

        let mut entries = peer_entries(&members);
        entries.push(format!("{}={}", self.identity.name, self.identity.peer_url));
        let initial_cluster = entries.join(",");
        tracing::info!(initial_cluster = %initial_cluster, "joining existing cluster");

        Ok(JoinPlan::Join {
            name: self.identity.name.clone(),
            peer_url: self.identity.peer_url.clone(),
            initial_cluster,
        })
    }

    /// Whether this node is allowed to bootstrap a new cluster.
    async fn consult_gate(&self) -> Result<bool> {
        let BootstrapGate::LeaderElector { url } = &self.gate else {
            return Ok(true);
        };
        let leader = self.fetch_designated_leader(url).await?;
        let designated = leader == self.identity.hostname || leader == self.identity.name;
        tracing::info!(leader = %leader, designated, "consulted leader elector");
        Ok(designated)
    }

    async fn fetch_designated_leader(&self, url: &str) -> Result<String> {
        with_retry(self.membership.retry(), || async {
            let response = self
                .membership
                .http()
                .get(url)
                .send()
                .await
                .map_err(ShepherdError::Unavailable)?;
            match response.status() {
                reqwest::StatusCode::OK => {
                    let body = response.text().await.map_err(ShepherdError::Unavailable)?;
                    let decoded: LeaderResponse = serde_json::from_str(&body)?;
                    Ok(decoded.name)
                }
                status => Err(ShepherdError::ControlPlane { status }),
            }
        })
        .await
    }
}
