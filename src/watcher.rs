//! Asynchronous eviction of dead members.
//!
//! Watches the orchestrator's lifecycle-event feed and deletes cluster
//! members whose pods are permanently gone, so a dead node does not keep
//! occupying a quorum slot until an operator notices. Several replicas of
//! this watcher may run at once; per-event statelessness plus treating
//! "member already gone" as success makes that safe.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::AsyncBufReadExt;
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::config::ShepherdConfig;
use crate::error::{Result, ShepherdError};
use crate::membership::{http_client, MembershipClient};

const KUBERNETES_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
const KUBERNETES_PORT_ENV: &str = "KUBERNETES_PORT_443_TCP_PORT";

/// One decoded entry of the event feed.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
struct WatchEnvelope {
    object: EventObject,
}

#[derive(Debug, Deserialize)]
struct EventObject {
    #[serde(rename = "involvedObject")]
    involved_object: InvolvedObject,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct InvolvedObject {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
}

/// Decode one line of the feed into a [`LifecycleEvent`].
pub fn decode_event(line: &str) -> Result<LifecycleEvent> {
    let envelope: WatchEnvelope = serde_json::from_str(line)?;
    Ok(LifecycleEvent {
        kind: envelope.object.involved_object.kind,
        name: envelope.object.involved_object.name,
        namespace: envelope.object.involved_object.namespace,
        reason: envelope.object.reason,
    })
}

/// Long-lived consumer of the lifecycle-event feed.
pub struct EventStreamWatcher {
    http: reqwest::Client,
    watch_url: String,
    bearer_token: String,
    namespace: String,
    trigger_reasons: HashSet<String>,
    reconnect_delay: Duration,
    membership: MembershipClient,
}

impl EventStreamWatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: reqwest::Client,
        watch_url: String,
        bearer_token: String,
        namespace: String,
        trigger_reasons: HashSet<String>,
        reconnect_delay: Duration,
        membership: MembershipClient,
    ) -> Self {
        Self {
            http,
            watch_url,
            bearer_token,
            namespace,
            trigger_reasons,
            reconnect_delay,
            // One attempt per call: a failed eviction is logged and the
            // stream moves on instead of stalling on a retry budget.
            membership: membership.single_attempt(),
        }
    }

    /// Build the watcher from configuration. Missing credentials or an
    /// unresolvable feed address are fatal here; nothing past setup is.
    pub async fn from_config(config: &ShepherdConfig, membership: MembershipClient) -> Result<Self> {
        let token_file = &config.watcher.token_file;
        let bearer_token = tokio::fs::read_to_string(token_file)
            .await
            .map_err(|err| {
                ShepherdError::Configuration(format!(
                    "cannot read service account token {}: {}",
                    token_file.display(),
                    err
                ))
            })?
            .trim()
            .to_string();

        let base_url = match &config.watcher.api_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let host = std::env::var(KUBERNETES_HOST_ENV).map_err(|_| {
                    ShepherdError::Configuration(format!("{} is not set", KUBERNETES_HOST_ENV))
                })?;
                let port = std::env::var(KUBERNETES_PORT_ENV).map_err(|_| {
                    ShepherdError::Configuration(format!("{} is not set", KUBERNETES_PORT_ENV))
                })?;
                format!("https://{}:{}", host, port)
            }
        };
        let watch_url = format!("{}/api/v1/events", base_url);

        let http = http_client(config.watcher.ca_file.as_deref()).await?;
        Ok(Self::new(
            http,
            watch_url,
            bearer_token,
            config.namespace.clone(),
            config.watcher.trigger_reasons.iter().cloned().collect(),
            config.watcher.reconnect_delay(),
            membership,
        ))
    }

    /// Consume the feed until shut down. Stream termination of any kind only
    /// triggers a delayed reconnect; this loop never exits on its own.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(url = %self.watch_url, "starting event watcher");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.run_once(&shutdown).await {
                Ok(()) if shutdown.is_cancelled() => break,
                Ok(()) => tracing::info!("event stream closed, reconnecting"),
                Err(err) => tracing::warn!(error = %err, "event stream failed, reconnecting"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        tracing::info!("event watcher stopped");
    }

    /// One connection to the feed: stream line-delimited JSON events until
    /// the server closes the stream or the connection drops.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<()> {
        let response = self
            .http
            .get(&self.watch_url)
            .bearer_auth(&self.bearer_token)
            .query(&[("watch", "true")])
            .send()
            .await
            .map_err(ShepherdError::Unavailable)?
            .error_for_status()
            .map_err(ShepherdError::Unavailable)?;

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        let mut lines = StreamReader::new(stream).lines();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                line = lines.next_line() => match line? {
                    Some(line) => self.handle_line(&line).await,
                    None => return Ok(()),
                },
            }
        }
    }

    /// Decode and act on a single feed line. Never fails: a malformed line
    /// or a failed eviction is logged and the stream moves on.
    pub async fn handle_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let event = match decode_event(line) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed event");
                return;
            }
        };
        if !self.is_actionable(&event) {
            return;
        }
        tracing::info!(reason = %event.reason, pod = %event.name, "detected lifecycle event");
        if let Err(err) = self.evict_member(&event.name).await {
            tracing::warn!(member = %event.name, error = %err, "failed to remove member");
        }
    }

    /// Only pod events in our namespace whose reason is in the trigger set
    /// mark a member as permanently gone.
    pub fn is_actionable(&self, event: &LifecycleEvent) -> bool {
        event.kind == "Pod"
            && event.namespace == self.namespace
            && self.trigger_reasons.contains(&event.reason)
    }

    /// Resolve and delete the member registered under `name`.
    ///
    /// Multiple watcher replicas may observe the same event, and resolving
    /// then deleting is inherently two calls; a 404 on the delete just means
    /// another replica won the race and counts as success.
    pub async fn evict_member(&self, name: &str) -> Result<()> {
        let Some(id) = self.membership.resolve_id(name).await? else {
            tracing::info!(member = name, "not in the member list, nothing to remove");
            return Ok(());
        };
        match self.membership.delete(&id).await {
            Ok(()) => {
                tracing::info!(member = name, id = %id, "removed dead member");
                Ok(())
            }
            Err(ShepherdError::ControlPlane { status })
                if status == reqwest::StatusCode::NOT_FOUND =>
            {
                tracing::debug!(member = name, id = %id, "member already removed by another watcher");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_feed_line() {
        let line = r#"{
            "type": "MODIFIED",
            "object": {
                "involvedObject": {"kind": "Pod", "name": "etcd-2", "namespace": "default"},
                "reason": "Killing"
            }
        }"#;
        let event = decode_event(line).unwrap();
        assert_eq!(
            event,
            LifecycleEvent {
                kind: "Pod".to_string(),
                name: "etcd-2".to_string(),
                namespace: "default".to_string(),
                reason: "Killing".to_string(),
            }
        );
    }

    #[test]
    fn decode_tolerates_missing_reason() {
        let line = r#"{"object": {"involvedObject": {"kind": "Pod", "name": "x", "namespace": "d"}}}"#;
        let event = decode_event(line).unwrap();
        assert_eq!(event.reason, "");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_event("not json"),
            Err(ShepherdError::ProtocolDecode(_))
        ));
        assert!(matches!(
            decode_event(r#"{"no_object": true}"#),
            Err(ShepherdError::ProtocolDecode(_))
        ));
    }

    fn watcher(namespace: &str, reasons: &[&str]) -> EventStreamWatcher {
        EventStreamWatcher::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1/api/v1/events".to_string(),
            "token".to_string(),
            namespace.to_string(),
            reasons.iter().map(|r| r.to_string()).collect(),
            Duration::from_secs(1),
            MembershipClient::new(
                "http://127.0.0.1:1/v2/members".to_string(),
                reqwest::Client::new(),
                crate::retry::RetryPolicy::default(),
            ),
        )
    }

    fn event(kind: &str, namespace: &str, reason: &str) -> LifecycleEvent {
        LifecycleEvent {
            kind: kind.to_string(),
            name: "etcd-2".to_string(),
            namespace: namespace.to_string(),
            reason: reason.to_string(),
        }
    }

    #[test]
    fn only_trigger_reasons_in_namespace_are_actionable() {
        let watcher = watcher("default", &["Killing", "NodeControllerEviction"]);
        assert!(watcher.is_actionable(&event("Pod", "default", "Killing")));
        assert!(watcher.is_actionable(&event("Pod", "default", "NodeControllerEviction")));
        assert!(!watcher.is_actionable(&event("Pod", "default", "Scheduled")));
        assert!(!watcher.is_actionable(&event("Pod", "kube-system", "Killing")));
        assert!(!watcher.is_actionable(&event("Node", "default", "Killing")));
    }
}
