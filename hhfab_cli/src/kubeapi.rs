use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_timer::Delay;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, ListParams},
    client::APIClient,
};

use crate::{ErrorKind, Result};

/// Heartbeats older than this mean the kubelet stopped talking to us
/// (the default kubelet interval is 5 minutes)
const HEARTBEAT_STALE: i64 = 6 * 60;

/// Poll cadence for the readiness wait
const POLL_SECS: u64 = 15;

/// Client creator against the vlab kubeconfig
async fn make_client(kubeconfig: &Path) -> Result<APIClient> {
    // kube resolves the config through the environment
    std::env::set_var("KUBECONFIG", kubeconfig);
    let config = kube::config::load_kube_config()
        .await
        .map_err(ErrorKind::KubeError)?;
    Ok(APIClient::new(config))
}

/// Names of the nodes that count as Ready right now
///
/// A node is Ready iff its Ready condition is True and its last heartbeat
/// is recent enough to trust.
pub fn ready_names(nodes: &[Node], now: DateTime<Utc>) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for node in nodes {
        let name = match node.metadata.as_ref().and_then(|m| m.name.clone()) {
            Some(n) => n,
            None => continue,
        };
        let conds = match node.status.as_ref().and_then(|s| s.conditions.clone()) {
            Some(c) => c,
            None => continue,
        };
        let ready = conds.iter().find(|c| c.type_ == "Ready");
        if let Some(c) = ready {
            if c.status != "True" {
                continue;
            }
            let fresh = c
                .last_heartbeat_time
                .as_ref()
                .map(|t| now.signed_duration_since(t.0).num_seconds() <= HEARTBEAT_STALE)
                .unwrap_or(false);
            if fresh {
                out.insert(name);
            } else {
                debug!("{} is Ready but its heartbeat is stale", name);
            }
        }
    }
    out
}

/// Wait until the expected node set is exactly the Ready set
///
/// Polls the api every 15s; respects the cancel flag and an optional
/// deadline.
pub async fn wait_ready(
    kubeconfig: &Path,
    expected: &BTreeSet<String>,
    deadline: Option<Duration>,
    cancel: &AtomicBool,
) -> Result<()> {
    let client = make_client(kubeconfig).await?;
    let api: Api<Node> = Api::all(client);
    let started = Instant::now();
    info!("Waiting for nodes to be Ready: {:?}", expected);

    loop {
        if cancel.load(Ordering::Relaxed) {
            bail!("cancelled while waiting for node readiness");
        }
        if let Some(d) = deadline {
            if started.elapsed() > d {
                return Err(ErrorKind::Readiness(format!(
                    "nodes not Ready within {}s: expected {:?}",
                    d.as_secs(),
                    expected
                ))
                .into());
            }
        }

        match api.list(&ListParams::default()).await {
            Ok(nodes) => {
                let ready = ready_names(&nodes.items, Utc::now());
                if &ready == expected {
                    info!("All {} expected nodes are Ready", expected.len());
                    return Ok(());
                }
                debug!("Ready nodes {:?}, expecting {:?}", ready, expected);
            }
            // the api server flaps while the control node installs; that
            // is part of what we are waiting out
            Err(e) => debug!("node list failed, retrying: {}", e),
        }
        Delay::new(Duration::from_secs(POLL_SECS)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn node(name: &str, ready: &str, heartbeat_age_secs: i64, now: DateTime<Utc>) -> Node {
        let mut n = Node::default();
        n.metadata = Some(ObjectMeta { name: Some(name.to_string()), ..Default::default() });
        n.status = Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".into(),
                status: ready.into(),
                last_heartbeat_time: Some(Time(now - ChronoDuration::seconds(heartbeat_age_secs))),
                ..Default::default()
            }]),
            ..Default::default()
        });
        n
    }

    #[test]
    fn stale_heartbeat_is_not_ready() {
        let now = Utc::now();
        let nodes = vec![
            node("control-01", "True", 0, now),
            node("gw-01", "True", 7 * 60, now),
        ];
        let ready = ready_names(&nodes, now);
        assert!(ready.contains("control-01"));
        assert!(!ready.contains("gw-01"));

        // once the heartbeat recovers the node counts again
        let nodes = vec![
            node("control-01", "True", 0, now),
            node("gw-01", "True", 0, now),
        ];
        let ready = ready_names(&nodes, now);
        assert_eq!(ready.len(), 2);
    }

    #[test]
    fn false_condition_is_not_ready() {
        let now = Utc::now();
        let nodes = vec![node("control-01", "False", 0, now)];
        assert!(ready_names(&nodes, now).is_empty());
    }

    #[test]
    fn missing_heartbeat_is_not_ready() {
        let now = Utc::now();
        let mut n = node("control-01", "True", 0, now);
        if let Some(st) = n.status.as_mut() {
            if let Some(conds) = st.conditions.as_mut() {
                conds[0].last_heartbeat_time = None;
            }
        }
        assert!(ready_names(&[n], now).is_empty());
    }
}
