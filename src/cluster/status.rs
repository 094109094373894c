use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, ListParams};
use serde::Serialize;
use tokio::time::{Instant, interval, timeout};
use tracing::debug;

use crate::error::ClusterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentPhase {
  Pending,
  Starting,
  Ready,
}

/// Rollout summary of one agent deployment and its pods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
  pub name: String,
  pub namespace: String,
  pub desired: i32,
  pub ready: i32,
  pub available: i32,
  pub pods_total: usize,
  pub pods_ready: usize,
  pub phase: AgentPhase,
}

pub fn derive_phase(desired: i32, ready: i32, available: i32) -> AgentPhase {
  if desired > 0 && available >= desired {
    AgentPhase::Ready
  } else if ready > 0 {
    AgentPhase::Starting
  } else {
    AgentPhase::Pending
  }
}

pub fn is_pod_ready(pod: &Pod) -> bool {
  pod
    .status
    .as_ref()
    .and_then(|s| s.conditions.as_ref())
    .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

pub async fn get_agent_status(client: &Client, namespace: &str, name: &str) -> Result<AgentStatus, ClusterError> {
  let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
  let dep = deployments.get(name).await?;

  let desired = dep.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
  let (ready, available) = dep
    .status
    .as_ref()
    .map(|s| (s.ready_replicas.unwrap_or(0), s.available_replicas.unwrap_or(0)))
    .unwrap_or((0, 0));

  let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
  let listed = pods.list(&ListParams::default().labels(&format!("app={}", name))).await?;
  let pods_ready = listed.items.iter().filter(|p| is_pod_ready(p)).count();

  Ok(AgentStatus {
    name: name.to_string(),
    namespace: namespace.to_string(),
    desired,
    ready,
    available,
    pods_total: listed.items.len(),
    pods_ready,
    phase: derive_phase(desired, ready, available),
  })
}

/// Polls the agent status every `every` until it reports ready or `deadline`
/// elapses. Errors along the way are retried.
pub async fn wait_for_ready(
  client: &Client,
  namespace: &str,
  name: &str,
  every: Duration,
  deadline: Duration,
) -> Result<AgentStatus, ClusterError> {
  poll_until_ready(|| get_agent_status(client, namespace, name), every, deadline)
    .await
    .map_err(|e| match e {
      ClusterError::Timeout(_) => ClusterError::Timeout(format!("agent {}/{} to become ready", namespace, name)),
      other => other,
    })
}

/// On deadline, returns the last fetch error if the final attempt failed,
/// otherwise [`ClusterError::Timeout`].
pub async fn poll_until_ready<F, Fut>(mut fetch: F, every: Duration, deadline: Duration) -> Result<AgentStatus, ClusterError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<AgentStatus, ClusterError>>,
{
  let started = Instant::now();
  let mut last_err = None;
  let poll = async {
    let mut ticker = interval(every);
    loop {
      ticker.tick().await;
      match fetch().await {
        Ok(status) if status.phase == AgentPhase::Ready => return status,
        Ok(status) => {
          debug!(name = %status.name, phase = ?status.phase, elapsed = ?started.elapsed(), "agent rollout");
          last_err = None;
        }
        Err(e) => {
          debug!(error = %e, elapsed = ?started.elapsed(), "agent status unavailable, retrying");
          last_err = Some(e);
        }
      }
    }
  };
  let outcome = timeout(deadline, poll).await;
  match outcome {
    Ok(status) => Ok(status),
    Err(_) => Err(last_err.unwrap_or_else(|| ClusterError::Timeout("agent to become ready".into()))),
  }
}
