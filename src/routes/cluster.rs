//! Cluster-facing endpoints: reachability, imperative deploys and the
//! `AgentTask` resource.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::info;
use warp::{Filter, Rejection, Reply};

use crate::cluster::crd::{AgentTaskSpec, child_name, create_agent_task, get_agent_task, set_agent_task_cancel};
use crate::cluster::deploy::{DeployParams, deploy_agent};
use crate::cluster::ping;
use crate::cluster::status::{get_agent_status, wait_for_ready};
use crate::config::DEFAULT_AGENT_NAMESPACE;
use crate::routes::auth::with_auth;
use crate::routes::{ApiError, AppState, with_state};

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_STATUS_WAIT_SECS: u64 = 300;

#[derive(Debug, Deserialize)]
pub struct PrepareRequest {
  #[serde(default)]
  pub org: String,
}

#[derive(Debug, Serialize)]
pub struct PrepareResponse {
  pub ok: bool,
  pub org: String,
  pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
  #[serde(default)]
  pub org: String,
  pub image: Option<String>,
  pub namespace: Option<String>,
  pub name: Option<String>,
  #[serde(default)]
  pub env: BTreeMap<String, String>,
}

/// Query for endpoints that address one named object of an org.
#[derive(Debug, Deserialize)]
pub struct ObjectQuery {
  #[serde(default)]
  pub org: String,
  #[serde(default)]
  pub name: String,
  pub namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
  #[serde(default)]
  pub org: String,
  #[serde(default)]
  pub name: String,
  pub namespace: Option<String>,
  /// Seconds to wait for the agent to become ready.
  pub wait: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskRequest {
  #[serde(default)]
  pub org: String,
  #[serde(default)]
  pub task: String,
  pub name: Option<String>,
  pub namespace: Option<String>,
  pub image: Option<String>,
  #[serde(default)]
  pub env: BTreeMap<String, String>,
  pub ttl_seconds_after_finished: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct CancelAgentTaskRequest {
  #[serde(default)]
  pub org: String,
  #[serde(default)]
  pub name: String,
  pub namespace: Option<String>,
  pub cancel: Option<bool>,
}

fn require(value: &str, what: &str) -> Result<(), ApiError> {
  if value.is_empty() {
    return Err(ApiError::InvalidRequest(format!("missing {}", what)));
  }
  Ok(())
}

fn namespace_or_default(namespace: Option<String>) -> String {
  namespace.filter(|n| !n.is_empty()).unwrap_or_else(|| DEFAULT_AGENT_NAMESPACE.to_string())
}

async fn org_client(state: &AppState, org: &str) -> Result<Client, ApiError> {
  Ok(state.gateway.client_for(org).await?)
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  let prepare = warp::path!("k8s" / "prepare")
    .and(warp::post())
    .and(with_auth(state.token.clone()))
    .and(warp::body::json())
    .and(with_state(state.clone()))
    .and_then(handle_prepare);

  let deploy = warp::path!("k8s" / "deploy")
    .and(warp::post())
    .and(with_auth(state.token.clone()))
    .and(warp::body::json())
    .and(with_state(state.clone()))
    .and_then(handle_deploy);

  let status = warp::path!("k8s" / "status")
    .and(warp::get())
    .and(warp::query::<StatusQuery>())
    .and(with_state(state.clone()))
    .and_then(handle_status);

  let create_task = warp::path!("agenttasks")
    .and(warp::post())
    .and(with_auth(state.token.clone()))
    .and(warp::body::json())
    .and(with_state(state.clone()))
    .and_then(handle_create_task);

  let get_task = warp::path!("agenttasks")
    .and(warp::get())
    .and(warp::query::<ObjectQuery>())
    .and(with_state(state.clone()))
    .and_then(handle_get_task);

  let cancel_task = warp::path!("agenttasks" / "cancel")
    .and(warp::post())
    .and(with_auth(state.token.clone()))
    .and(warp::body::json())
    .and(with_state(state))
    .and_then(handle_cancel_task);

  prepare.or(deploy).or(status).or(create_task).or(get_task).or(cancel_task)
}

async fn handle_prepare(req: PrepareRequest, state: AppState) -> Result<impl Reply, Rejection> {
  require(&req.org, "org")?;
  let client = org_client(&state, &req.org).await?;
  let version = ping(&client).await.map_err(ApiError::from)?;
  info!(org = %req.org, version = %version, "cluster reachable");
  Ok(warp::reply::json(&PrepareResponse {
    ok: true,
    org: req.org,
    version,
  }))
}

async fn handle_deploy(req: DeployRequest, state: AppState) -> Result<impl Reply, Rejection> {
  require(&req.org, "org")?;
  let client = org_client(&state, &req.org).await?;
  let params = DeployParams {
    org: req.org,
    image: req.image,
    namespace: req.namespace,
    name: req.name,
    env: req.env,
  };
  let deployed = deploy_agent(&client, &params).await.map_err(ApiError::from)?;
  Ok(warp::reply::json(&deployed))
}

async fn handle_status(query: StatusQuery, state: AppState) -> Result<impl Reply, Rejection> {
  require(&query.org, "org")?;
  require(&query.name, "name")?;
  let client = org_client(&state, &query.org).await?;
  let namespace = namespace_or_default(query.namespace);
  let status = match query.wait.filter(|w| *w > 0) {
    Some(secs) => {
      let deadline = Duration::from_secs(secs.min(MAX_STATUS_WAIT_SECS));
      wait_for_ready(&client, &namespace, &query.name, STATUS_POLL_INTERVAL, deadline).await
    }
    None => get_agent_status(&client, &namespace, &query.name).await,
  }
  .map_err(ApiError::from)?;
  Ok(warp::reply::json(&status))
}

async fn handle_create_task(req: AgentTaskRequest, state: AppState) -> Result<impl Reply, Rejection> {
  require(&req.org, "org")?;
  require(&req.task, "task")?;
  let client = org_client(&state, &req.org).await?;
  let namespace = namespace_or_default(req.namespace);
  let name = req
    .name
    .filter(|n| !n.is_empty())
    .unwrap_or_else(|| child_name("task", &req.org, &Utc::now().timestamp().to_string()));
  let spec = AgentTaskSpec {
    org_id: req.org,
    task: req.task,
    image: req.image.filter(|i| !i.is_empty()),
    env: req.env,
    cancel: false,
    ttl_seconds_after_finished: req.ttl_seconds_after_finished,
  };
  let task = create_agent_task(&client, &namespace, &name, spec)
    .await
    .map_err(ApiError::from)?;
  Ok(warp::reply::json(&task))
}

async fn handle_get_task(query: ObjectQuery, state: AppState) -> Result<impl Reply, Rejection> {
  require(&query.org, "org")?;
  require(&query.name, "name")?;
  let client = org_client(&state, &query.org).await?;
  let namespace = namespace_or_default(query.namespace);
  match get_agent_task(&client, &namespace, &query.name).await.map_err(ApiError::from)? {
    Some(task) => Ok(warp::reply::json(&task)),
    None => Err(ApiError::NotFound(format!("agent task {}/{}", namespace, query.name)).into()),
  }
}

async fn handle_cancel_task(req: CancelAgentTaskRequest, state: AppState) -> Result<impl Reply, Rejection> {
  require(&req.org, "org")?;
  require(&req.name, "name")?;
  let client = org_client(&state, &req.org).await?;
  let namespace = namespace_or_default(req.namespace);
  let cancel = req.cancel.unwrap_or(true);
  let task = set_agent_task_cancel(&client, &namespace, &req.name, cancel)
    .await
    .map_err(ApiError::from)?;
  info!(org = %req.org, task = %format!("{}/{}", namespace, req.name), cancel, "agent task cancel flag set");
  Ok(warp::reply::json(&task))
}
