use std::collections::HashMap;

use serde::Deserialize;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::models::{AgentLogRequest, AgentLogs, HeartbeatRequest, RegisterRequest};
use crate::routes::{ApiError, AppState, with_state};

#[derive(Debug, Deserialize)]
pub struct NameQuery {
  #[serde(default)]
  pub name: String,
}

impl NameQuery {
  pub fn required(self) -> Result<String, ApiError> {
    if self.name.is_empty() {
      return Err(ApiError::InvalidRequest("missing name".into()));
    }
    Ok(self.name)
  }
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  let list = warp::path!("agents")
    .and(warp::get())
    .and(with_state(state.clone()))
    .map(|state: AppState| warp::reply::json(&state.registry.list_agents()));

  let register = warp::path!("agents" / "register")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_state(state.clone()))
    .and_then(handle_register);

  let heartbeat = warp::path!("agents" / "heartbeat")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_state(state.clone()))
    .and_then(handle_heartbeat);

  let log = warp::path!("agents" / "log")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_state(state.clone()))
    .and_then(handle_log);

  let logs = warp::path!("agents" / "logs")
    .and(warp::get())
    .and(warp::query::<NameQuery>())
    .and(with_state(state))
    .and_then(handle_logs);

  list.or(register).or(heartbeat).or(log).or(logs)
}

async fn handle_register(req: RegisterRequest, state: AppState) -> Result<impl Reply, Rejection> {
  let agent = state
    .registry
    .register(&req.name, &req.org, req.labels)
    .map_err(ApiError::from)?;
  Ok(warp::reply::json(&agent))
}

async fn handle_heartbeat(req: HeartbeatRequest, state: AppState) -> Result<impl Reply, Rejection> {
  state
    .registry
    .heartbeat(&req.name, req.org.as_deref(), req.status.as_deref())
    .map_err(ApiError::from)?;
  Ok(warp::reply::json(&HashMap::from([("ok", "1")])))
}

async fn handle_log(req: AgentLogRequest, state: AppState) -> Result<impl Reply, Rejection> {
  if req.name.is_empty() {
    return Err(ApiError::InvalidRequest("missing name".into()).into());
  }
  state.registry.append_agent_log(&req.name, &req.line);
  Ok(StatusCode::NO_CONTENT)
}

async fn handle_logs(query: NameQuery, state: AppState) -> Result<impl Reply, Rejection> {
  let name = query.required()?;
  let lines = state.registry.agent_logs(&name).iter().map(ToString::to_string).collect();
  Ok(warp::reply::json(&AgentLogs { name, lines }))
}
