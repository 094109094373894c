use serde::Deserialize;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::models::{
  ClaimRequest, NoTask, ScheduleRequest, TaskLogRequest, TaskLogs, TaskRef, TaskStatus, TaskStatusResponse, UpdateRequest,
};
use crate::routes::auth::with_auth;
use crate::routes::{ApiError, AppState, with_state};

#[derive(Debug, Deserialize)]
pub struct IdQuery {
  #[serde(default)]
  pub id: String,
}

impl IdQuery {
  pub fn required(self) -> Result<String, ApiError> {
    if self.id.is_empty() {
      return Err(ApiError::InvalidRequest("missing id".into()));
    }
    Ok(self.id)
  }
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  schedule_route(state.clone())
    .or(list_route(state.clone()))
    .or(claim_route(state.clone()))
    .or(update_route(state.clone()))
    .or(cancel_route(state.clone()))
    .or(status_route(state.clone()))
    .or(log_route(state.clone()))
    .or(logs_route(state))
}

fn schedule_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("schedule")
    .and(warp::post())
    .and(with_auth(state.token.clone()))
    .and(warp::body::json())
    .and(with_state(state))
    .and_then(handle_schedule)
}

fn list_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("tasks")
    .and(warp::get())
    .and(with_state(state))
    .map(|state: AppState| warp::reply::json(&state.registry.list_tasks()))
}

fn claim_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("tasks" / "claim")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_state(state))
    .and_then(handle_claim)
}

fn update_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("tasks" / "update")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_state(state))
    .and_then(handle_update)
}

fn cancel_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("tasks" / "cancel")
    .and(warp::post())
    .and(with_auth(state.token.clone()))
    .and(warp::body::json())
    .and(with_state(state))
    .and_then(handle_cancel)
}

fn status_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("tasks" / "status")
    .and(warp::get())
    .and(warp::query::<IdQuery>())
    .and(with_state(state))
    .and_then(handle_status)
}

fn log_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("tasks" / "log")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_state(state))
    .and_then(handle_log)
}

fn logs_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("tasks" / "logs")
    .and(warp::get())
    .and(warp::query::<IdQuery>())
    .and(with_state(state))
    .and_then(handle_logs)
}

async fn handle_schedule(req: ScheduleRequest, state: AppState) -> Result<impl Reply, Rejection> {
  let task = state
    .registry
    .schedule_task(&req.org, &req.task, req.agent_hint.as_deref())
    .map_err(ApiError::from)?;
  Ok(warp::reply::json(&task))
}

async fn handle_claim(req: ClaimRequest, state: AppState) -> Result<warp::reply::Json, Rejection> {
  match state.registry.claim(&req.org, &req.agent_id).map_err(ApiError::from)? {
    Some(task) => Ok(warp::reply::json(&task)),
    None => Ok(warp::reply::json(&NoTask { task: None })),
  }
}

async fn handle_update(req: UpdateRequest, state: AppState) -> Result<impl Reply, Rejection> {
  if req.id.is_empty() || req.status.is_empty() {
    return Err(ApiError::InvalidRequest("missing id/status".into()).into());
  }
  let status: TaskStatus = req.status.parse().map_err(ApiError::InvalidRequest)?;
  let task = state.registry.update_status(&req.id, status).map_err(ApiError::from)?;
  Ok(warp::reply::json(&task))
}

async fn handle_cancel(req: TaskRef, state: AppState) -> Result<impl Reply, Rejection> {
  let task = state.registry.cancel_task(&req.id).map_err(ApiError::from)?;
  Ok(warp::reply::json(&task))
}

async fn handle_status(query: IdQuery, state: AppState) -> Result<impl Reply, Rejection> {
  let id = query.required()?;
  let task = state.registry.get_task(&id).map_err(ApiError::from)?;
  Ok(warp::reply::json(&TaskStatusResponse { task }))
}

async fn handle_log(req: TaskLogRequest, state: AppState) -> Result<impl Reply, Rejection> {
  if req.id.is_empty() {
    return Err(ApiError::InvalidRequest("missing id".into()).into());
  }
  state.registry.append_task_log(&req.id, &req.line);
  Ok(StatusCode::NO_CONTENT)
}

async fn handle_logs(query: IdQuery, state: AppState) -> Result<impl Reply, Rejection> {
  let id = query.required()?;
  let lines = state.registry.task_logs(&id).iter().map(ToString::to_string).collect();
  Ok(warp::reply::json(&TaskLogs { id, lines }))
}
