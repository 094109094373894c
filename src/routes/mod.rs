use std::convert::Infallible;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::error;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::cluster::ClusterGateway;
use crate::error::{ClusterError, RegistryError};
use crate::models::Health;
use crate::registry::Registry;

pub mod agents;
pub mod auth;
pub mod cluster;
pub mod sse;
pub mod tasks;

/// Shared handles every handler can reach.
#[derive(Clone)]
pub struct AppState {
  pub registry: Arc<Registry>,
  /// `None` disables token checks.
  pub token: Option<String>,
  pub host: String,
  pub gateway: Arc<dyn ClusterGateway>,
}

#[derive(Debug, Error)]
pub enum ApiError {
  #[error("{0}")]
  InvalidRequest(String),

  #[error("{0}")]
  NotFound(String),

  #[error("unauthorized")]
  Unauthorized,

  #[error("{0}")]
  Cluster(String),
}

impl warp::reject::Reject for ApiError {}

impl ApiError {
  fn status(&self) -> StatusCode {
    match self {
      ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
      ApiError::NotFound(_) => StatusCode::NOT_FOUND,
      ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
      ApiError::Cluster(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl From<RegistryError> for ApiError {
  fn from(err: RegistryError) -> Self {
    match err {
      RegistryError::InvalidRequest(msg) => ApiError::InvalidRequest(msg),
      RegistryError::NotFound(msg) => ApiError::NotFound(msg),
    }
  }
}

impl From<ClusterError> for ApiError {
  fn from(err: ClusterError) -> Self {
    if err.is_not_found() {
      return ApiError::NotFound(err.to_string());
    }
    error!(error = %err, "cluster request failed");
    ApiError::Cluster(err.to_string())
  }
}

#[derive(Serialize)]
struct ErrorBody {
  error: String,
}

pub fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
  warp::any().map(move || state.clone())
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
  health_route(state.clone())
    .or(tasks::routes(state.clone()))
    .or(agents::routes(state.clone()))
    .or(sse::routes(state.clone()))
    .or(cluster::routes(state))
    .recover(handle_rejection)
}

fn health_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("health").and(warp::get()).map(move || {
    warp::reply::json(&Health {
      status: "ok".to_string(),
      host: state.host.clone(),
    })
  })
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (status, message) = if let Some(e) = err.find::<ApiError>() {
    (e.status(), e.to_string())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "not found".to_string())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
  } else {
    error!("unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
  };
  Ok(warp::reply::with_status(warp::reply::json(&ErrorBody { error: message }), status))
}
