use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
  #[error("invalid request: {0}")]
  InvalidRequest(String),

  #[error("not found: {0}")]
  NotFound(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("missing required environment variable: {0}")]
  MissingEnvVar(String),

  #[error("invalid value for {key}: {message}")]
  InvalidValue { key: String, message: String },
}

/// Failures talking to a cluster on behalf of an organization.
#[derive(Debug, Error)]
pub enum ClusterError {
  #[error("cluster credentials for org '{org}' unavailable: {reason}")]
  Credentials { org: String, reason: String },

  #[error("kubernetes api error: {0}")]
  Kube(#[from] kube::Error),

  #[error("timed out waiting for {0}")]
  Timeout(String),

  #[error("{0}")]
  Unavailable(String),
}

impl ClusterError {
  pub fn is_conflict(&self) -> bool {
    matches!(self, ClusterError::Kube(e) if api_code(e) == Some(409))
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, ClusterError::Kube(e) if api_code(e) == Some(404))
  }
}

pub(crate) fn api_code(err: &kube::Error) -> Option<u16> {
  match err {
    kube::Error::Api(resp) => Some(resp.code),
    _ => None,
  }
}

pub(crate) fn api_reason(err: &kube::Error) -> Option<&str> {
  match err {
    kube::Error::Api(resp) => Some(resp.reason.as_str()),
    _ => None,
  }
}
