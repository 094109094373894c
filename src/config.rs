use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_ORCHESTRATOR_URL: &str = "http://host.k3d.internal:18080";
pub const DEFAULT_AGENT_IMAGE: &str = "mvp-agent:latest";
pub const DEFAULT_AGENT_PORT: i32 = 8443;
pub const DEFAULT_AGENT_NAMESPACE: &str = "mvp-agents";

#[derive(Debug, Clone)]
pub struct Config {
  pub server_port: u16,
  /// Shared bearer token. `None` leaves every endpoint open.
  pub token: Option<String>,
  pub host: String,
}

impl Config {
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
    Ok(Self {
      server_port: parse_or(&lookup, "SERVER_PORT", 8080)?,
      token: non_empty(&lookup, "ORCHESTRATOR_TOKEN"),
      host: non_empty(&lookup, "HOSTNAME").unwrap_or_else(hostname),
    })
  }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
  pub orchestrator_url: String,
  pub org: String,
  pub token: Option<String>,
  pub name: String,
  pub task_command: Option<String>,
  pub idle_backoff: Duration,
  pub error_backoff: Duration,
  pub http_timeout: Duration,
}

impl AgentConfig {
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
    Ok(Self {
      orchestrator_url: non_empty(&lookup, "ORCHESTRATOR_URL")
        .unwrap_or_else(|| DEFAULT_ORCHESTRATOR_URL.into())
        .trim_end_matches('/')
        .to_string(),
      org: non_empty(&lookup, "ORG_NAME").ok_or_else(|| ConfigError::MissingEnvVar("ORG_NAME".into()))?,
      token: non_empty(&lookup, "ORCHESTRATOR_TOKEN"),
      name: non_empty(&lookup, "AGENT_NAME")
        .or_else(|| non_empty(&lookup, "HOSTNAME"))
        .unwrap_or_else(hostname),
      task_command: non_empty(&lookup, "AGENT_TASK_COMMAND"),
      idle_backoff: Duration::from_secs(parse_or(&lookup, "AGENT_IDLE_BACKOFF_SECS", 5)?),
      error_backoff: Duration::from_secs(parse_or(&lookup, "AGENT_ERROR_BACKOFF_SECS", 3)?),
      http_timeout: Duration::from_secs(parse_or(&lookup, "AGENT_HTTP_TIMEOUT_SECS", 10)?),
    })
  }
}

#[derive(Debug, Clone)]
pub struct OperatorConfig {
  /// `None` watches every namespace.
  pub namespace: Option<String>,
  pub default_image: String,
  pub agent_port: i32,
}

impl OperatorConfig {
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
    Ok(Self {
      namespace: non_empty(&lookup, "WATCH_NAMESPACE"),
      default_image: non_empty(&lookup, "AGENT_IMAGE").unwrap_or_else(|| DEFAULT_AGENT_IMAGE.into()),
      agent_port: parse_or(&lookup, "AGENT_PORT", DEFAULT_AGENT_PORT)?,
    })
  }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
  lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
  T: FromStr,
  T::Err: std::fmt::Display,
{
  match non_empty(lookup, key) {
    None => Ok(default),
    Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
      key: key.to_string(),
      message: format!("'{}': {}", raw, e),
    }),
  }
}

/// Best-effort host identity for health output and agent naming.
pub fn hostname() -> String {
  std::fs::read_to_string("/etc/hostname")
    .ok()
    .map(|h| h.trim().to_string())
    .filter(|h| !h.is_empty())
    .unwrap_or_else(|| "localhost".to_string())
}
