//! HTTP client the remote agent uses to talk to the registry.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::models::{
  Agent, AgentLogRequest, ClaimRequest, Health, HeartbeatRequest, NoTask, RegisterRequest, Task, TaskLogRequest,
  TaskStatus, UpdateRequest,
};
use crate::routes::auth::TOKEN_HEADER;

#[derive(Deserialize)]
#[serde(untagged)]
enum ClaimResponse {
  Claimed(Task),
  Empty(NoTask),
}

#[derive(Clone)]
pub struct RegistryClient {
  http: reqwest::Client,
  base: String,
  token: Option<String>,
}

impl RegistryClient {
  pub fn new(base: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .context("building http client")?;
    Ok(Self {
      http,
      base: base.into().trim_end_matches('/').to_string(),
      token,
    })
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.base, path)
  }

  fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
    match &self.token {
      Some(token) => req.header(TOKEN_HEADER, token),
      None => req,
    }
  }

  async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<reqwest::Response> {
    let resp = self
      .authorized(self.http.post(self.url(path)).json(body))
      .send()
      .await
      .with_context(|| format!("POST {}", path))?;
    if !resp.status().is_success() {
      let status = resp.status();
      let text = resp.text().await.unwrap_or_default();
      return Err(anyhow!("POST {} returned {}: {}", path, status, text.trim()));
    }
    Ok(resp)
  }

  pub async fn health(&self) -> Result<Health> {
    let resp = self.http.get(self.url("/health")).send().await.context("GET /health")?;
    Ok(resp.error_for_status()?.json().await?)
  }

  pub async fn register(&self, name: &str, org: &str, labels: BTreeMap<String, String>) -> Result<Agent> {
    let body = RegisterRequest {
      name: name.to_string(),
      org: org.to_string(),
      labels,
    };
    Ok(self.post("/agents/register", &body).await?.json().await?)
  }

  /// `Ok(None)` when the registry has nothing for this org right now.
  pub async fn claim(&self, org: &str, agent_id: &str) -> Result<Option<Task>> {
    let body = ClaimRequest {
      org: org.to_string(),
      agent_id: agent_id.to_string(),
    };
    match self.post("/tasks/claim", &body).await?.json::<ClaimResponse>().await? {
      ClaimResponse::Claimed(task) => Ok(Some(task)),
      ClaimResponse::Empty(empty) => Ok(empty.task),
    }
  }

  pub async fn update_status(&self, id: &str, status: TaskStatus) -> Result<Task> {
    let body = UpdateRequest {
      id: id.to_string(),
      status: status.to_string(),
    };
    Ok(self.post("/tasks/update", &body).await?.json().await?)
  }

  // Observability calls below never gate task progress: one attempt, a
  // warning on failure, no retries.

  pub async fn notify_status(&self, id: &str, status: TaskStatus) {
    if let Err(e) = self.update_status(id, status).await {
      warn!(task_id = id, status = %status, error = %e, "status update failed");
    }
  }

  pub async fn heartbeat(&self, name: &str, org: &str, status: &str) {
    let body = HeartbeatRequest {
      name: name.to_string(),
      org: Some(org.to_string()),
      status: Some(status.to_string()),
    };
    if let Err(e) = self.post("/agents/heartbeat", &body).await {
      warn!(agent = name, error = %e, "heartbeat failed");
    }
  }

  pub async fn task_log(&self, id: &str, line: &str) {
    let body = TaskLogRequest {
      id: id.to_string(),
      line: line.to_string(),
    };
    if let Err(e) = self.post("/tasks/log", &body).await {
      warn!(task_id = id, error = %e, "task log post failed");
    }
  }

  pub async fn agent_log(&self, name: &str, line: &str) {
    let body = AgentLogRequest {
      name: name.to_string(),
      line: line.to_string(),
    };
    if let Err(e) = self.post("/agents/log", &body).await {
      warn!(agent = name, error = %e, "agent log post failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn claim_response_distinguishes_empty_from_claimed() {
    let empty: ClaimResponse = serde_json::from_str(r#"{"task":null}"#).unwrap();
    assert!(matches!(empty, ClaimResponse::Empty(NoTask { task: None })));

    let claimed: ClaimResponse = serde_json::from_str(
      r#"{"id":"1","org":"acme","text":"x","status":"running","createdAt":"2025-01-01T00:00:00Z","agentId":"a"}"#,
    )
    .unwrap();
    match claimed {
      ClaimResponse::Claimed(task) => assert_eq!(task.agent_id.as_deref(), Some("a")),
      ClaimResponse::Empty(_) => panic!("expected a task"),
    }
  }

  #[test]
  fn base_url_is_normalized() {
    let client = RegistryClient::new("http://orch:8080/", None, Duration::from_secs(1)).unwrap();
    assert_eq!(client.url("/health"), "http://orch:8080/health");
  }
}
