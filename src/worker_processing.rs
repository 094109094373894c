use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::{info, warn};

use crate::client::RegistryClient;
use crate::config::AgentConfig;
use crate::models::{AGENT_IDLE, AGENT_RUNNING, Task, TaskStatus};

/// What a single pass of the claim loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
  /// Nothing to do for this org.
  Idle,
  /// The registry could not be reached or refused the claim.
  Failed,
  /// A task was claimed and carried to completion.
  Processed(String),
}

pub struct Worker {
  client: RegistryClient,
  config: AgentConfig,
}

impl Worker {
  pub fn new(config: AgentConfig) -> Result<Self> {
    let client = RegistryClient::new(&config.orchestrator_url, config.token.clone(), config.http_timeout)?;
    Ok(Self { client, config })
  }

  pub fn name(&self) -> &str {
    &self.config.name
  }

  /// Connectivity check plus one registration. Neither is fatal: the claim
  /// loop keeps retrying on its own schedule.
  pub async fn start(&self) {
    match self.client.health().await {
      Ok(health) => info!(url = %self.config.orchestrator_url, host = %health.host, "connected to orchestrator"),
      Err(e) => warn!(url = %self.config.orchestrator_url, error = %e, "orchestrator health check failed"),
    }
    match self.client.register(&self.config.name, &self.config.org, Default::default()).await {
      Ok(agent) => info!(agent = %agent.name, org = %agent.org, "registered"),
      Err(e) => warn!(agent = %self.config.name, error = %e, "registration failed"),
    }
  }

  pub async fn run(&self) {
    self.start().await;
    loop {
      match self.poll_once().await {
        Poll::Idle => sleep(self.config.idle_backoff).await,
        Poll::Failed => sleep(self.config.error_backoff).await,
        Poll::Processed(_) => {}
      }
    }
  }

  pub async fn poll_once(&self) -> Poll {
    let name = &self.config.name;
    let org = &self.config.org;
    self.client.heartbeat(name, org, AGENT_IDLE).await;

    let task = match self.client.claim(org, name).await {
      Ok(Some(task)) => task,
      Ok(None) => return Poll::Idle,
      Err(e) => {
        warn!(agent = %name, error = %e, "claim failed");
        return Poll::Failed;
      }
    };

    info!(agent = %name, task_id = %task.id, "claimed task");
    self.process(&task).await;
    self.client.heartbeat(name, org, AGENT_IDLE).await;
    Poll::Processed(task.id)
  }

  async fn process(&self, task: &Task) {
    let client = &self.client;
    client.notify_status(&task.id, TaskStatus::Running).await;
    client.task_log(&task.id, "claimed task").await;
    client.heartbeat(&self.config.name, &self.config.org, AGENT_RUNNING).await;

    let summary = match &self.config.task_command {
      None => "no task command configured".to_string(),
      Some(command) => match run_task_command(client, command, task).await {
        Ok(status) if status.success() => "task command succeeded".to_string(),
        Ok(status) => format!("task command exited with {}", status),
        Err(e) => format!("task command failed: {:#}", e),
      },
    };
    client.task_log(&task.id, &summary).await;
    client.agent_log(&self.config.name, &format!("task {}: {}", task.id, summary)).await;

    client.notify_status(&task.id, TaskStatus::Completed).await;
    client.task_log(&task.id, "task done").await;
    info!(agent = %self.config.name, task_id = %task.id, outcome = %summary, "task finished");
  }
}

/// Runs `command` through `sh -c`, forwarding every stdout and stderr line to
/// the task's log as it is produced.
pub async fn run_task_command(client: &RegistryClient, command: &str, task: &Task) -> Result<ExitStatus> {
  let mut child = Command::new("sh")
    .arg("-c")
    .arg(command)
    .env("TASK_ID", &task.id)
    .env("TASK_TEXT", &task.text)
    .env("ORG", &task.org)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true)
    .spawn()
    .with_context(|| format!("spawning '{}'", command))?;

  let stdout = child.stdout.take().context("stdout not captured")?;
  let stderr = child.stderr.take().context("stderr not captured")?;
  let mut lines = LinesStream::new(BufReader::new(stdout).lines()).merge(LinesStream::new(BufReader::new(stderr).lines()));

  while let Some(line) = lines.next().await {
    match line {
      Ok(line) => client.task_log(&task.id, &line).await,
      Err(e) => {
        warn!(task_id = %task.id, error = %e, "reading task command output");
        break;
      }
    }
  }
  child.wait().await.context("waiting for task command")
}
