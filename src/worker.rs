use anyhow::Result;
use tracing::info;

use orchestrator::config::AgentConfig;
use orchestrator::init_tracing;
use orchestrator::worker_processing::Worker;

#[tokio::main]
async fn main() -> Result<()> {
  init_tracing();
  let config = AgentConfig::from_env()?;
  info!(org = %config.org, agent = %config.name, url = %config.orchestrator_url, "agent starting");

  let worker = Worker::new(config)?;
  tokio::select! {
    _ = worker.run() => {}
    _ = tokio::signal::ctrl_c() => info!(agent = %worker.name(), "shutting down"),
  }
  Ok(())
}
