use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use orchestrator::cluster::KubeconfigGateway;
use orchestrator::config::Config;
use orchestrator::registry::Registry;
use orchestrator::routes::{AppState, routes};
use orchestrator::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
  init_tracing();
  let config = Config::from_env()?;

  let state = AppState {
    registry: Arc::new(Registry::new()),
    token: config.token.clone(),
    host: config.host.clone(),
    gateway: Arc::new(KubeconfigGateway::from_env()),
  };
  if state.token.is_none() {
    info!("no ORCHESTRATOR_TOKEN set; mutating endpoints are open");
  }
  info!(port = config.server_port, host = %config.host, "orchestrator listening");

  warp::serve(routes(state))
    .run(([0, 0, 0, 0], config.server_port))
    .await;
  Ok(())
}
