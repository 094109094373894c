pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod ledger;
pub mod models;
pub mod reconcile;
pub mod registry;
pub mod routes;
pub mod scheduler;
pub mod worker_processing;

use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();
}
