//! Per-organization access to a Kubernetes cluster.
//!
//! [`ClusterGateway`] hands out a `kube::Client` bound to an organization.
//! [`KubeconfigGateway`] resolves a kubeconfig file per org and caches the
//! resulting client, so credentials are read once per handle.

pub mod crd;
pub mod deploy;
pub mod resources;
pub mod status;

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use kube::config::{KubeConfigOptions, Kubeconfig};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::ClusterError;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait ClusterGateway: Send + Sync {
  async fn client_for(&self, org: &str) -> Result<Client, ClusterError>;
}

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Loads one kubeconfig per organization from the local filesystem.
#[derive(Clone)]
pub struct KubeconfigGateway {
  lookup: Lookup,
  clients: Arc<Mutex<HashMap<String, Client>>>,
}

impl KubeconfigGateway {
  pub fn from_env() -> Self {
    Self::with_lookup(|key| env::var(key).ok())
  }

  pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
    Self {
      lookup: Arc::new(lookup),
      clients: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  fn var(&self, key: &str) -> Option<String> {
    (self.lookup)(key).filter(|v| !v.is_empty())
  }

  /// Picks the first existing candidate among `$KUBECONFIG`, the state
  /// directories and `~/.kube/<org>.config`. The last one is returned even
  /// when it does not exist, so the load error names a concrete path.
  pub fn kubeconfig_path_for_org(&self, org: &str) -> PathBuf {
    let file = format!("{}.config", org);

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(kc) = self.var("KUBECONFIG") {
      candidates.push(PathBuf::from(kc));
    }
    if let Some(base) = self.var("GUILDNET_STATE_DIR") {
      candidates.push(PathBuf::from(base).join("kube").join(&file));
    }
    if let Some(base) = self.var("GUILDNET_HOME") {
      candidates.push(PathBuf::from(base).join("state").join("kube").join(&file));
    }
    let home = PathBuf::from(self.var("HOME").unwrap_or_else(|| "/root".to_string()));
    let state_dir = if self.var("GUILDNET_ENV").as_deref() == Some("dev") { ".guildnetdev" } else { ".guildnet" };
    candidates.push(home.join(state_dir).join("state").join("kube").join(&file));

    candidates
      .into_iter()
      .find(|p| p.is_file())
      .unwrap_or_else(|| home.join(".kube").join(file))
  }

  pub fn cached(&self) -> usize {
    self.clients.lock().len()
  }

  async fn connect(&self, org: &str) -> Result<Client, ClusterError> {
    let path = self.kubeconfig_path_for_org(org);
    debug!(org, path = %path.display(), "loading kubeconfig");
    let credentials = |reason: String| ClusterError::Credentials {
      org: org.to_string(),
      reason,
    };

    let kubeconfig = Kubeconfig::read_from(&path).map_err(|e| credentials(format!("{}: {}", path.display(), e)))?;
    let mut config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
      .await
      .map_err(|e| credentials(e.to_string()))?;
    config.connect_timeout = Some(CLIENT_TIMEOUT);
    config.read_timeout = Some(CLIENT_TIMEOUT);

    let client = Client::try_from(config)?;
    info!(org, path = %path.display(), "cluster client ready");
    Ok(client)
  }
}

#[async_trait]
impl ClusterGateway for KubeconfigGateway {
  async fn client_for(&self, org: &str) -> Result<Client, ClusterError> {
    let cached = self.clients.lock().get(org).cloned();
    if let Some(client) = cached {
      return Ok(client);
    }
    let client = self.connect(org).await?;
    self.clients.lock().entry(org.to_string()).or_insert_with(|| client.clone());
    Ok(client)
  }
}

/// Reachability check. Returns the API server's git version.
pub async fn ping(client: &Client) -> Result<String, ClusterError> {
  let info = client.apiserver_version().await?;
  Ok(info.git_version)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::TempDir;

  const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: local
  cluster:
    server: http://127.0.0.1:1
contexts:
- name: local
  context:
    cluster: local
    user: local
current-context: local
users:
- name: local
  user:
    token: abc
"#;

  fn gateway(vars: Vec<(&'static str, String)>) -> KubeconfigGateway {
    let map: HashMap<&'static str, String> = vars.into_iter().collect();
    KubeconfigGateway::with_lookup(move |key| map.get(key).cloned())
  }

  fn write(path: &std::path::Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, KUBECONFIG).unwrap();
  }

  #[test]
  fn kubeconfig_env_wins_when_the_file_exists() {
    let dir = TempDir::new().unwrap();
    let explicit = dir.path().join("explicit.config");
    write(&explicit);
    let state = dir.path().join("state");
    write(&state.join("kube").join("acme.config"));

    let gw = gateway(vec![
      ("KUBECONFIG", explicit.display().to_string()),
      ("GUILDNET_STATE_DIR", state.display().to_string()),
    ]);
    assert_eq!(gw.kubeconfig_path_for_org("acme"), explicit);
  }

  #[test]
  fn missing_kubeconfig_env_falls_through_to_state_dir() {
    let dir = TempDir::new().unwrap();
    let state = dir.path().join("state");
    write(&state.join("kube").join("acme.config"));

    let gw = gateway(vec![
      ("KUBECONFIG", dir.path().join("nope").display().to_string()),
      ("GUILDNET_STATE_DIR", state.display().to_string()),
    ]);
    assert_eq!(gw.kubeconfig_path_for_org("acme"), state.join("kube").join("acme.config"));
  }

  #[test]
  fn dev_env_uses_the_dev_state_dir() {
    let home = TempDir::new().unwrap();
    let dev = home.path().join(".guildnetdev/state/kube/acme.config");
    write(&dev);

    let gw = gateway(vec![("HOME", home.path().display().to_string()), ("GUILDNET_ENV", "dev".into())]);
    assert_eq!(gw.kubeconfig_path_for_org("acme"), dev);

    let prod = gateway(vec![("HOME", home.path().display().to_string())]);
    assert_eq!(prod.kubeconfig_path_for_org("acme"), home.path().join(".kube/acme.config"));
  }

  #[tokio::test]
  async fn missing_file_is_a_credentials_error() {
    let home = TempDir::new().unwrap();
    let gw = gateway(vec![("HOME", home.path().display().to_string())]);
    let err = gw.client_for("acme").await.err().unwrap();
    assert!(matches!(err, ClusterError::Credentials { ref org, .. } if org == "acme"));
    assert_eq!(gw.cached(), 0);
  }

  #[tokio::test]
  async fn clients_are_cached_per_org() {
    let home = TempDir::new().unwrap();
    write(&home.path().join(".kube/acme.config"));
    let gw = gateway(vec![("HOME", home.path().display().to_string())]);

    gw.client_for("acme").await.unwrap();
    gw.client_for("acme").await.unwrap();
    assert_eq!(gw.cached(), 1);
    assert!(gw.client_for("other").await.is_err());
  }
}
