use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::Action as ControllerAction;
use kube::runtime::{Controller, watcher};
use kube::{Api, Client, CustomResourceExt};
use tracing::{debug, error, info};

use orchestrator::cluster::crd::AgentTask;
use orchestrator::config::OperatorConfig;
use orchestrator::init_tracing;
use orchestrator::reconcile::{KubeStore, Reconcile, ReconcileError, Reconciler, Settings};

type Ctx = Reconciler<KubeStore>;

async fn reconcile(task: Arc<AgentTask>, ctx: Arc<Ctx>) -> Result<ControllerAction, ReconcileError> {
  let action = ctx.reconcile(&task.key()).await?;
  Ok(action.into())
}

fn error_policy(task: Arc<AgentTask>, err: &ReconcileError, _ctx: Arc<Ctx>) -> ControllerAction {
  error!(task = %task.key(), error = %err, "reconcile failed");
  ControllerAction::requeue(Duration::from_secs(5))
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
  K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
  K::DynamicType: Default,
{
  match namespace {
    Some(ns) => Api::namespaced(client.clone(), ns),
    None => Api::all(client.clone()),
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  if std::env::args().any(|arg| arg == "--crd") {
    println!("{}", serde_json::to_string_pretty(&AgentTask::crd())?);
    return Ok(());
  }

  init_tracing();
  let config = OperatorConfig::from_env()?;
  let client = Client::try_default().await.context("connecting to cluster")?;
  let namespace = config.namespace.as_deref();
  info!(namespace = namespace.unwrap_or("*"), image = %config.default_image, "operator starting");

  let settings = Settings {
    default_image: config.default_image.clone(),
    agent_port: config.agent_port,
    ..Settings::default()
  };
  let ctx = Arc::new(Reconciler::new(KubeStore::new(client.clone()), settings));

  Controller::new(scoped::<AgentTask>(&client, namespace), watcher::Config::default())
    .owns(scoped::<Deployment>(&client, namespace), watcher::Config::default())
    .owns(scoped::<Service>(&client, namespace), watcher::Config::default())
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|result| async move {
      match result {
        Ok((object, _)) => debug!(task = %object.name, "reconciled"),
        Err(e) => debug!(error = %e, "controller event"),
      }
    })
    .await;

  info!("operator stopped");
  Ok(())
}
