//! Builders for the secret, deployment and service that back one agent.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
  Container, ContainerPort, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, Probe, Secret, SecretKeySelector, Service,
  ServicePort, ServiceSpec, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

pub const CONTAINER_NAME: &str = "agent";

/// Everything needed to render the children of one agent.
#[derive(Debug, Clone)]
pub struct AgentResources {
  pub name: String,
  pub namespace: String,
  pub image: String,
  pub port: i32,
  pub env: BTreeMap<String, String>,
  /// Attach TCP readiness/liveness probes on `port`.
  pub probes: bool,
  pub owner: Option<OwnerReference>,
}

impl AgentResources {
  pub fn secret_name(&self) -> String {
    format!("{}-env", self.name)
  }

  fn labels(&self) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), self.name.clone())])
  }

  fn metadata(&self, name: String) -> ObjectMeta {
    ObjectMeta {
      name: Some(name),
      namespace: Some(self.namespace.clone()),
      labels: Some(self.labels()),
      owner_references: self.owner.clone().map(|o| vec![o]),
      ..Default::default()
    }
  }

  pub fn secret(&self) -> Secret {
    Secret {
      metadata: self.metadata(self.secret_name()),
      string_data: Some(self.env.clone()),
      type_: Some("Opaque".to_string()),
      ..Default::default()
    }
  }

  /// Every env key is projected from the companion secret rather than
  /// inlined into the pod spec.
  fn env_from_secret(&self) -> Option<Vec<EnvVar>> {
    if self.env.is_empty() {
      return None;
    }
    let secret = self.secret_name();
    Some(
      self
        .env
        .keys()
        .map(|key| EnvVar {
          name: key.clone(),
          value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
              name: secret.clone(),
              key: key.clone(),
              optional: None,
            }),
            ..Default::default()
          }),
          ..Default::default()
        })
        .collect(),
    )
  }

  fn tcp_probe(&self, initial_delay: i32, period: i32) -> Probe {
    Probe {
      tcp_socket: Some(TCPSocketAction {
        port: IntOrString::Int(self.port),
        ..Default::default()
      }),
      initial_delay_seconds: Some(initial_delay),
      period_seconds: Some(period),
      ..Default::default()
    }
  }

  pub fn deployment(&self) -> Deployment {
    let container = Container {
      name: CONTAINER_NAME.to_string(),
      image: Some(self.image.clone()),
      ports: Some(vec![ContainerPort {
        container_port: self.port,
        ..Default::default()
      }]),
      env: self.env_from_secret(),
      readiness_probe: self.probes.then(|| self.tcp_probe(2, 5)),
      liveness_probe: self.probes.then(|| self.tcp_probe(5, 10)),
      ..Default::default()
    };

    Deployment {
      metadata: self.metadata(self.name.clone()),
      spec: Some(DeploymentSpec {
        replicas: Some(1),
        selector: LabelSelector {
          match_labels: Some(self.labels()),
          ..Default::default()
        },
        template: PodTemplateSpec {
          metadata: Some(ObjectMeta {
            labels: Some(self.labels()),
            ..Default::default()
          }),
          spec: Some(PodSpec {
            containers: vec![container],
            ..Default::default()
          }),
        },
        ..Default::default()
      }),
      ..Default::default()
    }
  }

  pub fn service(&self) -> Service {
    Service {
      metadata: self.metadata(self.name.clone()),
      spec: Some(ServiceSpec {
        selector: Some(self.labels()),
        ports: Some(vec![ServicePort {
          port: self.port,
          target_port: Some(IntOrString::Int(self.port)),
          ..Default::default()
        }]),
        type_: Some("ClusterIP".to_string()),
        ..Default::default()
      }),
      ..Default::default()
    }
  }
}
