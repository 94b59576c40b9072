// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Kubernetes plumbing for the operator: the API-server backed
//! [`ChildApplier`] and the controller loop.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::application::operator::{
    error_policy, reconcile, ChildApplier, OperatorContext, OperatorError, RenderedChild, SECRET_KEYS,
};
use crate::domain::operator::{CSIScaleOperator, CSIScaleOperatorStatus};

/// Applies operator children through the Kubernetes API
pub struct KubeApplier {
    client: Client,
}

impl KubeApplier {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn create_or_update<T>(&self, namespace: &str, resource: T) -> Result<T, kube::Error>
    where
        T: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), namespace);
        let name = resource.name_any();

        match api.get(&name).await {
            Ok(..) => Ok(retry(ExponentialBackoff::default(), || async {
                let mut desired = resource.clone();
                let current = api.get(&name).await?;
                desired.meta_mut().resource_version = current.resource_version();

                match api.replace(&name, &PostParams::default(), &desired).await {
                    Ok(result) => Ok(result),
                    Err(e) => match e {
                        kube::Error::Api(ref err) if err.code == 409 => {
                            debug!("Conflict replacing {}, retrying", name);
                            Err(backoff::Error::transient(e))
                        }
                        _ => Err(backoff::Error::Permanent(e)),
                    },
                }
            })
            .await?),
            Err(kube::Error::Api(ref err)) if err.code == 404 => {
                info!("Creating {}/{}", namespace, name);
                api.create(&PostParams::default(), &resource).await
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ChildApplier for KubeApplier {
    async fn verify_secret(&self, namespace: &str, name: &str) -> Result<(), OperatorError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret_error = |reason: String| OperatorError::Secret {
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason,
        };

        let secret = match api.get_opt(name).await? {
            Some(secret) => secret,
            None => return Err(secret_error("not found".to_string())),
        };
        let data = secret.data.unwrap_or_default();
        let string_data = secret.string_data.unwrap_or_default();
        for key in SECRET_KEYS {
            if !data.contains_key(key) && !string_data.contains_key(key) {
                return Err(secret_error(format!("missing key '{}'", key)));
            }
        }
        Ok(())
    }

    async fn apply(&self, namespace: &str, child: RenderedChild) -> Result<(), OperatorError> {
        match child {
            RenderedChild::ConfigMap(object) => {
                self.create_or_update::<ConfigMap>(namespace, object).await?;
            }
            RenderedChild::DaemonSet(object) => {
                self.create_or_update::<DaemonSet>(namespace, object).await?;
            }
            RenderedChild::StatefulSet(object) => {
                self.create_or_update::<StatefulSet>(namespace, object).await?;
            }
        }
        Ok(())
    }

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: CSIScaleOperatorStatus,
    ) -> Result<(), OperatorError> {
        let api: Api<CSIScaleOperator> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Run the operator until a shutdown signal arrives.
///
/// `namespace` limits the watch; `None` watches every namespace.
pub async fn run_operator(client: Client, namespace: Option<&str>, ctx: Arc<OperatorContext>) {
    let operators: Api<CSIScaleOperator> = match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let daemon_sets: Api<DaemonSet> = match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let stateful_sets: Api<StatefulSet> = match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let config_maps: Api<ConfigMap> = match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client),
    };

    info!("Starting CSIScaleOperator controller");
    Controller::new(operators, watcher::Config::default())
        .owns(daemon_sets, watcher::Config::default())
        .owns(stateful_sets, watcher::Config::default())
        .owns(config_maps, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!("Reconciled {}", object.name),
                Err(e) => warn!("Reconciliation error: {:?}", e),
            }
        })
        .await;
    info!("CSIScaleOperator controller stopped");
}
