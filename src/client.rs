/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/client.rs
*
* Typed access to the cluster resources the operator touches.
*
* Architecture:
* - `ClusterClient` is the seam between the reconciliation logic and the
*   Kubernetes API. Reads return `Ok(None)` for a missing object, creates
*   report `CreateOutcome::AlreadyExists` instead of failing on a 409, and
*   status writes carry the resourceVersion they were computed from.
* - `KubeClusterClient` implements the trait on top of `kube::Api`.
* - The unit tests of the controllers run against an in-memory
*   implementation of the same trait.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::{DynamoGraphDeployment, DynamoGraphDeploymentRequest};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, ServiceAccount};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    client::Client,
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{kind} {name} was modified concurrently")]
    Conflict { kind: &'static str, name: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} is missing metadata.{field}")]
    MissingMetadata { kind: &'static str, field: &'static str },
}

/// Result of a create call. A create that races with an identical one is
/// not an error for this operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, ClientError>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, ClientError>;
    async fn create_job(&self, job: &Job) -> Result<CreateOutcome, ClientError>;
    /// Deletes with background propagation; a missing job is not an error.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    async fn get_graph_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamoGraphDeployment>, ClientError>;
    async fn create_graph_deployment(
        &self,
        deployment: &DynamoGraphDeployment,
    ) -> Result<CreateOutcome, ClientError>;

    /// Writes `request.status`, conditioned on `request`'s resourceVersion.
    /// Returns the object as stored after the write.
    async fn update_request_status(
        &self,
        request: &DynamoGraphDeploymentRequest,
    ) -> Result<DynamoGraphDeploymentRequest, ClientError>;
    /// Replaces the finalizer list, conditioned on `request`'s resourceVersion.
    async fn set_request_finalizers(
        &self,
        request: &DynamoGraphDeploymentRequest,
        finalizers: Vec<String>,
    ) -> Result<DynamoGraphDeploymentRequest, ClientError>;

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, ClientError>;
    async fn create_service_account(&self, account: &ServiceAccount) -> Result<CreateOutcome, ClientError>;

    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>, ClientError>;
    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<CreateOutcome, ClientError>;
    async fn replace_role_binding(&self, binding: &RoleBinding) -> Result<(), ClientError>;
}

/// `ClusterClient` backed by a live `kube::Client`.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, ClientError>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        Ok(self.namespaced::<K>(namespace).get_opt(name).await?)
    }

    async fn create<K>(&self, kind: &'static str, object: &K) -> Result<CreateOutcome, ClientError>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let namespace = namespace_of(kind, object)?;
        match self
            .namespaced::<K>(&namespace)
            .create(&PostParams::default(), object)
            .await
        {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_request(
        &self,
        request: &DynamoGraphDeploymentRequest,
        patch: serde_json::Value,
        status: bool,
    ) -> Result<DynamoGraphDeploymentRequest, ClientError> {
        let namespace = namespace_of("DynamoGraphDeploymentRequest", request)?;
        let name = request.name_any();
        let api: Api<DynamoGraphDeploymentRequest> = self.namespaced(&namespace);
        let params = PatchParams::default();
        let result = if status {
            api.patch_status(&name, &params, &Patch::Merge(&patch)).await
        } else {
            api.patch(&name, &params, &Patch::Merge(&patch)).await
        };
        match result {
            Ok(updated) => Ok(updated),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(ClientError::Conflict {
                kind: "DynamoGraphDeploymentRequest",
                name,
            }),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(ClientError::NotFound {
                kind: "DynamoGraphDeploymentRequest",
                name,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, ClientError> {
        self.get(namespace, name).await
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, ClientError> {
        self.get(namespace, name).await
    }

    async fn create_job(&self, job: &Job) -> Result<CreateOutcome, ClientError> {
        self.create("Job", job).await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let jobs: Api<Job> = self.namespaced(namespace);
        match jobs.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_graph_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamoGraphDeployment>, ClientError> {
        self.get(namespace, name).await
    }

    async fn create_graph_deployment(
        &self,
        deployment: &DynamoGraphDeployment,
    ) -> Result<CreateOutcome, ClientError> {
        self.create("DynamoGraphDeployment", deployment).await
    }

    async fn update_request_status(
        &self,
        request: &DynamoGraphDeploymentRequest,
    ) -> Result<DynamoGraphDeploymentRequest, ClientError> {
        let patch = json!({
            "metadata": { "resourceVersion": request.resource_version() },
            "status": request.status,
        });
        self.patch_request(request, patch, true).await
    }

    async fn set_request_finalizers(
        &self,
        request: &DynamoGraphDeploymentRequest,
        finalizers: Vec<String>,
    ) -> Result<DynamoGraphDeploymentRequest, ClientError> {
        let patch = json!({
            "metadata": {
                "resourceVersion": request.resource_version(),
                "finalizers": finalizers,
            }
        });
        self.patch_request(request, patch, false).await
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, ClientError> {
        self.get(namespace, name).await
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<CreateOutcome, ClientError> {
        self.create("ServiceAccount", account).await
    }

    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>, ClientError> {
        self.get(namespace, name).await
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<CreateOutcome, ClientError> {
        self.create("RoleBinding", binding).await
    }

    async fn replace_role_binding(&self, binding: &RoleBinding) -> Result<(), ClientError> {
        let namespace = namespace_of("RoleBinding", binding)?;
        let bindings: Api<RoleBinding> = self.namespaced(&namespace);
        bindings
            .replace(&binding.name_any(), &PostParams::default(), binding)
            .await?;
        Ok(())
    }
}

pub(crate) fn namespace_of<K: Resource>(kind: &'static str, object: &K) -> Result<String, ClientError> {
    object
        .meta()
        .namespace
        .clone()
        .ok_or(ClientError::MissingMetadata {
            kind,
            field: "namespace",
        })
}
