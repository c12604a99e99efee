/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/rbac_manager.rs
*
* Provisions the identity profiling jobs run under.
*
* Architecture:
* - In cluster-wide mode every namespace that receives a request needs the
*   profiling ServiceAccount and a RoleBinding that grants it the profiling
*   ClusterRole. The controller asks for this through the one-method
*   `RbacManager` trait before each job launch.
* - `RbacProvisioner` implements it with get-or-create semantics: an
*   existing ServiceAccount is left alone, an existing RoleBinding is only
*   touched when its subjects drifted. `roleRef` cannot be changed on a live
*   RoleBinding, so a mismatch there is reported and left as is.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::client::{ClientError, ClusterClient, CreateOutcome};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const OPERATOR_NAME: &str = "dynamo-operator";

#[derive(Debug, Error)]
pub enum RbacError {
    #[error("failed to ensure ServiceAccount {name}: {source}")]
    ServiceAccount {
        name: String,
        #[source]
        source: ClientError,
    },

    #[error("failed to ensure RoleBinding {name}: {source}")]
    RoleBinding {
        name: String,
        #[source]
        source: ClientError,
    },
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait RbacManager: Send + Sync {
    /// Makes sure `service_account` exists in `namespace` and is bound to
    /// `cluster_role`. Safe to call on every reconcile.
    async fn ensure_service_account_with_rbac(
        &self,
        namespace: &str,
        service_account: &str,
        cluster_role: &str,
    ) -> Result<(), RbacError>;
}

pub struct RbacProvisioner {
    client: Arc<dyn ClusterClient>,
}

impl RbacProvisioner {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    async fn ensure_service_account(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        if self.client.get_service_account(namespace, name).await?.is_some() {
            debug!(namespace, service_account = name, "ServiceAccount already exists");
            return Ok(());
        }
        match self
            .client
            .create_service_account(&desired_service_account(namespace, name))
            .await?
        {
            CreateOutcome::Created => info!(namespace, service_account = name, "Created ServiceAccount"),
            CreateOutcome::AlreadyExists => {
                debug!(namespace, service_account = name, "ServiceAccount created concurrently")
            }
        }
        Ok(())
    }

    async fn ensure_role_binding(
        &self,
        namespace: &str,
        service_account: &str,
        cluster_role: &str,
    ) -> Result<(), ClientError> {
        let desired = desired_role_binding(namespace, service_account, cluster_role);
        let name = role_binding_name(service_account);

        let Some(mut existing) = self.client.get_role_binding(namespace, &name).await? else {
            match self.client.create_role_binding(&desired).await? {
                CreateOutcome::Created => {
                    info!(namespace, role_binding = %name, cluster_role, "Created RoleBinding")
                }
                CreateOutcome::AlreadyExists => {
                    debug!(namespace, role_binding = %name, "RoleBinding created concurrently")
                }
            }
            return Ok(());
        };

        if existing.role_ref.name != cluster_role || existing.role_ref.kind != "ClusterRole" {
            warn!(
                namespace,
                role_binding = %name,
                current = %existing.role_ref.name,
                expected = cluster_role,
                "RoleBinding references a different role; roleRef is immutable, leaving it unchanged"
            );
        }

        if existing.subjects == desired.subjects {
            debug!(namespace, role_binding = %name, "RoleBinding is up to date");
            return Ok(());
        }

        existing.subjects = desired.subjects;
        self.client.replace_role_binding(&existing).await?;
        info!(namespace, role_binding = %name, "Updated RoleBinding subjects");
        Ok(())
    }
}

#[async_trait]
impl RbacManager for RbacProvisioner {
    async fn ensure_service_account_with_rbac(
        &self,
        namespace: &str,
        service_account: &str,
        cluster_role: &str,
    ) -> Result<(), RbacError> {
        self.ensure_service_account(namespace, service_account)
            .await
            .map_err(|source| RbacError::ServiceAccount {
                name: service_account.to_string(),
                source,
            })?;
        self.ensure_role_binding(namespace, service_account, cluster_role)
            .await
            .map_err(|source| RbacError::RoleBinding {
                name: role_binding_name(service_account),
                source,
            })
    }
}

pub fn role_binding_name(service_account: &str) -> String {
    format!("{service_account}-binding")
}

fn rbac_labels(service_account: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), OPERATOR_NAME.to_string()),
        (COMPONENT_LABEL.to_string(), "rbac".to_string()),
        (NAME_LABEL.to_string(), service_account.to_string()),
    ])
}

fn desired_service_account(namespace: &str, name: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(rbac_labels(name)),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn desired_role_binding(namespace: &str, service_account: &str, cluster_role: &str) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(role_binding_name(service_account)),
            namespace: Some(namespace.to_string()),
            labels: Some(rbac_labels(service_account)),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}
