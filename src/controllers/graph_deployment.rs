/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/graph_deployment.rs
*
* Turns the generated deployment document of a request into the
* DynamoGraphDeployment object that gets submitted when `autoApply` is set.
*
* Naming and placement:
* - name: `deploymentOverrides.name`, else the document's own name.
* - namespace: `deploymentOverrides.namespace`, else the document's
*   namespace, else the request's namespace.
* - labels: document labels, then the operator's tracking labels, then the
*   override labels. Annotations: document, then overrides.
* - The request becomes the controller owner only when both live in the same
*   namespace; owner references cannot cross namespaces.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::profiling_job::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::crds::{DynamoGraphDeployment, DynamoGraphDeploymentRequest, GraphDeploymentDocument};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// Label pointing back at the request a deployment was generated for.
pub const REQUEST_NAME_LABEL: &str = "dgdr.nvidia.com/name";

#[derive(Debug, Clone)]
pub struct PlannedDeployment {
    pub name: String,
    pub namespace: String,
    /// Whether the request is set as controller owner.
    pub owned: bool,
    pub deployment: DynamoGraphDeployment,
}

pub fn plan_graph_deployment(
    request: &DynamoGraphDeploymentRequest,
    document: &GraphDeploymentDocument,
) -> PlannedDeployment {
    let overrides = request.spec.deployment_overrides.as_ref();
    let request_namespace = request.namespace().unwrap_or_default();

    let name = overrides
        .and_then(|o| o.name.clone())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| document.name().to_string());
    let namespace = overrides
        .and_then(|o| o.namespace.clone())
        .filter(|n| !n.is_empty())
        .or_else(|| document.metadata.namespace.clone().filter(|n| !n.is_empty()))
        .unwrap_or_else(|| request_namespace.clone());

    let tracking = BTreeMap::from([
        (REQUEST_NAME_LABEL.to_string(), request.name_any()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
    ]);
    let labels = merge_layers([
        document.metadata.labels.as_ref(),
        Some(&tracking),
        overrides.and_then(|o| o.labels.as_ref()),
    ]);
    let annotations = merge_layers([
        document.metadata.annotations.as_ref(),
        overrides.and_then(|o| o.annotations.as_ref()),
    ]);

    let owned = namespace == request_namespace;
    let owner_references = if owned {
        request.controller_owner_ref(&()).map(|owner| vec![owner])
    } else {
        None
    };

    let mut deployment = DynamoGraphDeployment::new(&name, document.spec.clone());
    deployment.metadata = ObjectMeta {
        name: Some(name.clone()),
        namespace: Some(namespace.clone()),
        labels: Some(labels),
        annotations: (!annotations.is_empty()).then_some(annotations),
        owner_references,
        ..Default::default()
    };

    PlannedDeployment {
        name,
        namespace,
        owned,
        deployment,
    }
}

/// Later layers win on key collisions.
fn merge_layers<const N: usize>(
    layers: [Option<&BTreeMap<String, String>>; N],
) -> BTreeMap<String, String> {
    layers
        .into_iter()
        .flatten()
        .flat_map(|layer| layer.iter().map(|(k, v)| (k.clone(), v.clone())))
        .collect()
}
