/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/profiling_job.rs
*
* Synthesizes and maintains the profiling Job of a request.
*
* Architecture:
* - Every name derived from a request lives in `ProfilingNames`, so the
*   controller, the launcher and the sidecar script agree on them.
* - The Job runs two containers over a shared `emptyDir`: the profiler
*   writes `k8s_deploy.yaml` into `/output`, the `output-copier` sidecar
*   waits for it, wraps its spec in a DynamoGraphDeployment named after the
*   request and publishes it as the output ConfigMap, owned by the request.
* - `ensure_profiling_job` is idempotent. An existing Job is compared with
*   the desired one through a fingerprint of the fields this operator sets;
*   a Job template cannot be patched, so drift is fixed by deleting the Job
*   and creating it again.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::rbac_manager::{RbacError, RbacManager};
use crate::client::{ClientError, ClusterClient, CreateOutcome};
use crate::config::OperatorConfig;
use crate::crds::{DynamoGraphDeploymentRequest, API_VERSION};
use crate::metrics;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EmptyDirVolumeSource, KeyToPath, PodSpec, PodTemplateSpec, Volume,
    VolumeMount,
};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const PROFILING_SERVICE_ACCOUNT: &str = "dgdr-profiling-job";
pub const PROFILER_CONTAINER: &str = "profiler";
pub const OUTPUT_COPIER_CONTAINER: &str = "output-copier";
pub const OUTPUT_VOLUME: &str = "profiling-output";
pub const CONFIG_VOLUME: &str = "profiling-config";
pub const OUTPUT_DIR: &str = "/output";
pub const CONFIG_DIR: &str = "/config";
pub const CONFIG_FILE: &str = "disagg.yaml";
/// Key of the generated deployment, both as a file in `/output` and in the
/// output ConfigMap.
pub const OUTPUT_FILE: &str = "k8s_deploy.yaml";
pub const DEFAULT_CONFIG_KEY: &str = "disagg.yaml";

pub const APP_LABEL: &str = "app";
pub const REQUEST_LABEL: &str = "dgdr";
pub const MANAGED_BY_LABEL: &str = "nvidia.com/managed-by";
pub const MANAGED_BY_VALUE: &str = "dynamo-operator";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{mode} profiling image not configured")]
    ImageNotConfigured { mode: &'static str },

    #[error("request has no uid, cannot own the profiling job")]
    MissingOwner,

    #[error("failed to ensure profiling job RBAC: {0}")]
    Rbac(#[from] RbacError),

    #[error("profiling job {0} is still being deleted")]
    PendingDeletion(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl LaunchError {
    /// Whether retrying cannot succeed without a configuration or spec change.
    pub fn is_permanent(&self) -> bool {
        matches!(self, LaunchError::ImageNotConfigured { .. } | LaunchError::MissingOwner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilingMode {
    /// Profiles against real workers.
    Online,
    /// AI-configurator estimation, no GPUs involved.
    Offline,
}

impl ProfilingMode {
    pub fn of(request: &DynamoGraphDeploymentRequest) -> Self {
        if request.spec.online {
            ProfilingMode::Online
        } else {
            ProfilingMode::Offline
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProfilingMode::Online => "online",
            ProfilingMode::Offline => "AIC",
        }
    }

    fn job_prefix(&self) -> &'static str {
        match self {
            ProfilingMode::Online => "profile-online",
            ProfilingMode::Offline => "profile-aic",
        }
    }

    fn app_label(&self) -> &'static str {
        match self {
            ProfilingMode::Online => "dynamo-profiler",
            ProfilingMode::Offline => "aic-profiler",
        }
    }

    fn image<'a>(&self, config: &'a OperatorConfig) -> Option<&'a str> {
        match self {
            ProfilingMode::Online => config.online_profiling_image.as_deref(),
            ProfilingMode::Offline => config.aic_profiling_image.as_deref(),
        }
    }
}

/// Names derived from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilingNames {
    pub mode: ProfilingMode,
    pub job: String,
    pub output_config_map: String,
}

impl ProfilingNames {
    pub fn for_request(request: &DynamoGraphDeploymentRequest) -> Self {
        let mode = ProfilingMode::of(request);
        let name = request.name_any();
        Self {
            mode,
            job: format!("{}-{}", mode.job_prefix(), name),
            output_config_map: format!("dgdr-output-{name}"),
        }
    }

    /// Value stored in `status.profilingResults`.
    pub fn results_reference(&self) -> String {
        format!("configmap/{}", self.output_config_map)
    }
}

/// What `ensure_profiling_job` had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSync {
    Created,
    Unchanged,
    Recreated,
}

/// Observed progress of a profiling Job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Running,
    Succeeded,
    Failed(String),
}

pub fn job_outcome(job: &Job) -> JobOutcome {
    let conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();
    for condition in conditions.iter().filter(|c| c.status == "True") {
        match condition.type_.as_str() {
            "Complete" => return JobOutcome::Succeeded,
            "Failed" => {
                let message = condition
                    .message
                    .clone()
                    .or_else(|| condition.reason.clone())
                    .unwrap_or_else(|| "unknown error".to_string());
                return JobOutcome::Failed(message);
            }
            _ => {}
        }
    }
    JobOutcome::Running
}

/// Provisions RBAC when running cluster-wide, then makes sure the profiling
/// Job for `request` exists and matches what `build_profiling_job` produces.
pub async fn ensure_profiling_job(
    client: &dyn ClusterClient,
    rbac: &dyn RbacManager,
    config: &OperatorConfig,
    request: &DynamoGraphDeploymentRequest,
) -> Result<JobSync, LaunchError> {
    let namespace = request.namespace().unwrap_or_default();
    if config.is_cluster_wide() {
        rbac.ensure_service_account_with_rbac(
            &namespace,
            PROFILING_SERVICE_ACCOUNT,
            &config.profiling_cluster_role,
        )
        .await?;
    }

    let desired = build_profiling_job(request, config)?;
    let name = desired.name_any();

    let Some(existing) = client.get_job(&namespace, &name).await? else {
        if client.create_job(&desired).await? == CreateOutcome::AlreadyExists {
            debug!(job = %name, "Profiling job created concurrently");
            return Ok(JobSync::Unchanged);
        }
        metrics::DGDR_PROFILING_JOBS_CREATED_TOTAL.inc();
        info!(job = %name, namespace = %namespace, "Created profiling job");
        return Ok(JobSync::Created);
    };

    if fingerprint(&existing, &desired) == fingerprint(&desired, &desired) {
        debug!(job = %name, "Profiling job is up to date");
        return Ok(JobSync::Unchanged);
    }

    warn!(job = %name, "Profiling job drifted from the desired template, recreating it");
    client.delete_job(&namespace, &name).await?;
    match client.create_job(&desired).await? {
        CreateOutcome::Created => {
            metrics::DGDR_PROFILING_JOBS_CREATED_TOTAL.inc();
            Ok(JobSync::Recreated)
        }
        CreateOutcome::AlreadyExists => Err(LaunchError::PendingDeletion(name)),
    }
}

pub fn build_profiling_job(
    request: &DynamoGraphDeploymentRequest,
    config: &OperatorConfig,
) -> Result<Job, LaunchError> {
    let names = ProfilingNames::for_request(request);
    let image = names
        .mode
        .image(config)
        .ok_or(LaunchError::ImageNotConfigured {
            mode: names.mode.display_name(),
        })?;
    let owner = request.controller_owner_ref(&()).ok_or(LaunchError::MissingOwner)?;
    let uid = request.uid().ok_or(LaunchError::MissingOwner)?;
    let namespace = request.namespace().unwrap_or_default();

    let labels = BTreeMap::from([
        (APP_LABEL.to_string(), names.mode.app_label().to_string()),
        (REQUEST_LABEL.to_string(), request.name_any()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
    ]);

    let config_key = online_config_key(request);
    let mut profiler_mounts = vec![VolumeMount {
        name: OUTPUT_VOLUME.to_string(),
        mount_path: OUTPUT_DIR.to_string(),
        ..Default::default()
    }];
    let mut volumes = vec![Volume {
        name: OUTPUT_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];
    if let Some((config_map, key)) = &config_key {
        profiler_mounts.push(VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: CONFIG_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        volumes.push(Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.clone(),
                items: Some(vec![KeyToPath {
                    key: key.clone(),
                    path: CONFIG_FILE.to_string(),
                    ..Default::default()
                }]),
                default_mode: Some(0o644),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let profiler = Container {
        name: PROFILER_CONTAINER.to_string(),
        image: Some(image.to_string()),
        args: Some(profiler_args(request, config_key.is_some())),
        volume_mounts: Some(profiler_mounts),
        ..Default::default()
    };

    let sidecar = Container {
        name: OUTPUT_COPIER_CONTAINER.to_string(),
        image: Some(config.sidecar_image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec![sidecar_script(&request.name_any(), &namespace, &uid, &names)]),
        volume_mounts: Some(vec![VolumeMount {
            name: OUTPUT_VOLUME.to_string(),
            mount_path: OUTPUT_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(names.job),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(config.profiling_backoff_limit),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(PROFILING_SERVICE_ACCOUNT.to_string()),
                    restart_policy: Some("Never".to_string()),
                    containers: vec![profiler, sidecar],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// The ConfigMap name and key of the profiler config, only for online
/// profiling.
fn online_config_key(request: &DynamoGraphDeploymentRequest) -> Option<(String, String)> {
    if !request.spec.online {
        return None;
    }
    let reference = request.spec.profiling_config.as_ref()?.config_map_ref.as_ref()?;
    let key = reference
        .key
        .clone()
        .unwrap_or_else(|| DEFAULT_CONFIG_KEY.to_string());
    Some((reference.name.clone(), key))
}

fn profiler_args(request: &DynamoGraphDeploymentRequest, with_config: bool) -> Vec<String> {
    let mut args = vec!["--model".to_string(), request.spec.model_name.clone()];
    if let Some(backend) = &request.spec.backend {
        args.extend(["--backend".to_string(), backend.clone()]);
    }
    args.extend([
        "--ttft".to_string(),
        request.spec.sla.ttft.to_string(),
        "--itl".to_string(),
        request.spec.sla.itl.to_string(),
        "--output-dir".to_string(),
        OUTPUT_DIR.to_string(),
    ]);
    if with_config {
        args.extend(["--config".to_string(), format!("{CONFIG_DIR}/{CONFIG_FILE}")]);
    }
    args
}

/// Shell run by the `output-copier` container. JSON is valid YAML, so the
/// published document is written as JSON.
fn sidecar_script(request: &str, namespace: &str, uid: &str, names: &ProfilingNames) -> String {
    let output = format!("{OUTPUT_DIR}/{OUTPUT_FILE}");
    let config_map = &names.output_config_map;
    format!(
        r#"set -eu
echo "Waiting for {output}"
while [ ! -f {output} ]; do
  sleep 2
done
SPEC=$(kubectl create -f {output} --dry-run=client -o json | jq -c '.spec')
jq -n --argjson spec "$SPEC" \
  '{{apiVersion: "{API_VERSION}", kind: "DynamoGraphDeployment", metadata: {{name: "{request}"}}, spec: $spec}}' \
  > /tmp/{OUTPUT_FILE}
kubectl create configmap {config_map} --namespace={namespace} \
  --from-file={OUTPUT_FILE}=/tmp/{OUTPUT_FILE} --dry-run=client -o json \
  | jq '.metadata.ownerReferences = [{{apiVersion: "{API_VERSION}", kind: "DynamoGraphDeploymentRequest", name: "{request}", uid: "{uid}", controller: true, blockOwnerDeletion: true}}]' \
  | kubectl apply -f -
echo "Published generated deployment to ConfigMap {config_map}"
"#
    )
}

/// The fields of `job` this operator controls. Labels are restricted to the
/// keys `desired` sets, since the API server adds its own.
fn fingerprint(job: &Job, desired: &Job) -> serde_json::Value {
    let wanted = desired.labels();
    let labels: BTreeMap<&String, &String> = job
        .labels()
        .iter()
        .filter(|(k, _)| wanted.contains_key(*k))
        .collect();
    let spec = job.spec.as_ref();
    let pod = spec.and_then(|s| s.template.spec.as_ref());
    let containers: Vec<serde_json::Value> = pod
        .map(|p| p.containers.as_slice())
        .unwrap_or_default()
        .iter()
        .map(|c| {
            json!({
                "name": c.name,
                "image": c.image,
                "command": c.command,
                "args": c.args,
                "volumeMounts": c.volume_mounts,
            })
        })
        .collect();
    json!({
        "labels": labels,
        "backoffLimit": spec.and_then(|s| s.backoff_limit),
        "serviceAccountName": pod.and_then(|p| p.service_account_name.clone()),
        "restartPolicy": pod.and_then(|p| p.restart_policy.clone()),
        "containers": containers,
        "volumes": pod.and_then(|p| p.volumes.clone()),
    })
}
