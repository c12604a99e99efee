/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/testing.rs
*
* Test doubles shared by the controller unit tests: an in-memory
* `ClusterClient` that behaves like the API server for the handful of calls
* the operator makes (resourceVersion checks, 409 on duplicate creates,
* finalizer-gated deletion) and an event publisher that records what it is
* given.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::client::{ClientError, ClusterClient, CreateOutcome};
use crate::config::OperatorConfig;
use crate::crds::{
    DynamoGraphDeployment, DynamoGraphDeploymentRequest, DynamoGraphDeploymentRequestSpec,
    DynamoGraphDeploymentStatus, SlaTargets,
};
use crate::events::EventPublisher;
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference, ServiceAccount};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Mutex;

pub const NAMESPACE: &str = "inference";
pub const ONLINE_IMAGE: &str = "nvcr.io/nvidia/ai-dynamo/profiler:test";
pub const AIC_IMAGE: &str = "nvcr.io/nvidia/ai-dynamo/aic-profiler:test";

pub const CANDIDATE_YAML: &str = r#"apiVersion: nvidia.com/v1alpha1
kind: DynamoGraphDeployment
metadata:
  name: qwen-disagg
  labels:
    team: inference
  annotations:
    profiler/run: "1"
spec:
  backendFramework: sglang
  services:
    Frontend:
      componentType: frontend
      replicas: 1
    decode:
      componentType: worker
      replicas: 2
"#;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn object_key<K: Resource>(object: &K) -> Key {
    key(
        object.meta().namespace.as_deref().unwrap_or_default(),
        object.meta().name.as_deref().unwrap_or_default(),
    )
}

#[derive(Default)]
struct FakeState {
    requests: BTreeMap<Key, DynamoGraphDeploymentRequest>,
    config_maps: BTreeMap<Key, ConfigMap>,
    jobs: BTreeMap<Key, Job>,
    graph_deployments: BTreeMap<Key, DynamoGraphDeployment>,
    service_accounts: BTreeMap<Key, ServiceAccount>,
    role_bindings: BTreeMap<Key, RoleBinding>,
    writes: Vec<String>,
    status_writes: usize,
    version: u64,
    failing_graph_deployment_reads: bool,
}

impl FakeState {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn stamp<K: Resource>(&mut self, object: &mut K) {
        let version = self.next_version();
        let meta = object.meta_mut();
        meta.resource_version = Some(version);
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", meta.name.as_deref().unwrap_or_default()));
        }
    }
}

/// In-memory cluster. `writes` records every mutating call other than
/// request status and finalizer updates.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_request(&self, mut request: DynamoGraphDeploymentRequest) {
        let mut state = self.state.lock().unwrap();
        state.stamp(&mut request);
        state.requests.insert(object_key(&request), request);
    }

    pub fn request(&self, namespace: &str, name: &str) -> DynamoGraphDeploymentRequest {
        self.try_request(namespace, name)
            .unwrap_or_else(|| panic!("request {namespace}/{name} not stored"))
    }

    pub fn try_request(&self, namespace: &str, name: &str) -> Option<DynamoGraphDeploymentRequest> {
        self.state.lock().unwrap().requests.get(&key(namespace, name)).cloned()
    }

    /// Applies a user-side edit, bumping the resourceVersion like the API
    /// server would.
    pub fn edit_request(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut DynamoGraphDeploymentRequest)) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let request = state
            .requests
            .get_mut(&key(namespace, name))
            .expect("request stored");
        edit(request);
        request.metadata.resource_version = Some(version);
    }

    pub fn insert_config_map(&self, config_map: ConfigMap) {
        let mut state = self.state.lock().unwrap();
        state.config_maps.insert(object_key(&config_map), config_map);
    }

    pub fn insert_job(&self, mut job: Job) {
        let mut state = self.state.lock().unwrap();
        state.stamp(&mut job);
        state.jobs.insert(object_key(&job), job);
    }

    pub fn job(&self, namespace: &str, name: &str) -> Option<Job> {
        self.state.lock().unwrap().jobs.get(&key(namespace, name)).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().unwrap().jobs.len()
    }

    /// Marks a job finished with a terminal condition (`Complete` or `Failed`).
    pub fn finish_job(&self, namespace: &str, name: &str, condition_type: &str, message: &str) {
        let mut state = self.state.lock().unwrap();
        let job = state.jobs.get_mut(&key(namespace, name)).expect("job stored");
        job.status = Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: condition_type.to_string(),
                status: "True".to_string(),
                message: Some(message.to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });
    }

    pub fn graph_deployment(&self, namespace: &str, name: &str) -> Option<DynamoGraphDeployment> {
        self.state
            .lock()
            .unwrap()
            .graph_deployments
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn graph_deployment_count(&self) -> usize {
        self.state.lock().unwrap().graph_deployments.len()
    }

    pub fn insert_graph_deployment(&self, mut deployment: DynamoGraphDeployment) {
        let mut state = self.state.lock().unwrap();
        state.stamp(&mut deployment);
        state.graph_deployments.insert(object_key(&deployment), deployment);
    }

    pub fn set_graph_deployment_state(&self, namespace: &str, name: &str, value: &str) {
        let mut state = self.state.lock().unwrap();
        let deployment = state
            .graph_deployments
            .get_mut(&key(namespace, name))
            .expect("deployment stored");
        deployment.status = Some(DynamoGraphDeploymentStatus {
            state: value.to_string(),
        });
    }

    pub fn remove_graph_deployment(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .graph_deployments
            .remove(&key(namespace, name));
    }

    pub fn fail_graph_deployment_reads(&self) {
        self.state.lock().unwrap().failing_graph_deployment_reads = true;
    }

    pub fn service_account(&self, namespace: &str, name: &str) -> Option<ServiceAccount> {
        self.state
            .lock()
            .unwrap()
            .service_accounts
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn role_binding(&self, namespace: &str, name: &str) -> Option<RoleBinding> {
        self.state
            .lock()
            .unwrap()
            .role_bindings
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn insert_role_binding(&self, mut binding: RoleBinding) {
        let mut state = self.state.lock().unwrap();
        state.stamp(&mut binding);
        state.role_bindings.insert(object_key(&binding), binding);
    }

    pub fn writes(&self) -> Vec<String> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }

    pub fn status_writes(&self) -> usize {
        self.state.lock().unwrap().status_writes
    }
}

fn insert_new<K: Resource + Clone>(
    state: &mut FakeState,
    select: impl FnOnce(&mut FakeState) -> &mut BTreeMap<Key, K>,
    kind: &str,
    object: &K,
) -> CreateOutcome {
    let object_key = object_key(object);
    let mut object = object.clone();
    state.stamp(&mut object);
    let map = select(state);
    if map.contains_key(&object_key) {
        return CreateOutcome::AlreadyExists;
    }
    map.insert(object_key.clone(), object);
    state
        .writes
        .push(format!("create {kind} {}/{}", object_key.0, object_key.1));
    CreateOutcome::Created
}

fn check_version(
    stored: &DynamoGraphDeploymentRequest,
    request: &DynamoGraphDeploymentRequest,
) -> Result<(), ClientError> {
    if stored.resource_version() != request.resource_version() {
        return Err(ClientError::Conflict {
            kind: "DynamoGraphDeploymentRequest",
            name: request.name_any(),
        });
    }
    Ok(())
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, ClientError> {
        Ok(self.state.lock().unwrap().config_maps.get(&key(namespace, name)).cloned())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, ClientError> {
        Ok(self.job(namespace, name))
    }

    async fn create_job(&self, job: &Job) -> Result<CreateOutcome, ClientError> {
        let mut state = self.state.lock().unwrap();
        Ok(insert_new(&mut state, |s| &mut s.jobs, "Job", job))
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        if state.jobs.remove(&key(namespace, name)).is_some() {
            state.writes.push(format!("delete Job {namespace}/{name}"));
        }
        Ok(())
    }

    async fn get_graph_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamoGraphDeployment>, ClientError> {
        if self.state.lock().unwrap().failing_graph_deployment_reads {
            return Err(ClientError::MissingMetadata {
                kind: "DynamoGraphDeployment",
                field: "status",
            });
        }
        Ok(self.graph_deployment(namespace, name))
    }

    async fn create_graph_deployment(
        &self,
        deployment: &DynamoGraphDeployment,
    ) -> Result<CreateOutcome, ClientError> {
        let mut state = self.state.lock().unwrap();
        Ok(insert_new(
            &mut state,
            |s| &mut s.graph_deployments,
            "DynamoGraphDeployment",
            deployment,
        ))
    }

    async fn update_request_status(
        &self,
        request: &DynamoGraphDeploymentRequest,
    ) -> Result<DynamoGraphDeploymentRequest, ClientError> {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let stored = state
            .requests
            .get_mut(&object_key(request))
            .ok_or_else(|| ClientError::NotFound {
                kind: "DynamoGraphDeploymentRequest",
                name: request.name_any(),
            })?;
        check_version(stored, request)?;
        stored.status = request.status.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        state.status_writes += 1;
        Ok(updated)
    }

    async fn set_request_finalizers(
        &self,
        request: &DynamoGraphDeploymentRequest,
        finalizers: Vec<String>,
    ) -> Result<DynamoGraphDeploymentRequest, ClientError> {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let request_key = object_key(request);
        let stored = state
            .requests
            .get_mut(&request_key)
            .ok_or_else(|| ClientError::NotFound {
                kind: "DynamoGraphDeploymentRequest",
                name: request.name_any(),
            })?;
        check_version(stored, request)?;
        stored.metadata.finalizers = Some(finalizers);
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        let releasable = updated.metadata.deletion_timestamp.is_some()
            && updated.finalizers().is_empty();
        if releasable {
            state.requests.remove(&request_key);
        }
        Ok(updated)
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, ClientError> {
        Ok(self.service_account(namespace, name))
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<CreateOutcome, ClientError> {
        let mut state = self.state.lock().unwrap();
        Ok(insert_new(&mut state, |s| &mut s.service_accounts, "ServiceAccount", account))
    }

    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>, ClientError> {
        Ok(self.role_binding(namespace, name))
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<CreateOutcome, ClientError> {
        let mut state = self.state.lock().unwrap();
        Ok(insert_new(&mut state, |s| &mut s.role_bindings, "RoleBinding", binding))
    }

    async fn replace_role_binding(&self, binding: &RoleBinding) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        let binding_key = object_key(binding);
        if !state.role_bindings.contains_key(&binding_key) {
            return Err(ClientError::NotFound {
                kind: "RoleBinding",
                name: binding.name_any(),
            });
        }
        let mut binding = binding.clone();
        state.stamp(&mut binding);
        state.role_bindings.insert(binding_key.clone(), binding);
        state
            .writes
            .push(format!("replace RoleBinding {}/{}", binding_key.0, binding_key.1));
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub type_: EventType,
    pub reason: String,
    pub note: Option<String>,
}

#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            type_,
            reason: reason.to_string(),
            note,
        });
    }
}

// --- Fixtures ---

/// A valid offline-profiling request in `NAMESPACE` at generation 1.
pub fn request(name: &str) -> DynamoGraphDeploymentRequest {
    let mut request = DynamoGraphDeploymentRequest::new(
        name,
        DynamoGraphDeploymentRequestSpec {
            model_name: "Qwen/Qwen3-0.6B".to_string(),
            backend: Some("sglang".to_string()),
            sla: SlaTargets { ttft: 100.0, itl: 10.0 },
            ..Default::default()
        },
    );
    request.metadata.namespace = Some(NAMESPACE.to_string());
    request.metadata.uid = Some(format!("uid-{name}"));
    request.metadata.generation = Some(1);
    request
}

pub fn config() -> OperatorConfig {
    OperatorConfig {
        online_profiling_image: Some(ONLINE_IMAGE.to_string()),
        aic_profiling_image: Some(AIC_IMAGE.to_string()),
        ..Default::default()
    }
}

pub fn config_map(name: &str, data: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
        metadata: kube::api::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}
