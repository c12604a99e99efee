/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/crds.rs
*
* This file defines the Rust data structures that correspond to the Custom
* Resource Definitions this operator works with. By using the
* `kube::CustomResource` derive macro we get a strongly-typed representation
* of both APIs.
*
* Architecture:
* - `DynamoGraphDeploymentRequest` (DGDR) is the resource users create. Its
*   `spec` describes the model and latency targets; its `status` is written
*   exclusively by the request controller and carries the lifecycle `state`,
*   typed conditions, the generated deployment document and a record of the
*   deployment that was created from it.
* - `DynamoGraphDeployment` (DGD) is the final serving topology. This operator
*   only creates it and reads back `status.state`; its spec is kept opaque and
*   every field the profiler emits is preserved verbatim.
* - `RequestState` and `ConditionType` are closed enums so the state machine
*   never compares raw strings.
* - `GraphDeploymentDocument` is the candidate deployment produced by
*   profiling. It can be decoded from the structured JSON stored in the
*   request status or from the raw YAML published by the profiling sidecar.
*
* SPDX-License-Identifier: Apache-2.0
*/

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// `apiVersion` of both custom resources.
pub const API_VERSION: &str = "nvidia.com/v1alpha1";
/// State the deployment controller reports once the graph is serving.
pub const DEPLOYMENT_STATE_READY: &str = "Ready";
/// Recorded for a deployment before its first observation.
pub const DEPLOYMENT_STATE_PENDING: &str = "Pending";

// --- DynamoGraphDeploymentRequest Custom Resource Definition ---

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[kube(
    group = "nvidia.com",
    version = "v1alpha1",
    kind = "DynamoGraphDeploymentRequest",
    namespaced,
    status = "DynamoGraphDeploymentRequestStatus",
    printcolumn = r#"{"name":"Model", "type":"string", "jsonPath":".spec.modelName"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    shortname = "dgdr"
)]
#[serde(rename_all = "camelCase")]
pub struct DynamoGraphDeploymentRequestSpec {
    /// The model to profile and serve, e.g. `Qwen/Qwen3-0.6B`.
    #[serde(default)]
    pub model_name: String,
    /// Inference backend. One of `vllm`, `sglang` or `trtllm` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Latency targets the profiler sizes the deployment against.
    #[serde(default)]
    pub sla: SlaTargets,
    /// Run online profiling against real workers instead of the offline
    /// AI-configurator estimation.
    #[serde(default)]
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiling_config: Option<ProfilingConfig>,
    /// Create the DynamoGraphDeployment automatically once profiling succeeds.
    #[serde(default)]
    pub auto_apply: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_overrides: Option<DeploymentOverrides>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SlaTargets {
    /// Time to first token, in milliseconds.
    pub ttft: f64,
    /// Inter-token latency, in milliseconds.
    pub itl: f64,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfilingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_ref: Option<ConfigMapKeyRef>,
}

/// Points at a key inside a ConfigMap in the request's namespace.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapKeyRef {
    pub name: String,
    /// Defaults to `disagg.yaml` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DynamoGraphDeploymentRequestStatus {
    #[serde(default)]
    pub state: RequestState,
    /// The last spec generation the controller fully processed.
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// The generated DynamoGraphDeployment. Stored as a structured object;
    /// a raw YAML string is accepted as well.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub generated_deployment: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentStatus>,
    /// Reference to the profiling output, e.g. `configmap/dgdr-output-foo`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub profiling_results: String,
}

/// Record of the DynamoGraphDeployment created for a request.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    pub name: String,
    pub namespace: String,
    /// Last state observed on the deployment.
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub created: bool,
}

/// Lifecycle state of a request.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum RequestState {
    #[default]
    #[serde(rename = "")]
    Empty,
    Pending,
    Profiling,
    Deploying,
    Ready,
    DeploymentDeleted,
    Failed,
    /// Anything this version of the controller does not recognize.
    #[serde(other)]
    Unknown,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Empty => "",
            RequestState::Pending => "Pending",
            RequestState::Profiling => "Profiling",
            RequestState::Deploying => "Deploying",
            RequestState::Ready => "Ready",
            RequestState::DeploymentDeleted => "DeploymentDeleted",
            RequestState::Failed => "Failed",
            RequestState::Unknown => "Unknown",
        }
    }

    /// States in which a spec edit is rejected instead of processed.
    pub fn is_spec_locked(&self) -> bool {
        matches!(self, RequestState::Profiling | RequestState::Ready)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConditionType {
    Validation,
    Profiling,
    SpecGenerated,
    DeploymentReady,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: String,
    #[serde(default)]
    pub observed_generation: i64,
}

impl Condition {
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        observed_generation: i64,
    ) -> Self {
        Self {
            type_,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now().to_rfc3339(),
            observed_generation,
        }
    }
}

impl DynamoGraphDeploymentRequestStatus {
    /// Upserts a condition keyed by its type.
    ///
    /// `lastTransitionTime` is carried over from the existing entry unless the
    /// status actually flips, so re-asserting a condition is a no-op on the
    /// wire.
    pub fn set_condition(&mut self, condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) => {
                let last_transition_time = if existing.status == condition.status {
                    existing.last_transition_time.clone()
                } else {
                    condition.last_transition_time.clone()
                };
                *existing = Condition {
                    last_transition_time,
                    ..condition
                };
            }
            None => self.conditions.push(condition),
        }
    }

    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

// --- DynamoGraphDeployment Custom Resource Definition ---

/// The serving topology. Only `services` is named; everything else the
/// profiler emits is carried in `extra` untouched.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[kube(
    group = "nvidia.com",
    version = "v1alpha1",
    kind = "DynamoGraphDeployment",
    namespaced,
    status = "DynamoGraphDeploymentStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    shortname = "dgd"
)]
#[serde(rename_all = "camelCase")]
#[schemars(extend("x-kubernetes-preserve-unknown-fields" = true))]
pub struct DynamoGraphDeploymentSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub services: BTreeMap<String, serde_json::Value>,
    #[serde(flatten)]
    #[schemars(skip)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DynamoGraphDeploymentStatus {
    #[serde(default)]
    pub state: String,
}

fn preserve_unknown_fields(_gen: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "nullable": true,
        "x-kubernetes-preserve-unknown-fields": true
    })
}

// --- Generated deployment document ---

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to parse generated deployment: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to decode generated deployment: {0}")]
    Json(#[from] serde_json::Error),

    #[error("generated deployment is neither an object nor a YAML document")]
    UnsupportedEncoding,

    #[error("generated deployment has no metadata.name")]
    MissingName,
}

/// A complete DynamoGraphDeployment document as produced by profiling.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GraphDeploymentDocument {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DynamoGraphDeploymentSpec,
}

impl GraphDeploymentDocument {
    /// Parses the YAML published in the profiling output ConfigMap.
    pub fn from_yaml(raw: &str) -> Result<Self, DocumentError> {
        let document: Self = serde_yaml::from_str(raw)?;
        document.validated()
    }

    /// Decodes the value stored in `status.generatedDeployment`, which is
    /// either the structured object or the raw YAML text.
    pub fn from_status_value(value: &serde_json::Value) -> Result<Self, DocumentError> {
        match value {
            serde_json::Value::Object(_) => {
                let document: Self = serde_json::from_value(value.clone())?;
                document.validated()
            }
            serde_json::Value::String(raw) => Self::from_yaml(raw),
            _ => Err(DocumentError::UnsupportedEncoding),
        }
    }

    pub fn to_status_value(&self) -> Result<serde_json::Value, DocumentError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    fn validated(self) -> Result<Self, DocumentError> {
        match self.metadata.name.as_deref() {
            Some(name) if !name.is_empty() => Ok(self),
            _ => Err(DocumentError::MissingName),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"
apiVersion: nvidia.com/v1alpha1
kind: DynamoGraphDeployment
metadata:
  name: sglang-agg
  labels:
    team: inference
spec:
  backendFramework: sglang
  services:
    Frontend:
      componentType: frontend
      replicas: 1
"#;

    #[test]
    fn request_state_uses_empty_string_for_initial_state() {
        let status: DynamoGraphDeploymentRequestStatus = serde_json::from_value(json!({})).unwrap();
        assert_eq!(status.state, RequestState::Empty);

        let state: RequestState = serde_json::from_value(json!("")).unwrap();
        assert_eq!(state, RequestState::Empty);
        assert_eq!(serde_json::to_value(RequestState::Empty).unwrap(), json!(""));
        assert_eq!(
            serde_json::to_value(RequestState::DeploymentDeleted).unwrap(),
            json!("DeploymentDeleted")
        );
    }

    #[test]
    fn unrecognized_state_deserializes_as_unknown() {
        let state: RequestState = serde_json::from_value(json!("Paused")).unwrap();
        assert_eq!(state, RequestState::Unknown);
    }

    #[test]
    fn only_profiling_and_ready_lock_the_spec() {
        assert!(RequestState::Profiling.is_spec_locked());
        assert!(RequestState::Ready.is_spec_locked());
        assert!(!RequestState::Empty.is_spec_locked());
        assert!(!RequestState::Deploying.is_spec_locked());
        assert!(!RequestState::Failed.is_spec_locked());
    }

    #[test]
    fn set_condition_upserts_by_type() {
        let mut status = DynamoGraphDeploymentRequestStatus::default();
        status.set_condition(Condition::new(
            ConditionType::Profiling,
            ConditionStatus::False,
            "ProfilingRunning",
            "Profiling is in progress",
            1,
        ));
        status.set_condition(Condition::new(
            ConditionType::Validation,
            ConditionStatus::True,
            "SpecValid",
            "ok",
            1,
        ));
        status.set_condition(Condition::new(
            ConditionType::Profiling,
            ConditionStatus::True,
            "ProfilingCompleted",
            "done",
            1,
        ));

        assert_eq!(status.conditions.len(), 2);
        let profiling = status.condition(ConditionType::Profiling).unwrap();
        assert_eq!(profiling.status, ConditionStatus::True);
        assert_eq!(profiling.reason, "ProfilingCompleted");
    }

    #[test]
    fn set_condition_keeps_transition_time_when_status_is_unchanged() {
        let mut status = DynamoGraphDeploymentRequestStatus::default();
        let mut first = Condition::new(ConditionType::DeploymentReady, ConditionStatus::False, "A", "a", 1);
        first.last_transition_time = "2025-01-01T00:00:00+00:00".to_string();
        status.set_condition(first);

        status.set_condition(Condition::new(
            ConditionType::DeploymentReady,
            ConditionStatus::False,
            "B",
            "b",
            1,
        ));
        let condition = status.condition(ConditionType::DeploymentReady).unwrap();
        assert_eq!(condition.reason, "B");
        assert_eq!(condition.last_transition_time, "2025-01-01T00:00:00+00:00");

        status.set_condition(Condition::new(
            ConditionType::DeploymentReady,
            ConditionStatus::True,
            "C",
            "c",
            1,
        ));
        let condition = status.condition(ConditionType::DeploymentReady).unwrap();
        assert_ne!(condition.last_transition_time, "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn document_parses_from_yaml_and_keeps_unknown_spec_fields() {
        let document = GraphDeploymentDocument::from_yaml(SAMPLE).unwrap();
        assert_eq!(document.name(), "sglang-agg");
        assert_eq!(document.kind, "DynamoGraphDeployment");
        assert!(document.spec.services.contains_key("Frontend"));
        assert_eq!(document.spec.extra.get("backendFramework"), Some(&json!("sglang")));
    }

    #[test]
    fn document_decodes_structured_and_raw_status_values() {
        let document = GraphDeploymentDocument::from_yaml(SAMPLE).unwrap();
        let structured = document.to_status_value().unwrap();
        assert_eq!(GraphDeploymentDocument::from_status_value(&structured).unwrap(), document);

        let raw = serde_json::Value::String(SAMPLE.to_string());
        assert_eq!(GraphDeploymentDocument::from_status_value(&raw).unwrap(), document);
    }

    #[test]
    fn document_rejects_unparseable_or_nameless_input() {
        let raw = serde_json::Value::String("spec: [unterminated".to_string());
        assert!(matches!(
            GraphDeploymentDocument::from_status_value(&raw),
            Err(DocumentError::Yaml(_))
        ));

        assert!(matches!(
            GraphDeploymentDocument::from_yaml("kind: DynamoGraphDeployment\nspec: {}\n"),
            Err(DocumentError::MissingName)
        ));

        assert!(matches!(
            GraphDeploymentDocument::from_status_value(&json!(42)),
            Err(DocumentError::UnsupportedEncoding)
        ));
    }
}
