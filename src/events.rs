/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/events.rs
*
* Kubernetes Event recording for the request controller.
*
* Every lifecycle transition of a DynamoGraphDeploymentRequest is surfaced as
* an Event so that `kubectl describe dgdr` tells the whole story. Publishing
* is fire-and-forget: a failed event is logged and never fails the reconcile.
*
* SPDX-License-Identifier: Apache-2.0
*/

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Name reported as the Event source.
pub const CONTROLLER_NAME: &str = "dgdr-controller";

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`.
pub mod reasons {
    pub const INITIALIZED: &str = "Initialized";
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    pub const PROFILING_JOB_CREATED: &str = "ProfilingJobCreated";
    pub const PROFILING_JOB_FAILED: &str = "ProfilingJobFailed";
    /// The profiling job could not be found or inspected.
    pub const PROFILING_CHECK_FAILED: &str = "ProfilingCheckFailed";
    pub const GENERATION_FAILED: &str = "GenerationFailed";
    pub const SPEC_GENERATED: &str = "SpecGenerated";
    /// A spec edit arrived after the lifecycle started.
    pub const SPEC_CHANGE_REJECTED: &str = "SpecChangeRejected";
    pub const DEPLOYMENT_CREATED: &str = "DeploymentCreated";
    pub const DEPLOYMENT_CREATION_FAILED: &str = "DeploymentCreationFailed";
    pub const DEPLOYMENT_READY: &str = "DeploymentReady";
    pub const DEPLOYMENT_DEGRADED: &str = "DeploymentDegraded";
    pub const DEPLOYMENT_DELETED: &str = "DeploymentDeleted";
    /// autoApply was turned off before the deployment was created or ready.
    pub const AUTO_APPLY_DISABLED: &str = "AutoApplyDisabled";
    /// autoApply is on but no deployment has been created yet.
    pub const DEPLOYMENT_PENDING: &str = "DeploymentPending";
    pub const INVALID_STATE: &str = "InvalidState";
}

/// Event actions, shown in the ACTION column.
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const VALIDATE: &str = "Validate";
    pub const PROFILE: &str = "Profile";
    pub const DEPLOY: &str = "Deploy";
}
