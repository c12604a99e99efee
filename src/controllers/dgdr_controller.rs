/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/dgdr_controller.rs
*
* This file implements the reconciliation logic for the
* DynamoGraphDeploymentRequest custom resource. A request is driven from a
* declarative description (model, backend, latency targets) through
* profiling to a running DynamoGraphDeployment.
*
* Architecture:
* The controller is a state machine driven by `status.state`:
* - **Initial state ("")**: validates the spec, records the observed
*   generation and moves to `Pending`, or to `Failed` naming the violated
*   rule.
* - **`Pending`**: provisions the profiling identity (cluster-wide mode),
*   launches the profiling Job and moves to `Profiling`.
* - **`Profiling`**: waits for the Job. On success the generated deployment
*   is read from the output ConfigMap and stored in the status; the request
*   then moves to `Deploying` (autoApply) or `Ready`. On failure it moves to
*   `Failed` with the Job's message.
* - **`Deploying`**: creates the DynamoGraphDeployment once, then mirrors
*   its state until it reports `Ready`.
* - **`Ready`**: with autoApply, keeps watching the deployment and falls
*   back to `Deploying` if it degrades.
* - **`DeploymentDeleted`, `Failed`**: terminal.
*
* Transitions whose next step is immediately actionable are chained within a
* single pass; every hop is persisted on its own so an interrupted pass
* resumes from the last written state. Status writes carry the
* resourceVersion of the object they were computed from, so a concurrent
* edit fails the pass and the runtime retries it against a fresh read.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::graph_deployment::plan_graph_deployment;
use super::profiling_job::{
    ensure_profiling_job, job_outcome, JobOutcome, JobSync, LaunchError, ProfilingNames, DEFAULT_CONFIG_KEY,
    OUTPUT_FILE,
};
use super::rbac_manager::{RbacManager, RbacProvisioner};
use crate::client::{ClientError, ClusterClient, CreateOutcome, KubeClusterClient};
use crate::config::OperatorConfig;
use crate::crds::{
    Condition, ConditionStatus, ConditionType, DeploymentStatus, DocumentError, DynamoGraphDeploymentRequest,
    DynamoGraphDeploymentRequestStatus, GraphDeploymentDocument, RequestState, DEPLOYMENT_STATE_PENDING,
    DEPLOYMENT_STATE_READY,
};
use crate::events::{actions, reasons, EventPublisher, KubeEventPublisher, CONTROLLER_NAME};
use crate::metrics;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    client::Client,
    runtime::{controller::Action, events::EventType},
    Resource, ResourceExt,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const FINALIZER: &str = "nvidia.com/dgdr-finalizer";
pub const SUPPORTED_BACKENDS: [&str; 3] = ["vllm", "sglang", "trtllm"];

// Upper bound on chained transitions in one pass.
const MAX_STEPS_PER_PASS: usize = 8;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("failed to launch profiling job: {0}")]
    Launch(#[from] LaunchError),

    #[error("invalid generated deployment: {0}")]
    Document(#[from] DocumentError),

    #[error("request is in state Deploying but has no generated deployment")]
    MissingGeneratedDeployment,
}

/// Spec rules checked before any work starts.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("modelName is required")]
    MissingModelName,

    #[error("sla.ttft must be greater than 0, got {0}")]
    InvalidTtft(f64),

    #[error("sla.itl must be greater than 0, got {0}")]
    InvalidItl(f64),

    #[error("backend must be one of vllm, sglang, trtllm, got {0:?}")]
    UnsupportedBackend(String),

    #[error("ConfigMap {name} not found in namespace {namespace}")]
    ConfigMapNotFound { name: String, namespace: String },

    #[error("key {key} not found in ConfigMap {name}")]
    ConfigMapKeyNotFound { key: String, name: String },
}

impl ValidationError {
    /// Condition reason naming the violated rule.
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::MissingModelName => "ModelNameRequired",
            ValidationError::InvalidTtft(_) => "InvalidTTFT",
            ValidationError::InvalidItl(_) => "InvalidITL",
            ValidationError::UnsupportedBackend(_) => "UnsupportedBackend",
            ValidationError::ConfigMapNotFound { .. } => "ConfigMapNotFound",
            ValidationError::ConfigMapKeyNotFound { .. } => "ConfigMapKeyNotFound",
        }
    }
}

/// The context required by the reconciler.
pub struct Context {
    pub client: Arc<dyn ClusterClient>,
    pub rbac: Arc<dyn RbacManager>,
    pub events: Arc<dyn EventPublisher>,
    pub config: OperatorConfig,
}

impl Context {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));
        Self {
            rbac: Arc::new(RbacProvisioner::new(cluster.clone())),
            events: Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
            client: cluster,
            config,
        }
    }
}

/// Main reconciliation function for the DynamoGraphDeploymentRequest resource.
pub async fn reconcile(request: Arc<DynamoGraphDeploymentRequest>, ctx: Arc<Context>) -> Result<Action, Error> {
    let span = info_span!(
        "reconcile_request",
        "dgdr.name" = request.name_any().as_str(),
        "dgdr.namespace" = request.namespace().unwrap_or_default().as_str(),
    );
    async move {
        let result = reconcile_request(&request, &ctx).await;
        metrics::record_reconcile(result.is_ok());
        result
    }
    .instrument(span)
    .await
}

pub fn error_policy(request: Arc<DynamoGraphDeploymentRequest>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(dgdr = %request.name_any(), "Reconciliation failed: {}", error);
    Action::requeue(ctx.config.error_requeue)
}

enum Step {
    Continue,
    Done(Action),
}

enum GeneratedOutput {
    Parsed(GraphDeploymentDocument),
    Unusable(String),
}

async fn reconcile_request(request: &DynamoGraphDeploymentRequest, ctx: &Context) -> Result<Action, Error> {
    let mut pass = Pass::new(ctx, request.clone());

    if request.meta().deletion_timestamp.is_some() {
        return pass.finalize().await;
    }
    pass.ensure_finalizer().await?;

    if pass.reject_spec_change().await {
        return Ok(Action::await_change());
    }

    for _ in 0..MAX_STEPS_PER_PASS {
        let step = match pass.state() {
            RequestState::Empty => pass.handle_initial().await?,
            RequestState::Pending => pass.handle_pending().await?,
            RequestState::Profiling => pass.handle_profiling().await?,
            RequestState::Deploying => pass.handle_deploying().await?,
            RequestState::Ready => pass.handle_ready().await?,
            RequestState::DeploymentDeleted => {
                debug!("Deployment was deleted, nothing left to do");
                Step::Done(Action::await_change())
            }
            RequestState::Failed => {
                info!("Request failed; profiling resources are released through owner references");
                Step::Done(Action::await_change())
            }
            RequestState::Unknown => pass.handle_unknown().await?,
        };
        if let Step::Done(action) = step {
            return Ok(action);
        }
    }
    Ok(Action::await_change())
}

/// One reconcile pass over a request. Holds the latest stored version of the
/// object so chained transitions write on top of each other.
struct Pass<'a> {
    ctx: &'a Context,
    request: DynamoGraphDeploymentRequest,
    reference: ObjectReference,
}

impl<'a> Pass<'a> {
    fn new(ctx: &'a Context, request: DynamoGraphDeploymentRequest) -> Self {
        let reference = request.object_ref(&());
        Self { ctx, request, reference }
    }

    fn state(&self) -> RequestState {
        self.request.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    fn generation(&self) -> i64 {
        self.request.metadata.generation.unwrap_or_default()
    }

    fn namespace(&self) -> String {
        self.request.namespace().unwrap_or_default()
    }

    fn status(&self) -> DynamoGraphDeploymentRequestStatus {
        self.request.status.clone().unwrap_or_default()
    }

    fn status_mut(&mut self) -> &mut DynamoGraphDeploymentRequestStatus {
        self.request.status.get_or_insert_with(Default::default)
    }

    fn condition(&self, type_: ConditionType, status: ConditionStatus, reason: &str, message: &str) -> Condition {
        Condition::new(type_, status, reason, message, self.generation())
    }

    async fn event(&self, type_: EventType, reason: &str, action: &str, note: String) {
        self.ctx
            .events
            .publish(&self.reference, type_, reason, action, Some(note))
            .await;
    }

    async fn write_status(&mut self) -> Result<(), Error> {
        self.request = self.ctx.client.update_request_status(&self.request).await?;
        Ok(())
    }

    /// Moves to `to`, optionally upserting a condition, and persists it.
    async fn transition(&mut self, to: RequestState, condition: Option<Condition>) -> Result<(), Error> {
        let from = self.state();
        let status = self.status_mut();
        status.state = to;
        if let Some(condition) = condition {
            status.set_condition(condition);
        }
        self.write_status().await?;
        metrics::record_transition(from, to);
        info!(from = %from, to = %to, "Request state changed");
        Ok(())
    }

    async fn ensure_finalizer(&mut self) -> Result<(), Error> {
        if self.request.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        let mut finalizers = self.request.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        self.request = self
            .ctx
            .client
            .set_request_finalizers(&self.request, finalizers)
            .await?;
        debug!("Added finalizer");
        Ok(())
    }

    async fn finalize(&self) -> Result<Action, Error> {
        if !self.request.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(Action::await_change());
        }
        info!("Request is being deleted; the profiling job and its output are garbage collected through owner references");
        let remaining: Vec<String> = self
            .request
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != FINALIZER)
            .cloned()
            .collect();
        self.ctx
            .client
            .set_request_finalizers(&self.request, remaining)
            .await?;
        info!("Finalizer removed");
        Ok(Action::await_change())
    }

    /// A spec edit after the lifecycle started is reported and otherwise
    /// ignored. Status is left untouched so the warning repeats.
    async fn reject_spec_change(&self) -> bool {
        let observed = self.status().observed_generation;
        let generation = self.generation();
        let state = self.state();
        if observed == 0 || observed == generation || !state.is_spec_locked() {
            return false;
        }
        warn!(observed, generation, state = %state, "Rejecting spec change");
        self.event(
            EventType::Warning,
            reasons::SPEC_CHANGE_REJECTED,
            actions::VALIDATE,
            format!(
                "Spec changes are not allowed once the request is {state} (observed generation {observed}, \
                 current {generation}); delete and recreate the request to change it"
            ),
        )
        .await;
        true
    }

    async fn handle_initial(&mut self) -> Result<Step, Error> {
        if let Some(violation) = self.find_validation_error().await? {
            let message = violation.to_string();
            warn!(reason = violation.reason(), "Spec validation failed: {}", message);
            self.event(
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::VALIDATE,
                message.clone(),
            )
            .await;
            let condition = self.condition(
                ConditionType::Validation,
                ConditionStatus::False,
                violation.reason(),
                &message,
            );
            self.transition(RequestState::Failed, Some(condition)).await?;
            return Ok(Step::Done(Action::await_change()));
        }

        let generation = self.generation();
        self.status_mut().observed_generation = generation;
        let condition = self.condition(
            ConditionType::Validation,
            ConditionStatus::True,
            "SpecValid",
            "Spec validation passed",
        );
        self.event(
            EventType::Normal,
            reasons::INITIALIZED,
            actions::VALIDATE,
            "Request validated, starting profiling".to_string(),
        )
        .await;
        self.transition(RequestState::Pending, Some(condition)).await?;
        Ok(Step::Continue)
    }

    async fn find_validation_error(&self) -> Result<Option<ValidationError>, Error> {
        let spec = &self.request.spec;
        if spec.model_name.trim().is_empty() {
            return Ok(Some(ValidationError::MissingModelName));
        }
        if !(spec.sla.ttft > 0.0) {
            return Ok(Some(ValidationError::InvalidTtft(spec.sla.ttft)));
        }
        if !(spec.sla.itl > 0.0) {
            return Ok(Some(ValidationError::InvalidItl(spec.sla.itl)));
        }
        if let Some(backend) = &spec.backend {
            if !SUPPORTED_BACKENDS.contains(&backend.as_str()) {
                return Ok(Some(ValidationError::UnsupportedBackend(backend.clone())));
            }
        }

        let reference = spec
            .profiling_config
            .as_ref()
            .and_then(|p| p.config_map_ref.as_ref())
            .filter(|_| spec.online);
        let Some(reference) = reference else {
            return Ok(None);
        };
        let namespace = self.namespace();
        let Some(config_map) = self.ctx.client.get_config_map(&namespace, &reference.name).await? else {
            return Ok(Some(ValidationError::ConfigMapNotFound {
                name: reference.name.clone(),
                namespace,
            }));
        };
        let key = reference.key.as_deref().unwrap_or(DEFAULT_CONFIG_KEY);
        let has_key = config_map.data.as_ref().is_some_and(|d| d.contains_key(key))
            || config_map.binary_data.as_ref().is_some_and(|d| d.contains_key(key));
        if !has_key {
            return Ok(Some(ValidationError::ConfigMapKeyNotFound {
                key: key.to_string(),
                name: reference.name.clone(),
            }));
        }
        Ok(None)
    }

    async fn handle_pending(&mut self) -> Result<Step, Error> {
        let names = ProfilingNames::for_request(&self.request);
        let launched = ensure_profiling_job(
            self.ctx.client.as_ref(),
            self.ctx.rbac.as_ref(),
            &self.ctx.config,
            &self.request,
        )
        .await;

        match launched {
            Ok(sync) => {
                if sync != JobSync::Unchanged {
                    self.event(
                        EventType::Normal,
                        reasons::PROFILING_JOB_CREATED,
                        actions::PROFILE,
                        format!("Created {} profiling job {}", names.mode.display_name(), names.job),
                    )
                    .await;
                }
                let condition = self.condition(
                    ConditionType::Profiling,
                    ConditionStatus::False,
                    "ProfilingRunning",
                    &format!("Profiling job {} is running", names.job),
                );
                self.transition(RequestState::Profiling, Some(condition)).await?;
                Ok(Step::Continue)
            }
            Err(e) if e.is_permanent() => {
                let message = e.to_string();
                warn!(job = %names.job, "Cannot launch profiling job: {}", message);
                self.event(
                    EventType::Warning,
                    reasons::PROFILING_JOB_FAILED,
                    actions::PROFILE,
                    message.clone(),
                )
                .await;
                let condition = self.condition(
                    ConditionType::Profiling,
                    ConditionStatus::False,
                    "ProfilingJobCreationFailed",
                    &message,
                );
                self.transition(RequestState::Failed, Some(condition)).await?;
                Ok(Step::Done(Action::await_change()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_profiling(&mut self) -> Result<Step, Error> {
        let names = ProfilingNames::for_request(&self.request);
        let Some(job) = self.ctx.client.get_job(&self.namespace(), &names.job).await? else {
            let message = format!("Profiling job {} not found", names.job);
            return self
                .fail(
                    reasons::PROFILING_CHECK_FAILED,
                    ConditionType::Profiling,
                    "ProfilingJobMissing",
                    message,
                )
                .await;
        };

        match job_outcome(&job) {
            JobOutcome::Running => {
                debug!(job = %names.job, "Profiling job still running");
                Ok(Step::Done(Action::await_change()))
            }
            JobOutcome::Failed(reason) => {
                let message = format!("Profiling job {} failed: {}", names.job, reason);
                self.fail(
                    reasons::PROFILING_JOB_FAILED,
                    ConditionType::Profiling,
                    "ProfilingFailed",
                    message,
                )
                .await
            }
            JobOutcome::Succeeded => self.collect_profiling_output(&names).await,
        }
    }

    async fn collect_profiling_output(&mut self, names: &ProfilingNames) -> Result<Step, Error> {
        let completed = self.condition(
            ConditionType::Profiling,
            ConditionStatus::True,
            "ProfilingCompleted",
            "Profiling job completed successfully",
        );
        self.status_mut().set_condition(completed);

        let document = match self.read_generated_output(names).await? {
            GeneratedOutput::Parsed(document) => document,
            GeneratedOutput::Unusable(message) => {
                return self
                    .fail(
                        reasons::GENERATION_FAILED,
                        ConditionType::SpecGenerated,
                        "GenerationFailed",
                        message,
                    )
                    .await;
            }
        };

        let value = document.to_status_value()?;
        let status = self.status_mut();
        status.generated_deployment = Some(value);
        status.profiling_results = names.results_reference();

        if self.request.spec.auto_apply {
            let message = format!(
                "Generated deployment {} from profiling results, creating it",
                document.name()
            );
            self.event(EventType::Normal, reasons::SPEC_GENERATED, actions::PROFILE, message.clone())
                .await;
            let condition = self.condition(ConditionType::SpecGenerated, ConditionStatus::True, "SpecGenerated", &message);
            self.transition(RequestState::Deploying, Some(condition)).await?;
            Ok(Step::Continue)
        } else {
            let message = format!(
                "Generated deployment {} is available in status.generatedDeployment; apply it manually or set autoApply",
                document.name()
            );
            self.event(EventType::Normal, reasons::SPEC_GENERATED, actions::PROFILE, message.clone())
                .await;
            let condition = self.condition(ConditionType::SpecGenerated, ConditionStatus::True, "SpecGenerated", &message);
            self.transition(RequestState::Ready, Some(condition)).await?;
            Ok(Step::Done(Action::await_change()))
        }
    }

    async fn read_generated_output(&self, names: &ProfilingNames) -> Result<GeneratedOutput, Error> {
        let Some(config_map) = self
            .ctx
            .client
            .get_config_map(&self.namespace(), &names.output_config_map)
            .await?
        else {
            return Ok(GeneratedOutput::Unusable(format!(
                "Output ConfigMap {} not found",
                names.output_config_map
            )));
        };
        let Some(raw) = config_map.data.as_ref().and_then(|d| d.get(OUTPUT_FILE)) else {
            return Ok(GeneratedOutput::Unusable(format!(
                "key {} not found in ConfigMap {}",
                OUTPUT_FILE, names.output_config_map
            )));
        };
        Ok(match GraphDeploymentDocument::from_yaml(raw) {
            Ok(document) => GeneratedOutput::Parsed(document),
            Err(e) => GeneratedOutput::Unusable(e.to_string()),
        })
    }

    async fn handle_deploying(&mut self) -> Result<Step, Error> {
        if !self.request.spec.auto_apply {
            let message = "autoApply was disabled; the generated deployment is available in \
                           status.generatedDeployment"
                .to_string();
            self.event(EventType::Normal, reasons::AUTO_APPLY_DISABLED, actions::DEPLOY, message.clone())
                .await;
            let condition = self.condition(
                ConditionType::DeploymentReady,
                ConditionStatus::False,
                "AutoApplyDisabled",
                &message,
            );
            let generation = self.generation();
            self.status_mut().observed_generation = generation;
            self.transition(RequestState::Ready, Some(condition)).await?;
            return Ok(Step::Done(Action::await_change()));
        }
        match self.status().deployment.filter(|d| d.created) {
            Some(record) => self.observe_deployment(record).await,
            None => self.create_deployment().await,
        }
    }

    async fn handle_ready(&mut self) -> Result<Step, Error> {
        if !self.request.spec.auto_apply {
            return Ok(Step::Done(Action::await_change()));
        }
        match self.status().deployment.filter(|d| d.created) {
            Some(record) => self.observe_deployment(record).await,
            None => {
                let message = "autoApply is enabled but no DynamoGraphDeployment was created yet".to_string();
                self.event(EventType::Normal, reasons::DEPLOYMENT_PENDING, actions::DEPLOY, message.clone())
                    .await;
                let condition = self.condition(
                    ConditionType::DeploymentReady,
                    ConditionStatus::False,
                    "DeploymentPending",
                    &message,
                );
                self.transition(RequestState::Deploying, Some(condition)).await?;
                Ok(Step::Continue)
            }
        }
    }

    async fn create_deployment(&mut self) -> Result<Step, Error> {
        let value = self
            .status()
            .generated_deployment
            .ok_or(Error::MissingGeneratedDeployment)?;
        let document = GraphDeploymentDocument::from_status_value(&value)?;
        let planned = plan_graph_deployment(&self.request, &document);

        match self.ctx.client.create_graph_deployment(&planned.deployment).await {
            Ok(CreateOutcome::Created) => {
                info!(
                    deployment = %planned.name,
                    namespace = %planned.namespace,
                    owned = planned.owned,
                    "Created DynamoGraphDeployment"
                );
                self.event(
                    EventType::Normal,
                    reasons::DEPLOYMENT_CREATED,
                    actions::DEPLOY,
                    format!("Created DynamoGraphDeployment {}/{}", planned.namespace, planned.name),
                )
                .await;
            }
            Ok(CreateOutcome::AlreadyExists) => {
                info!(deployment = %planned.name, namespace = %planned.namespace, "DynamoGraphDeployment already exists");
            }
            Err(e) => {
                self.event(
                    EventType::Warning,
                    reasons::DEPLOYMENT_CREATION_FAILED,
                    actions::DEPLOY,
                    format!("Failed to create DynamoGraphDeployment {}: {}", planned.name, e),
                )
                .await;
                return Err(e.into());
            }
        }

        let record = DeploymentStatus {
            name: planned.name.clone(),
            namespace: planned.namespace.clone(),
            state: DEPLOYMENT_STATE_PENDING.to_string(),
            created: true,
        };
        let condition = self.condition(
            ConditionType::DeploymentReady,
            ConditionStatus::False,
            "DeploymentCreated",
            &format!("DynamoGraphDeployment {} created, waiting for it to become ready", planned.name),
        );
        let status = self.status_mut();
        status.deployment = Some(record.clone());
        status.set_condition(condition);
        self.write_status().await?;
        Ok(Step::Done(self.monitor_action(&record)))
    }

    /// Mirrors the deployment's state into the request and moves between
    /// `Deploying` and `Ready` as it changes.
    async fn observe_deployment(&mut self, record: DeploymentStatus) -> Result<Step, Error> {
        let Some(deployment) = self
            .ctx
            .client
            .get_graph_deployment(&record.namespace, &record.name)
            .await?
        else {
            return self.mark_deployment_deleted(&record).await;
        };

        let observed = deployment
            .status
            .map(|s| s.state)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEPLOYMENT_STATE_PENDING.to_string());
        let ready = observed == DEPLOYMENT_STATE_READY;
        let before = self.request.status.clone();
        if let Some(current) = self.status_mut().deployment.as_mut() {
            current.state = observed.clone();
        }

        match (self.state(), ready) {
            (RequestState::Deploying, true) => {
                let message = format!("DynamoGraphDeployment {} is ready", record.name);
                self.event(EventType::Normal, reasons::DEPLOYMENT_READY, actions::DEPLOY, message.clone())
                    .await;
                let condition = self.condition(
                    ConditionType::DeploymentReady,
                    ConditionStatus::True,
                    "DeploymentReady",
                    &message,
                );
                self.transition(RequestState::Ready, Some(condition)).await?;
            }
            (RequestState::Ready, false) => {
                let message = format!(
                    "DynamoGraphDeployment {} is no longer ready (state {:?})",
                    record.name, observed
                );
                self.event(EventType::Warning, reasons::DEPLOYMENT_DEGRADED, actions::DEPLOY, message.clone())
                    .await;
                let condition = self.condition(
                    ConditionType::DeploymentReady,
                    ConditionStatus::False,
                    "DeploymentDegraded",
                    &message,
                );
                self.transition(RequestState::Deploying, Some(condition)).await?;
            }
            _ if self.request.status != before => self.write_status().await?,
            _ => debug!(deployment = %record.name, state = %observed, "Deployment state unchanged"),
        }
        Ok(Step::Done(self.monitor_action(&record)))
    }

    async fn mark_deployment_deleted(&mut self, record: &DeploymentStatus) -> Result<Step, Error> {
        let message = format!(
            "DynamoGraphDeployment {}/{} was deleted and will not be recreated",
            record.namespace, record.name
        );
        warn!(deployment = %record.name, "Deployment deleted");
        self.event(EventType::Warning, reasons::DEPLOYMENT_DELETED, actions::DEPLOY, message.clone())
            .await;
        if let Some(current) = self.status_mut().deployment.as_mut() {
            current.state = "Deleted".to_string();
        }
        let condition = self.condition(
            ConditionType::DeploymentReady,
            ConditionStatus::False,
            "DeploymentDeleted",
            &message,
        );
        self.transition(RequestState::DeploymentDeleted, Some(condition)).await?;
        Ok(Step::Done(Action::await_change()))
    }

    async fn handle_unknown(&mut self) -> Result<Step, Error> {
        warn!("Request has an unrecognized state");
        self.event(
            EventType::Warning,
            reasons::INVALID_STATE,
            actions::RECONCILE,
            "Invalid state".to_string(),
        )
        .await;
        let condition = self.condition(
            ConditionType::Validation,
            ConditionStatus::False,
            "InvalidState",
            "Invalid state",
        );
        self.transition(RequestState::Failed, Some(condition)).await?;
        Ok(Step::Done(Action::await_change()))
    }

    /// Records a permanent failure: warning event, `False` condition and the
    /// `Failed` state.
    async fn fail(
        &mut self,
        event_reason: &str,
        condition_type: ConditionType,
        condition_reason: &str,
        message: String,
    ) -> Result<Step, Error> {
        warn!("{}", message);
        self.event(EventType::Warning, event_reason, actions::PROFILE, message.clone())
            .await;
        let condition = self.condition(condition_type, ConditionStatus::False, condition_reason, &message);
        self.transition(RequestState::Failed, Some(condition)).await?;
        Ok(Step::Done(Action::await_change()))
    }

    /// Owned deployments produce watch events; others have to be polled.
    fn monitor_action(&self, record: &DeploymentStatus) -> Action {
        if record.namespace == self.namespace() {
            Action::await_change()
        } else {
            Action::requeue(self.ctx.config.deployment_poll_interval)
        }
    }
}
