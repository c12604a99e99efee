/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/metrics.rs
*
* This module defines and registers the custom Prometheus metrics that the
* dgdr-operator exposes. They describe how often requests are reconciled,
* how requests move through their lifecycle and how many profiling jobs the
* operator has launched.
*
* Using `lazy_static`, the metrics are created only once and are available
* globally across all concurrent reconciliation loops and the web server.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::RequestState;
use lazy_static::lazy_static;
use prometheus::{
    opts, register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec, Registry,
};

// --- Metric Definitions ---

lazy_static! {
    /// Reconcile passes, labeled by `success` or `error`.
    pub static ref DGDR_RECONCILE_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "dgdr_reconcile_total",
            "Total number of DynamoGraphDeploymentRequest reconcile passes.",
            &["result"]
        ).expect("dgdr_reconcile_total registers once");

    /// Lifecycle transitions, labeled by source and target state.
    pub static ref DGDR_STATE_TRANSITIONS_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "dgdr_state_transitions_total",
            "Total number of DynamoGraphDeploymentRequest state transitions.",
            &["from", "to"]
        ).expect("dgdr_state_transitions_total registers once");

    pub static ref DGDR_PROFILING_JOBS_CREATED_TOTAL: IntCounter =
        register_int_counter!(opts!(
            "dgdr_profiling_jobs_created_total",
            "Total number of profiling Jobs created by the operator."
        )).expect("dgdr_profiling_jobs_created_total registers once");
}

/// Creates a new Prometheus registry and registers all custom metrics.
///
/// This function is intended to be called once at operator startup.
pub fn create_and_register_metrics() -> Result<Registry, prometheus::Error> {
    let r = Registry::new();
    r.register(Box::new(DGDR_RECONCILE_TOTAL.clone()))?;
    r.register(Box::new(DGDR_STATE_TRANSITIONS_TOTAL.clone()))?;
    r.register(Box::new(DGDR_PROFILING_JOBS_CREATED_TOTAL.clone()))?;
    Ok(r)
}

pub fn record_reconcile(success: bool) {
    let result = if success { "success" } else { "error" };
    DGDR_RECONCILE_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_transition(from: RequestState, to: RequestState) {
    let from = if from == RequestState::Empty { "Empty" } else { from.as_str() };
    DGDR_STATE_TRANSITIONS_TOTAL
        .with_label_values(&[from, to.as_str()])
        .inc();
}
