/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* Archive: src/main.rs
*
* This file is the main entry point for the dgdr-operator. It sets up and runs
* the controller that drives DynamoGraphDeploymentRequest resources from
* profiling to a running DynamoGraphDeployment.
*
* Architecture:
* The program follows the standard `kube-rs` operator structure.
* 1.  **Initialization**: `tracing` is configured for structured JSON logs
* and the operator configuration is read from the environment.
* 2.  **Watches**: requests are watched cluster-wide, or in a single
* namespace when `DGDR_RESTRICTED_NAMESPACE` is set. Profiling Jobs and
* DynamoGraphDeployments are watched through their owner references so that
* their progress re-triggers the owning request.
* 3.  **Shared Context**: a `Context` holding the cluster client, the RBAC
* provisioner, the event recorder and the configuration is shared by all
* reconciles.
* 4.  **Concurrent Execution**: the controller and the `/metrics` server run
* side by side under `tokio::join!`.
*
* Running the binary with `--crd` prints both CustomResourceDefinitions as
* YAML and exits.
*
* SPDX-License-Identifier: Apache-2.0 */

use futures::stream::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::{Api, Client, CustomResourceExt};
use kube_runtime::{watcher, Controller};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warp::Filter;

mod client;
mod config;
mod crds;
mod events;
mod metrics;
mod controllers {
    pub mod dgdr_controller;
    pub mod graph_deployment;
    pub mod profiling_job;
    pub mod rbac_manager;
}
#[cfg(test)]
mod testing;

use config::OperatorConfig;
use controllers::dgdr_controller::{self, Context};
use crds::{DynamoGraphDeployment, DynamoGraphDeploymentRequest};

/// Initializes JSON logging filtered by `RUST_LOG` (default `info`).
fn init_telemetry() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().json();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

/// Renders the metrics into the Prometheus text format.
async fn metrics_handler(registry: Arc<Registry>) -> Result<impl warp::Reply, warp::Rejection> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }

    let response = String::from_utf8_lossy(&buffer).into_owned();
    Ok(warp::reply::with_header(
        response,
        "Content-Type",
        encoder.format_type(),
    ))
}

/// Runs the HTTP server to expose the /metrics endpoint.
async fn run_metrics_server(registry: Arc<Registry>, port: u16) {
    let metrics_route = warp::path("metrics")
        .and(warp::get())
        .and(warp::any().map(move || Arc::clone(&registry)))
        .and_then(metrics_handler);

    info!("Starting metrics server on 0.0.0.0:{}", port);
    warp::serve(metrics_route).run(([0, 0, 0, 0], port)).await;
}

fn print_crds() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&DynamoGraphDeploymentRequest::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&DynamoGraphDeployment::crd())?);
    Ok(())
}

/// The main entry point of the operator.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "--crd") {
        return print_crds();
    }

    // 1. Initialize logging and configuration
    init_telemetry()?;
    let config = OperatorConfig::from_env()?;
    info!(?config, "Configuration loaded.");

    // 2. Initialize Kubernetes client and APIs
    let client = Client::try_default().await?;
    let (requests, jobs, deployments) = match &config.restricted_namespace {
        Some(ns) => {
            info!(namespace = %ns, "Running in namespace-restricted mode");
            (
                Api::<DynamoGraphDeploymentRequest>::namespaced(client.clone(), ns),
                Api::<Job>::namespaced(client.clone(), ns),
                Api::<DynamoGraphDeployment>::namespaced(client.clone(), ns),
            )
        }
        None => (
            Api::<DynamoGraphDeploymentRequest>::all(client.clone()),
            Api::<Job>::all(client.clone()),
            Api::<DynamoGraphDeployment>::all(client.clone()),
        ),
    };

    // 3. Metrics registry and shared context
    let registry = Arc::new(metrics::create_and_register_metrics()?);
    info!("Custom metrics registered.");
    let metrics_port = config.metrics_port;
    let context = Arc::new(Context::new(client, config));

    info!("dgdr-operator starting...");

    // 4. Run the controller and metrics server concurrently
    tokio::join!(
        run_metrics_server(registry, metrics_port),
        Controller::new(requests, watcher::Config::default())
            .owns(jobs, watcher::Config::default())
            .owns(deployments, watcher::Config::default())
            .run(dgdr_controller::reconcile, dgdr_controller::error_policy, context)
            .for_each(|res| async move {
                match res {
                    Ok(o) => info!("Reconciled DynamoGraphDeploymentRequest: {:?}", o),
                    Err(e) => error!("DynamoGraphDeploymentRequest reconcile error: {}", e),
                }
            })
    );

    info!("dgdr-operator shutting down.");
    Ok(())
}
