/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/config.rs
*
* Operator configuration. Every setting comes from an environment variable
* with a sensible default; `from_lookup` takes the variable source as a
* function so the parsing rules can be exercised without touching the
* process environment.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::time::Duration;
use thiserror::Error;

pub const ENV_RESTRICTED_NAMESPACE: &str = "DGDR_RESTRICTED_NAMESPACE";
pub const ENV_PROFILING_CLUSTER_ROLE: &str = "DGDR_PROFILING_CLUSTER_ROLE";
pub const ENV_ONLINE_PROFILING_IMAGE: &str = "DGDR_ONLINE_PROFILING_IMAGE";
pub const ENV_AIC_PROFILING_IMAGE: &str = "DGDR_AIC_PROFILING_IMAGE";
pub const ENV_SIDECAR_IMAGE: &str = "DGDR_SIDECAR_IMAGE";
pub const ENV_PROFILING_BACKOFF_LIMIT: &str = "DGDR_PROFILING_BACKOFF_LIMIT";
pub const ENV_DEPLOYMENT_POLL_INTERVAL_SECS: &str = "DGDR_DEPLOYMENT_POLL_INTERVAL_SECS";
pub const ENV_ERROR_REQUEUE_SECS: &str = "DGDR_ERROR_REQUEUE_SECS";
pub const ENV_METRICS_PORT: &str = "METRICS_PORT";

const DEFAULT_PROFILING_CLUSTER_ROLE: &str = "dynamo-operator-dgdr-profiling";
const DEFAULT_SIDECAR_IMAGE: &str = "bitnami/kubectl:latest";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// When set, the operator only watches this namespace and the profiling
    /// service account is expected to be provisioned by the installer.
    pub restricted_namespace: Option<String>,
    pub profiling_cluster_role: String,
    pub online_profiling_image: Option<String>,
    pub aic_profiling_image: Option<String>,
    pub sidecar_image: String,
    pub profiling_backoff_limit: i32,
    /// Status poll interval for deployments in another namespace.
    pub deployment_poll_interval: Duration,
    pub error_requeue: Duration,
    pub metrics_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            restricted_namespace: None,
            profiling_cluster_role: DEFAULT_PROFILING_CLUSTER_ROLE.to_string(),
            online_profiling_image: None,
            aic_profiling_image: None,
            sidecar_image: DEFAULT_SIDECAR_IMAGE.to_string(),
            profiling_backoff_limit: 3,
            deployment_poll_interval: Duration::from_secs(30),
            error_requeue: Duration::from_secs(15),
            metrics_port: 9090,
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the configuration from an arbitrary variable source. Empty
    /// values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            restricted_namespace: get(ENV_RESTRICTED_NAMESPACE),
            profiling_cluster_role: get(ENV_PROFILING_CLUSTER_ROLE)
                .unwrap_or(defaults.profiling_cluster_role),
            online_profiling_image: get(ENV_ONLINE_PROFILING_IMAGE),
            aic_profiling_image: get(ENV_AIC_PROFILING_IMAGE),
            sidecar_image: get(ENV_SIDECAR_IMAGE).unwrap_or(defaults.sidecar_image),
            profiling_backoff_limit: parse_number(
                ENV_PROFILING_BACKOFF_LIMIT,
                get(ENV_PROFILING_BACKOFF_LIMIT),
                defaults.profiling_backoff_limit,
            )?,
            deployment_poll_interval: parse_number(
                ENV_DEPLOYMENT_POLL_INTERVAL_SECS,
                get(ENV_DEPLOYMENT_POLL_INTERVAL_SECS),
                defaults.deployment_poll_interval.as_secs(),
            )
            .map(Duration::from_secs)?,
            error_requeue: parse_number(
                ENV_ERROR_REQUEUE_SECS,
                get(ENV_ERROR_REQUEUE_SECS),
                defaults.error_requeue.as_secs(),
            )
            .map(Duration::from_secs)?,
            metrics_port: parse_number(ENV_METRICS_PORT, get(ENV_METRICS_PORT), defaults.metrics_port)?,
        })
    }

    /// Whether the operator may create cluster-scoped RBAC bindings for the
    /// profiling jobs it launches.
    pub fn is_cluster_wide(&self) -> bool {
        self.restricted_namespace.is_none()
    }
}

fn parse_number<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    match raw {
        None => Ok(default),
        Some(value) => match value.trim().parse::<T>() {
            Ok(parsed) if parsed >= T::default() => Ok(parsed),
            _ => Err(ConfigError::InvalidNumber { var, value }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = OperatorConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, OperatorConfig::default());
        assert!(config.is_cluster_wide());
        assert_eq!(config.profiling_cluster_role, "dynamo-operator-dgdr-profiling");
        assert_eq!(config.sidecar_image, "bitnami/kubectl:latest");
        assert_eq!(config.profiling_backoff_limit, 3);
    }

    #[test]
    fn values_are_read_from_the_lookup() {
        let config = OperatorConfig::from_lookup(lookup_from(&[
            (ENV_RESTRICTED_NAMESPACE, "team-a"),
            (ENV_ONLINE_PROFILING_IMAGE, "nvcr.io/dynamo/profiler:1.0"),
            (ENV_PROFILING_BACKOFF_LIMIT, "5"),
            (ENV_DEPLOYMENT_POLL_INTERVAL_SECS, "10"),
            (ENV_METRICS_PORT, "8080"),
        ]))
        .unwrap();

        assert_eq!(config.restricted_namespace.as_deref(), Some("team-a"));
        assert!(!config.is_cluster_wide());
        assert_eq!(
            config.online_profiling_image.as_deref(),
            Some("nvcr.io/dynamo/profiler:1.0")
        );
        assert_eq!(config.aic_profiling_image, None);
        assert_eq!(config.profiling_backoff_limit, 5);
        assert_eq!(config.deployment_poll_interval, Duration::from_secs(10));
        assert_eq!(config.metrics_port, 8080);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = OperatorConfig::from_lookup(lookup_from(&[
            (ENV_RESTRICTED_NAMESPACE, "  "),
            (ENV_SIDECAR_IMAGE, ""),
        ]))
        .unwrap();
        assert_eq!(config.restricted_namespace, None);
        assert_eq!(config.sidecar_image, "bitnami/kubectl:latest");
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = OperatorConfig::from_lookup(lookup_from(&[(ENV_PROFILING_BACKOFF_LIMIT, "-1")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                var: ENV_PROFILING_BACKOFF_LIMIT,
                value: "-1".to_string()
            }
        );

        assert!(OperatorConfig::from_lookup(lookup_from(&[(ENV_METRICS_PORT, "http")])).is_err());
    }
}
