//! Operator settings read from the environment

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_CLUSTER_RESYNC_SECS: u64 = 30;
pub const DEFAULT_OPS_POLL_SECS: u64 = 5;
pub const DEFAULT_POSTGRES_IMAGE_REPOSITORY: &str = "ghcr.io/cloudnative-pg/postgresql";
pub const DEFAULT_HEALTH_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Namespace both controllers watch; `None` watches every namespace
    pub watch_namespace: Option<String>,
    /// Steady-state requeue interval for DatabaseClusters
    pub cluster_resync: Duration,
    /// Requeue interval while an OpsRequest is Running
    pub ops_poll: Duration,
    pub postgres_image_repository: String,
    pub health_bind_addr: SocketAddr,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            cluster_resync: Duration::from_secs(DEFAULT_CLUSTER_RESYNC_SECS),
            ops_poll: Duration::from_secs(DEFAULT_OPS_POLL_SECS),
            postgres_image_repository: DEFAULT_POSTGRES_IMAGE_REPOSITORY.to_string(),
            health_bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the config from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let seconds = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match get(var) {
                None => Ok(default),
                Some(value) => match value.trim().parse::<u64>() {
                    Ok(0) => Err(ConfigError::Invalid {
                        var,
                        value,
                        reason: "must be greater than zero".to_string(),
                    }),
                    Ok(secs) => Ok(Duration::from_secs(secs)),
                    Err(e) => Err(ConfigError::Invalid {
                        var,
                        value,
                        reason: e.to_string(),
                    }),
                },
            }
        };

        let health_bind_addr = match get("HEALTH_BIND_ADDR") {
            None => defaults.health_bind_addr,
            Some(value) => value
                .trim()
                .parse::<SocketAddr>()
                .map_err(|e| ConfigError::Invalid {
                    var: "HEALTH_BIND_ADDR",
                    value: value.clone(),
                    reason: e.to_string(),
                })?,
        };

        Ok(Self {
            watch_namespace: get("WATCH_NAMESPACE"),
            cluster_resync: seconds("CLUSTER_RESYNC_SECONDS", defaults.cluster_resync)?,
            ops_poll: seconds("OPS_POLL_SECONDS", defaults.ops_poll)?,
            postgres_image_repository: get("POSTGRES_IMAGE_REPOSITORY")
                .unwrap_or(defaults.postgres_image_repository),
            health_bind_addr,
        })
    }
}
