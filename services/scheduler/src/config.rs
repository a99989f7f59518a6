//! Scheduler configuration.
//!
//! Loaded once at startup from `ESFM_*` environment variables, validated,
//! then shared read-only as `Arc<Configuration>`.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::model::ResourceRequest;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },

    #[error("executor timeout ({timeout_ms}ms) must be greater than the health check delay ({delay_ms}ms)")]
    TimeoutNotAboveDelay { timeout_ms: u128, delay_ms: u128 },

    #[error("pinned ports must be exactly two distinct ports, got {0:?}")]
    InvalidPorts(Vec<u16>),

    #[error("{field} must not be blank")]
    Blank { field: &'static str },
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Desired number of Elasticsearch nodes.
    pub elasticsearch_nodes: i64,

    /// CPU quantum per task.
    pub cpus: f64,

    /// Memory quantum per task (MB).
    pub mem: f64,

    /// Disk quantum per task (MB).
    pub disk: f64,

    /// Pinned `[client, transport]` ports. Empty means pick from the offer.
    pub elasticsearch_ports: Vec<u16>,

    /// Elasticsearch cluster name passed to every node.
    pub cluster_name: String,

    /// Period of the reconciliation ping; the liveness check runs at half.
    pub executor_health_delay: Duration,

    /// Maximum gap between status timestamps before an executor is lost.
    pub executor_timeout: Duration,

    pub framework_name: String,
    pub framework_role: String,
    pub framework_failover_timeout_secs: u64,

    pub executor_name: String,
    pub executor_image: String,

    /// Docker volume driver; enables external-volume mode when set.
    pub external_volume_driver: Option<String>,

    /// Path of the SQLite state file.
    pub store_path: String,

    /// Bound on every store round-trip.
    pub store_timeout: Duration,

    /// Interval between reaper passes.
    pub reaper_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Register against an in-process driver instead of a real orchestrator.
    pub dev_mode: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            elasticsearch_nodes: 3,
            cpus: 1.0,
            mem: 256.0,
            disk: 1024.0,
            elasticsearch_ports: Vec::new(),
            cluster_name: "mesos-ha".to_string(),
            executor_health_delay: Duration::from_millis(30_000),
            executor_timeout: Duration::from_millis(60_000),
            framework_name: "elasticsearch".to_string(),
            framework_role: "*".to_string(),
            framework_failover_timeout_secs: 2_592_000,
            executor_name: "elasticsearch-executor".to_string(),
            executor_image: "mesos/elasticsearch-executor".to_string(),
            external_volume_driver: None,
            store_path: "/var/lib/esfm/state.db".to_string(),
            store_timeout: Duration::from_millis(20_000),
            reaper_interval: esfm_reconcile::DEFAULT_REAPER_INTERVAL,
            log_level: "info".to_string(),
            dev_mode: false,
        }
    }
}

impl Configuration {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Env { lookup: &lookup };

        let elasticsearch_ports = match env.string("ESFM_ELASTICSEARCH_PORTS") {
            Some(raw) => parse_ports(&raw)?,
            None => defaults.elasticsearch_ports,
        };

        Ok(Self {
            elasticsearch_nodes: env.parse("ESFM_ELASTICSEARCH_NODES", defaults.elasticsearch_nodes)?,
            cpus: env.parse("ESFM_ELASTICSEARCH_CPU", defaults.cpus)?,
            mem: env.parse("ESFM_ELASTICSEARCH_RAM", defaults.mem)?,
            disk: env.parse("ESFM_ELASTICSEARCH_DISK", defaults.disk)?,
            elasticsearch_ports,
            cluster_name: env
                .string("ESFM_ELASTICSEARCH_CLUSTER_NAME")
                .unwrap_or(defaults.cluster_name),
            executor_health_delay: env
                .millis("ESFM_EXECUTOR_HEALTH_DELAY_MS", defaults.executor_health_delay)?,
            executor_timeout: env.millis("ESFM_EXECUTOR_TIMEOUT_MS", defaults.executor_timeout)?,
            framework_name: env
                .string("ESFM_FRAMEWORK_NAME")
                .unwrap_or(defaults.framework_name),
            framework_role: env
                .string("ESFM_FRAMEWORK_ROLE")
                .unwrap_or(defaults.framework_role),
            framework_failover_timeout_secs: env.parse(
                "ESFM_FRAMEWORK_FAILOVER_TIMEOUT_SECS",
                defaults.framework_failover_timeout_secs,
            )?,
            executor_name: env
                .string("ESFM_EXECUTOR_NAME")
                .unwrap_or(defaults.executor_name),
            executor_image: env
                .string("ESFM_EXECUTOR_IMAGE")
                .unwrap_or(defaults.executor_image),
            external_volume_driver: env
                .string("ESFM_EXTERNAL_VOLUME_DRIVER")
                .filter(|s| !s.trim().is_empty()),
            store_path: env.string("ESFM_STORE_PATH").unwrap_or(defaults.store_path),
            store_timeout: env.millis("ESFM_STORE_TIMEOUT_MS", defaults.store_timeout)?,
            reaper_interval: Duration::from_secs(env.parse(
                "ESFM_REAPER_INTERVAL_SECS",
                defaults.reaper_interval.as_secs(),
            )?),
            log_level: env.string("ESFM_LOG_LEVEL").unwrap_or(defaults.log_level),
            dev_mode: env.parse("ESFM_DEV", defaults.dev_mode)?,
        })
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.elasticsearch_nodes <= 0 {
            return Err(ConfigError::NonPositive {
                field: "elasticsearch_nodes",
            });
        }
        if self.elasticsearch_nodes % 2 == 0 {
            warn!(
                nodes = self.elasticsearch_nodes,
                "Even number of Elasticsearch nodes; an odd count avoids split-brain"
            );
        }

        for (field, value) in [("cpus", self.cpus), ("mem", self.mem), ("disk", self.disk)] {
            if value.is_nan() || value <= 0.0 {
                return Err(ConfigError::NonPositive { field });
            }
        }

        if self.executor_health_delay.is_zero() {
            return Err(ConfigError::NonPositive {
                field: "executor_health_delay",
            });
        }
        if self.executor_timeout <= self.executor_health_delay {
            return Err(ConfigError::TimeoutNotAboveDelay {
                timeout_ms: self.executor_timeout.as_millis(),
                delay_ms: self.executor_health_delay.as_millis(),
            });
        }
        if self.store_timeout.is_zero() {
            return Err(ConfigError::NonPositive {
                field: "store_timeout",
            });
        }
        if self.reaper_interval.is_zero() {
            return Err(ConfigError::NonPositive {
                field: "reaper_interval",
            });
        }

        if !self.elasticsearch_ports.is_empty() && self.pinned_ports().is_none() {
            return Err(ConfigError::InvalidPorts(self.elasticsearch_ports.clone()));
        }

        for (field, value) in [
            ("cluster_name", &self.cluster_name),
            ("framework_name", &self.framework_name),
            ("framework_role", &self.framework_role),
            ("executor_name", &self.executor_name),
            ("executor_image", &self.executor_image),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Blank { field });
            }
        }

        Ok(())
    }

    /// Pinned `(client, transport)` ports, if configured.
    pub fn pinned_ports(&self) -> Option<(u16, u16)> {
        match self.elasticsearch_ports.as_slice() {
            [client, transport] if client != transport => Some((*client, *transport)),
            _ => None,
        }
    }

    pub fn uses_external_volumes(&self) -> bool {
        self.external_volume_driver.is_some()
    }

    /// Prefix under which all persisted state lives.
    pub fn state_namespace(&self) -> String {
        format!("{}/{}", self.framework_name, self.cluster_name)
    }

    pub fn health_check_period(&self) -> Duration {
        self.executor_health_delay
    }

    /// Half the health check period.
    pub fn liveness_interval(&self) -> Duration {
        self.executor_health_delay / 2
    }

    /// Baseline resource request submitted on registration.
    pub fn framework_resources(&self) -> ResourceRequest {
        ResourceRequest {
            cpus: self.cpus,
            mem: self.mem,
            disk: (!self.uses_external_volumes()).then_some(self.disk),
            role: self.framework_role.clone(),
        }
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
    }

    fn parse<T: std::str::FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        match (self.lookup)(var) {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var,
                value: raw.clone(),
            }),
            None => Ok(default),
        }
    }

    fn millis(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(var, default_ms).map(Duration::from_millis)
    }
}

fn parse_ports(raw: &str) -> Result<Vec<u16>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                var: "ESFM_ELASTICSEARCH_PORTS",
                value: raw.to_string(),
            })
        })
        .collect()
}
