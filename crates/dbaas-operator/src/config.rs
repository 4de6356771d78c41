//! Operator configuration from flags and environment

use std::time::Duration;

use clap::Args;

use dbaas_common::telemetry::{LogFormat, TelemetryConfig, DEFAULT_FILTER};
use dbaas_common::FIELD_MANAGER;

/// Settings shared by every controller
#[derive(Args, Clone, Debug)]
pub struct ControllerConfig {
    /// Log line format: json or text
    #[arg(long, env = "DBAAS_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// Maximum concurrent reconciles per controller
    #[arg(long, env = "DBAAS_CONCURRENCY", default_value_t = 4)]
    pub concurrency: u16,

    /// Backstop requeue interval for converged objects, in seconds
    #[arg(long, env = "DBAAS_REQUEUE_SECS", default_value_t = 300)]
    pub requeue_secs: u64,

    /// Server-side watch timeout, in seconds; must stay below the client read timeout
    #[arg(long, env = "DBAAS_WATCH_TIMEOUT_SECS", default_value_t = 25)]
    pub watch_timeout_secs: u32,

    /// Field manager recorded on every write
    #[arg(long, env = "DBAAS_FIELD_MANAGER", default_value = FIELD_MANAGER)]
    pub field_manager: String,

    /// Apply the DBaaS CRDs on startup
    #[arg(long, env = "DBAAS_INSTALL_CRDS", default_value_t = false)]
    pub install_crds: bool,
}

impl ControllerConfig {
    /// Reject settings the controllers cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.requeue_secs == 0 {
            anyhow::bail!("--requeue-secs must be greater than zero");
        }
        if self.watch_timeout_secs == 0 || self.watch_timeout_secs >= 30 {
            anyhow::bail!("--watch-timeout-secs must be between 1 and 29");
        }
        if self.field_manager.trim().is_empty() {
            anyhow::bail!("--field-manager must not be empty");
        }
        Ok(())
    }

    /// Backstop requeue interval
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_secs)
    }

    /// Telemetry settings
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            format: self.log_format,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}
