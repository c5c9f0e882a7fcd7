use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::model::OverlapPolicy;
use crate::sweeper::SweepPolicy;
use crate::tenant::TenantSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("both CLASSBOOK_TLS_CERT and CLASSBOOK_TLS_KEY must be set, or neither")]
    PartialTls,
}

/// Server configuration, read from `CLASSBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    /// JSON member registry; without it nobody can log in.
    pub members_file: Option<PathBuf>,
    pub sweep_interval: Duration,
    pub sweep_budget: Duration,
    /// Consecutive failed sweeps before logging escalates to `error`.
    pub sweep_alert_after: u32,
    pub generation_window_days: u32,
    pub roll_interval: Duration,
    pub overlap: OverlapPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        let tls_cert = get("CLASSBOOK_TLS_CERT");
        let tls_key = get("CLASSBOOK_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        Ok(Self {
            port: parsed(&get, "CLASSBOOK_PORT")?.unwrap_or(5433),
            bind: get("CLASSBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: get("CLASSBOOK_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            password: get("CLASSBOOK_PASSWORD").unwrap_or_else(|| "classbook".into()),
            max_connections: parsed(&get, "CLASSBOOK_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&get, "CLASSBOOK_COMPACT_THRESHOLD")?.unwrap_or(1000),
            tls_cert,
            tls_key,
            metrics_port: parsed(&get, "CLASSBOOK_METRICS_PORT")?,
            members_file: get("CLASSBOOK_MEMBERS_FILE").map(PathBuf::from),
            sweep_interval: Duration::from_secs(
                parsed(&get, "CLASSBOOK_SWEEP_INTERVAL_SECS")?.unwrap_or(3600),
            ),
            sweep_budget: Duration::from_millis(
                parsed(&get, "CLASSBOOK_SWEEP_BUDGET_MS")?.unwrap_or(30_000),
            ),
            sweep_alert_after: parsed(&get, "CLASSBOOK_SWEEP_ALERT_AFTER")?.unwrap_or(3),
            generation_window_days: parsed(&get, "CLASSBOOK_GENERATION_WINDOW_DAYS")?
                .unwrap_or(56),
            roll_interval: Duration::from_secs(
                parsed(&get, "CLASSBOOK_ROLL_INTERVAL_SECS")?.unwrap_or(86_400),
            ),
            overlap: parsed(&get, "CLASSBOOK_OVERLAP")?.unwrap_or_default(),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn tenant_settings(&self) -> TenantSettings {
        TenantSettings {
            compact_threshold: self.compact_threshold,
            policy: self.overlap,
            window_days: self.generation_window_days,
            roll_interval: self.roll_interval,
            sweep: SweepPolicy {
                interval: self.sweep_interval,
                budget: self.sweep_budget,
                alert_after: self.sweep_alert_after,
            },
        }
    }
}

fn parsed<T>(
    get: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(var)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            })
        })
        .transpose()
}
