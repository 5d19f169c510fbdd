use std::str::FromStr;
use std::time::Duration;

/// A configuration value that could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got '{value}'")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Log output format of the binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

/// Coordinator configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Base URL this host registers its services under.
    pub host_url: String,
    /// Postgres persistence; `None` keeps everything in memory.
    pub database_url: Option<String>,
    pub liveness_window: Duration,
    pub reaper_interval: Duration,
    /// Completed jobs older than this are purged; `None` keeps them.
    pub retention: Option<Duration>,
    pub workflow_concurrency: usize,
    pub max_concurrent_jobs: u32,
    pub dispatch_timeout: Duration,
    pub log_format: LogFormat,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host_url: "http://localhost:8080".to_string(),
            database_url: None,
            liveness_window: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(30),
            retention: None,
            workflow_concurrency: castflow_workflow::DEFAULT_CONCURRENCY,
            max_concurrent_jobs: 8,
            dispatch_timeout: Duration::from_secs(10),
            log_format: LogFormat::Text,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default                 |
    /// |----------------------------|-------------------------|
    /// | `CASTFLOW_HOST_URL`        | `http://localhost:8080` |
    /// | `DATABASE_URL`             | unset (in-memory)       |
    /// | `JOB_LIVENESS_WINDOW_SECS` | `300`                   |
    /// | `REAPER_INTERVAL_SECS`     | `30`                    |
    /// | `JOB_RETENTION_HOURS`      | unset (no purge)        |
    /// | `WORKFLOW_CONCURRENCY`     | `4`                     |
    /// | `HOST_MAX_CONCURRENT_JOBS` | `8`                     |
    /// | `DISPATCH_TIMEOUT_SECS`    | `10`                    |
    /// | `LOG_FORMAT`               | `text`                  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let host_url = value("CASTFLOW_HOST_URL")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .unwrap_or(defaults.host_url);

        let liveness_window = match value("JOB_LIVENESS_WINDOW_SECS") {
            Some(v) => Duration::from_secs(positive("JOB_LIVENESS_WINDOW_SECS", &v)?),
            None => defaults.liveness_window,
        };
        let reaper_interval = match value("REAPER_INTERVAL_SECS") {
            Some(v) => Duration::from_secs(positive("REAPER_INTERVAL_SECS", &v)?),
            None => defaults.reaper_interval,
        };
        let retention = match value("JOB_RETENTION_HOURS") {
            Some(v) => {
                let hours = positive::<u64>("JOB_RETENTION_HOURS", &v)?;
                let secs = hours.checked_mul(3600).ok_or(ConfigError::Invalid {
                    key: "JOB_RETENTION_HOURS",
                    expected: "a number of hours that fits in seconds",
                    value: v,
                })?;
                Some(Duration::from_secs(secs))
            }
            None => None,
        };
        let workflow_concurrency = match value("WORKFLOW_CONCURRENCY") {
            Some(v) => positive("WORKFLOW_CONCURRENCY", &v)?,
            None => defaults.workflow_concurrency,
        };
        let max_concurrent_jobs = match value("HOST_MAX_CONCURRENT_JOBS") {
            Some(v) => positive("HOST_MAX_CONCURRENT_JOBS", &v)?,
            None => defaults.max_concurrent_jobs,
        };
        let dispatch_timeout = match value("DISPATCH_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(positive("DISPATCH_TIMEOUT_SECS", &v)?),
            None => defaults.dispatch_timeout,
        };
        let log_format = match value("LOG_FORMAT") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                key: "LOG_FORMAT",
                expected: "'text' or 'json'",
                value: v,
            })?,
            None => defaults.log_format,
        };

        Ok(Self {
            host_url,
            database_url: value("DATABASE_URL"),
            liveness_window,
            reaper_interval,
            retention,
            workflow_concurrency,
            max_concurrent_jobs,
            dispatch_timeout,
            log_format,
        })
    }
}

/// Parse a strictly positive integer.
fn positive<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialOrd,
{
    raw.trim()
        .parse::<T>()
        .ok()
        .filter(|v| *v > T::default())
        .ok_or_else(|| ConfigError::Invalid {
            key,
            expected: "a positive integer",
            value: raw.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
