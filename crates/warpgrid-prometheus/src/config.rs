//! Receiver configuration parser.
//!
//! The receiver is configured from TOML:
//!
//! ```toml
//! name = "prometheus"
//! job_staleness = "2m"
//!
//! [include_filter]
//! "localhost:9100" = ["node_cpu_seconds_total", "up"]
//!
//! [prometheus.global]
//! scrape_interval = "15s"
//!
//! [[prometheus.scrape_configs]]
//! job_name = "node"
//!
//! [[prometheus.scrape_configs.static_configs]]
//! targets = ["localhost:9100"]
//! labels = { env = "prod" }
//! ```
//!
//! Durations are written as strings with an `ms`, `s`, `m` or `h` suffix.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReceiverError, ReceiverResult};

/// Default inactivity window after which a job's bookkeeping is discarded.
pub const DEFAULT_JOB_STALENESS: Duration = Duration::from_secs(2 * 60);

/// Default delay between launching the scrape loop and applying discovery config.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceiverConfig {
    /// Receiver name, attached to every background task span.
    pub name: String,
    #[serde(default)]
    pub prometheus: PrometheusConfig,
    /// Endpoint → allowed metric names.
    #[serde(default)]
    pub include_filter: HashMap<String, Vec<String>>,
    #[serde(default = "default_job_staleness", with = "duration_str")]
    pub job_staleness: Duration,
    #[serde(default = "default_startup_grace", with = "duration_str")]
    pub startup_grace: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PrometheusConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub scrape_configs: Vec<ScrapeConfig>,
}

/// Defaults applied to every job that leaves a field unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalConfig {
    #[serde(default = "default_scrape_interval", with = "duration_str")]
    pub scrape_interval: Duration,
    #[serde(default = "default_scrape_timeout", with = "duration_str")]
    pub scrape_timeout: Duration,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            scrape_interval: default_scrape_interval(),
            scrape_timeout: default_scrape_timeout(),
        }
    }
}

/// A single scrape job definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapeConfig {
    pub job_name: String,
    #[serde(default, with = "opt_duration_str", skip_serializing_if = "Option::is_none")]
    pub scrape_interval: Option<Duration>,
    #[serde(default, with = "opt_duration_str", skip_serializing_if = "Option::is_none")]
    pub scrape_timeout: Option<Duration>,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Keep sample labels that collide with target labels.
    #[serde(default)]
    pub honor_labels: bool,
    #[serde(flatten)]
    pub service_discovery: ServiceDiscoveryConfig,
}

impl ScrapeConfig {
    /// Create a job with the given name and defaults for everything else.
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            scrape_interval: None,
            scrape_timeout: None,
            metrics_path: default_metrics_path(),
            scheme: default_scheme(),
            honor_labels: false,
            service_discovery: ServiceDiscoveryConfig::default(),
        }
    }

    /// Add a static target group to this job.
    pub fn with_static_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.service_discovery.static_configs.push(StaticConfig {
            targets: targets.into_iter().map(Into::into).collect(),
            labels: BTreeMap::new(),
        });
        self
    }

    /// Effective scrape interval.
    pub fn interval(&self, global: &GlobalConfig) -> Duration {
        self.scrape_interval.unwrap_or(global.scrape_interval)
    }

    /// Effective scrape timeout. An unset timeout never exceeds the interval.
    pub fn timeout(&self, global: &GlobalConfig) -> Duration {
        match self.scrape_timeout {
            Some(timeout) => timeout,
            None => global.scrape_timeout.min(self.interval(global)),
        }
    }

    fn validate(&self, global: &GlobalConfig) -> ReceiverResult<()> {
        let job = &self.job_name;
        if job.trim().is_empty() {
            return Err(ReceiverError::invalid_job(job, "job_name must not be empty"));
        }
        let interval = self.interval(global);
        let timeout = self.timeout(global);
        if interval.is_zero() {
            return Err(ReceiverError::invalid_job(job, "scrape_interval must be positive"));
        }
        if timeout.is_zero() {
            return Err(ReceiverError::invalid_job(job, "scrape_timeout must be positive"));
        }
        if timeout > interval {
            return Err(ReceiverError::invalid_job(
                job,
                format!("scrape_timeout {timeout:?} exceeds scrape_interval {interval:?}"),
            ));
        }
        if !self.metrics_path.starts_with('/') {
            return Err(ReceiverError::invalid_job(job, "metrics_path must start with '/'"));
        }
        if self.scheme != "http" && self.scheme != "https" {
            return Err(ReceiverError::invalid_job(
                job,
                format!("unsupported scheme {:?}", self.scheme),
            ));
        }
        for group in &self.service_discovery.static_configs {
            if group.targets.iter().any(|t| t.trim().is_empty()) {
                return Err(ReceiverError::invalid_job(job, "static target must not be empty"));
            }
        }
        for provider in &self.service_discovery.providers {
            if provider.kind.trim().is_empty() {
                return Err(ReceiverError::invalid_job(job, "discovery provider kind must not be empty"));
            }
        }
        Ok(())
    }
}

/// How a job's targets are discovered.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceDiscoveryConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_configs: Vec<StaticConfig>,
    /// Mechanisms resolved by a registered discoverer factory.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<ProviderConfig>,
}

/// A fixed list of targets sharing a label set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StaticConfig {
    pub targets: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// An externally implemented discovery mechanism, e.g. `kind = "dns"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub kind: String,
    #[serde(flatten)]
    pub options: toml::Table,
}

impl ReceiverConfig {
    /// A config with the given name and no jobs.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prometheus: PrometheusConfig::default(),
            include_filter: HashMap::new(),
            job_staleness: DEFAULT_JOB_STALENESS,
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }

    pub fn from_file(path: &Path) -> ReceiverResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ReceiverResult<Self> {
        Ok(toml::from_str(content)?)
    }
}

impl PrometheusConfig {
    /// Check every job definition. Job names must be unique.
    pub fn validate(&self) -> ReceiverResult<()> {
        let mut seen = HashSet::new();
        for job in &self.scrape_configs {
            job.validate(&self.global)?;
            if !seen.insert(job.job_name.as_str()) {
                return Err(ReceiverError::invalid_job(&job.job_name, "duplicate job_name"));
            }
        }
        Ok(())
    }

    /// Job name → its service discovery configuration.
    pub fn discovery_configs(&self) -> HashMap<String, ServiceDiscoveryConfig> {
        self.scrape_configs
            .iter()
            .map(|job| (job.job_name.clone(), job.service_discovery.clone()))
            .collect()
    }
}

/// Parse a duration string such as `"500ms"`, `"15s"`, `"2m"` or `"1h"`.
pub fn parse_duration(s: &str) -> ReceiverResult<Duration> {
    let s = s.trim();
    let invalid = || ReceiverError::InvalidDuration(s.to_string());

    let (digits, unit_ms) = if let Some(v) = s.strip_suffix("ms") {
        (v, 1)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1_000)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60_000)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3_600_000)
    } else {
        return Err(invalid());
    };

    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    value
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}

/// Render a duration in the shortest exact unit understood by [`parse_duration`].
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 3_600_000 == 0 && ms != 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 && ms != 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1_000 == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{ms}ms")
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod opt_duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&super::format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|raw| super::parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

fn default_job_staleness() -> Duration {
    DEFAULT_JOB_STALENESS
}

fn default_startup_grace() -> Duration {
    DEFAULT_STARTUP_GRACE
}

fn default_scrape_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_scrape_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}
