//! Domain types shared by the discovery, scrape and sink stages.
//!
//! Scraped data enters as [`Sample`]s, is translated into the neutral
//! [`Metric`] representation and leaves the receiver as a [`MetricsBatch`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Sorted label set.
pub type Labels = BTreeMap<String, String>;

/// Label carrying the job name.
pub const JOB_LABEL: &str = "job";
/// Label carrying the target address.
pub const INSTANCE_LABEL: &str = "instance";

// ── Scrape input ───────────────────────────────────────────────────

/// Metric type as reported by the target's metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
    #[default]
    Unknown,
}

/// A single scraped value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub name: String,
    pub labels: Labels,
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub kind: SampleKind,
}

impl Sample {
    pub fn new(name: impl Into<String>, value: f64, timestamp_ms: i64) -> Self {
        Self {
            name: name.into(),
            labels: Labels::new(),
            value,
            timestamp_ms,
            kind: SampleKind::Unknown,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_kind(mut self, kind: SampleKind) -> Self {
        self.kind = kind;
        self
    }

    /// Stable identity of the series this sample belongs to.
    pub fn series_key(&self) -> String {
        let mut key = self.name.clone();
        for (k, v) in &self.labels {
            key.push('\u{0}');
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key
    }
}

// ── Discovery output ───────────────────────────────────────────────

/// A group of targets produced by one discovery source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetGroup {
    /// Identifies the group within its provider.
    pub source: String,
    /// Each entry holds at least the address of one target.
    pub targets: Vec<Labels>,
    /// Labels shared by every target in the group.
    pub labels: Labels,
}

impl TargetGroup {
    /// Group of bare addresses.
    pub fn from_addresses<I, S>(source: impl Into<String>, addresses: I, labels: Labels) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source: source.into(),
            targets: addresses
                .into_iter()
                .map(|a| Labels::from([(ADDRESS_LABEL.to_string(), a.into())]))
                .collect(),
            labels,
        }
    }
}

/// Label under which discovery reports a target's `host:port`.
pub const ADDRESS_LABEL: &str = "__address__";

/// Full discovery state: job name → target groups.
pub type TargetSets = HashMap<String, Vec<TargetGroup>>;

/// Snapshot handed from discovery to the scrape engine.
pub type TargetSnapshot = Arc<TargetSets>;

/// A resolved scrape target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub job: String,
    pub address: String,
    /// Group and target labels, without internal `__` labels.
    pub labels: Labels,
}

impl Target {
    /// Flatten target groups into distinct targets for `job`.
    ///
    /// Target labels override group labels. Entries without an address are skipped.
    pub fn from_groups(job: &str, groups: &[TargetGroup]) -> Vec<Target> {
        let mut targets = Vec::new();
        for group in groups {
            for entry in &group.targets {
                let Some(address) = entry.get(ADDRESS_LABEL) else {
                    continue;
                };
                let mut labels = group.labels.clone();
                labels.extend(entry.iter().map(|(k, v)| (k.clone(), v.clone())));
                labels.retain(|k, _| !k.starts_with("__"));
                labels.insert(JOB_LABEL.to_string(), job.to_string());
                labels.insert(INSTANCE_LABEL.to_string(), address.clone());

                let target = Target {
                    job: job.to_string(),
                    address: address.clone(),
                    labels,
                };
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
        targets
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job, self.address)
    }
}

// ── Neutral metric output ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Gauge,
    Cumulative,
    Distribution,
    Summary,
}

impl From<SampleKind> for MetricKind {
    fn from(kind: SampleKind) -> Self {
        match kind {
            SampleKind::Counter => MetricKind::Cumulative,
            SampleKind::Histogram => MetricKind::Distribution,
            SampleKind::Summary => MetricKind::Summary,
            SampleKind::Gauge | SampleKind::Unknown => MetricKind::Gauge,
        }
    }
}

impl MetricKind {
    /// Series of this kind accumulate from a start time.
    pub fn is_cumulative(self) -> bool {
        !matches!(self, MetricKind::Gauge)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    pub name: String,
    pub kind: MetricKind,
    pub label_keys: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub timestamp_ms: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Start of accumulation for cumulative kinds; `None` for gauges.
    pub start_timestamp_ms: Option<i64>,
    /// Values in `label_keys` order; missing labels are empty strings.
    pub label_values: Vec<String>,
    pub points: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub descriptor: MetricDescriptor,
    pub timeseries: Vec<TimeSeries>,
}

/// The scrape target a batch originated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub job: String,
    pub instance: String,
}

/// Translated metrics from one scrape cycle of one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsBatch {
    pub receiver: String,
    pub node: Node,
    /// Bumped whenever the job was considered restarted after going quiet.
    pub generation: u64,
    pub metrics: Vec<Metric>,
}

impl MetricsBatch {
    /// Names of all metrics in the batch, in order.
    pub fn metric_names(&self) -> Vec<&str> {
        self.metrics.iter().map(|m| m.descriptor.name.as_str()).collect()
    }
}
