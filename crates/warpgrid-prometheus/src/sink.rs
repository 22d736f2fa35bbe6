//! Sample sink — the scrape engine's append target.
//!
//! Each scrape cycle opens a [`ScrapeTransaction`] through
//! [`Appendable::appender`], appends the scraped samples and commits. The
//! transaction drops samples rejected by the [`FilterIndex`], touches the
//! [`JobBookkeeper`], and on commit translates the buffered samples into
//! [`MetricsBatch`]es (one per target) for the [`MetricsConsumer`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::consumer::MetricsConsumer;
use crate::error::{ReceiverError, ReceiverResult};
use crate::filter::FilterIndex;
use crate::jobs::{JobBookkeeper, JobGeneration};
use crate::types::{
    Metric, MetricDescriptor, MetricKind, MetricsBatch, Node, Point, Sample, TimeSeries,
    INSTANCE_LABEL, JOB_LABEL,
};
use crate::BoxFuture;

/// Source of per-cycle appenders.
pub trait Appendable: Send + Sync {
    fn appender(&self) -> Box<dyn Appender>;
}

/// One scrape cycle's worth of samples.
pub trait Appender: Send {
    /// Buffer a sample scraped from `endpoint` for `job_id`.
    ///
    /// Filtered samples are dropped without error.
    fn append(&mut self, endpoint: &str, job_id: &str, sample: Sample) -> ReceiverResult<()>;

    /// Forward everything buffered to the consumer.
    fn commit(self: Box<Self>) -> BoxFuture<'static, ReceiverResult<()>>;

    /// Discard everything buffered.
    fn rollback(self: Box<Self>);
}

/// Bookkeeping key for a target of a job.
pub fn job_key(job: &str, instance: &str) -> String {
    format!("{job}/{instance}")
}

/// Filters, tracks and translates scraped samples.
pub struct SampleSink {
    receiver: Arc<str>,
    consumer: Arc<dyn MetricsConsumer>,
    filter: Arc<FilterIndex>,
    jobs: Arc<JobBookkeeper>,
}

impl SampleSink {
    pub fn new(
        receiver: &str,
        consumer: Arc<dyn MetricsConsumer>,
        filter: Arc<FilterIndex>,
        jobs: Arc<JobBookkeeper>,
    ) -> Self {
        Self {
            receiver: Arc::from(receiver),
            consumer,
            filter,
            jobs,
        }
    }

    pub fn jobs(&self) -> &Arc<JobBookkeeper> {
        &self.jobs
    }
}

impl Appendable for SampleSink {
    fn appender(&self) -> Box<dyn Appender> {
        Box::new(ScrapeTransaction {
            receiver: self.receiver.clone(),
            consumer: self.consumer.clone(),
            filter: self.filter.clone(),
            jobs: self.jobs.clone(),
            pending: BTreeMap::new(),
            dropped: 0,
        })
    }
}

/// Samples buffered for one target.
struct PendingNode {
    generation: JobGeneration,
    samples: Vec<Sample>,
}

/// Per-cycle appender handed out by [`SampleSink`].
pub struct ScrapeTransaction {
    receiver: Arc<str>,
    consumer: Arc<dyn MetricsConsumer>,
    filter: Arc<FilterIndex>,
    jobs: Arc<JobBookkeeper>,
    /// (job, instance) → buffered samples.
    pending: BTreeMap<(String, String), PendingNode>,
    dropped: usize,
}

impl Appender for ScrapeTransaction {
    fn append(&mut self, endpoint: &str, job_id: &str, sample: Sample) -> ReceiverResult<()> {
        if !self.filter.allows_target(job_id, endpoint, &sample.name) {
            trace!(job = %job_id, %endpoint, metric = %sample.name, "sample filtered");
            self.dropped += 1;
            return Ok(());
        }

        let node = self
            .pending
            .entry((job_id.to_string(), endpoint.to_string()))
            .or_insert_with(|| {
                let generation = self.jobs.touch(&job_key(job_id, endpoint), Instant::now());
                if generation.restarted {
                    debug!(
                        job = %job_id,
                        %endpoint,
                        generation = generation.generation,
                        "target started a new generation"
                    );
                }
                PendingNode {
                    generation,
                    samples: Vec::new(),
                }
            });
        node.samples.push(sample);
        Ok(())
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, ReceiverResult<()>> {
        let ScrapeTransaction {
            receiver,
            consumer,
            jobs,
            pending,
            dropped,
            ..
        } = *self;

        let batches: Vec<MetricsBatch> = pending
            .into_iter()
            .map(|((job, instance), node)| {
                let key = job_key(&job, &instance);
                MetricsBatch {
                    receiver: receiver.to_string(),
                    metrics: translate(&jobs, &key, node.samples),
                    generation: node.generation.generation,
                    node: Node { job, instance },
                }
            })
            .collect();
        jobs.maybe_gc(Instant::now());

        Box::pin(async move {
            let mut result = Ok(());
            for batch in batches {
                let job = batch.node.job.clone();
                let instance = batch.node.instance.clone();
                let metrics = batch.metrics.len();
                match consumer.consume_metrics(batch).await {
                    Ok(()) => {
                        debug!(%job, %instance, metrics, dropped, "batch forwarded");
                    }
                    Err(e) => {
                        warn!(%job, %instance, error = %e, "consumer rejected batch");
                        result = Err(ReceiverError::Consumer(e));
                    }
                }
            }
            result
        })
    }

    fn rollback(self: Box<Self>) {
        let samples: usize = self.pending.values().map(|n| n.samples.len()).sum();
        debug!(samples, "scrape transaction rolled back");
    }
}

/// Group samples by metric name into the neutral representation.
///
/// Cumulative series get their start time from the bookkeeper; points of the
/// same series within one cycle are merged.
fn translate(jobs: &JobBookkeeper, job_id: &str, samples: Vec<Sample>) -> Vec<Metric> {
    // name → (kind, samples), in first-seen order.
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, (MetricKind, Vec<Sample>)> = HashMap::new();
    for sample in samples {
        let entry = grouped.entry(sample.name.clone()).or_insert_with(|| {
            order.push(sample.name.clone());
            (MetricKind::from(sample.kind), Vec::new())
        });
        entry.1.push(sample);
    }

    order
        .into_iter()
        .filter_map(|name| grouped.remove(&name).map(|group| (name, group)))
        .map(|(name, (kind, samples))| {
            let mut label_keys: Vec<String> = samples
                .iter()
                .flat_map(|s| s.labels.keys())
                .filter(|k| k.as_str() != JOB_LABEL && k.as_str() != INSTANCE_LABEL)
                .cloned()
                .collect();
            label_keys.sort();
            label_keys.dedup();

            let mut timeseries: Vec<TimeSeries> = Vec::new();
            for sample in samples {
                let label_values: Vec<String> = label_keys
                    .iter()
                    .map(|k| sample.labels.get(k).cloned().unwrap_or_default())
                    .collect();
                let start_timestamp_ms = kind.is_cumulative().then(|| {
                    jobs.adjust_cumulative(
                        job_id,
                        &sample.series_key(),
                        sample.value,
                        sample.timestamp_ms,
                    )
                });
                let point = Point {
                    timestamp_ms: sample.timestamp_ms,
                    value: sample.value,
                };

                match timeseries.iter_mut().find(|ts| ts.label_values == label_values) {
                    Some(ts) => ts.points.push(point),
                    None => timeseries.push(TimeSeries {
                        start_timestamp_ms,
                        label_values,
                        points: vec![point],
                    }),
                }
            }

            Metric {
                descriptor: MetricDescriptor {
                    name,
                    kind,
                    label_keys,
                },
                timeseries,
            }
        })
        .collect()
}
