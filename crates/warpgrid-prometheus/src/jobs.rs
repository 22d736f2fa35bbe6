//! Job bookkeeping — reconciles successive scrape cycles into coherent series.
//!
//! Every scrape commit touches the record of its job. A job that stays quiet
//! for at least the staleness window is treated as a fresh process instance
//! when it reappears: its generation is bumped and its per-series cumulative
//! state is dropped, so a restarted exporter's counters start a new series
//! instead of looking like a reset of the old one.
//!
//! All state lives behind a single mutex, so concurrent scrape loops see one
//! coherent view of job staleness.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::DEFAULT_JOB_STALENESS;

/// Snapshot of a job's record after a [`JobBookkeeper::touch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobGeneration {
    pub generation: u64,
    /// True when this touch opened a new generation (first sight or after going stale).
    pub restarted: bool,
}

/// Start time and last value of one cumulative series.
struct SeriesState {
    start_timestamp_ms: i64,
    last_value: f64,
}

struct JobRecord {
    last_seen: Instant,
    generation: u64,
    series: HashMap<String, SeriesState>,
}

impl JobRecord {
    fn is_stale(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) >= window
    }
}

struct Inner {
    jobs: HashMap<String, JobRecord>,
    /// Generations are unique across jobs and evictions.
    next_generation: u64,
    last_gc: Option<Instant>,
}

/// Tracks per-job activity, generation and cumulative series state.
pub struct JobBookkeeper {
    inner: Mutex<Inner>,
    window: Duration,
}

impl Default for JobBookkeeper {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_STALENESS)
    }
}

impl JobBookkeeper {
    /// Create a bookkeeper with the given staleness window.
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                next_generation: 1,
                last_gc: None,
            }),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record activity for `job_id` at `now`.
    ///
    /// Opens a new generation if the job is unknown or has been quiet for
    /// at least the staleness window.
    pub fn touch(&self, job_id: &str, now: Instant) -> JobGeneration {
        let mut inner = self.inner.lock();
        let Inner {
            jobs,
            next_generation,
            ..
        } = &mut *inner;

        let mut fresh = || {
            let generation = *next_generation;
            *next_generation += 1;
            generation
        };

        match jobs.get_mut(job_id) {
            Some(record) if !record.is_stale(now, self.window) => {
                record.last_seen = now;
                JobGeneration {
                    generation: record.generation,
                    restarted: false,
                }
            }
            Some(record) => {
                let generation = fresh();
                debug!(job = %job_id, generation, "job reappeared after going stale");
                record.last_seen = now;
                record.generation = generation;
                record.series.clear();
                JobGeneration {
                    generation,
                    restarted: true,
                }
            }
            None => {
                let generation = fresh();
                jobs.insert(
                    job_id.to_string(),
                    JobRecord {
                        last_seen: now,
                        generation,
                        series: HashMap::new(),
                    },
                );
                JobGeneration {
                    generation,
                    restarted: true,
                }
            }
        }
    }

    /// Whether `job_id` has had no activity for at least `window`. Unknown jobs are stale.
    pub fn is_stale(&self, job_id: &str, now: Instant, window: Duration) -> bool {
        self.inner
            .lock()
            .jobs
            .get(job_id)
            .is_none_or(|record| record.is_stale(now, window))
    }

    /// Remove every job that has been quiet for at least `window`. Returns the count removed.
    pub fn evict_stale(&self, now: Instant, window: Duration) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.jobs.len();
        inner.jobs.retain(|_, record| !record.is_stale(now, window));
        inner.last_gc = Some(now);
        let evicted = before - inner.jobs.len();
        if evicted > 0 {
            debug!(evicted, remaining = inner.jobs.len(), "evicted stale jobs");
        }
        evicted
    }

    /// Evict stale jobs if half a window has passed since the last sweep.
    pub fn maybe_gc(&self, now: Instant) -> usize {
        let due = self
            .inner
            .lock()
            .last_gc
            .is_none_or(|last| now.saturating_duration_since(last) >= self.window / 2);
        if due {
            self.evict_stale(now, self.window)
        } else {
            0
        }
    }

    /// Start timestamp for a cumulative series observed at `timestamp_ms`.
    ///
    /// A new series, or one whose value went down (counter reset), starts at
    /// `timestamp_ms`; otherwise the stored start is kept. NaN values (staleness
    /// markers) leave the series untouched.
    pub fn adjust_cumulative(
        &self,
        job_id: &str,
        series_key: &str,
        value: f64,
        timestamp_ms: i64,
    ) -> i64 {
        let mut inner = self.inner.lock();
        let Some(record) = inner.jobs.get_mut(job_id) else {
            return timestamp_ms;
        };

        if value.is_nan() {
            return record
                .series
                .get(series_key)
                .map_or(timestamp_ms, |state| state.start_timestamp_ms);
        }

        match record.series.get_mut(series_key) {
            Some(state)
                if value.is_finite() && state.last_value.is_finite() && value < state.last_value =>
            {
                debug!(job = %job_id, series = %series_key, "counter reset detected");
                state.start_timestamp_ms = timestamp_ms;
                state.last_value = value;
                timestamp_ms
            }
            Some(state) => {
                state.last_value = value;
                state.start_timestamp_ms
            }
            None => {
                record.series.insert(
                    series_key.to_string(),
                    SeriesState {
                        start_timestamp_ms: timestamp_ms,
                        last_value: value,
                    },
                );
                timestamp_ms
            }
        }
    }

    /// Number of tracked jobs.
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
