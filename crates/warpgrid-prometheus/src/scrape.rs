//! Scrape coordinator — one scrape loop per discovered target.
//!
//! The coordinator holds the validated job definitions and reconciles its
//! running loops against every target snapshot published by discovery:
//! new targets get a loop, vanished targets have theirs cancelled, targets
//! whose job definition changed are restarted. Each loop scrapes on the
//! job's interval under the job's timeout and commits the result through
//! the sink. A failed scrape only affects its own target; it is reported as
//! `up = 0` and retried on the next tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::config::{PrometheusConfig, ScrapeConfig};
use crate::error::{ReceiverError, ReceiverResult};
use crate::sink::Appendable;
use crate::types::{Sample, SampleKind, Target, TargetSnapshot};
use crate::BoxFuture;

/// Contract the receiver needs from a scrape engine.
pub trait ScrapeEngine: Send + Sync {
    /// Validate and install job definitions. Must be called before [`ScrapeEngine::run`].
    fn apply_config(&self, config: &PrometheusConfig) -> ReceiverResult<()>;

    /// Manage scrape loops from discovery notifications until cancelled.
    fn run(&self, notifications: watch::Receiver<TargetSnapshot>) -> BoxFuture<'_, ReceiverResult<()>>;
}

/// Fetches the current samples of one target.
///
/// Samples with `timestamp_ms == 0` are stamped with the scrape time.
pub trait Scraper: Send + Sync {
    fn scrape<'a>(
        &'a self,
        target: &'a Target,
        config: &'a ScrapeConfig,
    ) -> BoxFuture<'a, anyhow::Result<Vec<Sample>>>;
}

/// A validated job with its effective timing.
struct JobSpec {
    config: ScrapeConfig,
    interval: Duration,
    timeout: Duration,
}

struct LoopSlot {
    spec: Arc<JobSpec>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Default [`ScrapeEngine`].
pub struct ScrapeCoordinator {
    cancel: CancellationToken,
    scraper: Arc<dyn Scraper>,
    sink: Arc<dyn Appendable>,
    jobs: RwLock<HashMap<String, Arc<JobSpec>>>,
    loops: Mutex<HashMap<Target, LoopSlot>>,
    reload: Notify,
    running: AtomicBool,
}

impl ScrapeCoordinator {
    pub fn new(
        cancel: CancellationToken,
        scraper: Arc<dyn Scraper>,
        sink: Arc<dyn Appendable>,
    ) -> Self {
        Self {
            cancel,
            scraper,
            sink,
            jobs: RwLock::new(HashMap::new()),
            loops: Mutex::new(HashMap::new()),
            reload: Notify::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Targets with a running scrape loop.
    pub fn active_targets(&self) -> Vec<Target> {
        self.loops.lock().keys().cloned().collect()
    }

    /// Names of the installed jobs.
    pub fn job_names(&self) -> Vec<String> {
        self.jobs.read().keys().cloned().collect()
    }

    /// Bring the running loops in line with `snapshot`.
    fn reconcile(&self, snapshot: &TargetSnapshot) {
        let jobs = self.jobs.read().clone();

        let mut desired: HashMap<Target, Arc<JobSpec>> = HashMap::new();
        for (job, groups) in snapshot.iter() {
            let Some(spec) = jobs.get(job) else {
                debug!(%job, "discovered job has no scrape config");
                continue;
            };
            for target in Target::from_groups(job, groups) {
                desired.insert(target, spec.clone());
            }
        }

        let mut loops = self.loops.lock();
        let before = loops.len();
        loops.retain(|target, slot| {
            let keep = desired
                .get(target)
                .is_some_and(|spec| Arc::ptr_eq(spec, &slot.spec));
            if !keep {
                slot.cancel.cancel();
                debug!(%target, "scrape loop stopped");
            }
            keep
        });
        let stopped = before - loops.len();

        let mut started = 0;
        for (target, spec) in desired {
            if loops.contains_key(&target) {
                continue;
            }
            let cancel = self.cancel.child_token();
            let handle = tokio::spawn(
                scrape_loop(
                    target.clone(),
                    spec.clone(),
                    self.scraper.clone(),
                    self.sink.clone(),
                    cancel.clone(),
                )
                .in_current_span(),
            );
            loops.insert(target, LoopSlot { spec, cancel, handle });
            started += 1;
        }

        if started > 0 || stopped > 0 {
            info!(targets = loops.len(), started, stopped, "scrape targets reconciled");
        }
    }

    fn stop_all(&self) {
        let mut loops = self.loops.lock();
        for (target, slot) in loops.drain() {
            slot.cancel.cancel();
            slot.handle.abort();
            debug!(%target, "scrape loop stopped");
        }
    }
}

impl ScrapeEngine for ScrapeCoordinator {
    fn apply_config(&self, config: &PrometheusConfig) -> ReceiverResult<()> {
        config.validate()?;

        let specs: HashMap<String, Arc<JobSpec>> = config
            .scrape_configs
            .iter()
            .map(|job| {
                let spec = JobSpec {
                    config: job.clone(),
                    interval: job.interval(&config.global),
                    timeout: job.timeout(&config.global),
                };
                (job.job_name.clone(), Arc::new(spec))
            })
            .collect();

        info!(jobs = specs.len(), "scrape config applied");
        *self.jobs.write() = specs;
        self.reload.notify_one();
        Ok(())
    }

    fn run(&self, mut notifications: watch::Receiver<TargetSnapshot>) -> BoxFuture<'_, ReceiverResult<()>> {
        Box::pin(async move {
            if self.running.swap(true, Ordering::SeqCst) {
                return Err(ReceiverError::AlreadyRunning("scrape coordinator"));
            }
            info!("scrape coordinator started");

            let mut snapshot = notifications.borrow_and_update().clone();
            self.reconcile(&snapshot);

            let result = loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break Ok(()),
                    changed = notifications.changed() => {
                        if changed.is_err() {
                            break Err(ReceiverError::NotificationsClosed);
                        }
                        snapshot = notifications.borrow_and_update().clone();
                        self.reconcile(&snapshot);
                    }
                    _ = self.reload.notified() => self.reconcile(&snapshot),
                }
            };

            self.stop_all();
            info!("scrape coordinator stopped");
            result
        })
    }
}

async fn scrape_loop(
    target: Target,
    spec: Arc<JobSpec>,
    scraper: Arc<dyn Scraper>,
    sink: Arc<dyn Appendable>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(spec.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(%target, interval = ?spec.interval, timeout = ?spec.timeout, "scrape loop started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(spec.timeout, scraper.scrape(&target, &spec.config)) => r,
        };
        let duration = started.elapsed();
        let scrape_ts = epoch_millis();

        let (samples, up) = match result {
            Ok(Ok(samples)) => (samples, 1.0),
            Ok(Err(source)) => {
                let err = ReceiverError::Scrape {
                    target: target.to_string(),
                    source,
                };
                warn!(%target, error = %err, "scrape failed");
                (Vec::new(), 0.0)
            }
            Err(_) => {
                let err = ReceiverError::ScrapeTimeout {
                    target: target.to_string(),
                };
                warn!(%target, error = %err, "scrape failed");
                (Vec::new(), 0.0)
            }
        };

        if cancel.is_cancelled() {
            break;
        }

        let scraped = samples.len();
        let mut app = sink.appender();
        let mut append_error = None;
        for mut sample in samples
            .into_iter()
            .chain(report_samples(up, duration, scraped))
        {
            if sample.timestamp_ms == 0 {
                sample.timestamp_ms = scrape_ts;
            }
            apply_target_labels(&target, &mut sample, spec.config.honor_labels);
            if let Err(e) = app.append(&target.address, &target.job, sample) {
                append_error = Some(e);
                break;
            }
        }

        if let Some(e) = append_error {
            warn!(%target, error = %e, "append failed, discarding scrape");
            app.rollback();
            continue;
        }
        // A batch still committing when the loop is cancelled is discarded.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(%target, "cancelled during commit");
                break;
            }
            committed = app.commit() => {
                if let Err(e) = committed {
                    warn!(%target, error = %e, "commit failed");
                }
            }
        }
    }

    debug!(%target, "scrape loop exited");
}

/// Synthetic series describing the scrape itself.
fn report_samples(up: f64, duration: Duration, scraped: usize) -> [Sample; 3] {
    [
        Sample::new("up", up, 0).with_kind(SampleKind::Gauge),
        Sample::new("scrape_duration_seconds", duration.as_secs_f64(), 0)
            .with_kind(SampleKind::Gauge),
        Sample::new("scrape_samples_scraped", scraped as f64, 0).with_kind(SampleKind::Gauge),
    ]
}

/// Attach target labels to a sample.
///
/// On conflict the target wins and the sample's value moves to
/// `exported_<name>`, unless `honor_labels` keeps the sample's value.
fn apply_target_labels(target: &Target, sample: &mut Sample, honor_labels: bool) {
    for (key, value) in &target.labels {
        match sample.labels.get(key) {
            Some(existing) if existing == value => {}
            Some(_) if honor_labels => {}
            Some(existing) => {
                let existing = existing.clone();
                sample.labels.insert(format!("exported_{key}"), existing);
                sample.labels.insert(key.clone(), value.clone());
            }
            None => {
                sample.labels.insert(key.clone(), value.clone());
            }
        }
    }
}

fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Appender;
    use crate::types::{Labels, TargetGroup, TargetSets, INSTANCE_LABEL, JOB_LABEL};
    use std::sync::atomic::AtomicUsize;

    /// Records every committed (endpoint, job, sample) triple.
    #[derive(Default)]
    struct RecordingSink {
        committed: Arc<Mutex<Vec<(String, String, Sample)>>>,
    }

    struct RecordingAppender {
        buffered: Vec<(String, String, Sample)>,
        committed: Arc<Mutex<Vec<(String, String, Sample)>>>,
    }

    impl Appendable for RecordingSink {
        fn appender(&self) -> Box<dyn Appender> {
            Box::new(RecordingAppender {
                buffered: Vec::new(),
                committed: self.committed.clone(),
            })
        }
    }

    impl Appender for RecordingAppender {
        fn append(&mut self, endpoint: &str, job_id: &str, sample: Sample) -> ReceiverResult<()> {
            self.buffered
                .push((endpoint.to_string(), job_id.to_string(), sample));
            Ok(())
        }

        fn commit(self: Box<Self>) -> BoxFuture<'static, ReceiverResult<()>> {
            let RecordingAppender {
                buffered,
                committed,
            } = *self;
            committed.lock().extend(buffered);
            Box::pin(async { Ok(()) })
        }

        fn rollback(self: Box<Self>) {}
    }

    /// Holds every commit until `release` fires.
    #[derive(Default)]
    struct GatedSink {
        started: Arc<AtomicUsize>,
        release: Arc<Notify>,
        delivered: Arc<AtomicUsize>,
    }

    struct GatedAppender {
        samples: usize,
        started: Arc<AtomicUsize>,
        release: Arc<Notify>,
        delivered: Arc<AtomicUsize>,
    }

    impl Appendable for GatedSink {
        fn appender(&self) -> Box<dyn Appender> {
            Box::new(GatedAppender {
                samples: 0,
                started: self.started.clone(),
                release: self.release.clone(),
                delivered: self.delivered.clone(),
            })
        }
    }

    impl Appender for GatedAppender {
        fn append(&mut self, _endpoint: &str, _job_id: &str, _sample: Sample) -> ReceiverResult<()> {
            self.samples += 1;
            Ok(())
        }

        fn commit(self: Box<Self>) -> BoxFuture<'static, ReceiverResult<()>> {
            let GatedAppender {
                samples,
                started,
                release,
                delivered,
            } = *self;
            started.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                release.notified().await;
                delivered.fetch_add(samples, Ordering::SeqCst);
                Ok(())
            })
        }

        fn rollback(self: Box<Self>) {}
    }

    /// Returns one `requests_total` sample, or fails for addresses starting with "down".
    struct FakeScraper {
        calls: AtomicUsize,
    }

    impl Scraper for FakeScraper {
        fn scrape<'a>(
            &'a self,
            target: &'a Target,
            _config: &'a ScrapeConfig,
        ) -> BoxFuture<'a, anyhow::Result<Vec<Sample>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if target.address.starts_with("down") {
                    anyhow::bail!("connection refused");
                }
                Ok(vec![Sample::new("requests_total", 42.0, 0)
                    .with_label("path", "/")
                    .with_kind(SampleKind::Counter)])
            })
        }
    }

    fn fast_job(name: &str) -> ScrapeConfig {
        let mut job = ScrapeConfig::new(name);
        job.scrape_interval = Some(Duration::from_millis(50));
        job.scrape_timeout = Some(Duration::from_millis(40));
        job
    }

    fn config(jobs: Vec<ScrapeConfig>) -> PrometheusConfig {
        PrometheusConfig {
            scrape_configs: jobs,
            ..Default::default()
        }
    }

    fn snapshot(entries: &[(&str, &[&str])]) -> TargetSnapshot {
        let sets: TargetSets = entries
            .iter()
            .map(|(job, addrs)| {
                (
                    job.to_string(),
                    vec![TargetGroup::from_addresses("0", addrs.iter().copied(), Labels::new())],
                )
            })
            .collect();
        Arc::new(sets)
    }

    fn coordinator(
        cancel: &CancellationToken,
    ) -> (Arc<ScrapeCoordinator>, Arc<Mutex<Vec<(String, String, Sample)>>>) {
        let sink = RecordingSink::default();
        let committed = sink.committed.clone();
        let scraper = Arc::new(FakeScraper {
            calls: AtomicUsize::new(0),
        });
        (
            Arc::new(ScrapeCoordinator::new(cancel.clone(), scraper, Arc::new(sink))),
            committed,
        )
    }

    async fn eventually(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn apply_config_rejects_invalid_jobs() {
        let cancel = CancellationToken::new();
        let (coord, _) = coordinator(&cancel);

        let mut bad = fast_job("bad");
        bad.scrape_timeout = Some(Duration::from_secs(10));
        let err = coord.apply_config(&config(vec![bad])).unwrap_err();
        assert!(matches!(err, ReceiverError::InvalidJob { .. }));
        assert!(coord.job_names().is_empty());
    }

    #[tokio::test]
    async fn targets_get_scraped_with_report_series() {
        let cancel = CancellationToken::new();
        let (coord, committed) = coordinator(&cancel);
        coord.apply_config(&config(vec![fast_job("job1")])).unwrap();

        let (_tx, rx) = watch::channel(snapshot(&[("job1", &["a:1"])]));
        let c = coord.clone();
        let handle = tokio::spawn(async move { c.run(rx).await });

        eventually("first commit", || !committed.lock().is_empty()).await;
        {
            let committed = committed.lock();
            let names: Vec<&str> = committed.iter().map(|(_, _, s)| s.name.as_str()).collect();
            assert!(names.contains(&"requests_total"));
            assert!(names.contains(&"up"));
            assert!(names.contains(&"scrape_duration_seconds"));
            assert!(names.contains(&"scrape_samples_scraped"));

            let (endpoint, job, sample) = &committed[0];
            assert_eq!(endpoint, "a:1");
            assert_eq!(job, "job1");
            assert_eq!(sample.labels[JOB_LABEL], "job1");
            assert_eq!(sample.labels[INSTANCE_LABEL], "a:1");
            assert!(sample.timestamp_ms > 0);
        }

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_scrape_reports_down() {
        let cancel = CancellationToken::new();
        let (coord, committed) = coordinator(&cancel);
        coord.apply_config(&config(vec![fast_job("job1")])).unwrap();

        let (_tx, rx) = watch::channel(snapshot(&[("job1", &["down:1"])]));
        let c = coord.clone();
        let handle = tokio::spawn(async move { c.run(rx).await });

        eventually("up sample", || {
            committed.lock().iter().any(|(_, _, s)| s.name == "up")
        })
        .await;
        {
            let committed = committed.lock();
            let up = committed.iter().find(|(_, _, s)| s.name == "up").unwrap();
            assert_eq!(up.2.value, 0.0);
            assert!(committed.iter().all(|(_, _, s)| s.name != "requests_total"));
        }

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn loops_follow_target_updates() {
        let cancel = CancellationToken::new();
        let (coord, _) = coordinator(&cancel);
        coord
            .apply_config(&config(vec![fast_job("job1"), fast_job("job2")]))
            .unwrap();

        let (tx, rx) = watch::channel(snapshot(&[("job1", &["a:1", "b:1"])]));
        let c = coord.clone();
        let handle = tokio::spawn(async move { c.run(rx).await });

        eventually("two loops", || coord.active_targets().len() == 2).await;

        tx.send(snapshot(&[("job1", &["b:1"]), ("job2", &["c:1"])]))
            .unwrap();
        eventually("reconciled loops", || {
            let mut addrs: Vec<String> =
                coord.active_targets().into_iter().map(|t| t.address).collect();
            addrs.sort();
            addrs == vec!["b:1", "c:1"]
        })
        .await;

        // Jobs without a definition are ignored.
        tx.send(snapshot(&[("unknown", &["z:1"])])).unwrap();
        eventually("no loops", || coord.active_targets().is_empty()).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reapplied_config_restarts_changed_jobs() {
        let cancel = CancellationToken::new();
        let (coord, _) = coordinator(&cancel);
        coord.apply_config(&config(vec![fast_job("job1")])).unwrap();

        let (_tx, rx) = watch::channel(snapshot(&[("job1", &["a:1"])]));
        let c = coord.clone();
        let handle = tokio::spawn(async move { c.run(rx).await });
        eventually("loop", || coord.active_targets().len() == 1).await;

        // Dropping the job from the config stops its loops.
        coord.apply_config(&config(vec![fast_job("other")])).unwrap();
        eventually("loop removed", || coord.active_targets().is_empty()).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_everything() {
        let cancel = CancellationToken::new();
        let (coord, committed) = coordinator(&cancel);
        coord.apply_config(&config(vec![fast_job("job1")])).unwrap();

        let (_tx, rx) = watch::channel(snapshot(&[("job1", &["a:1"])]));
        let c = coord.clone();
        let handle = tokio::spawn(async move { c.run(rx).await });
        eventually("first commit", || !committed.lock().is_empty()).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("coordinator did not stop")
            .unwrap()
            .unwrap();
        assert!(coord.active_targets().is_empty());

        let count = committed.lock().len();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(committed.lock().len(), count);
    }

    #[tokio::test]
    async fn cancel_during_commit_discards_the_batch() {
        let cancel = CancellationToken::new();
        let sink = Arc::new(GatedSink::default());
        let scraper = Arc::new(FakeScraper {
            calls: AtomicUsize::new(0),
        });
        let group = TargetGroup::from_addresses("0", ["a:1"], Labels::new());
        let target = Target::from_groups("job1", &[group]).remove(0);
        let spec = Arc::new(JobSpec {
            config: fast_job("job1"),
            interval: Duration::from_millis(50),
            timeout: Duration::from_millis(40),
        });

        let handle = tokio::spawn(scrape_loop(target, spec, scraper, sink.clone(), cancel.clone()));
        eventually("commit in flight", || sink.started.load(Ordering::SeqCst) == 1).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scrape loop stayed blocked in commit")
            .unwrap();

        sink.release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 0);
        assert_eq!(sink.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_notifications_end_run_with_error() {
        let cancel = CancellationToken::new();
        let (coord, _) = coordinator(&cancel);
        coord.apply_config(&config(vec![fast_job("job1")])).unwrap();

        let (tx, rx) = watch::channel(snapshot(&[]));
        let c = coord.clone();
        let handle = tokio::spawn(async move { c.run(rx).await });
        drop(tx);

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ReceiverError::NotificationsClosed));
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let cancel = CancellationToken::new();
        let (coord, _) = coordinator(&cancel);
        let (_tx, rx) = watch::channel(snapshot(&[]));
        let c = coord.clone();
        let rx2 = rx.clone();
        let handle = tokio::spawn(async move { c.run(rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = coord.run(rx2).await.unwrap_err();
        assert!(matches!(err, ReceiverError::AlreadyRunning(_)));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn target_labels_override_unless_honored() {
        let target = Target {
            job: "job1".to_string(),
            address: "a:1".to_string(),
            labels: Labels::from([
                (JOB_LABEL.to_string(), "job1".to_string()),
                (INSTANCE_LABEL.to_string(), "a:1".to_string()),
            ]),
        };

        let mut sample = Sample::new("m", 1.0, 0).with_label(JOB_LABEL, "pushed");
        apply_target_labels(&target, &mut sample, false);
        assert_eq!(sample.labels[JOB_LABEL], "job1");
        assert_eq!(sample.labels["exported_job"], "pushed");
        assert_eq!(sample.labels[INSTANCE_LABEL], "a:1");

        let mut honored = Sample::new("m", 1.0, 0).with_label(JOB_LABEL, "pushed");
        apply_target_labels(&target, &mut honored, true);
        assert_eq!(honored.labels[JOB_LABEL], "pushed");
        assert!(!honored.labels.contains_key("exported_job"));
    }
}
