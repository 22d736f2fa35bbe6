//! Receiver lifecycle — ordered startup and idempotent shutdown.
//!
//! `start` runs the startup handshake at most once:
//!
//! ```text
//! host root token ──► child token (stored for stop)
//!   1. build JobBookkeeper + SampleSink, scrape + discovery engines
//!   2. scrape.apply_config(static config)     ── error ─► host fatal, abort
//!   3. spawn discovery.run()                  ── error ─► host fatal
//!   4. spawn { sleep(grace); open gate; scrape.run(notifications) }
//!                                             ── error ─► error channel (logged)
//!   5. wait for gate
//!   6. discovery.apply_config(job → sd config) ── error ─► error channel (logged)
//! ```
//!
//! `stop` cancels the child token exactly once. It does not wait for the
//! background tasks to drain.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::config::ReceiverConfig;
use crate::consumer::MetricsConsumer;
use crate::discovery::{DiscovererFactory, DiscovererRegistry, DiscoveryEngine, DiscoveryRunner};
use crate::error::{ReceiverError, ReceiverResult};
use crate::filter::FilterIndex;
use crate::host::Host;
use crate::jobs::JobBookkeeper;
use crate::scrape::{ScrapeCoordinator, ScrapeEngine, Scraper};
use crate::sink::{Appendable, SampleSink};
use crate::BoxFuture;

/// Value reported by [`MetricsReceiver::metrics_source`].
pub const METRICS_SOURCE: &str = "Prometheus";

/// Host-driven lifecycle of a metrics receiver.
pub trait MetricsReceiver: Send + Sync {
    /// Name of the metrics data source.
    fn metrics_source(&self) -> &'static str;

    /// Start receiving. Only the first call has any effect.
    fn start(&self, host: Arc<dyn Host>) -> BoxFuture<'_, ReceiverResult<()>>;

    /// Signal all background work to stop. Only the first call has any effect.
    fn stop(&self) -> ReceiverResult<()>;

    /// Push buffered metrics downstream.
    fn flush(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Lets exactly one caller through, however many race for it.
#[derive(Debug, Default)]
pub struct OnceGuard {
    done: AtomicBool,
}

impl OnceGuard {
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
        }
    }

    /// True for the first caller only.
    pub fn try_enter(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Builds the discovery and scrape engines for one receiver run.
pub trait EngineFactory: Send + Sync {
    fn discovery(&self, cancel: CancellationToken) -> Arc<dyn DiscoveryEngine>;

    fn scrape(&self, sink: Arc<dyn Appendable>, cancel: CancellationToken) -> Arc<dyn ScrapeEngine>;
}

/// [`DiscoveryRunner`] + [`ScrapeCoordinator`] around a target scraper.
pub struct PrometheusEngines {
    scraper: Arc<dyn Scraper>,
    discoverers: Arc<dyn DiscovererFactory>,
}

impl PrometheusEngines {
    /// Static discovery only.
    pub fn new(scraper: Arc<dyn Scraper>) -> Self {
        Self {
            scraper,
            discoverers: Arc::new(DiscovererRegistry::new()),
        }
    }

    pub fn with_discoverers(mut self, discoverers: Arc<dyn DiscovererFactory>) -> Self {
        self.discoverers = discoverers;
        self
    }
}

impl EngineFactory for PrometheusEngines {
    fn discovery(&self, cancel: CancellationToken) -> Arc<dyn DiscoveryEngine> {
        Arc::new(DiscoveryRunner::new(cancel, self.discoverers.clone()))
    }

    fn scrape(&self, sink: Arc<dyn Appendable>, cancel: CancellationToken) -> Arc<dyn ScrapeEngine> {
        Arc::new(ScrapeCoordinator::new(cancel, self.scraper.clone(), sink))
    }
}

/// Scrapes Prometheus targets and forwards translated metrics to a consumer.
pub struct PrometheusReceiver {
    shared: Arc<Shared>,
}

/// Receiver state owned jointly by the handle and the startup task.
struct Shared {
    config: Arc<ReceiverConfig>,
    consumer: Arc<dyn MetricsConsumer>,
    filter: Arc<FilterIndex>,
    engines: Arc<dyn EngineFactory>,
    state: AtomicU8,
    stop_once: OnceGuard,
    /// Created when starting, taken when stopping.
    cancel: Mutex<Option<CancellationToken>>,
}

impl PrometheusReceiver {
    pub fn new(
        config: ReceiverConfig,
        consumer: Arc<dyn MetricsConsumer>,
        engines: Arc<dyn EngineFactory>,
    ) -> Self {
        let filter = Arc::new(FilterIndex::new(&config.include_filter));
        let shared = Shared {
            config: Arc::new(config),
            consumer,
            filter,
            engines,
            state: AtomicU8::new(LifecycleState::Idle as u8),
            stop_once: OnceGuard::new(),
            cancel: Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }
}

impl Shared {
    fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_state(&self, to: LifecycleState) -> LifecycleState {
        LifecycleState::from_u8(self.state.swap(to as u8, Ordering::AcqRel))
    }

    async fn startup(self: Arc<Self>, host: Arc<dyn Host>) {
        let cancel = host.context().child_token();
        {
            let mut slot = self.cancel.lock();
            if self.stop_once.is_done() {
                cancel.cancel();
                debug!("stopped while starting, abandoning startup");
                return;
            }
            *slot = Some(cancel.clone());
        }

        let jobs = Arc::new(JobBookkeeper::new(self.config.job_staleness));
        let sink: Arc<dyn Appendable> = Arc::new(SampleSink::new(
            &self.config.name,
            self.consumer.clone(),
            self.filter.clone(),
            jobs,
        ));
        let discovery = self.engines.discovery(cancel.clone());
        let scrape = self.engines.scrape(sink, cancel.clone());

        if let Err(e) = scrape.apply_config(&self.config.prometheus) {
            error!(error = %e, "scrape config rejected, aborting start");
            cancel.cancel();
            self.transition(LifecycleState::Starting, LifecycleState::Stopped);
            host.report_fatal_error(e);
            return;
        }

        {
            let discovery = discovery.clone();
            let host = host.clone();
            tokio::spawn(
                async move {
                    if let Err(e) = discovery.run().await {
                        error!(error = %e, "discovery runner failed");
                        host.report_fatal_error(e);
                    }
                }
                .in_current_span(),
            );
        }

        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let (errs_tx, mut errs_rx) = mpsc::channel::<ReceiverError>(1);
        let notifications = discovery.notifications();
        let grace = self.config.startup_grace;
        {
            let scrape = scrape.clone();
            let errs_tx = errs_tx.clone();
            tokio::spawn(
                async move {
                    tokio::time::sleep(grace).await;
                    let _ = gate_tx.send(());
                    if let Err(e) = scrape.run(notifications).await {
                        let _ = errs_tx.try_send(e);
                    }
                }
                .in_current_span(),
            );
        }
        let _ = gate_rx.await;

        // The scrape engine has had its grace period; let discovery feed it.
        let discovery_configs = self.config.prometheus.discovery_configs();
        if let Err(e) = discovery.apply_config(discovery_configs) {
            let _ = errs_tx.try_send(e);
        }
        drop(errs_tx);

        tokio::spawn(
            async move {
                while let Some(e) = errs_rx.recv().await {
                    error!(error = %e, "background receiver error");
                }
            }
            .in_current_span(),
        );

        if self.transition(LifecycleState::Starting, LifecycleState::Running) {
            info!(
                jobs = self.config.prometheus.scrape_configs.len(),
                filtered = !self.filter.is_empty(),
                "receiver started"
            );
        }
    }
}

impl MetricsReceiver for PrometheusReceiver {
    fn metrics_source(&self) -> &'static str {
        METRICS_SOURCE
    }

    fn start(&self, host: Arc<dyn Host>) -> BoxFuture<'_, ReceiverResult<()>> {
        Box::pin(async move {
            let shared = &self.shared;
            if !shared.transition(LifecycleState::Idle, LifecycleState::Starting) {
                debug!(name = %shared.config.name, state = ?shared.state(), "start ignored");
                return Ok(());
            }
            let span = info_span!("receiver", name = %shared.config.name);
            // Runs detached so a caller that drops this future cannot strand the handshake.
            let startup = tokio::spawn(shared.clone().startup(host).instrument(span));
            if let Err(e) = startup.await {
                error!(name = %shared.config.name, error = %e, "receiver startup task failed");
            }
            Ok(())
        })
    }

    fn stop(&self) -> ReceiverResult<()> {
        let shared = &self.shared;
        if !shared.stop_once.try_enter() {
            return Ok(());
        }
        let previous = shared.set_state(LifecycleState::Stopping);
        if let Some(cancel) = shared.cancel.lock().take() {
            cancel.cancel();
        }
        shared.set_state(LifecycleState::Stopped);
        info!(name = %shared.config.name, ?previous, "receiver stopped");
        Ok(())
    }

    /// The scrape loops commit at the end of every cycle, so there is nothing to flush.
    fn flush(&self) {}
}
