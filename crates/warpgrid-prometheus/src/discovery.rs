//! Discovery runner — resolves job configs into target groups.
//!
//! Each configured job gets one provider task per discovery mechanism.
//! Providers push their full group list whenever it changes; the runner
//! merges them into one [`TargetSets`] snapshot per update and publishes it
//! on a latest-value channel. A scrape engine that subscribes late still
//! sees the most recent state.
//!
//! # Architecture
//!
//! ```text
//! DiscoveryRunner
//!   ├── apply_config() → cancel old providers, spawn new ones
//!   │     └── Discoverer::run() → GroupSender::send()
//!   ├── run() → merge provider updates, publish snapshots
//!   └── notifications() → watch::Receiver<TargetSnapshot>
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::config::{ProviderConfig, ServiceDiscoveryConfig};
use crate::error::{ReceiverError, ReceiverResult};
use crate::types::{TargetGroup, TargetSets, TargetSnapshot};
use crate::BoxFuture;

/// Contract the receiver needs from a discovery engine.
pub trait DiscoveryEngine: Send + Sync {
    /// Run until the engine's cancellation token fires.
    fn run(&self) -> BoxFuture<'_, ReceiverResult<()>>;

    /// Replace the discovery configuration of every job.
    fn apply_config(&self, configs: HashMap<String, ServiceDiscoveryConfig>) -> ReceiverResult<()>;

    /// Consumer end of the target notification channel.
    fn notifications(&self) -> watch::Receiver<TargetSnapshot>;
}

/// A single discovery mechanism for one job.
pub trait Discoverer: Send + Sync {
    /// Send the provider's full group list on every change until `cancel` fires.
    fn run(&self, cancel: CancellationToken, sender: GroupSender) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Builds the providers for a job's discovery configuration.
pub trait DiscovererFactory: Send + Sync {
    /// Returns `(provider name, provider)` pairs; names are unique within the job.
    fn build(
        &self,
        job: &str,
        config: &ServiceDiscoveryConfig,
    ) -> ReceiverResult<Vec<(String, Arc<dyn Discoverer>)>>;
}

/// Builder for an externally implemented mechanism.
pub type ProviderBuilder =
    Arc<dyn Fn(&str, &ProviderConfig) -> anyhow::Result<Arc<dyn Discoverer>> + Send + Sync>;

enum Update {
    Reconfigure {
        generation: u64,
        jobs: Vec<String>,
    },
    Groups {
        generation: u64,
        job: Arc<str>,
        provider: Arc<str>,
        groups: Vec<TargetGroup>,
    },
}

/// Handle a provider uses to publish its groups.
#[derive(Clone)]
pub struct GroupSender {
    generation: u64,
    job: Arc<str>,
    provider: Arc<str>,
    tx: mpsc::UnboundedSender<Update>,
}

impl GroupSender {
    /// Publish the provider's full group list. Returns false once the runner is gone.
    pub fn send(&self, groups: Vec<TargetGroup>) -> bool {
        self.tx
            .send(Update::Groups {
                generation: self.generation,
                job: self.job.clone(),
                provider: self.provider.clone(),
                groups,
            })
            .is_ok()
    }
}

/// Providers started by the latest `apply_config`.
struct ProviderSet {
    generation: u64,
    cancel: CancellationToken,
}

/// Default [`DiscoveryEngine`]: runs providers and merges their output.
pub struct DiscoveryRunner {
    cancel: CancellationToken,
    factory: Arc<dyn DiscovererFactory>,
    updates_tx: mpsc::UnboundedSender<Update>,
    updates_rx: Mutex<Option<mpsc::UnboundedReceiver<Update>>>,
    providers: Mutex<ProviderSet>,
    targets_tx: watch::Sender<TargetSnapshot>,
}

impl DiscoveryRunner {
    pub fn new(cancel: CancellationToken, factory: Arc<dyn DiscovererFactory>) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (targets_tx, _) = watch::channel(Arc::new(TargetSets::new()));
        let providers = ProviderSet {
            generation: 0,
            cancel: cancel.child_token(),
        };
        Self {
            cancel,
            factory,
            updates_tx,
            updates_rx: Mutex::new(Some(updates_rx)),
            providers: Mutex::new(providers),
            targets_tx,
        }
    }
}

impl DiscoveryEngine for DiscoveryRunner {
    fn run(&self) -> BoxFuture<'_, ReceiverResult<()>> {
        Box::pin(async move {
            let mut updates = self
                .updates_rx
                .lock()
                .take()
                .ok_or(ReceiverError::AlreadyRunning("discovery runner"))?;

            info!("discovery runner started");
            let mut current = 0;
            // job → provider → groups
            let mut state: HashMap<String, BTreeMap<Arc<str>, Vec<TargetGroup>>> = HashMap::new();

            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    update = updates.recv() => {
                        let Some(update) = update else { break };
                        match update {
                            Update::Reconfigure { generation, jobs } => {
                                current = generation;
                                state.retain(|job, _| jobs.contains(job));
                                for job in jobs {
                                    // Providers of the new generation refill their entries.
                                    state.insert(job, BTreeMap::new());
                                }
                            }
                            Update::Groups { generation, job, provider, groups } => {
                                if generation != current {
                                    debug!(%job, %provider, "dropping update from replaced provider");
                                    continue;
                                }
                                state
                                    .entry(job.to_string())
                                    .or_default()
                                    .insert(provider, groups);
                            }
                        }
                        self.publish(&state);
                    }
                }
            }

            self.providers.lock().cancel.cancel();
            info!("discovery runner stopped");
            Ok(())
        })
    }

    fn apply_config(&self, configs: HashMap<String, ServiceDiscoveryConfig>) -> ReceiverResult<()> {
        let mut providers = self.providers.lock();
        providers.cancel.cancel();
        providers.generation += 1;
        providers.cancel = self.cancel.child_token();
        let generation = providers.generation;

        let _ = self.updates_tx.send(Update::Reconfigure {
            generation,
            jobs: configs.keys().cloned().collect(),
        });

        let mut first_error = None;
        let mut started = 0;
        for (job, config) in &configs {
            let built = match self.factory.build(job, config) {
                Ok(built) => built,
                Err(e) => {
                    warn!(%job, error = %e, "failed to build discovery providers");
                    first_error.get_or_insert(e);
                    continue;
                }
            };

            let job: Arc<str> = Arc::from(job.as_str());
            for (name, discoverer) in built {
                let sender = GroupSender {
                    generation,
                    job: job.clone(),
                    provider: Arc::from(name.as_str()),
                    tx: self.updates_tx.clone(),
                };
                let cancel = providers.cancel.clone();
                tokio::spawn(
                    async move {
                        if let Err(e) = discoverer.run(cancel, sender).await {
                            warn!(error = %e, "discovery provider failed");
                        }
                    }
                    .instrument(tracing::debug_span!("provider", job = %job, provider = %name)),
                );
                started += 1;
            }
        }

        info!(jobs = configs.len(), providers = started, generation, "discovery config applied");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn notifications(&self) -> watch::Receiver<TargetSnapshot> {
        self.targets_tx.subscribe()
    }
}

impl DiscoveryRunner {
    fn publish(&self, state: &HashMap<String, BTreeMap<Arc<str>, Vec<TargetGroup>>>) {
        let sets: TargetSets = state
            .iter()
            .map(|(job, providers)| {
                let groups = providers.values().flatten().cloned().collect();
                (job.clone(), groups)
            })
            .collect();
        debug!(jobs = sets.len(), "publishing target sets");
        self.targets_tx.send_replace(Arc::new(sets));
    }
}

/// Publishes a fixed list of groups once, then idles until cancelled.
pub struct StaticDiscoverer {
    groups: Vec<TargetGroup>,
}

impl StaticDiscoverer {
    pub fn new(groups: Vec<TargetGroup>) -> Self {
        Self { groups }
    }
}

impl Discoverer for StaticDiscoverer {
    fn run(&self, cancel: CancellationToken, sender: GroupSender) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            sender.send(self.groups.clone());
            cancel.cancelled().await;
            Ok(())
        })
    }
}

/// Default [`DiscovererFactory`]: static targets plus registered mechanisms.
#[derive(Default, Clone)]
pub struct DiscovererRegistry {
    builders: HashMap<String, ProviderBuilder>,
}

impl DiscovererRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builder for `providers` entries of the given kind.
    pub fn with_provider(mut self, kind: impl Into<String>, builder: ProviderBuilder) -> Self {
        self.builders.insert(kind.into(), builder);
        self
    }
}

impl DiscovererFactory for DiscovererRegistry {
    fn build(
        &self,
        job: &str,
        config: &ServiceDiscoveryConfig,
    ) -> ReceiverResult<Vec<(String, Arc<dyn Discoverer>)>> {
        let mut built: Vec<(String, Arc<dyn Discoverer>)> = Vec::new();

        if !config.static_configs.is_empty() {
            let groups = config
                .static_configs
                .iter()
                .enumerate()
                .map(|(i, sc)| {
                    TargetGroup::from_addresses(i.to_string(), sc.targets.clone(), sc.labels.clone())
                })
                .collect();
            built.push(("static".to_string(), Arc::new(StaticDiscoverer::new(groups))));
        }

        for (i, provider) in config.providers.iter().enumerate() {
            let builder = self.builders.get(&provider.kind).ok_or_else(|| ReceiverError::Discovery {
                job: job.to_string(),
                source: anyhow::anyhow!("unknown discovery provider kind {:?}", provider.kind),
            })?;
            let discoverer = builder(job, provider).map_err(|source| ReceiverError::Discovery {
                job: job.to_string(),
                source,
            })?;
            built.push((format!("{}/{i}", provider.kind), discoverer));
        }

        Ok(built)
    }
}
