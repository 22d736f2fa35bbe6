//! warpgrid-prometheus — Prometheus metrics receiver for WarpGrid.
//!
//! Discovers scrape targets, scrapes them on a per-job interval, filters
//! samples per endpoint, and forwards translated metric batches to a
//! downstream consumer.
//!
//! # Architecture
//!
//! ```text
//! PrometheusReceiver (start/stop once)
//!   ├── DiscoveryRunner
//!   │     ├── Discoverer per job/provider → TargetGroups
//!   │     └── watch channel → latest TargetSnapshot
//!   ├── ScrapeCoordinator
//!   │     ├── reconcile(snapshot) → one scrape loop per Target
//!   │     └── Scraper (external) → Vec<Sample>
//!   └── SampleSink (Appendable)
//!         ├── FilterIndex      ← include_filter
//!         ├── JobBookkeeper    ← staleness + cumulative start times
//!         └── MetricsConsumer  ← translated MetricsBatch
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod config;
pub mod consumer;
pub mod discovery;
pub mod error;
pub mod filter;
pub mod host;
pub mod jobs;
pub mod lifecycle;
pub mod scrape;
pub mod sink;
pub mod types;

/// Boxed future used by the object-safe traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use config::{PrometheusConfig, ReceiverConfig, ScrapeConfig, ServiceDiscoveryConfig};
pub use consumer::MetricsConsumer;
pub use discovery::{Discoverer, DiscovererRegistry, DiscoveryEngine, DiscoveryRunner};
pub use error::{ReceiverError, ReceiverResult};
pub use filter::FilterIndex;
pub use host::{ChannelHost, Host};
pub use jobs::JobBookkeeper;
pub use lifecycle::{EngineFactory, MetricsReceiver, PrometheusEngines, PrometheusReceiver};
pub use scrape::{ScrapeCoordinator, ScrapeEngine, Scraper};
pub use sink::SampleSink;
pub use types::{MetricsBatch, Sample, Target, TargetGroup};
