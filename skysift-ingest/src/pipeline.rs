//! Pipeline assembly: sources → aggregator → decode → track.
//!
//! One consumer task pulls deduplicated batches, classifies and
//! field-decodes each frame through the injected codec, resolves CPR
//! positions, and merges into the aircraft store — so all mutation of a
//! given aircraft is serialized. A separate maintenance task runs expiry,
//! eviction, CPR pruning, and the reporting-interval counter reset on a
//! schedule instead of inline with ingestion.
//!
//! Everything is explicitly constructed and torn down; there is no global
//! state. Locks are table-granularity and never held across an await.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skysift_core::classify::Classifier;
use skysift_core::codec::ModesCodec;
use skysift_core::cpr::{CprConfig, CprResolver};
use skysift_core::store::{AircraftState, AircraftStore, StoreConfig};
use skysift_core::types::{Icao, RawFrame, SkysiftError, SourceId};

use crate::aggregator::{AggregatorConfig, BatchQueue, SourceAggregator};
use crate::source::{unix_now, SourceConfig, SourceHealth, SourceState, SourceStatus};
use crate::IngestError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub aggregator: AggregatorConfig,
    pub cpr: CprConfig,
    pub store: StoreConfig,
    /// Expiry/eviction/prune sweep period (seconds).
    pub maintenance_interval_s: f64,
    /// Rate counters reset on this fixed interval (seconds).
    pub reporting_interval_s: f64,
    /// Bound on task teardown during `shutdown` (seconds).
    pub shutdown_timeout_s: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            aggregator: AggregatorConfig::default(),
            cpr: CprConfig::default(),
            store: StoreConfig::default(),
            maintenance_interval_s: 5.0,
            reporting_interval_s: 60.0,
            shutdown_timeout_s: 10.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Counters and stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PipelineCounters {
    received: AtomicU64,
    decoded: AtomicU64,
    format_errors: AtomicU64,
    checksum_errors: AtomicU64,
    decode_errors: AtomicU64,
    /// f64 bit pattern: start of the current reporting window.
    window_start: AtomicU64,
}

impl PipelineCounters {
    fn window_start(&self) -> f64 {
        f64::from_bits(self.window_start.load(Ordering::Relaxed))
    }

    fn reset(&self, now: f64) {
        self.received.store(0, Ordering::Relaxed);
        self.decoded.store(0, Ordering::Relaxed);
        self.format_errors.store(0, Ordering::Relaxed);
        self.checksum_errors.store(0, Ordering::Relaxed);
        self.decode_errors.store(0, Ordering::Relaxed);
        self.window_start.store(now.to_bits(), Ordering::Relaxed);
    }
}

/// Point-in-time statistics for observability collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub connected_sources: usize,
    pub total_sources: usize,
    pub sources: Vec<SourceHealth>,

    pub live_aircraft: usize,
    pub cpr_cached: usize,

    /// Frames entering the decode stage over the current reporting window.
    pub messages_per_sec: f64,
    pub received: u64,
    pub decoded: u64,
    pub decode_success_rate: f64,

    pub format_errors: u64,
    pub checksum_errors: u64,
    pub decode_errors: u64,

    pub duplicates: u64,
    pub shed_batches: u64,
    pub conflicts: u64,
    pub expired: u64,
    pub evicted: u64,
}

// ---------------------------------------------------------------------------
// Shared pipeline state
// ---------------------------------------------------------------------------

struct PipelineInner {
    classifier: Classifier,
    resolver: Mutex<CprResolver>,
    store: RwLock<AircraftStore>,
    counters: PipelineCounters,
}

impl PipelineInner {
    /// Decode one frame and fold it into the tracked state. Errors are
    /// counted by kind and swallowed — a bad frame never stops the stream.
    fn process_frame(&self, frame: &RawFrame) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let msg = match self.classifier.decode(frame) {
            Ok(msg) => msg,
            Err(SkysiftError::BadLength(_)) | Err(SkysiftError::BadHex) => {
                self.counters.format_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(SkysiftError::ChecksumFailed) => {
                self.counters.checksum_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(err) => {
                debug!(source = frame.source, %err, "frame dropped");
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let position = msg.kind.cpr().and_then(|cpr| {
            let surface = msg.category() == skysift_core::types::MsgCategory::SurfacePosition;
            self.resolver
                .lock()
                .unwrap()
                .update(msg.icao, cpr, surface, msg.timestamp)
                .map(|p| (p.lat, p.lon))
        });

        let outcome = self
            .store
            .write()
            .unwrap()
            .apply(&msg, position, msg.timestamp);
        if !outcome.conflicts.is_empty() {
            debug!(
                icao = %skysift_core::types::icao_to_string(&msg.icao),
                conflicts = outcome.conflicts.len(),
                "implausible update applied (prefer-newest)"
            );
        }

        self.counters.decoded.fetch_add(1, Ordering::Relaxed);
    }

    /// Expiry + eviction + CPR cache maintenance, in one sweep.
    fn run_maintenance(&self, now: f64) {
        let (expired, evicted) = {
            let mut store = self.store.write().unwrap();
            let expired = store.expire(now);
            let evicted = store.evict_for_capacity();
            (expired, evicted)
        };

        {
            let mut resolver = self.resolver.lock().unwrap();
            for icao in expired.iter().chain(evicted.iter()) {
                resolver.remove(icao);
            }
            resolver.prune(now);
        }

        if !expired.is_empty() || !evicted.is_empty() {
            debug!(
                expired = expired.len(),
                evicted = evicted.len(),
                "maintenance sweep"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Handle for downstream collaborators
// ---------------------------------------------------------------------------

/// Cheap-to-clone view of the running pipeline: the pull API, statistics,
/// and the administrative maintenance trigger.
#[derive(Clone)]
pub struct TrackerHandle {
    inner: Arc<PipelineInner>,
    queue: Arc<BatchQueue>,
    sources: Arc<Vec<(String, Arc<SourceStatus>)>>,
}

impl TrackerHandle {
    /// All live aircraft, most recently seen first.
    pub fn snapshot(&self) -> Vec<AircraftState> {
        self.inner.store.read().unwrap().snapshot()
    }

    pub fn aircraft(&self, icao: &Icao) -> Option<AircraftState> {
        self.inner.store.read().unwrap().get(icao).cloned()
    }

    /// Watchlist collaborator hook.
    pub fn set_watchlisted(&self, icao: &Icao, flagged: bool) -> bool {
        self.inner.store.write().unwrap().set_watchlisted(icao, flagged)
    }

    /// Immediate expire/evict/prune, for memory-pressure callers. Does not
    /// touch the reporting counters.
    pub fn force_maintenance(&self) {
        self.inner.run_maintenance(unix_now());
    }

    pub fn stats(&self) -> StatsSnapshot {
        let now = unix_now();
        let counters = &self.inner.counters;
        let received = counters.received.load(Ordering::Relaxed);
        let decoded = counters.decoded.load(Ordering::Relaxed);
        let elapsed = (now - counters.window_start()).max(1e-3);

        let source_health: Vec<SourceHealth> = self
            .sources
            .iter()
            .map(|(name, status)| SourceHealth {
                name: name.clone(),
                state: status.state(),
                messages: status.messages(),
                bytes: status.bytes(),
                errors: status.errors(),
                last_activity: status.last_activity(),
            })
            .collect();
        let connected = source_health
            .iter()
            .filter(|h| h.state == SourceState::Connected)
            .count();

        let store = self.inner.store.read().unwrap();
        let store_counters = store.counters();

        StatsSnapshot {
            connected_sources: connected,
            total_sources: source_health.len(),
            sources: source_health,
            live_aircraft: store.len(),
            cpr_cached: self.inner.resolver.lock().unwrap().cached(),
            messages_per_sec: received as f64 / elapsed,
            received,
            decoded,
            decode_success_rate: if received > 0 {
                decoded as f64 / received as f64
            } else {
                0.0
            },
            format_errors: counters.format_errors.load(Ordering::Relaxed),
            checksum_errors: counters.checksum_errors.load(Ordering::Relaxed),
            decode_errors: counters.decode_errors.load(Ordering::Relaxed),
            duplicates: self.queue.duplicates(),
            shed_batches: self.queue.shed_batches(),
            conflicts: store_counters.conflicts,
            expired: store_counters.expired,
            evicted: store_counters.evicted,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    config: PipelineConfig,
    inner: Arc<PipelineInner>,
    aggregator: SourceAggregator,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn new(codec: Arc<dyn ModesCodec>, config: PipelineConfig) -> Self {
        let inner = Arc::new(PipelineInner {
            classifier: Classifier::new(Arc::clone(&codec)),
            resolver: Mutex::new(CprResolver::new(codec, config.cpr.clone())),
            store: RwLock::new(AircraftStore::new(config.store.clone())),
            counters: PipelineCounters::default(),
        });
        inner.counters.reset(unix_now());

        Pipeline {
            aggregator: SourceAggregator::new(config.aggregator.clone()),
            config,
            inner,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Register a receiver front-end. Must happen before `start`.
    pub fn add_source(&mut self, config: SourceConfig) -> Result<SourceId, IngestError> {
        self.aggregator.add_source(config)
    }

    /// Spawn source tasks, the aggregator cycle, the consumer, and the
    /// maintenance schedule.
    pub fn start(&mut self) -> Result<(), IngestError> {
        self.aggregator.start()?;

        let queue = self.aggregator.queue();
        let consumer_inner = Arc::clone(&self.inner);
        let consumer_queue = Arc::clone(&queue);
        self.tasks.push(tokio::spawn(async move {
            run_consumer(consumer_inner, consumer_queue).await;
        }));

        let maint_inner = Arc::clone(&self.inner);
        let maint_queue = queue;
        let maint_cancel = self.cancel.clone();
        let maintenance_interval = self.config.maintenance_interval_s;
        let reporting_interval = self.config.reporting_interval_s;
        self.tasks.push(tokio::spawn(async move {
            run_maintenance(
                maint_inner,
                maint_queue,
                maint_cancel,
                maintenance_interval,
                reporting_interval,
            )
            .await;
        }));

        info!("pipeline started");
        Ok(())
    }

    /// Handle for downstream watchlist/alerting/API collaborators.
    pub fn handle(&self) -> TrackerHandle {
        TrackerHandle {
            inner: Arc::clone(&self.inner),
            queue: self.aggregator.queue(),
            sources: Arc::new(self.aggregator.source_statuses()),
        }
    }

    /// Stop every task and close every socket. Bounded by the configured
    /// shutdown timeout.
    pub async fn shutdown(&mut self) -> Result<(), IngestError> {
        info!("pipeline shutting down");
        self.cancel.cancel();
        self.aggregator.stop().await;

        let deadline = Duration::from_secs_f64(self.config.shutdown_timeout_s);
        for task in self.tasks.drain(..) {
            if timeout(deadline, task).await.is_err() {
                warn!("task did not stop within the shutdown timeout");
                return Err(IngestError::ShutdownTimeout);
            }
        }
        Ok(())
    }
}

/// Pull batches until the aggregator stops, then drain and exit.
async fn run_consumer(inner: Arc<PipelineInner>, queue: Arc<BatchQueue>) {
    while let Some(batch) = queue.recv_batch().await {
        for frame in &batch.frames {
            inner.process_frame(frame);
        }
    }
    debug!("consumer drained");
}

async fn run_maintenance(
    inner: Arc<PipelineInner>,
    queue: Arc<BatchQueue>,
    cancel: CancellationToken,
    maintenance_interval_s: f64,
    reporting_interval_s: f64,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(
        maintenance_interval_s.max(0.01),
    ));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_reset = unix_now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = unix_now();
        inner.run_maintenance(now);

        if now - last_reset >= reporting_interval_s {
            inner.counters.reset(now);
            queue.reset_counters();
            inner.store.write().unwrap().reset_counters();
            last_reset = now;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
