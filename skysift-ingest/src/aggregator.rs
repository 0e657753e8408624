//! Multi-source aggregation: one coordinating cycle that drains every
//! source's channel, deduplicates identical bytes across sources inside a
//! sliding window, and emits ordered batches into a bounded queue.
//!
//! The cycle never touches socket I/O — each source has its own reader task
//! — so one dead receiver cannot stall collection from the others. When the
//! consumer falls behind, the queue sheds its oldest batches rather than
//! blocking the cycle.

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use skysift_core::types::{RawFrame, SourceId};

use crate::source::{unix_now, SourceConfig, SourceConnection, SourceHealth, SourceState, SourceStatus};
use crate::IngestError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Registry capacity; `add_source` past this is an error.
    pub max_sources: usize,
    /// Collection cycle period (milliseconds).
    pub poll_interval_ms: u64,
    /// Identical bytes within this window count as one observation (seconds).
    pub dedup_window_s: f64,
    /// How often expired fingerprints are purged (seconds).
    pub dedup_purge_interval_s: f64,
    /// How often parked sources are checked for a retry nudge (seconds).
    pub health_check_interval_s: f64,
    /// Output queue bound, in batches. Overflow sheds the oldest.
    pub queue_capacity: usize,
    /// Per-source frame channel bound.
    pub source_channel_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            max_sources: 8,
            poll_interval_ms: 50,
            dedup_window_s: 2.0,
            dedup_purge_interval_s: 5.0,
            health_check_interval_s: 10.0,
            queue_capacity: 256,
            source_channel_capacity: 1024,
        }
    }
}

/// One collection cycle's worth of deduplicated frames.
#[derive(Debug, Clone)]
pub struct Batch {
    pub frames: Vec<RawFrame>,
    pub collected_at: f64,
}

/// Aggregate counters plus per-source health.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatorStats {
    pub sources: Vec<SourceHealth>,
    pub connected_sources: usize,
    pub received: u64,
    pub unique: u64,
    pub duplicates: u64,
    pub shed_batches: u64,
    pub queued_batches: usize,
}

// ---------------------------------------------------------------------------
// Shared output side
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AggCounters {
    received: AtomicU64,
    unique: AtomicU64,
    duplicates: AtomicU64,
    shed: AtomicU64,
}

/// Output queue + counters, shared between the cycle task and the consumer.
pub struct BatchQueue {
    queue: Mutex<VecDeque<Batch>>,
    notify: Notify,
    counters: AggCounters,
    capacity: usize,
    cancel: CancellationToken,
}

impl BatchQueue {
    fn new(capacity: usize, cancel: CancellationToken) -> Self {
        BatchQueue {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            counters: AggCounters::default(),
            capacity,
            cancel,
        }
    }

    /// Push a batch, shedding from the front when full.
    fn push(&self, batch: Batch) {
        {
            let mut queue = self.queue.lock().unwrap();
            queue.push_back(batch);
            while queue.len() > self.capacity {
                queue.pop_front();
                self.counters.shed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.notify.notify_one();
    }

    /// Non-blocking pull.
    pub fn try_next_batch(&self) -> Option<Batch> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Await the next batch. Returns `None` once the aggregator has stopped
    /// and the queue is drained.
    pub async fn recv_batch(&self) -> Option<Batch> {
        loop {
            if let Some(batch) = self.try_next_batch() {
                return Some(batch);
            }
            if self.cancel.is_cancelled() {
                return self.try_next_batch();
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = self.notify.notified() => {}
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn shed_batches(&self) -> u64 {
        self.counters.shed.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.counters.duplicates.load(Ordering::Relaxed)
    }

    /// Reporting-interval reset of the rate counters.
    pub fn reset_counters(&self) {
        self.counters.received.store(0, Ordering::Relaxed);
        self.counters.unique.store(0, Ordering::Relaxed);
        self.counters.duplicates.store(0, Ordering::Relaxed);
        self.counters.shed.store(0, Ordering::Relaxed);
    }
}

/// Exact-content fingerprint of a frame's bytes.
fn fingerprint(hex: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    hex.hash(&mut hasher);
    hasher.finish()
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// What the cycle task needs to health-check a source it does not own.
struct HealthProbe {
    name: String,
    status: Arc<SourceStatus>,
    nudge: Arc<Notify>,
    min_retry_interval_s: f64,
}

pub struct SourceAggregator {
    config: AggregatorConfig,
    sources: Vec<SourceConnection>,
    receivers: Vec<mpsc::Receiver<RawFrame>>,
    senders: Vec<mpsc::Sender<RawFrame>>,
    queue: Arc<BatchQueue>,
    cancel: CancellationToken,
    cycle: Option<JoinHandle<()>>,
}

impl SourceAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let cancel = CancellationToken::new();
        let queue = Arc::new(BatchQueue::new(config.queue_capacity, cancel.clone()));
        SourceAggregator {
            config,
            sources: Vec::new(),
            receivers: Vec::new(),
            senders: Vec::new(),
            queue,
            cancel,
            cycle: None,
        }
    }

    /// Register a source before `start`. The registry has fixed capacity.
    pub fn add_source(&mut self, config: SourceConfig) -> Result<SourceId, IngestError> {
        if self.cycle.is_some() {
            return Err(IngestError::AlreadyStarted);
        }
        if self.sources.len() >= self.config.max_sources {
            return Err(IngestError::RegistryFull(self.config.max_sources));
        }
        let id = self.sources.len();
        let (tx, rx) = mpsc::channel(self.config.source_channel_capacity);
        self.sources.push(SourceConnection::new(id, config));
        self.senders.push(tx);
        self.receivers.push(rx);
        Ok(id)
    }

    /// Spawn every source's reader task plus the coordinating cycle.
    pub fn start(&mut self) -> Result<(), IngestError> {
        if self.cycle.is_some() {
            return Err(IngestError::AlreadyStarted);
        }

        for (source, tx) in self.sources.iter_mut().zip(self.senders.drain(..)) {
            source.start(tx, self.cancel.clone());
        }

        let probes: Vec<HealthProbe> = self
            .sources
            .iter()
            .map(|s| HealthProbe {
                name: s.config.name.clone(),
                status: Arc::clone(s.status()),
                nudge: s.retry_handle(),
                min_retry_interval_s: s.config.reconnect.min_retry_interval_s,
            })
            .collect();

        info!(sources = self.sources.len(), "aggregator starting");
        self.cycle = Some(tokio::spawn(run_cycle(
            self.config.clone(),
            std::mem::take(&mut self.receivers),
            probes,
            Arc::clone(&self.queue),
            self.cancel.clone(),
        )));
        Ok(())
    }

    /// Cancel and join every task. Sources close their sockets on the way
    /// out. Idempotent.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(cycle) = self.cycle.take() {
            let _ = cycle.await;
        }
        for source in &mut self.sources {
            source.join().await;
        }
    }

    /// Shared pull side for the consumer.
    pub fn queue(&self) -> Arc<BatchQueue> {
        Arc::clone(&self.queue)
    }

    /// (name, status) pairs for stats readers that outlive `&self`.
    pub fn source_statuses(&self) -> Vec<(String, Arc<SourceStatus>)> {
        self.sources
            .iter()
            .map(|s| (s.config.name.clone(), Arc::clone(s.status())))
            .collect()
    }

    pub fn stats(&self) -> AggregatorStats {
        let sources: Vec<SourceHealth> = self.sources.iter().map(|s| s.health()).collect();
        let connected = sources
            .iter()
            .filter(|h| h.state == SourceState::Connected)
            .count();
        AggregatorStats {
            connected_sources: connected,
            sources,
            received: self.queue.counters.received.load(Ordering::Relaxed),
            unique: self.queue.counters.unique.load(Ordering::Relaxed),
            duplicates: self.queue.counters.duplicates.load(Ordering::Relaxed),
            shed_batches: self.queue.counters.shed.load(Ordering::Relaxed),
            queued_batches: self.queue.queued(),
        }
    }
}

/// The coordinating cycle: drain channels, dedup, batch, purge, health-check.
async fn run_cycle(
    config: AggregatorConfig,
    mut receivers: Vec<mpsc::Receiver<RawFrame>>,
    probes: Vec<HealthProbe>,
    queue: Arc<BatchQueue>,
    cancel: CancellationToken,
) {
    let mut dedup: HashMap<u64, f64> = HashMap::new();
    let mut ticker =
        tokio::time::interval(Duration::from_millis(config.poll_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut last_purge = unix_now();
    let mut last_health = unix_now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = unix_now();

        // Drain every source in registry order; per-source order is the
        // channel's.
        let mut frames = Vec::new();
        for rx in receivers.iter_mut() {
            while let Ok(frame) = rx.try_recv() {
                queue.counters.received.fetch_add(1, Ordering::Relaxed);
                let fp = fingerprint(&frame.hex);
                match dedup.get(&fp) {
                    // Window measured from the first observation, so a
                    // repeat after expiry is a fresh observation.
                    Some(&ts) if now - ts <= config.dedup_window_s => {
                        queue.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        dedup.insert(fp, now);
                        queue.counters.unique.fetch_add(1, Ordering::Relaxed);
                        frames.push(frame);
                    }
                }
            }
        }

        if !frames.is_empty() {
            queue.push(Batch {
                frames,
                collected_at: now,
            });
        }

        if now - last_purge >= config.dedup_purge_interval_s {
            dedup.retain(|_, ts| now - *ts <= config.dedup_window_s);
            last_purge = now;
        }

        if now - last_health >= config.health_check_interval_s {
            for probe in &probes {
                if probe.status.state() == SourceState::Failed
                    && now - probe.status.last_attempt() >= probe.min_retry_interval_s
                {
                    debug!(source = %probe.name, "health check nudging parked source");
                    probe.nudge.notify_one();
                }
            }
            last_health = now;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ReconnectConfig;
    use skysift_core::wire::WireFormat;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    const FRAME_A: &str = "8D4840D6202CC371C32CE0576098";
    const FRAME_B: &str = "8D40621D58C382D690C8AC2863A7";

    fn source_config(addr: String, name: &str) -> SourceConfig {
        SourceConfig {
            name: name.into(),
            addr,
            format: WireFormat::AvrLines,
            reconnect: ReconnectConfig {
                initial_backoff_s: 0.05,
                max_backoff_s: 0.2,
                multiplier: 2.0,
                max_attempts: 3,
                min_retry_interval_s: 0.01,
            },
            connect_timeout_s: 1.0,
        }
    }

    fn fast_config() -> AggregatorConfig {
        AggregatorConfig {
            poll_interval_ms: 10,
            dedup_window_s: 5.0,
            dedup_purge_interval_s: 0.5,
            health_check_interval_s: 0.2,
            ..AggregatorConfig::default()
        }
    }

    /// Listener that writes the given lines on its first accepted
    /// connection, then holds the socket open.
    async fn serve_lines(lines: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            for line in lines {
                socket.write_all(line.as_bytes()).await.unwrap();
            }
            sleep(Duration::from_secs(5)).await;
        });
        addr
    }

    async fn collect_hexes(queue: &BatchQueue, want: usize, deadline_ms: u64) -> Vec<String> {
        let mut hexes = Vec::new();
        let _ = timeout(Duration::from_millis(deadline_ms), async {
            while hexes.len() < want {
                match queue.recv_batch().await {
                    Some(batch) => {
                        hexes.extend(batch.frames.into_iter().map(|f| f.hex));
                    }
                    None => break,
                }
            }
        })
        .await;
        hexes
    }

    #[test]
    fn test_registry_capacity() {
        let mut agg = SourceAggregator::new(AggregatorConfig {
            max_sources: 1,
            ..AggregatorConfig::default()
        });
        agg.add_source(source_config("127.0.0.1:1".into(), "a"))
            .unwrap();
        let err = agg
            .add_source(source_config("127.0.0.1:2".into(), "b"))
            .unwrap_err();
        assert!(matches!(err, IngestError::RegistryFull(1)));
    }

    #[test]
    fn test_fingerprint_is_content_hash() {
        assert_eq!(fingerprint(FRAME_A), fingerprint(FRAME_A));
        assert_ne!(fingerprint(FRAME_A), fingerprint(FRAME_B));
    }

    #[tokio::test]
    async fn test_dedup_across_sources() {
        // Both sources carry FRAME_A; only one copy may come out. FRAME_B
        // rides along on the first source to prove the stream still flows.
        let addr1 = serve_lines(vec![format!("*{FRAME_A};\n*{FRAME_B};\n")]).await;
        let addr2 = serve_lines(vec![format!("*{FRAME_A};\n")]).await;

        let mut agg = SourceAggregator::new(fast_config());
        agg.add_source(source_config(addr1, "rx1")).unwrap();
        agg.add_source(source_config(addr2, "rx2")).unwrap();
        agg.start().unwrap();

        let queue = agg.queue();
        let hexes = collect_hexes(&queue, 2, 1500).await;
        // Give any late duplicate a chance to surface.
        sleep(Duration::from_millis(150)).await;
        let mut hexes = hexes;
        while let Some(batch) = queue.try_next_batch() {
            hexes.extend(batch.frames.into_iter().map(|f| f.hex));
        }

        assert_eq!(
            hexes.iter().filter(|h| *h == FRAME_A).count(),
            1,
            "identical bytes from two sources must count once"
        );
        assert_eq!(hexes.iter().filter(|h| *h == FRAME_B).count(), 1);
        assert_eq!(agg.stats().duplicates, 1);

        agg.stop().await;
    }

    #[tokio::test]
    async fn test_repeat_after_window_emitted_again() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(format!("*{FRAME_A};\n").as_bytes())
                .await
                .unwrap();
            sleep(Duration::from_millis(500)).await; // past the 0.3 s window
            socket
                .write_all(format!("*{FRAME_A};\n").as_bytes())
                .await
                .unwrap();
            sleep(Duration::from_secs(5)).await;
        });

        let mut agg = SourceAggregator::new(AggregatorConfig {
            poll_interval_ms: 10,
            dedup_window_s: 0.3,
            dedup_purge_interval_s: 0.1,
            ..AggregatorConfig::default()
        });
        agg.add_source(source_config(addr, "rx")).unwrap();
        agg.start().unwrap();

        let queue = agg.queue();
        let hexes = collect_hexes(&queue, 2, 2000).await;
        assert_eq!(
            hexes.iter().filter(|h| *h == FRAME_A).count(),
            2,
            "a repeat after the window expires is a fresh observation"
        );

        agg.stop().await;
    }

    #[tokio::test]
    async fn test_queue_sheds_oldest() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // Two writes far enough apart to land in separate cycles,
            // hence separate batches.
            socket
                .write_all(format!("*{FRAME_A};\n").as_bytes())
                .await
                .unwrap();
            sleep(Duration::from_millis(150)).await;
            socket
                .write_all(format!("*{FRAME_B};\n").as_bytes())
                .await
                .unwrap();
            sleep(Duration::from_secs(5)).await;
        });

        let mut agg = SourceAggregator::new(AggregatorConfig {
            poll_interval_ms: 10,
            queue_capacity: 1,
            ..AggregatorConfig::default()
        });
        agg.add_source(source_config(addr, "rx")).unwrap();
        agg.start().unwrap();

        // Nobody drains the queue; the second batch must push the first out.
        sleep(Duration::from_millis(400)).await;
        let queue = agg.queue();
        assert_eq!(queue.shed_batches(), 1);
        let batch = queue.try_next_batch().expect("newest batch retained");
        assert_eq!(batch.frames[0].hex, FRAME_B);

        agg.stop().await;
    }

    #[tokio::test]
    async fn test_stop_terminates_everything() {
        let addr = serve_lines(vec![format!("*{FRAME_A};\n")]).await;
        let mut agg = SourceAggregator::new(fast_config());
        agg.add_source(source_config(addr, "rx")).unwrap();
        agg.start().unwrap();
        sleep(Duration::from_millis(100)).await;

        timeout(Duration::from_secs(2), agg.stop())
            .await
            .expect("stop must terminate promptly");

        // After stop, the consumer side drains and then sees the end.
        let queue = agg.queue();
        while queue.recv_batch().await.is_some() {}
    }
}
