//! One receiver front-end: a TCP socket, a framer, and a reader task.
//!
//! Each source runs its own task so a stalled or dead receiver can never
//! hold up the aggregator cycle. Frames flow through an ordered per-source
//! channel; reconnection uses bounded exponential backoff, and a source that
//! exhausts its attempt budget parks as failed until the aggregator's health
//! check nudges it.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skysift_core::types::{RawFrame, SourceId};
use skysift_core::wire::{Framer, WireFormat};

/// Unix timestamp in seconds.
pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Reconnect behavior: exponential backoff with a cap on delay and attempts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_backoff_s: f64,
    pub max_backoff_s: f64,
    pub multiplier: f64,
    /// After this many consecutive failures the source parks as failed and
    /// waits for a health-check nudge.
    pub max_attempts: u32,
    /// Floor between attempts regardless of backoff schedule.
    pub min_retry_interval_s: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            initial_backoff_s: 1.0,
            max_backoff_s: 60.0,
            multiplier: 2.0,
            max_attempts: 10,
            min_retry_interval_s: 1.0,
        }
    }
}

/// One receiver front-end endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// host:port of the receiver's TCP output.
    pub addr: String,
    pub format: WireFormat,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_s: f64,
}

fn default_connect_timeout() -> f64 {
    10.0
}

/// Exponential backoff for the given attempt number (0-based), capped and
/// floored per config.
pub fn backoff_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    let secs = config.initial_backoff_s * config.multiplier.powi(attempt as i32);
    let secs = secs
        .min(config.max_backoff_s)
        .max(config.min_retry_interval_s);
    Duration::from_secs_f64(secs)
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Disconnected,
    Connecting,
    Connected,
    /// Attempt budget exhausted; waiting for a health-check nudge.
    Failed,
}

impl SourceState {
    fn from_u8(v: u8) -> SourceState {
        match v {
            1 => SourceState::Connecting,
            2 => SourceState::Connected,
            3 => SourceState::Failed,
            _ => SourceState::Disconnected,
        }
    }
}

/// Shared counters for one source. Written by the reader task, read by the
/// aggregator's health check and the stats snapshot.
#[derive(Debug, Default)]
pub struct SourceStatus {
    state: AtomicU8,
    messages: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    reconnect_attempts: AtomicU32,
    /// f64 bit patterns; 0.0 means never.
    last_activity: AtomicU64,
    last_attempt: AtomicU64,
}

impl SourceStatus {
    pub fn state(&self) -> SourceState {
        SourceState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: SourceState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SourceState::Connected
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn last_activity(&self) -> f64 {
        f64::from_bits(self.last_activity.load(Ordering::Relaxed))
    }

    pub fn last_attempt(&self) -> f64 {
        f64::from_bits(self.last_attempt.load(Ordering::Relaxed))
    }

    fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    fn record_bytes(&self, n: u64, now: f64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
        self.last_activity.store(now.to_bits(), Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_attempt(&self, now: f64) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        self.last_attempt.store(now.to_bits(), Ordering::Relaxed);
    }
}

/// Point-in-time health report for one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub name: String,
    pub state: SourceState,
    pub messages: u64,
    pub bytes: u64,
    pub errors: u64,
    pub last_activity: f64,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Handle for one source's reader task.
pub struct SourceConnection {
    pub config: SourceConfig,
    id: SourceId,
    status: Arc<SourceStatus>,
    retry_nudge: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl SourceConnection {
    pub fn new(id: SourceId, config: SourceConfig) -> Self {
        SourceConnection {
            config,
            id,
            status: Arc::new(SourceStatus::default()),
            retry_nudge: Arc::new(Notify::new()),
            task: None,
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn status(&self) -> &Arc<SourceStatus> {
        &self.status
    }

    pub fn health(&self) -> SourceHealth {
        SourceHealth {
            name: self.config.name.clone(),
            state: self.status.state(),
            messages: self.status.messages(),
            bytes: self.status.bytes(),
            errors: self.status.errors(),
            last_activity: self.status.last_activity(),
        }
    }

    /// Wake a parked (failed) source for another round of attempts.
    pub fn nudge_retry(&self) {
        self.retry_nudge.notify_one();
    }

    /// Clone of the nudge handle, for a health checker that does not own
    /// the connection.
    pub fn retry_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.retry_nudge)
    }

    /// Spawn the reader task. Frames go out through `tx` in arrival order.
    pub fn start(&mut self, tx: mpsc::Sender<RawFrame>, cancel: CancellationToken) {
        let config = self.config.clone();
        let status = Arc::clone(&self.status);
        let nudge = Arc::clone(&self.retry_nudge);
        let id = self.id;
        self.task = Some(tokio::spawn(run_source(
            id, config, status, nudge, tx, cancel,
        )));
    }

    /// Wait for the reader task to exit (after cancellation).
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Connect / read / reconnect loop for one source.
async fn run_source(
    id: SourceId,
    config: SourceConfig,
    status: Arc<SourceStatus>,
    nudge: Arc<Notify>,
    tx: mpsc::Sender<RawFrame>,
    cancel: CancellationToken,
) {
    let mut attempts: u32 = 0;

    while !cancel.is_cancelled() {
        status.set_state(SourceState::Connecting);
        status.record_attempt(unix_now());

        let connect = timeout(
            Duration::from_secs_f64(config.connect_timeout_s),
            TcpStream::connect(&config.addr),
        );
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connect => match result {
                Ok(Ok(stream)) => Some(stream),
                Ok(Err(e)) => {
                    debug!(source = %config.name, error = %e, "connect failed");
                    None
                }
                Err(_) => {
                    debug!(source = %config.name, "connect timed out");
                    None
                }
            },
        };

        if let Some(stream) = stream {
            info!(source = %config.name, addr = %config.addr, "connected");
            status.set_state(SourceState::Connected);
            attempts = 0;

            let eof = read_until_closed(id, &config, stream, &status, &tx, &cancel).await;
            if cancel.is_cancelled() {
                break;
            }
            if eof {
                info!(source = %config.name, "connection closed by remote");
            } else {
                status.record_error();
            }
            status.set_state(SourceState::Disconnected);
        } else {
            status.record_error();
        }

        attempts += 1;

        if attempts >= config.reconnect.max_attempts {
            warn!(
                source = %config.name,
                attempts,
                "retry budget exhausted, parking until health check"
            );
            status.set_state(SourceState::Failed);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = nudge.notified() => {
                    attempts = 0;
                    continue;
                }
            }
        }

        let delay = backoff_delay(attempts - 1, &config.reconnect);
        debug!(source = %config.name, attempts, delay_s = delay.as_secs_f64(), "backing off");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }

    status.set_state(SourceState::Disconnected);
}

/// Read loop for one established connection. Returns true on clean EOF,
/// false on read error or a closed output channel. The socket closes when
/// the stream drops.
async fn read_until_closed(
    id: SourceId,
    config: &SourceConfig,
    mut stream: TcpStream,
    status: &SourceStatus,
    tx: &mpsc::Sender<RawFrame>,
    cancel: &CancellationToken,
) -> bool {
    let mut framer = Framer::new(config.format);
    let mut buf = [0u8; 4096];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return false,
            result = stream.read(&mut buf) => match result {
                Ok(0) => return true,
                Ok(n) => n,
                Err(e) => {
                    warn!(source = %config.name, error = %e, "read failed");
                    return false;
                }
            },
        };

        let now = unix_now();
        status.record_bytes(n as u64, now);
        for frame in framer.feed(&buf[..n], now) {
            status.record_message();
            let raw = RawFrame {
                hex: frame.hex,
                timestamp: frame.timestamp,
                source: id,
            };
            if tx.send(raw).await.is_err() {
                return false; // aggregator gone
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
