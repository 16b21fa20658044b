//! The metrics pipeline.
//!
//! Recording is a single unbounded-channel send, so the evaluator never
//! blocks on metrics and never observes an error from them. A
//! background aggregator consumes records into mutex-guarded counters
//! and flushes batches to the Remote store's counter keys, where
//! processes aggregate. With no Remote (or Redis tracking off) the
//! counters simply accumulate in memory.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use magick_core::config::MetricsConfig;
use magick_storage::traits::RemoteBackend;

/// Cap on buffered durations per (feature, operation); oldest evicted.
const DURATION_RING_CAP: usize = 1000;

/// TTL on every Remote metrics key.
const METRICS_KEY_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Operation being measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Enabled,
    Value,
    Variant,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Value => "value",
            Self::Variant => "variant",
        }
    }
}

/// One evaluation observation.
#[derive(Debug, Clone)]
pub struct MetricRecord {
    pub feature: String,
    pub operation: Operation,
    pub duration_ms: f64,
    pub success: bool,
}

#[derive(Default)]
struct MetricsState {
    /// Lifetime per-feature counts in this process.
    usage: HashMap<String, u64>,
    /// Counts not yet flushed to Remote.
    pending: HashMap<String, u64>,
    pending_total: u64,
    /// Unflushed durations per (feature, operation).
    durations: HashMap<(String, Operation), VecDeque<f64>>,
    /// Per-feature counts already flushed, so queries never double
    /// count against the Remote aggregate.
    flushed: HashMap<String, u64>,
    /// Evaluations observed with `success = false`.
    failures: HashMap<String, u64>,
}

impl MetricsState {
    fn apply(&mut self, record: &MetricRecord) {
        *self.usage.entry(record.feature.clone()).or_default() += 1;
        *self.pending.entry(record.feature.clone()).or_default() += 1;
        self.pending_total += 1;
        if !record.success {
            *self.failures.entry(record.feature.clone()).or_default() += 1;
        }

        let ring = self
            .durations
            .entry((record.feature.clone(), record.operation))
            .or_default();
        if ring.len() == DURATION_RING_CAP {
            ring.pop_front();
        }
        ring.push_back(record.duration_ms);
    }

    fn take_batch(&mut self) -> FlushBatch {
        let counts = std::mem::take(&mut self.pending);
        self.pending_total = 0;
        let durations = std::mem::take(&mut self.durations);
        FlushBatch { counts, durations }
    }

    fn restore_batch(&mut self, batch: FlushBatch) {
        for (feature, count) in batch.counts {
            *self.pending.entry(feature).or_default() += count;
            self.pending_total += count;
        }
        for (key, mut ring) in batch.durations {
            let current = self.durations.entry(key).or_default();
            // Put the older samples back in front, re-applying the cap.
            while let Some(sample) = ring.pop_back() {
                current.push_front(sample);
            }
            current.truncate(DURATION_RING_CAP);
        }
    }
}

struct FlushBatch {
    counts: HashMap<String, u64>,
    durations: HashMap<(String, Operation), VecDeque<f64>>,
}

impl FlushBatch {
    fn is_empty(&self) -> bool {
        self.counts.is_empty() && self.durations.is_empty()
    }
}

fn stats_key(feature: &str) -> String {
    format!("magick:stats:{feature}")
}

fn duration_sum_key(feature: &str, op: Operation) -> String {
    format!("magick:duration:sum:{feature}:{}", op.as_str())
}

fn duration_count_key(feature: &str, op: Operation) -> String {
    format!("magick:duration:count:{feature}:{}", op.as_str())
}

/// Asynchronous usage-metrics pipeline.
pub struct MetricsPipeline {
    sender: Mutex<Option<mpsc::UnboundedSender<MetricRecord>>>,
    state: Arc<Mutex<MetricsState>>,
    remote: Option<Arc<dyn RemoteBackend>>,
    tracking: bool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsPipeline {
    /// Build the pipeline and spawn its aggregator.
    ///
    /// `remote` enables cross-process aggregation; `None` keeps all
    /// counters in memory. When disabled in the config, recording is a
    /// no-op.
    pub fn new(config: MetricsConfig, remote: Option<Arc<dyn RemoteBackend>>) -> Arc<Self> {
        let tracking = config.redis_tracking.unwrap_or(remote.is_some()) && remote.is_some();
        let state = Arc::new(Mutex::new(MetricsState::default()));

        let (sender, handle) = if config.enabled {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = Aggregator {
                state: Arc::clone(&state),
                remote: remote.clone().filter(|_| tracking),
                batch_size: config.batch_size,
                flush_interval: config.flush_interval,
            };
            let handle = tokio::spawn(worker.run(rx));
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        Arc::new(Self {
            sender: Mutex::new(sender),
            state,
            remote: remote.filter(|_| tracking),
            tracking,
            handle: Mutex::new(handle),
        })
    }

    /// Record one observation. Wait-free for the caller; errors and a
    /// disabled pipeline are silently absorbed.
    pub fn record(&self, feature: &str, operation: Operation, duration_ms: f64, success: bool) {
        let sender = self.sender.lock();
        if let Some(sender) = sender.as_ref() {
            let _ = sender.send(MetricRecord {
                feature: feature.to_string(),
                operation,
                duration_ms,
                success,
            });
        }
    }

    /// Total evaluations of a feature: the Remote aggregate plus this
    /// process's not-yet-flushed delta.
    pub async fn usage_count(&self, feature: &str) -> u64 {
        let (local, flushed) = {
            let state = self.state.lock();
            (
                state.usage.get(feature).copied().unwrap_or(0),
                state.flushed.get(feature).copied().unwrap_or(0),
            )
        };

        let remote_count = match &self.remote {
            Some(remote) => match remote.get_value(&stats_key(feature)).await {
                Ok(value) => value.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0),
                Err(err) => {
                    debug!(error = %err, "remote usage read failed, using local count");
                    // The flushed part lives remotely; fall back to the
                    // full local count rather than undercounting.
                    return local;
                }
            },
            None => return local,
        };

        remote_count + local.saturating_sub(flushed)
    }

    /// Mean duration in milliseconds for one (feature, operation),
    /// combining the Remote aggregate with local unflushed samples.
    pub async fn average_duration(&self, feature: &str, operation: Operation) -> Option<f64> {
        let (local_sum, local_count) = {
            let state = self.state.lock();
            state
                .durations
                .get(&(feature.to_string(), operation))
                .map(|ring| (ring.iter().sum::<f64>(), ring.len() as u64))
                .unwrap_or((0.0, 0))
        };

        let (remote_sum, remote_count) = match &self.remote {
            Some(remote) => {
                let sum = remote
                    .get_value(&duration_sum_key(feature, operation))
                    .await
                    .ok()
                    .flatten()
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(0.0);
                let count = remote
                    .get_value(&duration_count_key(feature, operation))
                    .await
                    .ok()
                    .flatten()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);
                (sum, count)
            }
            None => (0.0, 0),
        };

        let total_count = local_count + remote_count;
        if total_count == 0 {
            return None;
        }
        Some((local_sum + remote_sum) / total_count as f64)
    }

    /// Features ordered by usage, descending, truncated to `limit`.
    pub async fn most_used_features(&self, limit: usize) -> Vec<(String, u64)> {
        let mut names: Vec<String> = {
            let state = self.state.lock();
            state.usage.keys().cloned().collect()
        };

        if let Some(remote) = &self.remote {
            match remote.keys_with_prefix("magick:stats:").await {
                Ok(keys) => {
                    for key in keys {
                        if let Some(name) = key.strip_prefix("magick:stats:") {
                            if !names.iter().any(|n| n == name) {
                                names.push(name.to_string());
                            }
                        }
                    }
                }
                Err(err) => debug!(error = %err, "remote key listing failed"),
            }
        }

        let mut ranked = Vec::with_capacity(names.len());
        for name in names {
            let count = self.usage_count(&name).await;
            ranked.push((name, count));
        }
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked
    }

    /// Evaluations recorded with `success = false` in this process.
    pub fn failure_count(&self, feature: &str) -> u64 {
        self.state.lock().failures.get(feature).copied().unwrap_or(0)
    }

    /// Whether aggregates are pushed to the Remote store.
    pub fn remote_tracking(&self) -> bool {
        self.tracking
    }

    /// Drop every counter. Test support.
    pub fn reset(&self) {
        *self.state.lock() = MetricsState::default();
    }

    /// Stop the aggregator, flushing what remains.
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct Aggregator {
    state: Arc<Mutex<MetricsState>>,
    remote: Option<Arc<dyn RemoteBackend>>,
    batch_size: usize,
    flush_interval: Duration,
}

impl Aggregator {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<MetricRecord>) {
        let mut last_flush = Instant::now();
        let mut ticker = tokio::time::interval(self.flush_interval.max(Duration::from_millis(50)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                record = rx.recv() => match record {
                    Some(record) => {
                        let due = {
                            let mut state = self.state.lock();
                            state.apply(&record);
                            state.pending_total as usize >= self.batch_size
                        };
                        if due {
                            self.flush().await;
                            last_flush = Instant::now();
                        }
                    }
                    None => {
                        self.flush().await;
                        debug!("metrics aggregator stopped");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    let overdue = last_flush.elapsed() >= self.flush_interval;
                    let has_pending = self.state.lock().pending_total > 0;
                    if overdue && has_pending {
                        self.flush().await;
                        last_flush = Instant::now();
                    }
                }
            }
        }
    }

    /// Push pending counters to Remote. With no Remote this is a no-op
    /// and the counters keep accumulating; a failed push restores the
    /// batch.
    async fn flush(&self) {
        let Some(remote) = &self.remote else { return };

        let batch = self.state.lock().take_batch();
        if batch.is_empty() {
            return;
        }

        let mut failed = false;
        for (feature, count) in &batch.counts {
            let key = stats_key(feature);
            match remote.incr_by(&key, *count as i64).await {
                Ok(_) => {
                    let _ = remote.expire(&key, METRICS_KEY_TTL).await;
                }
                Err(err) => {
                    warn!(feature = %feature, error = %err, "metrics flush failed");
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            for ((feature, op), ring) in &batch.durations {
                let sum: f64 = ring.iter().sum();
                let count = ring.len() as i64;
                if count == 0 {
                    continue;
                }
                let sum_key = duration_sum_key(feature, *op);
                let count_key = duration_count_key(feature, *op);

                let pushed = remote.incr_by_float(&sum_key, sum).await.is_ok()
                    && remote.incr_by(&count_key, count).await.is_ok();
                if pushed {
                    let _ = remote.expire(&sum_key, METRICS_KEY_TTL).await;
                    let _ = remote.expire(&count_key, METRICS_KEY_TTL).await;
                } else {
                    failed = true;
                    break;
                }
            }
        }

        let mut state = self.state.lock();
        if failed {
            state.restore_batch(batch);
        } else {
            for (feature, count) in batch.counts {
                *state.flushed.entry(feature).or_default() += count;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magick_core::config::MetricsConfig;
    use magick_storage::memory::MemoryRemote;

    fn config(batch_size: usize, flush_ms: u64) -> MetricsConfig {
        MetricsConfig {
            enabled: true,
            batch_size,
            flush_interval: Duration::from_millis(flush_ms),
            redis_tracking: None,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_local_counting_without_remote() {
        let pipeline = MetricsPipeline::new(config(100, 60_000), None);

        for _ in 0..3 {
            pipeline.record("dark_mode", Operation::Enabled, 0.1, true);
        }
        pipeline.record("beta", Operation::Value, 0.2, false);
        settle().await;

        assert_eq!(pipeline.usage_count("dark_mode").await, 3);
        assert_eq!(pipeline.usage_count("beta").await, 1);
        assert_eq!(pipeline.usage_count("ghost").await, 0);
        assert_eq!(pipeline.failure_count("beta"), 1);
        assert_eq!(pipeline.failure_count("dark_mode"), 0);
    }

    #[tokio::test]
    async fn test_batch_flush_to_remote() {
        let remote = Arc::new(MemoryRemote::new());
        let pipeline = MetricsPipeline::new(config(5, 60_000), Some(remote.clone()));

        for _ in 0..5 {
            pipeline.record("f", Operation::Enabled, 1.0, true);
        }
        settle().await;

        let stored = remote.get_value("magick:stats:f").await.unwrap();
        assert_eq!(stored, Some("5".to_string()));

        // No double counting after the flush.
        assert_eq!(pipeline.usage_count("f").await, 5);
    }

    #[tokio::test]
    async fn test_interval_flush() {
        let remote = Arc::new(MemoryRemote::new());
        let pipeline = MetricsPipeline::new(config(1000, 60), Some(remote.clone()));

        pipeline.record("f", Operation::Enabled, 1.0, true);
        tokio::time::sleep(Duration::from_millis(250)).await;

        let stored = remote.get_value("magick:stats:f").await.unwrap();
        assert_eq!(stored, Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_remote_outage_accumulates_locally() {
        let remote = Arc::new(MemoryRemote::new());
        let pipeline = MetricsPipeline::new(config(2, 60_000), Some(remote.clone()));

        remote.set_failing(true);
        for _ in 0..4 {
            pipeline.record("f", Operation::Enabled, 1.0, true);
        }
        settle().await;

        // Nothing lost: the count is fully visible locally.
        assert_eq!(pipeline.usage_count("f").await, 4);

        remote.set_failing(false);
        for _ in 0..2 {
            pipeline.record("f", Operation::Enabled, 1.0, true);
        }
        settle().await;

        assert_eq!(pipeline.usage_count("f").await, 6);

        // Shutdown pushes the last unflushed record.
        pipeline.shutdown().await;
        let stored = remote.get_value("magick:stats:f").await.unwrap();
        assert_eq!(stored, Some("6".to_string()));
    }

    #[tokio::test]
    async fn test_average_duration_combines_tiers() {
        let remote = Arc::new(MemoryRemote::new());
        let pipeline = MetricsPipeline::new(config(2, 60_000), Some(remote.clone()));

        pipeline.record("f", Operation::Enabled, 2.0, true);
        pipeline.record("f", Operation::Enabled, 4.0, true);
        settle().await;

        // Both samples flushed to Remote.
        let avg = pipeline.average_duration("f", Operation::Enabled).await;
        assert_eq!(avg, Some(3.0));

        // A third, unflushed sample folds in.
        pipeline.record("f", Operation::Enabled, 9.0, true);
        settle().await;
        let avg = pipeline.average_duration("f", Operation::Enabled).await.unwrap();
        assert!((avg - 5.0).abs() < 1e-9);

        assert_eq!(pipeline.average_duration("f", Operation::Value).await, None);
    }

    #[tokio::test]
    async fn test_most_used_features_ranks_and_truncates() {
        let pipeline = MetricsPipeline::new(config(1000, 60_000), None);

        for _ in 0..5 {
            pipeline.record("a", Operation::Enabled, 1.0, true);
        }
        for _ in 0..2 {
            pipeline.record("b", Operation::Enabled, 1.0, true);
        }
        pipeline.record("c", Operation::Enabled, 1.0, true);
        settle().await;

        let top = pipeline.most_used_features(2).await;
        assert_eq!(top, vec![("a".to_string(), 5), ("b".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_disabled_pipeline_records_nothing() {
        let mut cfg = config(10, 60_000);
        cfg.enabled = false;
        let pipeline = MetricsPipeline::new(cfg, None);

        pipeline.record("f", Operation::Enabled, 1.0, true);
        settle().await;

        assert_eq!(pipeline.usage_count("f").await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_remainder() {
        let remote = Arc::new(MemoryRemote::new());
        let pipeline = MetricsPipeline::new(config(1000, 60_000), Some(remote.clone()));

        pipeline.record("f", Operation::Enabled, 1.0, true);
        settle().await;
        pipeline.shutdown().await;

        let stored = remote.get_value("magick:stats:f").await.unwrap();
        assert_eq!(stored, Some("1".to_string()));
    }
}
