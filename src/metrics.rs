//! Per-node counters and write latency sampling.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const LATENCY_SAMPLES: usize = 1024;

/// The most recent write latencies, oldest dropped first
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: Arc<Mutex<VecDeque<Duration>>>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn observe(&self, latency: Duration) {
        let mut samples = self.samples.lock();
        while samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(latency);
    }

    /// Nearest-rank quantile; zero while nothing was observed
    pub fn quantile(&self, q: f64) -> Duration {
        let mut ordered: Vec<Duration> = self.samples.lock().iter().copied().collect();
        if ordered.is_empty() {
            return Duration::ZERO;
        }
        let rank = (ordered.len() as f64 * q.clamp(0.0, 1.0)).ceil() as usize;
        let (_, nth, _) = ordered.select_nth_unstable(rank.saturating_sub(1));
        *nth
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-node counters.
///
/// Cloning shares the counters, so a handle can be sent to a monitoring
/// thread while the node keeps running on its own thread.
#[derive(Debug, Clone)]
pub struct NodeMetrics {
    chunks_written: Arc<AtomicU64>,
    bytes_written: Arc<AtomicU64>,
    chunks_pushed: Arc<AtomicU64>,
    write_backpressure: Arc<AtomicU64>,
    push_backpressure: Arc<AtomicU64>,
    write_latency: LatencyWindow,
    start_time: Instant,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self {
            chunks_written: Arc::new(AtomicU64::new(0)),
            bytes_written: Arc::new(AtomicU64::new(0)),
            chunks_pushed: Arc::new(AtomicU64::new(0)),
            write_backpressure: Arc::new(AtomicU64::new(0)),
            push_backpressure: Arc::new(AtomicU64::new(0)),
            write_latency: LatencyWindow::with_capacity(LATENCY_SAMPLES),
            start_time: Instant::now(),
        }
    }

    /// Record a completed write of `bytes` taking `latency`
    pub fn record_write(&self, bytes: usize, latency: Duration) {
        self.chunks_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
        self.write_latency.observe(latency);
    }

    /// Record a chunk pushed out of the readable side
    pub fn record_push(&self) {
        self.chunks_pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `write()` reporting backpressure
    pub fn record_write_backpressure(&self) {
        self.write_backpressure.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `push()` reporting backpressure
    pub fn record_push_backpressure(&self) {
        self.push_backpressure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_written(&self) -> u64 {
        self.chunks_written.load(Ordering::Relaxed)
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn total_pushed(&self) -> u64 {
        self.chunks_pushed.load(Ordering::Relaxed)
    }

    /// Written chunks per second since creation
    pub fn throughput_cps(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_written() as f64 / elapsed
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_written: self.total_written(),
            bytes_written: self.total_bytes_written(),
            chunks_pushed: self.total_pushed(),
            write_backpressure: self.write_backpressure.load(Ordering::Relaxed),
            push_backpressure: self.push_backpressure.load(Ordering::Relaxed),
            throughput_cps: self.throughput_cps(),
            write_p50: self.write_latency.quantile(0.50),
            write_p99: self.write_latency.quantile(0.99),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        NodeMetrics::new()
    }
}

/// Point-in-time copy of a node's counters
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub chunks_written: u64,
    pub bytes_written: u64,
    pub chunks_pushed: u64,
    pub write_backpressure: u64,
    pub push_backpressure: u64,
    pub throughput_cps: f64,
    pub write_p50: Duration,
    pub write_p99: Duration,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// One-line summary, as used by `StreamChain::metrics_summary`
    pub fn format(&self) -> String {
        format!(
            "Written: {} ({} bytes), Pushed: {}, Backpressure: {} write / {} push, \
             {:.1} chunks/s, write p50 {:?} p99 {:?}",
            self.chunks_written,
            self.bytes_written,
            self.chunks_pushed,
            self.write_backpressure,
            self.push_backpressure,
            self.throughput_cps,
            self.write_p50,
            self.write_p99,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_window_keeps_recent_samples() {
        let window = LatencyWindow::with_capacity(4);
        assert_eq!(window.quantile(0.5), Duration::ZERO);
        for ms in [100, 1, 2, 3, 4] {
            window.observe(Duration::from_millis(ms));
        }
        assert_eq!(window.len(), 4);
        assert_eq!(window.quantile(0.5), Duration::from_millis(2));
        assert_eq!(window.quantile(1.0), Duration::from_millis(4));
    }

    #[test]
    fn test_metrics_shared_across_threads() {
        let metrics = NodeMetrics::new();
        let remote = metrics.clone();
        for _ in 0..100 {
            metrics.record_write(4, Duration::from_micros(1));
        }
        let seen = std::thread::spawn(move || remote.snapshot())
            .join()
            .expect("Thread join failed");
        assert_eq!(seen.chunks_written, 100);
        assert_eq!(seen.bytes_written, 400);
        assert!(seen.format().contains("Written: 100"));
    }
}
