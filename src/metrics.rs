//! Prometheus-compatible metrics endpoint
//!
//! Exposes replication metrics in Prometheus format for Grafana dashboards.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::replication::TickReport;

/// Rolling window for tick-time percentiles
const TICK_HISTORY_LEN: usize = 1000;

/// Metrics registry for the replication engine
#[derive(Debug)]
pub struct ReplicationMetrics {
    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    // Stage timing (microseconds, last tick)
    pub visibility_time_us: AtomicU64,
    pub queuing_time_us: AtomicU64,
    pub dispatch_time_us: AtomicU64,

    // Gauges
    pub observers_active: AtomicU64,
    pub tracked_entities: AtomicU64,
    pub visible_pairs: AtomicU64,

    // Counters
    pub records_collected: AtomicU64,
    pub observers_pruned: AtomicU64,
    pub full_snapshots: AtomicU64,
    pub deltas: AtomicU64,
    pub removals: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub overflow_resyncs: AtomicU64,

    start_time: Instant,

    tick_history: RwLock<VecDeque<u64>>,
}

impl ReplicationMetrics {
    pub fn new() -> Self {
        Self {
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            visibility_time_us: AtomicU64::new(0),
            queuing_time_us: AtomicU64::new(0),
            dispatch_time_us: AtomicU64::new(0),
            observers_active: AtomicU64::new(0),
            tracked_entities: AtomicU64::new(0),
            visible_pairs: AtomicU64::new(0),
            records_collected: AtomicU64::new(0),
            observers_pruned: AtomicU64::new(0),
            full_snapshots: AtomicU64::new(0),
            deltas: AtomicU64::new(0),
            removals: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            overflow_resyncs: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY_LEN)),
        }
    }

    /// Fold one tick's report into the registry
    pub fn record_tick(&self, report: &TickReport) {
        self.record_tick_time(report.total_time);

        #[cfg(feature = "metrics_extended")]
        {
            self.visibility_time_us
                .store(report.visibility_time.as_micros() as u64, Ordering::Relaxed);
            self.queuing_time_us
                .store(report.queuing_time.as_micros() as u64, Ordering::Relaxed);
            self.dispatch_time_us
                .store(report.dispatch_time.as_micros() as u64, Ordering::Relaxed);
        }

        self.observers_active.store(report.observers as u64, Ordering::Relaxed);
        self.tracked_entities.store(report.tracked_entities as u64, Ordering::Relaxed);
        self.visible_pairs.store(report.compute.visible_pairs as u64, Ordering::Relaxed);

        let add = |counter: &AtomicU64, value: usize| {
            counter.fetch_add(value as u64, Ordering::Relaxed);
        };
        add(&self.records_collected, report.compute.records_collected);
        add(&self.observers_pruned, report.pruned);
        add(&self.full_snapshots, report.dispatch.full_snapshots);
        add(&self.deltas, report.dispatch.deltas);
        add(&self.removals, report.dispatch.removals);
        add(&self.messages_sent, report.dispatch.messages_sent);
        add(&self.messages_dropped, report.dispatch.messages_dropped);
        add(&self.bytes_sent, report.dispatch.bytes_sent);
        add(&self.overflow_resyncs, report.dispatch.overflow_resyncs);
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY_LEN {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        // Tick timing
        metric!("viewcast_tick_time_microseconds", "Last tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("viewcast_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("viewcast_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("viewcast_tick_time_max_microseconds", "Maximum tick time in the window", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("viewcast_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));

        // Per-stage timing, labelled
        output.push_str("# HELP viewcast_stage_time_microseconds Last tick time per stage\n");
        output.push_str("# TYPE viewcast_stage_time_microseconds gauge\n");
        for (stage, value) in [
            ("visibility", &self.visibility_time_us),
            ("queuing", &self.queuing_time_us),
            ("dispatch", &self.dispatch_time_us),
        ] {
            output.push_str(&format!(
                "viewcast_stage_time_microseconds{{stage=\"{}\"}} {}\n",
                stage,
                value.load(Ordering::Relaxed)
            ));
        }

        // Population
        metric!("viewcast_observers", "Active observers", "gauge",
            self.observers_active.load(Ordering::Relaxed));
        metric!("viewcast_tracked_entities", "Entities carrying a visibility record", "gauge",
            self.tracked_entities.load(Ordering::Relaxed));
        metric!("viewcast_visible_pairs", "Observer/entity pairs visible last tick", "gauge",
            self.visible_pairs.load(Ordering::Relaxed));
        metric!("viewcast_records_collected_total", "Visibility records garbage collected", "counter",
            self.records_collected.load(Ordering::Relaxed));
        metric!("viewcast_observers_pruned_total", "Observers pruned after disconnect or host loss", "counter",
            self.observers_pruned.load(Ordering::Relaxed));

        // Replication traffic
        metric!("viewcast_full_snapshots_total", "Full snapshot records dispatched", "counter",
            self.full_snapshots.load(Ordering::Relaxed));
        metric!("viewcast_deltas_total", "Delta records dispatched", "counter",
            self.deltas.load(Ordering::Relaxed));
        metric!("viewcast_removals_total", "Entity removals dispatched", "counter",
            self.removals.load(Ordering::Relaxed));
        metric!("viewcast_messages_sent_total", "Messages accepted by sinks", "counter",
            self.messages_sent.load(Ordering::Relaxed));
        metric!("viewcast_messages_dropped_total", "Messages lost to full or closed sinks", "counter",
            self.messages_dropped.load(Ordering::Relaxed));
        metric!("viewcast_bytes_sent_total", "Total bytes handed to sinks", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("viewcast_overflow_resyncs_total", "Full resyncs caused by the pending-update cap", "counter",
            self.overflow_resyncs.load(Ordering::Relaxed));
        metric!("viewcast_uptime_seconds", "Process uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        format!(r#"{{
  "performance": {{
    "tick_time_us": {},
    "tick_time_p95_us": {},
    "tick_time_p99_us": {},
    "tick_time_max_us": {},
    "tick_count": {},
    "visibility_us": {},
    "queuing_us": {},
    "dispatch_us": {}
  }},
  "population": {{
    "observers": {},
    "tracked_entities": {},
    "visible_pairs": {},
    "records_collected": {},
    "observers_pruned": {}
  }},
  "replication": {{
    "full_snapshots": {},
    "deltas": {},
    "removals": {},
    "overflow_resyncs": {}
  }},
  "network": {{
    "messages_sent": {},
    "messages_dropped": {},
    "bytes_sent": {}
  }},
  "uptime_seconds": {}
}}"#,
            self.tick_time_us.load(Ordering::Relaxed),
            self.tick_time_p95_us.load(Ordering::Relaxed),
            self.tick_time_p99_us.load(Ordering::Relaxed),
            self.tick_time_max_us.load(Ordering::Relaxed),
            self.tick_count.load(Ordering::Relaxed),
            self.visibility_time_us.load(Ordering::Relaxed),
            self.queuing_time_us.load(Ordering::Relaxed),
            self.dispatch_time_us.load(Ordering::Relaxed),
            self.observers_active.load(Ordering::Relaxed),
            self.tracked_entities.load(Ordering::Relaxed),
            self.visible_pairs.load(Ordering::Relaxed),
            self.records_collected.load(Ordering::Relaxed),
            self.observers_pruned.load(Ordering::Relaxed),
            self.full_snapshots.load(Ordering::Relaxed),
            self.deltas.load(Ordering::Relaxed),
            self.removals.load(Ordering::Relaxed),
            self.overflow_resyncs.load(Ordering::Relaxed),
            self.messages_sent.load(Ordering::Relaxed),
            self.messages_dropped.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
            self.uptime_seconds(),
        )
    }
}

impl Default for ReplicationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<ReplicationMetrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);

                    // Longest prefix first: /metrics/json before /metrics
                    let response = if request.starts_with("GET /metrics/json") || request.starts_with("GET /json") {
                        http_response("200 OK", "application/json", &metrics.to_json())
                    } else if request.starts_with("GET /metrics") {
                        http_response("200 OK", "text/plain; version=0.0.4", &metrics.to_prometheus())
                    } else if request.starts_with("GET /health") {
                        http_response("200 OK", "text/plain", "OK")
                    } else {
                        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
                    };

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::compute::ComputeStats;
    use crate::replication::dispatch::DispatchStats;

    #[test]
    fn test_metrics_new() {
        let metrics = ReplicationMetrics::new();
        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.messages_sent.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_tick_time() {
        let metrics = ReplicationMetrics::new();
        for i in 0..100 {
            metrics.record_tick_time(Duration::from_micros(100 + i * 10));
        }

        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 100);
        assert!(metrics.tick_time_p95_us.load(Ordering::Relaxed) > 0);
        assert!(metrics.tick_time_p99_us.load(Ordering::Relaxed) >= metrics.tick_time_p95_us.load(Ordering::Relaxed));
        assert_eq!(metrics.tick_time_max_us.load(Ordering::Relaxed), 1090);
    }

    #[test]
    fn test_history_window_bounded() {
        let metrics = ReplicationMetrics::new();
        for _ in 0..(TICK_HISTORY_LEN + 50) {
            metrics.record_tick_time(Duration::from_micros(5));
        }
        assert_eq!(metrics.tick_history.read().len(), TICK_HISTORY_LEN);
    }

    #[test]
    fn test_record_tick_accumulates() {
        let metrics = ReplicationMetrics::new();
        let report = TickReport {
            tick: 1,
            observers: 3,
            tracked_entities: 7,
            compute: ComputeStats { visible_pairs: 9, records_collected: 2, ..Default::default() },
            dispatch: DispatchStats {
                messages_sent: 3,
                bytes_sent: 120,
                full_snapshots: 4,
                deltas: 5,
                ..Default::default()
            },
            ..Default::default()
        };

        metrics.record_tick(&report);
        metrics.record_tick(&report);

        assert_eq!(metrics.observers_active.load(Ordering::Relaxed), 3, "Gauges are overwritten");
        assert_eq!(metrics.messages_sent.load(Ordering::Relaxed), 6, "Counters accumulate");
        assert_eq!(metrics.bytes_sent.load(Ordering::Relaxed), 240);
        assert_eq!(metrics.records_collected.load(Ordering::Relaxed), 4);
        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = ReplicationMetrics::new();
        metrics.observers_active.store(50, Ordering::Relaxed);
        metrics.full_snapshots.store(12, Ordering::Relaxed);

        let output = metrics.to_prometheus();

        assert!(output.contains("viewcast_observers 50"));
        assert!(output.contains("viewcast_full_snapshots_total 12"));
        assert!(output.contains("viewcast_stage_time_microseconds{stage=\"queuing\"}"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_json_format() {
        let metrics = ReplicationMetrics::new();
        metrics.observers_active.store(100, Ordering::Relaxed);

        let output = metrics.to_json();

        assert!(output.contains("\"observers\": 100"));
        assert!(output.contains("\"performance\":"));
        assert!(output.contains("\"network\":"));
    }
}
