//! Relay metrics with a Prometheus text rendering.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Recent latencies kept for percentile estimates
const LATENCY_WINDOW: usize = 4096;

#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    total_requests: AtomicU64,
    active_tunnels: AtomicU64,
    /// Indexed by status class: 1xx..5xx
    by_status: [AtomicU64; 5],
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    latencies: Mutex<LatencyWindow>,
    per_subdomain: Mutex<HashMap<String, SubdomainMetrics>>,
}

/// Ring buffer of recent latencies in microseconds
#[derive(Default)]
struct LatencyWindow {
    values: Vec<u64>,
    next: usize,
}

impl LatencyWindow {
    fn record(&mut self, latency_us: u64) {
        if self.values.len() < LATENCY_WINDOW {
            self.values.push(latency_us);
        } else {
            self.values[self.next] = latency_us;
        }
        self.next = (self.next + 1) % LATENCY_WINDOW;
    }

    fn percentile(&self, p: f64) -> u64 {
        if self.values.is_empty() {
            return 0;
        }
        let mut sorted = self.values.clone();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 * p / 100.0) as usize).min(sorted.len() - 1);
        sorted[idx]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubdomainMetrics {
    pub requests: u64,
    pub errors: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed external request.
    ///
    /// `tunnel` is the subdomain of the registered tunnel that served it; requests
    /// that never matched a tunnel only count toward the global figures.
    pub async fn record_request(
        &self,
        tunnel: Option<&str>,
        status: u16,
        latency_us: u64,
        bytes_in: u64,
        bytes_out: u64,
    ) {
        let inner = &self.inner;
        inner.total_requests.fetch_add(1, Ordering::Relaxed);
        inner.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        inner.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
        if let Some(counter) = (status / 100)
            .checked_sub(1)
            .and_then(|class| inner.by_status.get(class as usize))
        {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        inner.latencies.lock().await.record(latency_us);

        let Some(subdomain) = tunnel else {
            return;
        };
        let mut subs = inner.per_subdomain.lock().await;
        let entry = subs.entry(subdomain.to_string()).or_default();
        entry.requests += 1;
        if status >= 500 {
            entry.errors += 1;
        }
    }

    pub fn tunnel_opened(&self) {
        self.inner.active_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_closed(&self) {
        self.inner.active_tunnels.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_tunnels(&self) -> u64 {
        self.inner.active_tunnels.load(Ordering::Relaxed)
    }

    pub async fn subdomain(&self, subdomain: &str) -> Option<SubdomainMetrics> {
        self.inner.per_subdomain.lock().await.get(subdomain).cloned()
    }

    /// Render in the Prometheus text exposition format
    pub async fn to_prometheus(&self, registered: usize) -> String {
        let inner = &self.inner;
        let mut out = String::new();

        let _ = writeln!(out, "# TYPE skyconnect_requests_total counter");
        let _ = writeln!(out, "skyconnect_requests_total {}", inner.total_requests.load(Ordering::Relaxed));

        let _ = writeln!(out, "# TYPE skyconnect_requests_by_status counter");
        for (i, counter) in inner.by_status.iter().enumerate() {
            let _ = writeln!(
                out,
                "skyconnect_requests_by_status{{status=\"{}xx\"}} {}",
                i + 1,
                counter.load(Ordering::Relaxed)
            );
        }

        let _ = writeln!(out, "# TYPE skyconnect_active_tunnels gauge");
        let _ = writeln!(out, "skyconnect_active_tunnels {}", self.active_tunnels());
        let _ = writeln!(out, "# TYPE skyconnect_registered_subdomains gauge");
        let _ = writeln!(out, "skyconnect_registered_subdomains {}", registered);

        let _ = writeln!(out, "# TYPE skyconnect_bytes_total counter");
        let _ = writeln!(out, "skyconnect_bytes_total{{direction=\"in\"}} {}", inner.bytes_in.load(Ordering::Relaxed));
        let _ = writeln!(out, "skyconnect_bytes_total{{direction=\"out\"}} {}", inner.bytes_out.load(Ordering::Relaxed));

        let latencies = inner.latencies.lock().await;
        let _ = writeln!(out, "# TYPE skyconnect_latency_us summary");
        for (label, p) in [("0.5", 50.0), ("0.95", 95.0), ("0.99", 99.0)] {
            let _ = writeln!(out, "skyconnect_latency_us{{quantile=\"{}\"}} {}", label, latencies.percentile(p));
        }
        drop(latencies);

        let subs = inner.per_subdomain.lock().await;
        let mut names: Vec<&String> = subs.keys().collect();
        names.sort();
        let _ = writeln!(out, "# TYPE skyconnect_subdomain_requests_total counter");
        for name in &names {
            let _ = writeln!(out, "skyconnect_subdomain_requests_total{{subdomain=\"{}\"}} {}", escape(name), subs[*name].requests);
        }
        let _ = writeln!(out, "# TYPE skyconnect_subdomain_errors_total counter");
        for name in &names {
            let _ = writeln!(out, "skyconnect_subdomain_errors_total{{subdomain=\"{}\"}} {}", escape(name), subs[*name].errors);
        }

        out
    }
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}
