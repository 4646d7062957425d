use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use fm_core::events::{Event, EventKind};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Fixed-bucket histogram. Sums are kept in whole milliseconds so they fit
/// a plain atomic counter.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    buckets: Vec<AtomicU64>,
    sum_millis: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: Vec<f64>) -> Self {
        let buckets = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            sum_millis: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, seconds: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let millis = (seconds.max(0.0) * 1000.0).round() as u64;
        self.sum_millis.fetch_add(millis, Ordering::Relaxed);
        if let Some(idx) = self.bounds.iter().position(|b| seconds <= *b) {
            self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum_millis.load(Ordering::Relaxed) as f64 / 1000.0
    }

    /// Cumulative `(upper_bound, count)` pairs, Prometheus style.
    fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        self.bounds
            .iter()
            .zip(&self.buckets)
            .map(|(bound, n)| {
                running += n.load(Ordering::Relaxed);
                (*bound, running)
            })
            .collect()
    }
}

/// Workflow and job durations range from seconds to hours.
fn duration_bounds() -> Vec<f64> {
    vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

type CounterKey = (String, Vec<(String, String)>);

/// Process-local metrics registry.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<CounterKey, AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
    workflow_starts: RwLock<AHashMap<Uuid, DateTime<Utc>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let key = counter_key(name, labels);
        if let Some(c) = read(&self.counters).get(&key) {
            c.fetch_add(1, Ordering::Relaxed);
            return;
        }
        write(&self.counters)
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        read(&self.counters)
            .get(&counter_key(name, labels))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn add_gauge(&self, name: &str, delta: i64) {
        if let Some(g) = read(&self.gauges).get(name) {
            g.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        write(&self.gauges)
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        read(&self.gauges)
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn observe(&self, name: &str, seconds: f64) {
        if let Some(h) = read(&self.histograms).get(name) {
            h.observe(seconds);
            return;
        }
        write(&self.histograms)
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(duration_bounds()))
            .observe(seconds);
    }

    pub fn histogram_count(&self, name: &str) -> u64 {
        read(&self.histograms).get(name).map(Histogram::count).unwrap_or(0)
    }

    // -- Lifecycle events ---------------------------------------------------

    /// Fold one lifecycle event into the registry.
    pub fn record_event(&self, event: &Event) {
        match &event.kind {
            EventKind::WorkflowStarted { workflow_id, .. } => {
                self.increment_counter("foreman_workflows_started_total", &[]);
                self.add_gauge("foreman_workflows_active", 1);
                write(&self.workflow_starts).insert(*workflow_id, event.timestamp);
            }
            EventKind::WorkflowCompleted { workflow_id } => {
                self.finish_workflow(*workflow_id, "completed", event.timestamp);
            }
            EventKind::WorkflowFailed { workflow_id, .. } => {
                self.finish_workflow(*workflow_id, "failed", event.timestamp);
            }
            EventKind::AgentSpawned { agent_type, .. } => {
                self.increment_counter(
                    "foreman_agents_spawned_total",
                    &[("agent_type", agent_type.as_str())],
                );
            }
            EventKind::PhaseFailed { phase, .. } => {
                self.increment_counter(
                    "foreman_phase_failures_total",
                    &[("phase", phase.as_str())],
                );
            }
            EventKind::JobCompleted { job_type, .. } => {
                self.increment_counter(
                    "foreman_jobs_total",
                    &[("job_type", job_type), ("outcome", "completed")],
                );
            }
            EventKind::JobFailed {
                job_type, exhausted, ..
            } => {
                let outcome = if *exhausted { "failed" } else { "retrying" };
                self.increment_counter(
                    "foreman_jobs_total",
                    &[("job_type", job_type), ("outcome", outcome)],
                );
            }
            EventKind::FailureDetected { failure_type, .. } => {
                let ty = failure_type.to_string();
                self.increment_counter("foreman_failures_detected_total", &[("type", &ty)]);
            }
            EventKind::RecoveryAttempted {
                strategy, success, ..
            } => {
                let success = if *success { "true" } else { "false" };
                self.increment_counter(
                    "foreman_recovery_attempts_total",
                    &[("strategy", strategy), ("success", success)],
                );
            }
            EventKind::RecoveryEscalated { .. } => {
                self.increment_counter("foreman_recovery_escalations_total", &[]);
            }
            _ => {}
        }
    }

    /// Drain events from a bus subscription until every sender is gone.
    pub async fn consume(&self, rx: flume::Receiver<Event>) {
        while let Ok(event) = rx.recv_async().await {
            self.record_event(&event);
        }
    }

    fn finish_workflow(&self, workflow_id: Uuid, status: &str, at: DateTime<Utc>) {
        self.increment_counter("foreman_workflows_finished_total", &[("status", status)]);
        if let Some(started) = write(&self.workflow_starts).remove(&workflow_id) {
            self.add_gauge("foreman_workflows_active", -1);
            let secs = (at - started).num_milliseconds().max(0) as f64 / 1000.0;
            self.observe("foreman_workflow_duration_seconds", secs);
        }
    }

    // -- Export -------------------------------------------------------------

    /// Prometheus text exposition, sorted by metric name.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = read(&self.counters);
        let mut keys: Vec<&CounterKey> = counters.keys().collect();
        keys.sort();
        let mut last_name = "";
        for key in keys {
            let (name, labels) = key;
            if name != last_name {
                out.push_str(&format!("# TYPE {name} counter\n"));
                last_name = name;
            }
            let value = counters[key].load(Ordering::Relaxed);
            out.push_str(&format!("{name}{} {value}\n", label_str(labels)));
        }
        drop(counters);

        let gauges = read(&self.gauges);
        let mut names: Vec<&String> = gauges.keys().collect();
        names.sort();
        for name in names {
            let value = gauges[name].load(Ordering::Relaxed);
            out.push_str(&format!("# TYPE {name} gauge\n{name} {value}\n"));
        }
        drop(gauges);

        let histograms = read(&self.histograms);
        let mut names: Vec<&String> = histograms.keys().collect();
        names.sort();
        for name in names {
            let h = &histograms[name];
            out.push_str(&format!("# TYPE {name} histogram\n"));
            for (bound, count) in h.cumulative() {
                out.push_str(&format!("{name}_bucket{{le=\"{bound}\"}} {count}\n"));
            }
            out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", h.count()));
            out.push_str(&format!("{name}_sum {}\n{name}_count {}\n", h.sum(), h.count()));
        }

        out
    }

    pub fn export_json(&self) -> serde_json::Value {
        let counters: serde_json::Map<String, serde_json::Value> = read(&self.counters)
            .iter()
            .map(|((name, labels), v)| {
                (
                    format!("{name}{}", label_str(labels)),
                    serde_json::json!(v.load(Ordering::Relaxed)),
                )
            })
            .collect();
        let gauges: serde_json::Map<String, serde_json::Value> = read(&self.gauges)
            .iter()
            .map(|(name, v)| (name.clone(), serde_json::json!(v.load(Ordering::Relaxed))))
            .collect();
        let histograms: serde_json::Map<String, serde_json::Value> = read(&self.histograms)
            .iter()
            .map(|(name, h)| {
                (
                    name.clone(),
                    serde_json::json!({ "count": h.count(), "sum": h.sum() }),
                )
            })
            .collect();

        serde_json::json!({
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }
}

fn counter_key(name: &str, labels: &[(&str, &str)]) -> CounterKey {
    let mut pairs: Vec<(String, String)> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    pairs.sort();
    (name.to_string(), pairs)
}

fn label_str(labels: &[(String, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let inner: Vec<String> = labels.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
    format!("{{{}}}", inner.join(","))
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
