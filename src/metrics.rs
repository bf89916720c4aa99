use anyhow::{Context, Result};
use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Metric name prefix for all potsync metrics
const PREFIX: &str = "potsync";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Worker pool metrics
    pub static ref TASKS_SUBMITTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_tasks_submitted_total"), "Tasks accepted by a worker pool"),
        &["pool"]
    ).expect("Failed to create tasks_submitted_total metric");

    pub static ref TASKS_FINISHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_tasks_finished_total"), "Tasks that reached a terminal state"),
        &["pool", "outcome"]
    ).expect("Failed to create tasks_finished_total metric");

    pub static ref TASK_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_task_duration_seconds"),
            "Time spent executing a task on a worker"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        &["pool"]
    ).expect("Failed to create task_duration_seconds metric");

    pub static ref POOL_QUEUED_TASKS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_pool_queued_tasks"), "Tasks waiting in the backlog"),
        &["pool"]
    ).expect("Failed to create pool_queued_tasks metric");

    pub static ref POOL_RUNNING_TASKS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_pool_running_tasks"), "Tasks currently executing"),
        &["pool"]
    ).expect("Failed to create pool_running_tasks metric");

    pub static ref POOL_WORKERS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_pool_workers"), "Live worker threads"),
        &["pool"]
    ).expect("Failed to create pool_workers metric");
}

/// Register all metrics with the registry.
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(TASKS_SUBMITTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TASKS_FINISHED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TASK_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(POOL_QUEUED_TASKS.clone()));
    let _ = REGISTRY.register(Box::new(POOL_RUNNING_TASKS.clone()));
    let _ = REGISTRY.register(Box::new(POOL_WORKERS.clone()));
}

pub fn record_task_submitted(pool: &str) {
    TASKS_SUBMITTED_TOTAL.with_label_values(&[pool]).inc();
}

/// Record a task reaching a terminal state, `outcome` is "success" or "panic".
pub fn record_task_finished(pool: &str, outcome: &str, duration: Duration) {
    TASKS_FINISHED_TOTAL
        .with_label_values(&[pool, outcome])
        .inc();

    TASK_DURATION_SECONDS
        .with_label_values(&[pool])
        .observe(duration.as_secs_f64());
}

pub fn set_pool_load(pool: &str, queued: usize, running: usize) {
    POOL_QUEUED_TASKS.with_label_values(&[pool]).set(queued as f64);
    POOL_RUNNING_TASKS.with_label_values(&[pool]).set(running as f64);
}

pub fn set_pool_workers(pool: &str, workers: usize) {
    POOL_WORKERS.with_label_values(&[pool]).set(workers as f64);
}

/// Encode every registered metric in the Prometheus text format.
pub fn render_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("Failed to encode metrics")?;
    String::from_utf8(buffer).context("Metrics output is not valid UTF-8")
}
