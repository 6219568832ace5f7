//! Metrics module
//!
//! Process-wide Prometheus counters for the upload pipeline. Every update is
//! a lock-free atomic increment, so unrelated uploads never contend.

pub mod server;

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec,
    register_int_gauge, Counter, CounterVec, Histogram, HistogramVec, IntGauge,
};

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "hayate_uploads_total",
        "Total number of remote uploads",
        &["destination", "status"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "hayate_upload_bytes_total",
        "Total bytes uploaded to object storage"
    ).unwrap();

    pub static ref OPEN_UPLOADS: IntGauge = register_int_gauge!(
        "hayate_open_uploads",
        "Remote uploads currently in flight"
    ).unwrap();

    pub static ref UPLOAD_FAILURES: CounterVec = register_counter_vec!(
        "hayate_upload_failures_total",
        "Failed remote uploads by failure category",
        &["category"]
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "hayate_upload_duration_seconds",
        "Remote upload duration in seconds",
        &["destination"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).unwrap();

    // Multipart metrics
    pub static ref MULTIPART_PARTS: Histogram = register_histogram!(
        "hayate_multipart_parts",
        "Number of parts per multipart upload",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]
    ).unwrap();

    // Cleanup metrics
    pub static ref CLEANUP_TOTAL: CounterVec = register_counter_vec!(
        "hayate_cleanup_total",
        "Delete/abort requests sent to object storage",
        &["action", "status"]
    ).unwrap();

    // Request metrics
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "hayate_requests_total",
        "HTTP requests handled by the proxy",
        &["route", "status"]
    ).unwrap();
}

/// Record a successful remote upload
pub fn record_upload_success(destination: &str) {
    UPLOADS_TOTAL.with_label_values(&[destination, "success"]).inc();
}

/// Record a failed remote upload
pub fn record_upload_failure(destination: &str, category: &str) {
    UPLOADS_TOTAL.with_label_values(&[destination, "failure"]).inc();
    UPLOAD_FAILURES.with_label_values(&[category]).inc();
}

/// Record bytes accepted by a remote upload
pub fn record_upload_bytes(bytes: u64) {
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record upload duration
pub fn record_upload_duration(destination: &str, duration_secs: f64) {
    UPLOAD_DURATION
        .with_label_values(&[destination])
        .observe(duration_secs);
}

/// Record the part count of a completed multipart upload
pub fn record_multipart_parts(parts_count: usize) {
    MULTIPART_PARTS.observe(parts_count as f64);
}

/// Record a delete/abort attempt
pub fn record_cleanup(action: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    CLEANUP_TOTAL.with_label_values(&[action, status]).inc();
}

/// Record a handled request
pub fn record_request(route: &str, status: u16) {
    REQUESTS_TOTAL
        .with_label_values(&[route, &status.to_string()])
        .inc();
}
