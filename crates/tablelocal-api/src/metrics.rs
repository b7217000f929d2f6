//! Table service metrics for Prometheus
//!
//! Tracks operations, latencies and error rates per operation type.

use crate::resource::{Resource, parse_path};
use axum::http::Method;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Table service operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableOperation {
    CreateTable,
    QueryTables,
    GetTable,
    DeleteTable,
    InsertEntity,
    QueryEntities,
    GetEntity,
    UpdateEntity,
    MergeEntity,
    DeleteEntity,
    Batch,
}

impl TableOperation {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CreateTable => "CreateTable",
            Self::QueryTables => "QueryTables",
            Self::GetTable => "GetTable",
            Self::DeleteTable => "DeleteTable",
            Self::InsertEntity => "InsertEntity",
            Self::QueryEntities => "QueryEntities",
            Self::GetEntity => "GetEntity",
            Self::UpdateEntity => "UpdateEntity",
            Self::MergeEntity => "MergeEntity",
            Self::DeleteEntity => "DeleteEntity",
            Self::Batch => "Batch",
        }
    }

    /// Classify a request. `method` is the effective method, after any
    /// `X-HTTP-Method` tunnelling.
    #[must_use]
    pub fn classify(method: &Method, path: &str, account: &str) -> Option<Self> {
        let resource = parse_path(path, account).ok()?;
        let op = match (method.as_str(), &resource) {
            ("POST", Resource::Tables) => Self::CreateTable,
            ("GET", Resource::Tables) => Self::QueryTables,
            ("GET", Resource::Table(_)) => Self::GetTable,
            ("DELETE", Resource::Table(_)) => Self::DeleteTable,
            ("POST", Resource::Entities(_)) => Self::InsertEntity,
            ("GET", Resource::Entities(_)) => Self::QueryEntities,
            ("GET", Resource::Entity(..)) => Self::GetEntity,
            ("PUT", Resource::Entity(..)) => Self::UpdateEntity,
            ("MERGE" | "PATCH", Resource::Entity(..)) => Self::MergeEntity,
            ("DELETE", Resource::Entity(..)) => Self::DeleteEntity,
            ("POST", Resource::Batch) => Self::Batch,
            _ => return None,
        };
        Some(op)
    }
}

/// Per-operation metrics
#[derive(Debug, Default)]
struct OperationMetrics {
    /// Total requests
    requests_total: AtomicU64,
    /// Successful requests (2xx)
    requests_success: AtomicU64,
    /// Client errors (4xx)
    requests_client_error: AtomicU64,
    /// Server errors (5xx)
    requests_server_error: AtomicU64,
    /// Total request bytes
    request_bytes_total: AtomicU64,
    /// Latency sum in microseconds
    latency_sum_us: AtomicU64,
    /// Latency histogram, one non-cumulative count per bucket
    /// Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 5s, 10s
    latency_buckets: [AtomicU64; 11],
}

const LATENCY_BUCKET_BOUNDARIES_MS: [u64; 11] =
    [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000, 10000];

impl OperationMetrics {
    fn record(&self, status_code: u16, request_bytes: u64, latency_us: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        if (200..300).contains(&status_code) {
            self.requests_success.fetch_add(1, Ordering::Relaxed);
        } else if (400..500).contains(&status_code) {
            self.requests_client_error.fetch_add(1, Ordering::Relaxed);
        } else if status_code >= 500 {
            self.requests_server_error.fetch_add(1, Ordering::Relaxed);
        }

        self.request_bytes_total
            .fetch_add(request_bytes, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let latency_ms = latency_us / 1000;
        if let Some(i) = LATENCY_BUCKET_BOUNDARIES_MS
            .iter()
            .position(|&boundary| latency_ms <= boundary)
        {
            self.latency_buckets[i].fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Metrics collector for one server instance
#[derive(Debug)]
pub struct TableMetrics {
    operations: RwLock<HashMap<TableOperation, OperationMetrics>>,
    start_time: Instant,
}

impl Default for TableMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TableMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Record one completed operation
    pub fn record_operation(
        &self,
        op: TableOperation,
        status_code: u16,
        request_bytes: u64,
        latency_us: u64,
    ) {
        // Fast path: the entry already exists
        if let Some(metrics) = self.operations.read().get(&op) {
            metrics.record(status_code, request_bytes, latency_us);
            return;
        }
        self.operations
            .write()
            .entry(op)
            .or_default()
            .record(status_code, request_bytes, latency_us);
    }

    /// Total requests recorded for one operation
    #[must_use]
    pub fn request_count(&self, op: TableOperation) -> u64 {
        self.operations
            .read()
            .get(&op)
            .map_or(0, |m| m.requests_total.load(Ordering::Relaxed))
    }

    /// Export metrics in Prometheus text format
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        let mut output = String::with_capacity(4 * 1024);

        let _ = writeln!(
            output,
            "# HELP tablelocal_uptime_seconds Server uptime in seconds"
        );
        let _ = writeln!(output, "# TYPE tablelocal_uptime_seconds counter");
        let _ = writeln!(
            output,
            "tablelocal_uptime_seconds {}",
            self.start_time.elapsed().as_secs()
        );

        let ops = self.operations.read();
        let mut sorted: Vec<_> = ops.iter().collect();
        sorted.sort_by_key(|(op, _)| op.as_str());

        let _ = writeln!(
            output,
            "# HELP tablelocal_requests_total Total requests by operation and status"
        );
        let _ = writeln!(output, "# TYPE tablelocal_requests_total counter");
        for (op, metrics) in &sorted {
            let op_name = op.as_str();
            for (status, counter) in [
                ("success", &metrics.requests_success),
                ("client_error", &metrics.requests_client_error),
                ("server_error", &metrics.requests_server_error),
            ] {
                let _ = writeln!(
                    output,
                    "tablelocal_requests_total{{operation=\"{op_name}\",status=\"{status}\"}} {}",
                    counter.load(Ordering::Relaxed)
                );
            }
        }

        let _ = writeln!(
            output,
            "# HELP tablelocal_request_bytes_total Total request body bytes"
        );
        let _ = writeln!(output, "# TYPE tablelocal_request_bytes_total counter");
        for (op, metrics) in &sorted {
            let _ = writeln!(
                output,
                "tablelocal_request_bytes_total{{operation=\"{}\"}} {}",
                op.as_str(),
                metrics.request_bytes_total.load(Ordering::Relaxed)
            );
        }

        let _ = writeln!(
            output,
            "# HELP tablelocal_request_duration_seconds Request duration histogram"
        );
        let _ = writeln!(output, "# TYPE tablelocal_request_duration_seconds histogram");
        for (op, metrics) in &sorted {
            let op_name = op.as_str();
            let total = metrics.requests_total.load(Ordering::Relaxed);
            let sum_us = metrics.latency_sum_us.load(Ordering::Relaxed);

            let mut cumulative = 0u64;
            for (bucket, &boundary_ms) in metrics
                .latency_buckets
                .iter()
                .zip(LATENCY_BUCKET_BOUNDARIES_MS.iter())
            {
                cumulative += bucket.load(Ordering::Relaxed);
                let _ = writeln!(
                    output,
                    "tablelocal_request_duration_seconds_bucket{{operation=\"{op_name}\",le=\"{}\"}} {cumulative}",
                    boundary_ms as f64 / 1000.0
                );
            }
            let _ = writeln!(
                output,
                "tablelocal_request_duration_seconds_bucket{{operation=\"{op_name}\",le=\"+Inf\"}} {total}"
            );
            let _ = writeln!(
                output,
                "tablelocal_request_duration_seconds_sum{{operation=\"{op_name}\"}} {}",
                sum_us as f64 / 1_000_000.0
            );
            let _ = writeln!(
                output,
                "tablelocal_request_duration_seconds_count{{operation=\"{op_name}\"}} {total}"
            );
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCOUNT: &str = "devstoreaccount1";

    #[test]
    fn test_classify() {
        let cases = [
            (Method::POST, "/devstoreaccount1/Tables", TableOperation::CreateTable),
            (Method::GET, "/Tables", TableOperation::QueryTables),
            (Method::DELETE, "/Tables('test')", TableOperation::DeleteTable),
            (Method::POST, "/test", TableOperation::InsertEntity),
            (Method::GET, "/test()", TableOperation::QueryEntities),
            (
                Method::GET,
                "/test(PartitionKey='a',RowKey='b')",
                TableOperation::GetEntity,
            ),
            (
                Method::PATCH,
                "/test(PartitionKey='a',RowKey='b')",
                TableOperation::MergeEntity,
            ),
            (Method::POST, "/devstoreaccount1/$batch", TableOperation::Batch),
        ];
        for (method, path, expected) in cases {
            assert_eq!(
                TableOperation::classify(&method, path, ACCOUNT),
                Some(expected),
                "{method} {path}"
            );
        }
        assert_eq!(TableOperation::classify(&Method::PUT, "/Tables", ACCOUNT), None);
        assert_eq!(TableOperation::classify(&Method::GET, "/", ACCOUNT), None);
    }

    #[test]
    fn test_record_operation() {
        let metrics = TableMetrics::new();
        metrics.record_operation(TableOperation::GetEntity, 200, 0, 500);
        metrics.record_operation(TableOperation::GetEntity, 404, 0, 1000);
        metrics.record_operation(TableOperation::InsertEntity, 201, 128, 2000);

        assert_eq!(metrics.request_count(TableOperation::GetEntity), 2);
        assert_eq!(metrics.request_count(TableOperation::Batch), 0);

        let output = metrics.export_prometheus();
        assert!(output.contains(
            "tablelocal_requests_total{operation=\"GetEntity\",status=\"client_error\"} 1"
        ));
        assert!(output.contains("tablelocal_request_bytes_total{operation=\"InsertEntity\"} 128"));
    }

    #[test]
    fn test_latency_histogram_is_cumulative() {
        let metrics = TableMetrics::new();
        metrics.record_operation(TableOperation::QueryEntities, 200, 0, 500); // 0.5ms
        metrics.record_operation(TableOperation::QueryEntities, 200, 0, 50_000); // 50ms
        metrics.record_operation(TableOperation::QueryEntities, 200, 0, 60_000_000); // 60s

        let output = metrics.export_prometheus();
        assert!(output.contains(
            "tablelocal_request_duration_seconds_bucket{operation=\"QueryEntities\",le=\"0.001\"} 1"
        ));
        assert!(output.contains(
            "tablelocal_request_duration_seconds_bucket{operation=\"QueryEntities\",le=\"0.05\"} 2"
        ));
        assert!(output.contains(
            "tablelocal_request_duration_seconds_bucket{operation=\"QueryEntities\",le=\"+Inf\"} 3"
        ));
    }
}
