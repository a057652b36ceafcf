//! Operation metrics for the syncer
//!
//! Every reconcile branch and checker sweep records
//! `{operation, duration, error}`. Recording is a side effect only; it never
//! affects control flow.
//!
//! Instruments are created from an explicit [`Meter`] by
//! [`OperationMetrics::register`], which the hosting binary calls once after
//! telemetry is initialised. Nothing in the library registers instruments on
//! first use.

use std::time::{Duration, Instant};

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Label key carrying the operation name
pub const OPERATION_LABEL: &str = "operation_type";

/// Well-known operation names
pub mod operations {
    /// Pod add event
    pub const POD_ADD: &str = "pod_add";
    /// Pod update event
    pub const POD_UPDATE: &str = "pod_update";
    /// Pod delete event
    pub const POD_DELETE: &str = "pod_delete";
    /// Claim add event
    pub const PVC_ADD: &str = "pvc_add";
    /// Claim update event
    pub const PVC_UPDATE: &str = "pvc_update";
    /// Claim delete event
    pub const PVC_DELETE: &str = "pvc_delete";
    /// Pod consistency sweep
    pub const POD_CHECK: &str = "pod_check";
    /// Claim consistency sweep
    pub const PVC_CHECK: &str = "pvc_check";
}

/// Sink for operation counts, durations and errors
pub trait MetricsRecorder: Send + Sync {
    /// Record one completed operation
    fn record(&self, operation: &str, duration: Duration, failed: bool);
}

/// OpenTelemetry-backed operation metrics
pub struct OperationMetrics {
    operations: Counter<u64>,
    duration: Histogram<f64>,
    errors: Counter<u64>,
}

impl OperationMetrics {
    /// Create the syncer instruments on the given meter
    pub fn register(meter: &Meter) -> Self {
        Self {
            operations: meter
                .u64_counter("syncer_operations_total")
                .with_description("Cumulative number of sync operations by operation type")
                .with_unit("{operations}")
                .build(),
            duration: meter
                .f64_histogram("syncer_operations_duration_seconds")
                .with_description("Duration in seconds of sync operations by operation type")
                .with_unit("s")
                .build(),
            errors: meter
                .u64_counter("syncer_operations_errors_total")
                .with_description("Cumulative number of sync operation errors by operation type")
                .with_unit("{errors}")
                .build(),
        }
    }
}

impl MetricsRecorder for OperationMetrics {
    fn record(&self, operation: &str, duration: Duration, failed: bool) {
        let labels = [KeyValue::new(OPERATION_LABEL, operation.to_string())];
        self.operations.add(1, &labels);
        self.duration.record(duration.as_secs_f64(), &labels);
        if failed {
            self.errors.add(1, &labels);
        }
    }
}

/// Recorder that drops everything
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn record(&self, _operation: &str, _duration: Duration, _failed: bool) {}
}

/// Times a single operation
pub struct OperationTimer<'a> {
    recorder: &'a dyn MetricsRecorder,
    operation: &'static str,
    start: Instant,
}

impl<'a> OperationTimer<'a> {
    /// Start timing `operation`
    pub fn start(recorder: &'a dyn MetricsRecorder, operation: &'static str) -> Self {
        Self {
            recorder,
            operation,
            start: Instant::now(),
        }
    }

    /// Record the operation with the outcome of `result`
    pub fn finish<T, E>(self, result: &Result<T, E>) {
        self.recorder
            .record(self.operation, self.start.elapsed(), result.is_err());
    }
}
