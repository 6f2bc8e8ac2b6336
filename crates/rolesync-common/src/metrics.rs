//! Metrics for rolesync observability
//!
//! Instruments are created lazily on the global meter, so they are no-ops
//! until telemetry installs an exporting meter provider.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};

static METER: Lazy<Meter> = Lazy::new(|| global::meter("rolesync"));

/// Histogram of per-key sync duration
///
/// Labels:
/// - `result`: success, error
pub static SYNC_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("rolesync_sync_duration_seconds")
        .with_description("Duration of policy domain syncs in seconds")
        .with_unit("s")
        .build()
});

/// Counter of sync errors
///
/// Labels:
/// - `reason`: not_found, malformed_key, other
pub static SYNC_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("rolesync_sync_errors_total")
        .with_description("Total number of failed policy domain syncs")
        .with_unit("{errors}")
        .build()
});

/// Counter of applied change items
///
/// Labels:
/// - `operation`: add, update, delete
/// - `kind`: ServiceRole, ServiceRoleBinding, ClusterRbacConfig
/// - `result`: success, error
pub static CHANGES_APPLIED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("rolesync_changes_applied_total")
        .with_description("Total number of authorization object changes applied")
        .with_unit("{changes}")
        .build()
});

/// Counter of rate-limited requeues and dropped keys
///
/// Labels:
/// - `outcome`: requeued, dropped
pub static QUEUE_RETRIES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("rolesync_queue_retries_total")
        .with_description("Total number of reconciliation key retries")
        .with_unit("{retries}")
        .build()
});

/// Label value for a successful outcome
pub const RESULT_SUCCESS: &str = "success";
/// Label value for a failed outcome
pub const RESULT_ERROR: &str = "error";
