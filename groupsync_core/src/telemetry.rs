//! Reconciliation counters.
//!
//! Two counters, both tagged by `controller`:
//!
//! - `groupsync_reconciliation_count_total` - attempts
//! - `groupsync_reconciliation_error_total` - failures
//!
//! Success rate in the metrics backend is `1 - error_total / count_total`.
//! The counters go through the `metrics` facade; the exporter is installed
//! by whichever binary hosts the `/metrics` route.

use metrics::counter;

const RECONCILIATION_COUNT: &str = "groupsync_reconciliation_count_total";
const RECONCILIATION_ERROR: &str = "groupsync_reconciliation_error_total";

/// Count one reconciliation attempt.
pub fn record_reconciliation_start(controller: &str) {
    counter!(RECONCILIATION_COUNT, 1, "controller" => controller.to_owned());
}

/// Count one reconciliation failure.
pub fn record_reconciliation_error(controller: &str) {
    counter!(RECONCILIATION_ERROR, 1, "controller" => controller.to_owned());
}

/// Record a completed reconciliation: always the attempt, and the error
/// counter when `err` is set.
pub fn record_reconciliation(controller: &str, err: Option<&anyhow::Error>) {
    record_reconciliation_start(controller);
    if err.is_some() {
        record_reconciliation_error(controller);
    }
}
