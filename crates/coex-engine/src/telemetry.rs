//! Metric recording helpers
//!
//! Uses the `metrics` facade; installing an exporter is up to the host.

use coex_core::{CommunityId, MigrationMode};

pub(crate) fn record_shadow_sync(community: &CommunityId, outcome: &'static str) {
    metrics::counter!(
        "coex_shadow_sync_total",
        "community" => community.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub(crate) fn record_divergences(community: &CommunityId, opened: usize) {
    if opened > 0 {
        metrics::counter!("coex_shadow_divergences_total", "community" => community.to_string())
            .increment(opened as u64);
    }
}

pub(crate) fn record_accuracy(community: &CommunityId, accuracy: f64) {
    metrics::gauge!("coex_shadow_accuracy_percent", "community" => community.to_string())
        .set(accuracy);
}

pub(crate) fn record_transition(from: MigrationMode, to: MigrationMode) {
    metrics::counter!(
        "coex_mode_transitions_total",
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
}

pub(crate) fn record_rollback(from: MigrationMode, automatic: bool) {
    metrics::counter!(
        "coex_rollbacks_total",
        "from" => from.as_str(),
        "automatic" => automatic.to_string()
    )
    .increment(1);
}

pub(crate) fn record_health_alert(community: &CommunityId) {
    metrics::counter!("coex_health_alerts_total", "community" => community.to_string())
        .increment(1);
}

pub(crate) fn record_job_failure(job: &'static str) {
    metrics::counter!("coex_job_failures_total", "job" => job).increment(1);
}

pub(crate) fn record_grant_op(op: &'static str, success: bool) {
    metrics::counter!(
        "coex_namespaced_grant_ops_total",
        "op" => op,
        "success" => success.to_string()
    )
    .increment(1);
}
