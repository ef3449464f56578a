//! Credit pool counters
//!
//! Recorded through the `metrics` facade; without an installed recorder every
//! call is a no-op. The `pool` label is `charging` or `monitoring`.
//!
//! - `credit_pool_usage_requests_total` (counter): labels `pool`, `reason`
//! - `credit_pool_enforcement_actions_total` (counter): labels `pool`, `kind`
//! - `credit_pool_grants_total` (counter): labels `pool`, `outcome`
//! - `credit_pool_stale_deltas_total` (counter): label `pool`

use crate::action::ActionKind;
use crate::messages::UsageReason;
use crate::result_code::GrantOutcome;

pub const CHARGING_POOL: &str = "charging";
pub const MONITORING_POOL: &str = "monitoring";

/// Record a usage request produced by a scan.
pub fn record_usage_request(pool: &'static str, reason: UsageReason) {
    metrics::counter!("credit_pool_usage_requests_total", "pool" => pool, "reason" => reason.label())
        .increment(1);
}

/// Record an enforcement action produced by a scan.
pub fn record_enforcement_action(pool: &'static str, kind: ActionKind) {
    metrics::counter!("credit_pool_enforcement_actions_total", "pool" => pool, "kind" => kind.label())
        .increment(1);
}

/// Record an ingested grant response.
pub fn record_grant(pool: &'static str, outcome: GrantOutcome) {
    metrics::counter!("credit_pool_grants_total", "pool" => pool, "outcome" => outcome.label())
        .increment(1);
}

/// Record a reconciliation delta for a key the pool no longer holds.
pub fn record_stale_delta(pool: &'static str) {
    metrics::counter!("credit_pool_stale_deltas_total", "pool" => pool).increment(1);
}
