//! Per-key quota state machine
//!
//! A `SessionCredit` holds byte counters ("buckets") for one charging or
//! monitoring key plus the flags that drive the report cycle:
//!
//! 1. Usage accumulates into `used_*`
//! 2. Crossing the reporting threshold (or validity expiry, or a forced
//!    re-auth) makes the credit report: unreported usage moves into
//!    `reporting_*` and the reporting flag is set
//! 3. A grant moves `reporting_*` into `reported_*`, extends `allowed_*` and
//!    clears the reporting flag
//! 4. Exhaustion disables service until a later grant re-enables it
//!
//! Every mutation records its bucket delta so the change can be replayed onto
//! a persisted checkpoint with `merge`.

use std::collections::BTreeMap;

use common::CreditConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::messages::{FinalUnitAction, UsageReason};
use crate::stored::StoredSessionCredit;

/// Named counters of a credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    UsedTx = 0,
    UsedRx = 1,
    /// Direction-less volume allowance
    AllowedTotal = 2,
    AllowedTotalTx = 3,
    AllowedTotalRx = 4,
    /// Usage sent in the outstanding report
    ReportingTx = 5,
    ReportingRx = 6,
    /// Usage acknowledged by a grant
    ReportedTx = 7,
    ReportedRx = 8,
}

impl Bucket {
    pub const COUNT: usize = 9;

    pub const ALL: [Bucket; Bucket::COUNT] = [
        Bucket::UsedTx,
        Bucket::UsedRx,
        Bucket::AllowedTotal,
        Bucket::AllowedTotalTx,
        Bucket::AllowedTotalRx,
        Bucket::ReportingTx,
        Bucket::ReportingRx,
        Bucket::ReportedTx,
        Bucket::ReportedRx,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Forced re-validation progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReAuthState {
    #[default]
    NotNeeded,
    /// Next scan must report regardless of threshold
    Required,
    /// Report sent, waiting for the grant
    Processing,
}

/// Service status of the traffic governed by a credit.
///
/// Transitions:
/// - Enabled → Disabled (exhausted, enforcement action emitted)
/// - Disabled → NeedsActivation (grant received)
/// - NeedsActivation → Enabled (continue action emitted)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    #[default]
    Enabled,
    Disabled,
    NeedsActivation,
}

/// Service transition a scan must turn into an enforcement action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceTransition {
    Deactivate,
    Activate,
}

/// Allowance carried by a successful grant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grant {
    pub total: u64,
    pub tx: u64,
    pub rx: u64,
    /// Zero means no expiry
    pub validity_seconds: u64,
    /// Set when this is the final grant
    pub final_action: Option<FinalUnitAction>,
}

/// Changes to one credit since the last checkpoint.
///
/// State fields are absolute; buckets are signed deltas so merging onto a
/// checkpoint that has drifted still converges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditUpdateCriteria {
    pub reporting: bool,
    #[serde(default)]
    pub granted: bool,
    pub is_final: bool,
    pub denied: bool,
    pub reauth_state: ReAuthState,
    pub service_state: ServiceState,
    #[serde(default)]
    pub expiry_time: Option<u64>,
    #[serde(default)]
    pub final_action: Option<FinalUnitAction>,
    pub bucket_deltas: BTreeMap<Bucket, i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PendingDelta {
    dirty: bool,
    buckets: [i64; Bucket::COUNT],
}

/// Quota state machine for one credit key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCredit {
    buckets: [u64; Bucket::COUNT],
    reporting: bool,
    /// At least one successful grant was applied
    granted: bool,
    is_final: bool,
    denied: bool,
    reauth_state: ReAuthState,
    service_state: ServiceState,
    expiry_time: Option<u64>,
    final_action: Option<FinalUnitAction>,
    pending: PendingDelta,
}

impl SessionCredit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a bucket.
    pub fn get(&self, bucket: Bucket) -> u64 {
        self.buckets[bucket.index()]
    }

    pub fn is_reporting(&self) -> bool {
        self.reporting
    }

    pub fn is_granted(&self) -> bool {
        self.granted
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }

    pub fn is_denied(&self) -> bool {
        self.denied
    }

    pub fn reauth_state(&self) -> ReAuthState {
        self.reauth_state
    }

    pub fn service_state(&self) -> ServiceState {
        self.service_state
    }

    pub fn final_action(&self) -> Option<&FinalUnitAction> {
        self.final_action.as_ref()
    }

    /// Accumulate data-plane usage.
    pub fn add_used_credit(&mut self, used_tx: u64, used_rx: u64) {
        self.add(Bucket::UsedTx, used_tx);
        self.add(Bucket::UsedRx, used_rx);
    }

    /// Cancel the outstanding report cycle. Returns whether one was in flight.
    pub fn reset_reporting(&mut self) -> bool {
        let was_reporting = self.reporting;
        self.set(Bucket::ReportingTx, 0);
        self.set(Bucket::ReportingRx, 0);
        self.reporting = false;
        if self.reauth_state == ReAuthState::Processing {
            self.reauth_state = ReAuthState::Required;
        }
        self.pending.dirty = true;
        was_reporting
    }

    /// Force a report on the next scan. No-op while a report is in flight.
    pub fn reauth(&mut self) {
        if self.reporting {
            return;
        }
        self.reauth_state = ReAuthState::Required;
        self.pending.dirty = true;
    }

    /// Why the credit must report now, if it must.
    ///
    /// Nothing is reported while a report is in flight. A forced re-auth wins
    /// over everything else; a final or disabled credit only reports on
    /// re-auth.
    pub fn update_reason(&self, config: &CreditConfig, now: u64) -> Option<UsageReason> {
        if self.reporting {
            return None;
        }
        if self.reauth_state == ReAuthState::Required {
            return Some(UsageReason::ForcedReauth);
        }
        if self.is_final || self.service_state == ServiceState::Disabled {
            return None;
        }
        if self.threshold_crossed(config.usage_reporting_threshold) {
            return Some(UsageReason::Threshold);
        }
        if self.expiry_time.is_some_and(|expiry| now >= expiry) {
            return Some(UsageReason::ValidityTimerExpired);
        }
        None
    }

    pub fn needs_reporting(&self, config: &CreditConfig, now: u64) -> bool {
        self.update_reason(config, now).is_some()
    }

    /// Whether the granted allowance is used up (or credit was refused).
    ///
    /// A grant of zero units in every dimension is used up by any traffic
    /// beyond the margin.
    pub fn is_exhausted(&self, config: &CreditConfig) -> bool {
        if self.denied {
            return true;
        }
        let margin = config.extra_quota_margin;
        if self.is_zero_grant() {
            return self.used_total() > margin;
        }
        let over = |used: u64, allowed: u64| allowed > 0 && used >= allowed.saturating_add(margin);
        over(self.used_total(), self.get(Bucket::AllowedTotal))
            || over(self.get(Bucket::UsedTx), self.get(Bucket::AllowedTotalTx))
            || over(self.get(Bucket::UsedRx), self.get(Bucket::AllowedTotalRx))
    }

    /// Advance the service state, returning the transition to enforce.
    ///
    /// A refused credit is always enforced; `terminate_on_exhaust` only
    /// governs volume exhaustion.
    pub fn poll_service_transition(&mut self, config: &CreditConfig) -> Option<ServiceTransition> {
        let enforce = self.denied || (config.terminate_on_exhaust && self.is_exhausted(config));
        if self.service_state != ServiceState::Disabled && enforce {
            self.service_state = ServiceState::Disabled;
            self.pending.dirty = true;
            return Some(ServiceTransition::Deactivate);
        }
        if self.service_state == ServiceState::NeedsActivation {
            self.service_state = ServiceState::Enabled;
            self.pending.dirty = true;
            return Some(ServiceTransition::Activate);
        }
        None
    }

    /// Start a report cycle: move unreported usage into the reporting buckets.
    ///
    /// Returns the `(tx, rx)` bytes to put in the usage request.
    pub fn build_usage(&mut self, reason: UsageReason) -> (u64, u64) {
        let (tx, rx) = self.unreported_usage();
        self.set(Bucket::ReportingTx, tx);
        self.set(Bucket::ReportingRx, rx);
        self.reporting = true;
        if reason == UsageReason::ForcedReauth || self.reauth_state == ReAuthState::Required {
            self.reauth_state = ReAuthState::Processing;
        }
        self.pending.dirty = true;
        (tx, rx)
    }

    /// Usage not yet acknowledged by a grant, including any report in flight.
    pub fn unreported_usage(&self) -> (u64, u64) {
        (
            self.get(Bucket::UsedTx)
                .saturating_sub(self.get(Bucket::ReportedTx)),
            self.get(Bucket::UsedRx)
                .saturating_sub(self.get(Bucket::ReportedRx)),
        )
    }

    /// Apply a successful grant.
    pub fn apply_grant(&mut self, grant: Grant, now: u64) {
        self.add(Bucket::AllowedTotal, grant.total);
        self.add(Bucket::AllowedTotalTx, grant.tx);
        self.add(Bucket::AllowedTotalRx, grant.rx);
        self.acknowledge_reporting();

        if self.reauth_state == ReAuthState::Processing {
            self.reauth_state = ReAuthState::NotNeeded;
        }
        self.denied = false;
        self.granted = true;
        self.is_final = grant.final_action.is_some();
        self.final_action = grant.final_action;
        self.expiry_time = if grant.validity_seconds > 0 && !self.is_final {
            Some(now.saturating_add(grant.validity_seconds))
        } else {
            None
        };
        if self.service_state == ServiceState::Disabled {
            self.service_state = ServiceState::NeedsActivation;
        }
        self.pending.dirty = true;
    }

    /// Record a refused grant: the credit is final and counts as exhausted.
    pub fn mark_denied(&mut self, final_action: Option<FinalUnitAction>) {
        self.reset_reporting();
        if self.reauth_state == ReAuthState::Required {
            self.reauth_state = ReAuthState::NotNeeded;
        }
        self.denied = true;
        self.is_final = true;
        if final_action.is_some() {
            self.final_action = final_action;
        }
        self.expiry_time = None;
        self.pending.dirty = true;
    }

    /// Drain the changes recorded since the last call.
    pub fn take_update_criteria(&mut self) -> Option<CreditUpdateCriteria> {
        if !self.pending.dirty {
            return None;
        }
        let bucket_deltas = Bucket::ALL
            .iter()
            .filter_map(|&b| {
                let delta = self.pending.buckets[b.index()];
                (delta != 0).then_some((b, delta))
            })
            .collect();
        self.pending = PendingDelta::default();
        Some(CreditUpdateCriteria {
            reporting: self.reporting,
            granted: self.granted,
            is_final: self.is_final,
            denied: self.denied,
            reauth_state: self.reauth_state,
            service_state: self.service_state,
            expiry_time: self.expiry_time,
            final_action: self.final_action.clone(),
            bucket_deltas,
        })
    }

    /// Forget recorded changes (the full state was persisted instead).
    pub fn clear_update_criteria(&mut self) {
        self.pending = PendingDelta::default();
    }

    /// Replay changes computed on another instance. Not itself recorded.
    pub fn merge(&mut self, update: &CreditUpdateCriteria) {
        self.reporting = update.reporting;
        self.granted = update.granted;
        self.is_final = update.is_final;
        self.denied = update.denied;
        self.reauth_state = update.reauth_state;
        self.service_state = update.service_state;
        self.expiry_time = update.expiry_time;
        self.final_action = update.final_action.clone();
        for (bucket, delta) in &update.bucket_deltas {
            let slot = &mut self.buckets[bucket.index()];
            *slot = slot.saturating_add_signed(*delta);
        }
    }

    pub fn marshal(&self) -> StoredSessionCredit {
        StoredSessionCredit {
            reporting: self.reporting,
            granted: self.granted,
            is_final: self.is_final,
            denied: self.denied,
            reauth_state: self.reauth_state,
            service_state: self.service_state,
            expiry_time: self.expiry_time,
            final_action: self.final_action.clone(),
            buckets: Bucket::ALL.iter().map(|&b| (b, self.get(b))).collect(),
        }
    }

    /// Rebuild a credit from its stored form.
    ///
    /// Every bucket must be present and reported plus in-flight usage may
    /// not exceed used.
    pub fn unmarshal(stored: &StoredSessionCredit) -> Result<Self> {
        let mut buckets = [0u64; Bucket::COUNT];
        for bucket in Bucket::ALL {
            buckets[bucket.index()] = *stored.buckets.get(&bucket).ok_or_else(|| {
                Error::MalformedSnapshot(format!("credit is missing bucket {bucket:?}"))
            })?;
        }
        for (used, reported, reporting) in [
            (Bucket::UsedTx, Bucket::ReportedTx, Bucket::ReportingTx),
            (Bucket::UsedRx, Bucket::ReportedRx, Bucket::ReportingRx),
        ] {
            let used_value = buckets[used.index()];
            let reported_value = buckets[reported.index()];
            let reporting_value = buckets[reporting.index()];
            match reported_value.checked_add(reporting_value) {
                Some(accounted) if accounted <= used_value => {}
                _ => {
                    return Err(Error::MalformedSnapshot(format!(
                        "{reported:?} ({reported_value}) + {reporting:?} ({reporting_value}) \
                         exceeds {used:?} ({used_value})"
                    )));
                }
            }
        }
        Ok(Self {
            buckets,
            reporting: stored.reporting,
            granted: stored.granted,
            is_final: stored.is_final,
            denied: stored.denied,
            reauth_state: stored.reauth_state,
            service_state: stored.service_state,
            expiry_time: stored.expiry_time,
            final_action: stored.final_action.clone(),
            pending: PendingDelta::default(),
        })
    }

    fn used_total(&self) -> u64 {
        self.get(Bucket::UsedTx)
            .saturating_add(self.get(Bucket::UsedRx))
    }

    /// Granted, but with no allowance in any dimension.
    fn is_zero_grant(&self) -> bool {
        self.granted
            && [Bucket::AllowedTotal, Bucket::AllowedTotalTx, Bucket::AllowedTotalRx]
                .iter()
                .all(|&b| self.get(b) == 0)
    }

    fn threshold_crossed(&self, ratio: f64) -> bool {
        let crossed = |used: u64, reported: u64, allowed: u64| {
            if allowed == 0 {
                return false;
            }
            let remaining = allowed.saturating_sub(reported);
            if remaining == 0 {
                return used > reported;
            }
            let trigger = reported.saturating_add((remaining as f64 * ratio).ceil() as u64);
            used >= trigger
        };
        let reported_total = self
            .get(Bucket::ReportedTx)
            .saturating_add(self.get(Bucket::ReportedRx));
        if self.is_zero_grant() {
            return self.used_total() > reported_total;
        }
        crossed(
            self.used_total(),
            reported_total,
            self.get(Bucket::AllowedTotal),
        ) || crossed(
            self.get(Bucket::UsedTx),
            self.get(Bucket::ReportedTx),
            self.get(Bucket::AllowedTotalTx),
        ) || crossed(
            self.get(Bucket::UsedRx),
            self.get(Bucket::ReportedRx),
            self.get(Bucket::AllowedTotalRx),
        )
    }

    fn acknowledge_reporting(&mut self) {
        let tx = self
            .get(Bucket::ReportedTx)
            .saturating_add(self.get(Bucket::ReportingTx));
        let rx = self
            .get(Bucket::ReportedRx)
            .saturating_add(self.get(Bucket::ReportingRx));
        self.set(Bucket::ReportedTx, tx);
        self.set(Bucket::ReportedRx, rx);
        self.set(Bucket::ReportingTx, 0);
        self.set(Bucket::ReportingRx, 0);
        self.reporting = false;
    }

    fn add(&mut self, bucket: Bucket, amount: u64) {
        let value = self.get(bucket).saturating_add(amount);
        self.set(bucket, value);
    }

    fn set(&mut self, bucket: Bucket, value: u64) {
        let old = self.buckets[bucket.index()];
        let delta = (i128::from(value) - i128::from(old)).clamp(i64::MIN.into(), i64::MAX.into());
        let slot = &mut self.pending.buckets[bucket.index()];
        *slot = slot.saturating_add(delta as i64);
        self.buckets[bucket.index()] = value;
        self.pending.dirty = true;
    }
}

/// Current unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
