//! Usage-monitoring credit pool
//!
//! Monitors are keyed by an opaque monitoring key and fed by the policy
//! authority. At most one monitor is designated session-level; its exhaustion
//! terminates every rule of the session, while a rule-level monitor only
//! restricts the rules bound to it.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use common::CreditConfig;
use policy::{RuleKey, RuleLookup};
use tracing::{debug, info, warn};

use crate::action::{ActionKey, ActionKind, ServiceAction};
use crate::credit::{
    Bucket, CreditUpdateCriteria, Grant, ServiceTransition, SessionCredit, unix_now,
};
use crate::error::{Error, Result};
use crate::messages::{
    MonitoringLevel, TerminationSnapshot, UsageMonitorUpdate, UsageMonitoringUpdateResponse,
    UsageRecord,
};
use crate::metrics::{self, MONITORING_POOL};
use crate::pool::{CreditPool, PoolUpdateCriteria, ReAuthResult};
use crate::result_code::classify_success;
use crate::stored::{StoredMonitor, StoredUsageMonitoringCreditPool};

/// A quota state machine plus its monitoring level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Monitor {
    pub credit: SessionCredit,
    pub level: MonitoringLevel,
}

impl Monitor {
    pub fn new(level: MonitoringLevel) -> Self {
        Self {
            credit: SessionCredit::new(),
            level,
        }
    }

    pub fn marshal(&self) -> StoredMonitor {
        StoredMonitor {
            credit: self.credit.marshal(),
            level: self.level,
        }
    }

    pub fn unmarshal(stored: &StoredMonitor) -> Result<Self> {
        Ok(Self {
            credit: SessionCredit::unmarshal(&stored.credit)?,
            level: stored.level,
        })
    }
}

/// Usage monitors of one subscriber session.
#[derive(Debug, Clone)]
pub struct UsageMonitoringCreditPool {
    imsi: String,
    config: CreditConfig,
    monitor_map: HashMap<String, Monitor>,
    session_level_key: Option<String>,
    new_keys: HashSet<String>,
    session_level_dirty: bool,
}

impl UsageMonitoringCreditPool {
    pub fn new(imsi: impl Into<String>) -> Self {
        Self::with_config(imsi, CreditConfig::default())
    }

    pub fn with_config(imsi: impl Into<String>, config: CreditConfig) -> Self {
        Self {
            imsi: imsi.into(),
            config,
            monitor_map: HashMap::new(),
            session_level_key: None,
            new_keys: HashSet::new(),
            session_level_dirty: false,
        }
    }

    pub fn imsi(&self) -> &str {
        &self.imsi
    }

    pub fn config(&self) -> &CreditConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.monitor_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitor_map.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.monitor_map.contains_key(key)
    }

    pub fn level(&self, key: &str) -> Option<MonitoringLevel> {
        self.monitor_map.get(key).map(|monitor| monitor.level)
    }

    /// Held keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.monitor_map.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Current session-level designee, if any.
    pub fn get_session_level_key(&self) -> Option<&str> {
        self.session_level_key.as_deref()
    }

    /// Insert a monitor for a key the pool does not hold yet.
    ///
    /// The monitor ships in full with the next `take_update_criteria`.
    pub fn add_monitor(&mut self, key: impl Into<String>, monitor: Monitor) -> Result<()> {
        let key = key.into();
        self.insert_restored(key.clone(), monitor)?;
        self.new_keys.insert(key);
        Ok(())
    }

    /// Insert without marking the key new: the monitor is already persisted.
    fn insert_restored(&mut self, key: String, monitor: Monitor) -> Result<()> {
        match self.monitor_map.entry(key) {
            Entry::Occupied(slot) => Err(Error::DuplicateKey(slot.key().clone())),
            Entry::Vacant(slot) => {
                slot.insert(monitor);
                Ok(())
            }
        }
    }

    pub fn reauth_key(&mut self, key: &str) -> ReAuthResult {
        match self.monitor_map.get_mut(key) {
            Some(monitor) => {
                monitor.credit.reauth();
                info!(imsi = %self.imsi, monitoring_key = key, "monitoring re-auth initiated");
                ReAuthResult::UpdateInitiated
            }
            None => {
                warn!(imsi = %self.imsi, monitoring_key = key, "re-auth for unknown monitoring key");
                ReAuthResult::KeyNotFound
            }
        }
    }

    pub fn reauth_all(&mut self) -> ReAuthResult {
        if self.monitor_map.is_empty() {
            return ReAuthResult::NoEntries;
        }
        for monitor in self.monitor_map.values_mut() {
            monitor.credit.reauth();
        }
        info!(
            imsi = %self.imsi,
            monitors = self.monitor_map.len(),
            "monitoring re-auth initiated for all monitors"
        );
        ReAuthResult::UpdateInitiated
    }

    pub fn marshal(&self) -> StoredUsageMonitoringCreditPool {
        let mut monitors: Vec<(String, StoredMonitor)> = self
            .monitor_map
            .iter()
            .map(|(key, monitor)| (key.clone(), monitor.marshal()))
            .collect();
        monitors.sort_by(|(a, _), (b, _)| a.cmp(b));
        StoredUsageMonitoringCreditPool {
            imsi: self.imsi.clone(),
            monitors,
            session_level_key: self.session_level_key.clone(),
        }
    }

    /// Restore a pool. Any malformed entry or a dangling session-level key
    /// fails the whole restore.
    pub fn unmarshal(
        marshaled: &StoredUsageMonitoringCreditPool,
        config: CreditConfig,
    ) -> Result<Self> {
        if marshaled.imsi.is_empty() {
            return Err(Error::MalformedSnapshot(
                "monitoring pool has no subscriber identity".into(),
            ));
        }
        let mut pool = Self::with_config(marshaled.imsi.clone(), config);
        for (key, stored) in &marshaled.monitors {
            let monitor = Monitor::unmarshal(stored)
                .map_err(|e| e.context(format!("monitor {key}")))?;
            pool.insert_restored(key.clone(), monitor)
                .map_err(|_| Error::MalformedSnapshot(format!("duplicate monitor {key}")))?;
        }
        if let Some(key) = &marshaled.session_level_key {
            if !pool.contains(key) {
                return Err(Error::MalformedSnapshot(format!(
                    "session-level key {key} has no monitor"
                )));
            }
            pool.session_level_key = Some(key.clone());
        }
        debug!(imsi = %pool.imsi, monitors = pool.len(), "monitoring pool restored");
        Ok(pool)
    }

    /// Point the session-level slot at `key`. Last writer wins.
    fn set_session_level_key(&mut self, key: &str) {
        match self.session_level_key.as_deref() {
            Some(current) if current == key => return,
            Some(current) => warn!(
                imsi = %self.imsi,
                previous = current,
                monitoring_key = key,
                "session-level monitoring key overwritten"
            ),
            None => info!(imsi = %self.imsi, monitoring_key = key, "session-level monitoring key set"),
        }
        self.session_level_key = Some(key.to_string());
        self.session_level_dirty = true;
    }
}

impl CreditPool for UsageMonitoringCreditPool {
    type Key = String;
    type Response = UsageMonitoringUpdateResponse;
    type Request = UsageMonitorUpdate;
    type StoredEntry = StoredMonitor;

    fn add_used_credit(&mut self, key: &String, used_tx: u64, used_rx: u64) -> bool {
        match self.monitor_map.get_mut(key) {
            Some(monitor) => {
                monitor.credit.add_used_credit(used_tx, used_rx);
                true
            }
            None => {
                debug!(imsi = %self.imsi, monitoring_key = %key, "usage for untracked monitoring key dropped");
                false
            }
        }
    }

    fn reset_reporting_credit(&mut self, key: &String) -> bool {
        match self.monitor_map.get_mut(key) {
            Some(monitor) => {
                monitor.credit.reset_reporting();
                true
            }
            None => {
                warn!(imsi = %self.imsi, monitoring_key = %key, "reset reporting for unknown monitoring key");
                false
            }
        }
    }

    fn get_updates(
        &mut self,
        ip_addr: &str,
        static_rules: &dyn RuleLookup,
        dynamic_rules: Option<&dyn RuleLookup>,
    ) -> (Vec<UsageMonitorUpdate>, Vec<ServiceAction>) {
        let now = unix_now();
        let session_level_key = self.session_level_key.as_deref();
        let mut updates = Vec::new();
        let mut actions = Vec::new();

        for (key, monitor) in self.monitor_map.iter_mut() {
            let credit = &mut monitor.credit;
            if let Some(transition) = credit.poll_service_transition(&self.config) {
                let session_wide = session_level_key == Some(key.as_str());
                let rule_ids = if session_wide {
                    policy::collect_all_rules(static_rules, dynamic_rules)
                } else {
                    policy::collect_rules(RuleKey::Monitoring(key), static_rules, dynamic_rules)
                };
                let kind = match transition {
                    ServiceTransition::Activate => ActionKind::Continue,
                    ServiceTransition::Deactivate if session_wide => ActionKind::Terminate,
                    ServiceTransition::Deactivate => ActionKind::Restrict,
                };
                let action = ServiceAction::new(
                    kind,
                    &self.imsi,
                    ip_addr,
                    ActionKey::Monitoring(key.clone()),
                    rule_ids,
                );
                info!(
                    imsi = %self.imsi,
                    monitoring_key = %key,
                    session_level = session_wide,
                    kind = kind.label(),
                    rules = action.rule_ids.len(),
                    "monitoring enforcement action"
                );
                metrics::record_enforcement_action(MONITORING_POOL, kind);
                actions.push(action);
                if transition == ServiceTransition::Deactivate {
                    continue;
                }
            }

            if let Some(reason) = credit.update_reason(&self.config, now) {
                let (bytes_tx, bytes_rx) = credit.build_usage(reason);
                debug!(
                    imsi = %self.imsi,
                    monitoring_key = %key,
                    bytes_tx,
                    bytes_rx,
                    reason = reason.label(),
                    "monitoring usage request"
                );
                metrics::record_usage_request(MONITORING_POOL, reason);
                updates.push(UsageMonitorUpdate {
                    monitoring_key: key.clone(),
                    level: monitor.level,
                    bytes_tx,
                    bytes_rx,
                });
            }
        }

        (updates, actions)
    }

    fn get_termination_updates(&self, ip_addr: &str) -> TerminationSnapshot {
        let mut snapshot = TerminationSnapshot::new(self.imsi.as_str(), ip_addr);
        let mut entries: Vec<(&String, &Monitor)> = self.monitor_map.iter().collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (key, monitor) in entries {
            let (bytes_tx, bytes_rx) = monitor.credit.unreported_usage();
            snapshot
                .usage_records
                .push(UsageRecord::Monitoring(UsageMonitorUpdate {
                    monitoring_key: key.clone(),
                    level: monitor.level,
                    bytes_tx,
                    bytes_rx,
                }));
        }
        snapshot
    }

    fn receive_credit(&mut self, response: &UsageMonitoringUpdateResponse) -> bool {
        let key = response.monitoring_key.as_str();
        metrics::record_grant(MONITORING_POOL, classify_success(response.success));

        if !response.success {
            match self.monitor_map.get_mut(key) {
                Some(monitor) => {
                    warn!(imsi = %self.imsi, monitoring_key = key, "monitoring grant refused");
                    monitor.credit.mark_denied(None);
                }
                None => warn!(
                    imsi = %self.imsi,
                    monitoring_key = key,
                    "unsuccessful grant for new monitoring key, no monitor created"
                ),
            }
            return false;
        }

        let grant = Grant {
            total: response.granted_total,
            ..Grant::default()
        };
        match self.monitor_map.get_mut(key) {
            Some(monitor) => {
                monitor.credit.apply_grant(grant, unix_now());
                debug!(
                    imsi = %self.imsi,
                    monitoring_key = key,
                    granted_total = response.granted_total,
                    "monitoring grant applied"
                );
            }
            None => {
                let mut monitor = Monitor::new(response.level);
                monitor.credit.apply_grant(grant, unix_now());
                info!(
                    imsi = %self.imsi,
                    monitoring_key = key,
                    level = ?response.level,
                    granted_total = response.granted_total,
                    "new usage monitor"
                );
                self.monitor_map.insert(key.to_string(), monitor);
                self.new_keys.insert(key.to_string());
            }
        }

        if response.level == MonitoringLevel::SessionLevel {
            self.set_session_level_key(key);
        }
        true
    }

    fn get_credit(&self, key: &String, bucket: Bucket) -> u64 {
        self.monitor_map
            .get(key)
            .map(|monitor| monitor.credit.get(bucket))
            .unwrap_or(0)
    }

    fn merge_credit_update(&mut self, key: &String, update: &CreditUpdateCriteria) {
        match self.monitor_map.get_mut(key) {
            Some(monitor) => monitor.credit.merge(update),
            None => {
                warn!(
                    imsi = %self.imsi,
                    monitoring_key = %key,
                    "update criteria for unknown monitoring key dropped"
                );
                metrics::record_stale_delta(MONITORING_POOL);
            }
        }
    }

    fn take_update_criteria(&mut self) -> PoolUpdateCriteria<String, StoredMonitor> {
        let mut update = PoolUpdateCriteria::default();
        for (key, monitor) in self.monitor_map.iter_mut() {
            if self.new_keys.contains(key) {
                monitor.credit.clear_update_criteria();
                update.new_entries.push((key.clone(), monitor.marshal()));
            } else if let Some(criteria) = monitor.credit.take_update_criteria() {
                update.credit_updates.push((key.clone(), criteria));
            }
        }
        if self.session_level_dirty {
            update.session_level_key = self.session_level_key.clone();
        }
        self.new_keys.clear();
        self.session_level_dirty = false;
        update.new_entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        update.credit_updates.sort_by(|(a, _), (b, _)| a.cmp(b));
        update
    }

    fn apply_update_criteria(
        &mut self,
        update: &PoolUpdateCriteria<String, StoredMonitor>,
    ) -> Result<()> {
        let mut restored = Vec::with_capacity(update.new_entries.len());
        for (key, stored) in &update.new_entries {
            let monitor = Monitor::unmarshal(stored)
                .map_err(|e| e.context(format!("new monitor {key}")))?;
            restored.push((key.clone(), monitor));
        }
        for (key, monitor) in restored {
            if let Err(e) = self.insert_restored(key, monitor) {
                warn!(imsi = %self.imsi, error = %e, "new monitor already in checkpoint");
            }
        }
        for (key, criteria) in &update.credit_updates {
            self.merge_credit_update(key, criteria);
        }
        if let Some(key) = &update.session_level_key {
            if self.contains(key) {
                self.session_level_key = Some(key.clone());
            } else {
                warn!(
                    imsi = %self.imsi,
                    monitoring_key = %key,
                    "session-level key without monitor in checkpoint, ignored"
                );
            }
        }
        Ok(())
    }
}
