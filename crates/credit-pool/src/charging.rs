//! Online-charging credit pool
//!
//! Credits are keyed by rating group plus optional service id and fed by the
//! online-charging authority. Exhausted credits are enforced according to the
//! final-unit action of their last grant: redirect, restrict, or terminate
//! when no final-unit action applies.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use common::CreditConfig;
use policy::{ChargingKey, RuleKey, RuleLookup};
use tracing::{debug, info, warn};

use crate::action::{ActionKey, ActionKind, ServiceAction};
use crate::credit::{
    Bucket, CreditUpdateCriteria, Grant, ServiceTransition, SessionCredit, unix_now,
};
use crate::error::{Error, Result};
use crate::messages::{
    CreditUpdateResponse, CreditUsage, FinalUnitAction, TerminationSnapshot, UsageReason,
    UsageRecord,
};
use crate::metrics::{self, CHARGING_POOL};
use crate::pool::{CreditPool, PoolUpdateCriteria, ReAuthResult};
use crate::result_code::{GrantOutcome, classify_result_code};
use crate::stored::{StoredChargingCreditPool, StoredSessionCredit};

/// Charging credits of one subscriber session.
#[derive(Debug, Clone)]
pub struct ChargingCreditPool {
    imsi: String,
    config: CreditConfig,
    credit_map: HashMap<ChargingKey, SessionCredit>,
    /// Keys created since the last `take_update_criteria`
    new_keys: HashSet<ChargingKey>,
}

impl ChargingCreditPool {
    pub fn new(imsi: impl Into<String>) -> Self {
        Self::with_config(imsi, CreditConfig::default())
    }

    pub fn with_config(imsi: impl Into<String>, config: CreditConfig) -> Self {
        Self {
            imsi: imsi.into(),
            config,
            credit_map: HashMap::new(),
            new_keys: HashSet::new(),
        }
    }

    pub fn imsi(&self) -> &str {
        &self.imsi
    }

    pub fn config(&self) -> &CreditConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.credit_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credit_map.is_empty()
    }

    pub fn contains(&self, key: &ChargingKey) -> bool {
        self.credit_map.contains_key(key)
    }

    /// Held keys, sorted.
    pub fn keys(&self) -> Vec<ChargingKey> {
        let mut keys: Vec<ChargingKey> = self.credit_map.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Insert a credit for a key the pool does not hold yet.
    ///
    /// The credit ships in full with the next `take_update_criteria`.
    pub fn add_credit(&mut self, key: ChargingKey, credit: SessionCredit) -> Result<()> {
        self.insert_restored(key, credit)?;
        self.new_keys.insert(key);
        Ok(())
    }

    /// Insert without marking the key new: the credit is already persisted.
    fn insert_restored(&mut self, key: ChargingKey, credit: SessionCredit) -> Result<()> {
        match self.credit_map.entry(key) {
            Entry::Occupied(_) => Err(Error::DuplicateKey(key.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(credit);
                Ok(())
            }
        }
    }

    /// Force one credit to report on the next scan.
    pub fn reauth_key(&mut self, key: &ChargingKey) -> ReAuthResult {
        match self.credit_map.get_mut(key) {
            Some(credit) => {
                credit.reauth();
                info!(imsi = %self.imsi, charging_key = %key, "charging re-auth initiated");
                ReAuthResult::UpdateInitiated
            }
            None => {
                warn!(imsi = %self.imsi, charging_key = %key, "re-auth for unknown charging key");
                ReAuthResult::KeyNotFound
            }
        }
    }

    /// Force every credit to report on the next scan.
    pub fn reauth_all(&mut self) -> ReAuthResult {
        if self.credit_map.is_empty() {
            return ReAuthResult::NoEntries;
        }
        for credit in self.credit_map.values_mut() {
            credit.reauth();
        }
        info!(
            imsi = %self.imsi,
            credits = self.credit_map.len(),
            "charging re-auth initiated for all credits"
        );
        ReAuthResult::UpdateInitiated
    }

    pub fn marshal(&self) -> StoredChargingCreditPool {
        let mut credits: Vec<(ChargingKey, StoredSessionCredit)> = self
            .credit_map
            .iter()
            .map(|(key, credit)| (*key, credit.marshal()))
            .collect();
        credits.sort_by_key(|(key, _)| *key);
        StoredChargingCreditPool {
            imsi: self.imsi.clone(),
            credits,
        }
    }

    /// Restore a pool. Any malformed entry fails the whole restore.
    pub fn unmarshal(marshaled: &StoredChargingCreditPool, config: CreditConfig) -> Result<Self> {
        if marshaled.imsi.is_empty() {
            return Err(Error::MalformedSnapshot(
                "charging pool has no subscriber identity".into(),
            ));
        }
        let mut pool = Self::with_config(marshaled.imsi.clone(), config);
        for (key, stored) in &marshaled.credits {
            let credit = SessionCredit::unmarshal(stored)
                .map_err(|e| e.context(format!("charging credit {key}")))?;
            pool.insert_restored(*key, credit).map_err(|_| {
                Error::MalformedSnapshot(format!("duplicate charging credit {key}"))
            })?;
        }
        debug!(imsi = %pool.imsi, credits = pool.len(), "charging pool restored");
        Ok(pool)
    }

    fn init_new_credit(&mut self, response: &CreditUpdateResponse, outcome: GrantOutcome) -> bool {
        let key = response.charging_key;
        if outcome != GrantOutcome::Granted {
            warn!(
                imsi = %self.imsi,
                charging_key = %key,
                result_code = response.result_code,
                "unsuccessful grant for new charging key, no credit created"
            );
            return false;
        }
        let mut credit = SessionCredit::new();
        credit.apply_grant(grant_from(response), unix_now());
        info!(
            imsi = %self.imsi,
            charging_key = %key,
            granted_tx = response.granted_tx,
            granted_rx = response.granted_rx,
            granted_total = response.granted_total,
            "new charging credit"
        );
        self.credit_map.insert(key, credit);
        self.new_keys.insert(key);
        true
    }
}

impl CreditPool for ChargingCreditPool {
    type Key = ChargingKey;
    type Response = CreditUpdateResponse;
    type Request = CreditUsage;
    type StoredEntry = StoredSessionCredit;

    fn add_used_credit(&mut self, key: &ChargingKey, used_tx: u64, used_rx: u64) -> bool {
        match self.credit_map.get_mut(key) {
            Some(credit) => {
                credit.add_used_credit(used_tx, used_rx);
                true
            }
            None => {
                debug!(imsi = %self.imsi, charging_key = %key, "usage for untracked charging key dropped");
                false
            }
        }
    }

    fn reset_reporting_credit(&mut self, key: &ChargingKey) -> bool {
        match self.credit_map.get_mut(key) {
            Some(credit) => {
                credit.reset_reporting();
                true
            }
            None => {
                warn!(imsi = %self.imsi, charging_key = %key, "reset reporting for unknown charging key");
                false
            }
        }
    }

    fn get_updates(
        &mut self,
        ip_addr: &str,
        static_rules: &dyn RuleLookup,
        dynamic_rules: Option<&dyn RuleLookup>,
    ) -> (Vec<CreditUsage>, Vec<ServiceAction>) {
        let now = unix_now();
        let mut updates = Vec::new();
        let mut actions = Vec::new();

        for (key, credit) in self.credit_map.iter_mut() {
            if let Some(transition) = credit.poll_service_transition(&self.config) {
                let action = build_action(
                    &self.imsi,
                    ip_addr,
                    key,
                    credit,
                    transition,
                    static_rules,
                    dynamic_rules,
                );
                info!(
                    imsi = %self.imsi,
                    charging_key = %key,
                    kind = action.kind.label(),
                    rules = action.rule_ids.len(),
                    "charging enforcement action"
                );
                metrics::record_enforcement_action(CHARGING_POOL, action.kind);
                actions.push(action);
                if transition == ServiceTransition::Deactivate {
                    continue;
                }
            }

            if let Some(reason) = credit.update_reason(&self.config, now) {
                let (bytes_tx, bytes_rx) = credit.build_usage(reason);
                debug!(
                    imsi = %self.imsi,
                    charging_key = %key,
                    bytes_tx,
                    bytes_rx,
                    reason = reason.label(),
                    "charging usage request"
                );
                metrics::record_usage_request(CHARGING_POOL, reason);
                updates.push(CreditUsage {
                    charging_key: *key,
                    bytes_tx,
                    bytes_rx,
                    reason,
                });
            }
        }

        (updates, actions)
    }

    fn get_termination_updates(&self, ip_addr: &str) -> TerminationSnapshot {
        let mut snapshot = TerminationSnapshot::new(self.imsi.as_str(), ip_addr);
        let mut entries: Vec<(&ChargingKey, &SessionCredit)> = self.credit_map.iter().collect();
        entries.sort_by_key(|(key, _)| **key);
        for (key, credit) in entries {
            let (bytes_tx, bytes_rx) = credit.unreported_usage();
            snapshot.usage_records.push(UsageRecord::Charging(CreditUsage {
                charging_key: *key,
                bytes_tx,
                bytes_rx,
                reason: UsageReason::Termination,
            }));
        }
        snapshot
    }

    fn receive_credit(&mut self, response: &CreditUpdateResponse) -> bool {
        let key = response.charging_key;
        let outcome = classify_result_code(response.result_code);
        metrics::record_grant(CHARGING_POOL, outcome);

        match self.credit_map.get_mut(&key) {
            None => self.init_new_credit(response, outcome),
            Some(credit) => match outcome {
                GrantOutcome::Granted => {
                    credit.apply_grant(grant_from(response), unix_now());
                    debug!(
                        imsi = %self.imsi,
                        charging_key = %key,
                        granted_tx = response.granted_tx,
                        granted_rx = response.granted_rx,
                        is_final = response.final_unit.is_some(),
                        "charging grant applied"
                    );
                    true
                }
                GrantOutcome::Denied => {
                    warn!(
                        imsi = %self.imsi,
                        charging_key = %key,
                        result_code = response.result_code,
                        "charging credit denied, key will be enforced as exhausted"
                    );
                    credit.mark_denied(response.final_unit.clone());
                    false
                }
                GrantOutcome::Transient => {
                    warn!(
                        imsi = %self.imsi,
                        charging_key = %key,
                        result_code = response.result_code,
                        "transient charging failure, report will be retried"
                    );
                    credit.reset_reporting();
                    true
                }
            },
        }
    }

    fn get_credit(&self, key: &ChargingKey, bucket: Bucket) -> u64 {
        self.credit_map
            .get(key)
            .map(|credit| credit.get(bucket))
            .unwrap_or(0)
    }

    fn merge_credit_update(&mut self, key: &ChargingKey, update: &CreditUpdateCriteria) {
        match self.credit_map.get_mut(key) {
            Some(credit) => credit.merge(update),
            None => {
                warn!(
                    imsi = %self.imsi,
                    charging_key = %key,
                    "update criteria for unknown charging key dropped"
                );
                metrics::record_stale_delta(CHARGING_POOL);
            }
        }
    }

    fn take_update_criteria(&mut self) -> PoolUpdateCriteria<ChargingKey, StoredSessionCredit> {
        let mut update = PoolUpdateCriteria::default();
        for (key, credit) in self.credit_map.iter_mut() {
            if self.new_keys.contains(key) {
                credit.clear_update_criteria();
                update.new_entries.push((*key, credit.marshal()));
            } else if let Some(criteria) = credit.take_update_criteria() {
                update.credit_updates.push((*key, criteria));
            }
        }
        self.new_keys.clear();
        update.new_entries.sort_by_key(|(key, _)| *key);
        update.credit_updates.sort_by_key(|(key, _)| *key);
        update
    }

    fn apply_update_criteria(
        &mut self,
        update: &PoolUpdateCriteria<ChargingKey, StoredSessionCredit>,
    ) -> Result<()> {
        let mut restored = Vec::with_capacity(update.new_entries.len());
        for (key, stored) in &update.new_entries {
            let credit = SessionCredit::unmarshal(stored)
                .map_err(|e| e.context(format!("new charging credit {key}")))?;
            restored.push((*key, credit));
        }
        for (key, credit) in restored {
            if let Err(e) = self.insert_restored(key, credit) {
                warn!(imsi = %self.imsi, error = %e, "new charging credit already in checkpoint");
            }
        }
        for (key, criteria) in &update.credit_updates {
            self.merge_credit_update(key, criteria);
        }
        Ok(())
    }
}

fn grant_from(response: &CreditUpdateResponse) -> Grant {
    Grant {
        total: response.granted_total,
        tx: response.granted_tx,
        rx: response.granted_rx,
        validity_seconds: response.validity_seconds,
        final_action: response.final_unit.clone(),
    }
}

/// Build the action for a service transition, scoped to the key's rules.
fn build_action(
    imsi: &str,
    ip_addr: &str,
    key: &ChargingKey,
    credit: &SessionCredit,
    transition: ServiceTransition,
    static_rules: &dyn RuleLookup,
    dynamic_rules: Option<&dyn RuleLookup>,
) -> ServiceAction {
    let rule_ids = policy::collect_rules(RuleKey::Charging(key), static_rules, dynamic_rules);
    let kind = match (transition, credit.final_action()) {
        (ServiceTransition::Activate, _) => ActionKind::Continue,
        (ServiceTransition::Deactivate, Some(FinalUnitAction::Redirect { .. })) => {
            ActionKind::Redirect
        }
        (ServiceTransition::Deactivate, Some(FinalUnitAction::RestrictAccess { .. })) => {
            ActionKind::Restrict
        }
        (ServiceTransition::Deactivate, _) => ActionKind::Terminate,
    };
    let mut action = ServiceAction::new(kind, imsi, ip_addr, ActionKey::Charging(*key), rule_ids);
    match (kind, credit.final_action()) {
        (ActionKind::Redirect, Some(FinalUnitAction::Redirect { server })) => {
            action.redirect_server = Some(server.clone());
        }
        (ActionKind::Restrict, Some(FinalUnitAction::RestrictAccess { restrict_rules })) => {
            action.restrict_rules = restrict_rules.clone();
        }
        _ => {}
    }
    action
}
