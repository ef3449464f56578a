//! In-memory rule store
//!
//! Holds rule definitions by id. Used as the static store (rules installed
//! with the gateway) and as the per-session dynamic store (rules pushed by
//! the policy authority). Both are queried through `RuleLookup`.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::{Error, PolicyRule, Result, RuleId, RuleKey, RuleLookup};

/// Rule definitions keyed by rule id.
#[derive(Debug, Default, Clone)]
pub struct RuleStore {
    rules: HashMap<RuleId, PolicyRule>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a rule. Rules need a non-empty id.
    pub fn insert(&mut self, rule: PolicyRule) -> Result<()> {
        if rule.id.trim().is_empty() {
            return Err(Error::InvalidRule("rule id must not be empty".into()));
        }
        debug!(rule_id = %rule.id, "rule installed");
        self.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    /// Remove a rule, returning it if it existed.
    pub fn remove(&mut self, rule_id: &str) -> Option<PolicyRule> {
        let removed = self.rules.remove(rule_id);
        if removed.is_some() {
            debug!(rule_id, "rule removed");
        }
        removed
    }

    pub fn get(&self, rule_id: &str) -> Option<&PolicyRule> {
        self.rules.get(rule_id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl FromIterator<PolicyRule> for RuleStore {
    /// Collect rules, skipping ones with an empty id.
    fn from_iter<I: IntoIterator<Item = PolicyRule>>(iter: I) -> Self {
        let mut store = Self::new();
        for rule in iter {
            let _ = store.insert(rule);
        }
        store
    }
}

impl RuleLookup for RuleStore {
    fn rules_bound_to(&self, key: RuleKey<'_>) -> BTreeSet<RuleId> {
        self.rules
            .values()
            .filter(|rule| rule.is_bound_to(key))
            .map(|rule| rule.id.clone())
            .collect()
    }

    fn all_rules(&self) -> BTreeSet<RuleId> {
        self.rules.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChargingKey;

    fn charging_rule(id: &str, rating_group: u32) -> PolicyRule {
        PolicyRule {
            id: id.into(),
            charging_key: Some(ChargingKey::new(rating_group)),
            monitoring_key: None,
        }
    }

    fn monitoring_rule(id: &str, key: &str) -> PolicyRule {
        PolicyRule {
            id: id.into(),
            charging_key: None,
            monitoring_key: Some(key.into()),
        }
    }

    #[test]
    fn insert_rejects_empty_id() {
        let mut store = RuleStore::new();
        let err = store.insert(charging_rule("  ", 1)).unwrap_err();
        assert!(err.to_string().contains("empty"));
        assert!(store.is_empty());
    }

    #[test]
    fn insert_replaces_same_id() {
        let mut store = RuleStore::new();
        store.insert(charging_rule("r1", 1)).unwrap();
        store.insert(charging_rule("r1", 2)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get("r1").unwrap().charging_key,
            Some(ChargingKey::new(2))
        );
    }

    #[test]
    fn remove_returns_rule() {
        let mut store = RuleStore::new();
        store.insert(charging_rule("r1", 1)).unwrap();
        assert!(store.remove("r1").is_some());
        assert!(store.remove("r1").is_none());
    }

    #[test]
    fn lookup_by_charging_key() {
        let store: RuleStore = vec![
            charging_rule("a", 1),
            charging_rule("b", 1),
            charging_rule("c", 2),
        ]
        .into_iter()
        .collect();

        let key = ChargingKey::new(1);
        let rules = store.rules_bound_to(RuleKey::Charging(&key));
        assert_eq!(
            rules.into_iter().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn lookup_by_monitoring_key() {
        let store: RuleStore = vec![monitoring_rule("m1", "mk-1"), monitoring_rule("m2", "mk-2")]
            .into_iter()
            .collect();

        let rules = store.rules_bound_to(RuleKey::Monitoring("mk-2"));
        assert_eq!(rules.len(), 1);
        assert!(rules.contains("m2"));
        assert!(store.rules_bound_to(RuleKey::Monitoring("none")).is_empty());
    }

    #[test]
    fn all_rules_lists_every_id() {
        let store: RuleStore = vec![charging_rule("a", 1), monitoring_rule("m", "mk")]
            .into_iter()
            .collect();
        assert_eq!(store.all_rules().len(), 2);
    }
}
