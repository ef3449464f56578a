//! Policy rule lookup for credit enforcement
//!
//! Defines the `RuleLookup` trait that decouples credit accounting from rule
//! storage. A credit pool only asks which rules a charging key or monitoring
//! key governs, and only while building an enforcement action; it never owns
//! rule definitions. `RuleStore` is the in-memory implementation used for both
//! the static (preinstalled) and dynamic (pushed per session) rule sets.

pub mod store;

pub use store::RuleStore;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Identifier of a policy rule.
pub type RuleId = String;

/// Online-charging credit identity: rating group plus optional service id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChargingKey {
    pub rating_group: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<u32>,
}

impl ChargingKey {
    pub fn new(rating_group: u32) -> Self {
        Self {
            rating_group,
            service_id: None,
        }
    }

    pub fn with_service(rating_group: u32, service_id: u32) -> Self {
        Self {
            rating_group,
            service_id: Some(service_id),
        }
    }
}

impl From<u32> for ChargingKey {
    fn from(rating_group: u32) -> Self {
        Self::new(rating_group)
    }
}

impl fmt::Display for ChargingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.service_id {
            Some(sid) => write!(f, "rg:{}/sid:{}", self.rating_group, sid),
            None => write!(f, "rg:{}", self.rating_group),
        }
    }
}

/// Key a rule lookup is made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKey<'a> {
    Charging(&'a ChargingKey),
    Monitoring(&'a str),
}

/// A policy rule as far as credit enforcement is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: RuleId,
    #[serde(default)]
    pub charging_key: Option<ChargingKey>,
    #[serde(default)]
    pub monitoring_key: Option<String>,
}

impl PolicyRule {
    /// Whether the rule is governed by the given key.
    pub fn is_bound_to(&self, key: RuleKey<'_>) -> bool {
        match key {
            RuleKey::Charging(ck) => self.charging_key.as_ref() == Some(ck),
            RuleKey::Monitoring(mk) => self.monitoring_key.as_deref() == Some(mk),
        }
    }
}

/// Errors from rule store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid rule: {0}")]
    InvalidRule(String),
}

/// Result alias for rule store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Resolves which enforcement rules a credit key governs.
///
/// Queried only while a pool builds enforcement actions for exhausted keys.
pub trait RuleLookup {
    /// Rules bound to the charging or monitoring key.
    fn rules_bound_to(&self, key: RuleKey<'_>) -> BTreeSet<RuleId>;

    /// Every rule known to this lookup (session-wide enforcement scope).
    fn all_rules(&self) -> BTreeSet<RuleId>;
}

/// Union of rules bound to `key` across the static and optional dynamic store.
pub fn collect_rules(
    key: RuleKey<'_>,
    static_rules: &dyn RuleLookup,
    dynamic_rules: Option<&dyn RuleLookup>,
) -> BTreeSet<RuleId> {
    let mut rules = static_rules.rules_bound_to(key);
    if let Some(dynamic) = dynamic_rules {
        rules.extend(dynamic.rules_bound_to(key));
    }
    rules
}

/// Union of every rule across the static and optional dynamic store.
pub fn collect_all_rules(
    static_rules: &dyn RuleLookup,
    dynamic_rules: Option<&dyn RuleLookup>,
) -> BTreeSet<RuleId> {
    let mut rules = static_rules.all_rules();
    if let Some(dynamic) = dynamic_rules {
        rules.extend(dynamic.all_rules());
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, ck: Option<ChargingKey>, mk: Option<&str>) -> PolicyRule {
        PolicyRule {
            id: id.into(),
            charging_key: ck,
            monitoring_key: mk.map(String::from),
        }
    }

    #[test]
    fn charging_key_display() {
        assert_eq!(ChargingKey::new(5).to_string(), "rg:5");
        assert_eq!(ChargingKey::with_service(5, 9).to_string(), "rg:5/sid:9");
    }

    #[test]
    fn charging_key_with_service_is_distinct() {
        assert_ne!(ChargingKey::new(5), ChargingKey::with_service(5, 1));
        assert_eq!(ChargingKey::from(5), ChargingKey::new(5));
    }

    #[test]
    fn charging_key_serializes_without_absent_service() {
        let json = serde_json::to_string(&ChargingKey::new(3)).unwrap();
        assert_eq!(json, r#"{"rating_group":3}"#);
        let back: ChargingKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ChargingKey::new(3));
    }

    #[test]
    fn rule_binding_matches_exact_charging_key() {
        let r = rule("r1", Some(ChargingKey::with_service(1, 2)), None);
        assert!(r.is_bound_to(RuleKey::Charging(&ChargingKey::with_service(1, 2))));
        assert!(!r.is_bound_to(RuleKey::Charging(&ChargingKey::new(1))));
        assert!(!r.is_bound_to(RuleKey::Monitoring("mk")));
    }

    #[test]
    fn collect_rules_unions_dynamic_store() {
        let mut static_rules = RuleStore::new();
        static_rules
            .insert(rule("static-1", Some(ChargingKey::new(1)), None))
            .unwrap();
        let mut dynamic_rules = RuleStore::new();
        dynamic_rules
            .insert(rule("dyn-1", Some(ChargingKey::new(1)), None))
            .unwrap();
        dynamic_rules.insert(rule("dyn-2", None, Some("mk"))).unwrap();

        let key = ChargingKey::new(1);
        let dynamic: &dyn RuleLookup = &dynamic_rules;
        let only_static = collect_rules(RuleKey::Charging(&key), &static_rules, None);
        assert_eq!(only_static.len(), 1);

        let both = collect_rules(RuleKey::Charging(&key), &static_rules, Some(dynamic));
        assert_eq!(
            both.into_iter().collect::<Vec<_>>(),
            vec!["dyn-1".to_string(), "static-1".to_string()]
        );

        let all = collect_all_rules(&static_rules, Some(dynamic));
        assert_eq!(all.len(), 3);
    }
}
