//! Enforcement actions produced for exhausted or re-enabled credits

use std::collections::BTreeSet;
use std::fmt;

use policy::{ChargingKey, RuleId};
use serde::{Deserialize, Serialize};

use crate::messages::RedirectServer;

/// Directive for the traffic tied to a credit key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Service resumes (a disabled credit received a new grant)
    Continue,
    Terminate,
    Redirect,
    Restrict,
}

impl ActionKind {
    /// Label for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::Continue => "continue",
            ActionKind::Terminate => "terminate",
            ActionKind::Redirect => "redirect",
            ActionKind::Restrict => "restrict",
        }
    }
}

/// Credit key an action was produced for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKey {
    Charging(ChargingKey),
    Monitoring(String),
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKey::Charging(key) => write!(f, "{key}"),
            ActionKey::Monitoring(key) => write!(f, "mk:{key}"),
        }
    }
}

/// An enforcement directive scoped to a subscriber, address and rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAction {
    pub kind: ActionKind,
    pub imsi: String,
    pub ip_addr: String,
    pub key: ActionKey,
    pub rule_ids: BTreeSet<RuleId>,
    /// Set for `Redirect`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_server: Option<RedirectServer>,
    /// Set for `Restrict` on charging keys: rules that stay permitted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restrict_rules: Vec<RuleId>,
}

impl ServiceAction {
    pub fn new(
        kind: ActionKind,
        imsi: &str,
        ip_addr: &str,
        key: ActionKey,
        rule_ids: BTreeSet<RuleId>,
    ) -> Self {
        Self {
            kind,
            imsi: imsi.to_string(),
            ip_addr: ip_addr.to_string(),
            key,
            rule_ids,
            redirect_server: None,
            restrict_rules: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels() {
        assert_eq!(ActionKind::Continue.label(), "continue");
        assert_eq!(ActionKind::Terminate.label(), "terminate");
        assert_eq!(ActionKind::Redirect.label(), "redirect");
        assert_eq!(ActionKind::Restrict.label(), "restrict");
    }

    #[test]
    fn key_display() {
        assert_eq!(ActionKey::Charging(ChargingKey::new(5)).to_string(), "rg:5");
        assert_eq!(ActionKey::Monitoring("mk-1".into()).to_string(), "mk:mk-1");
    }

    #[test]
    fn new_action_has_no_redirect_or_restrict_payload() {
        let action = ServiceAction::new(
            ActionKind::Terminate,
            "IMSI1",
            "10.0.0.1",
            ActionKey::Charging(ChargingKey::new(5)),
            BTreeSet::new(),
        );
        assert!(action.redirect_server.is_none());
        assert!(action.restrict_rules.is_empty());
        let json = serde_json::to_value(&action).unwrap();
        assert!(json.get("redirect_server").is_none());
        assert_eq!(json["kind"], "terminate");
    }
}
