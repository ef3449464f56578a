//! Request/response messages exchanged with the charging and policy authorities
//!
//! Field-level contracts only. Encoding and transport are handled by the
//! caller; pools produce requests from `get_updates` and ingest responses in
//! `receive_credit` at some later call.

use policy::{ChargingKey, RuleId};
use serde::{Deserialize, Serialize};

/// Why a usage report was generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageReason {
    /// Usage crossed the reporting threshold of the current grant
    Threshold,
    /// The grant's validity time elapsed
    ValidityTimerExpired,
    /// Operator or authority forced re-validation
    ForcedReauth,
    /// Session close-out
    Termination,
}

impl UsageReason {
    pub fn label(&self) -> &'static str {
        match self {
            UsageReason::Threshold => "threshold",
            UsageReason::ValidityTimerExpired => "validity_timer_expired",
            UsageReason::ForcedReauth => "forced_reauth",
            UsageReason::Termination => "termination",
        }
    }
}

/// Address form of a redirect target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectAddressType {
    Ipv4,
    Ipv6,
    Url,
    SipUri,
}

/// Where redirected traffic is sent once the final units are used up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectServer {
    pub address_type: RedirectAddressType,
    pub server_address: String,
}

/// What to do once a final grant is consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FinalUnitAction {
    Terminate,
    Redirect { server: RedirectServer },
    RestrictAccess { restrict_rules: Vec<RuleId> },
}

/// Charging usage request sent to the online-charging authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditUsage {
    #[serde(flatten)]
    pub charging_key: ChargingKey,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub reason: UsageReason,
}

/// Charging grant response from the online-charging authority.
///
/// Charging credits have no session-level designation; `is_session_level`
/// is carried for wire compatibility and not acted on by the charging pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditUpdateResponse {
    #[serde(flatten)]
    pub charging_key: ChargingKey,
    pub result_code: u32,
    #[serde(default)]
    pub granted_total: u64,
    #[serde(default)]
    pub granted_tx: u64,
    #[serde(default)]
    pub granted_rx: u64,
    /// Zero means the grant does not expire.
    #[serde(default)]
    pub validity_seconds: u64,
    #[serde(default)]
    pub is_session_level: bool,
    /// Present when this is the final grant for the key.
    #[serde(default)]
    pub final_unit: Option<FinalUnitAction>,
}

impl CreditUpdateResponse {
    /// Successful directional grant with no validity limit.
    pub fn granted(charging_key: ChargingKey, granted_tx: u64, granted_rx: u64) -> Self {
        Self {
            charging_key,
            result_code: crate::result_code::DIAMETER_SUCCESS,
            granted_total: 0,
            granted_tx,
            granted_rx,
            validity_seconds: 0,
            is_session_level: false,
            final_unit: None,
        }
    }
}

/// Granularity of a usage-monitoring key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringLevel {
    /// Tracks whole-session usage
    SessionLevel,
    /// Tracks usage of the rules bound to the key
    RuleLevel,
}

/// Usage-monitoring report sent to the policy authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMonitorUpdate {
    pub monitoring_key: String,
    pub level: MonitoringLevel,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
}

/// Usage-monitoring grant from the policy authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMonitoringUpdateResponse {
    pub monitoring_key: String,
    pub level: MonitoringLevel,
    pub granted_total: u64,
    pub success: bool,
}

/// One key's final usage in a termination snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UsageRecord {
    Charging(CreditUsage),
    Monitoring(UsageMonitorUpdate),
}

impl UsageRecord {
    pub fn bytes_tx(&self) -> u64 {
        match self {
            UsageRecord::Charging(u) => u.bytes_tx,
            UsageRecord::Monitoring(u) => u.bytes_tx,
        }
    }

    pub fn bytes_rx(&self) -> u64 {
        match self {
            UsageRecord::Charging(u) => u.bytes_rx,
            UsageRecord::Monitoring(u) => u.bytes_rx,
        }
    }
}

/// Final usage of every key in a session, built at termination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationSnapshot {
    pub imsi: String,
    pub ip_addr: String,
    pub usage_records: Vec<UsageRecord>,
}

impl TerminationSnapshot {
    pub fn new(imsi: impl Into<String>, ip_addr: impl Into<String>) -> Self {
        Self {
            imsi: imsi.into(),
            ip_addr: ip_addr.into(),
            usage_records: Vec::new(),
        }
    }

    /// Append another pool's records for the same session.
    pub fn merge(&mut self, other: TerminationSnapshot) {
        self.usage_records.extend(other.usage_records);
    }

    pub fn total_tx(&self) -> u64 {
        self.usage_records.iter().map(UsageRecord::bytes_tx).sum()
    }

    pub fn total_rx(&self) -> u64 {
        self.usage_records.iter().map(UsageRecord::bytes_rx).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_usage_flattens_charging_key() {
        let usage = CreditUsage {
            charging_key: ChargingKey::with_service(5, 2),
            bytes_tx: 10,
            bytes_rx: 20,
            reason: UsageReason::Threshold,
        };
        let json = serde_json::to_value(&usage).unwrap();
        assert_eq!(json["rating_group"], 5);
        assert_eq!(json["service_id"], 2);
        assert_eq!(json["reason"], "threshold");
    }

    #[test]
    fn grant_response_defaults_optional_fields() {
        let response: CreditUpdateResponse =
            serde_json::from_str(r#"{"rating_group":7,"result_code":2001,"granted_tx":500}"#)
                .unwrap();
        assert_eq!(response.charging_key, ChargingKey::new(7));
        assert_eq!(response.granted_tx, 500);
        assert_eq!(response.granted_rx, 0);
        assert_eq!(response.validity_seconds, 0);
        assert!(response.final_unit.is_none());
    }

    #[test]
    fn final_unit_action_is_tagged() {
        let action = FinalUnitAction::Redirect {
            server: RedirectServer {
                address_type: RedirectAddressType::Url,
                server_address: "http://topup.example".into(),
            },
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "redirect");
        assert_eq!(json["server"]["address_type"], "url");
    }

    #[test]
    fn termination_snapshot_merges_and_totals() {
        let mut charging = TerminationSnapshot::new("IMSI1", "10.0.0.1");
        charging.usage_records.push(UsageRecord::Charging(CreditUsage {
            charging_key: ChargingKey::new(1),
            bytes_tx: 100,
            bytes_rx: 200,
            reason: UsageReason::Termination,
        }));
        let mut monitoring = TerminationSnapshot::new("IMSI1", "10.0.0.1");
        monitoring
            .usage_records
            .push(UsageRecord::Monitoring(UsageMonitorUpdate {
                monitoring_key: "mk".into(),
                level: MonitoringLevel::RuleLevel,
                bytes_tx: 1,
                bytes_rx: 2,
            }));

        charging.merge(monitoring);
        assert_eq!(charging.usage_records.len(), 2);
        assert_eq!(charging.total_tx(), 101);
        assert_eq!(charging.total_rx(), 202);
    }

    #[test]
    fn reason_labels() {
        assert_eq!(UsageReason::Threshold.label(), "threshold");
        assert_eq!(UsageReason::ForcedReauth.label(), "forced_reauth");
        assert_eq!(UsageReason::Termination.label(), "termination");
    }
}
