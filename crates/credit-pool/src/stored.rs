//! Persisted forms of credits and pools
//!
//! These are what a session store writes and reads back on restart. Entries
//! are kept as ordered lists (sorted by key on marshal) so two snapshots of
//! the same state serialize identically. A missing `imsi` deserializes as
//! empty and is rejected by `unmarshal`, so both a truncated document and a
//! hand-built snapshot fail the same way.

use std::collections::BTreeMap;

use policy::ChargingKey;
use serde::{Deserialize, Serialize};

use crate::credit::{Bucket, ReAuthState, ServiceState};
use crate::messages::{FinalUnitAction, MonitoringLevel};

/// Stored state of one `SessionCredit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSessionCredit {
    pub reporting: bool,
    #[serde(default)]
    pub granted: bool,
    pub is_final: bool,
    #[serde(default)]
    pub denied: bool,
    #[serde(default)]
    pub reauth_state: ReAuthState,
    #[serde(default)]
    pub service_state: ServiceState,
    #[serde(default)]
    pub expiry_time: Option<u64>,
    #[serde(default)]
    pub final_action: Option<FinalUnitAction>,
    pub buckets: BTreeMap<Bucket, u64>,
}

/// Stored state of one usage monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMonitor {
    pub credit: StoredSessionCredit,
    pub level: MonitoringLevel,
}

/// Stored charging pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredChargingCreditPool {
    #[serde(default)]
    pub imsi: String,
    #[serde(default)]
    pub credits: Vec<(ChargingKey, StoredSessionCredit)>,
}

/// Stored usage-monitoring pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUsageMonitoringCreditPool {
    #[serde(default)]
    pub imsi: String,
    #[serde(default)]
    pub monitors: Vec<(String, StoredMonitor)>,
    #[serde(default)]
    pub session_level_key: Option<String>,
}
