//! Persisted session state and the drained changes replayed onto it

use common::CreditConfig;
use credit_pool::{
    ChargingCreditPool, CreditPool, PoolUpdateCriteria, StoredChargingCreditPool, StoredMonitor,
    StoredSessionCredit, StoredUsageMonitoringCreditPool, UsageMonitoringCreditPool,
};
use policy::ChargingKey;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Checkpoint of both pools of one subscriber session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSessionState {
    pub charging: StoredChargingCreditPool,
    pub monitoring: StoredUsageMonitoringCreditPool,
}

impl StoredSessionState {
    pub fn from_pools(charging: &ChargingCreditPool, monitoring: &UsageMonitoringCreditPool) -> Self {
        Self {
            charging: charging.marshal(),
            monitoring: monitoring.marshal(),
        }
    }

    /// Rebuild both pools. Either both restore or neither does.
    pub fn restore(
        &self,
        config: CreditConfig,
    ) -> Result<(ChargingCreditPool, UsageMonitoringCreditPool)> {
        let charging = ChargingCreditPool::unmarshal(&self.charging, config)?;
        let monitoring = UsageMonitoringCreditPool::unmarshal(&self.monitoring, config)?;
        Ok((charging, monitoring))
    }
}

/// Changes drained from both live pools of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub charging: PoolUpdateCriteria<ChargingKey, StoredSessionCredit>,
    pub monitoring: PoolUpdateCriteria<String, StoredMonitor>,
}

impl SessionUpdate {
    /// Drain both pools.
    pub fn take(
        charging: &mut ChargingCreditPool,
        monitoring: &mut UsageMonitoringCreditPool,
    ) -> Self {
        Self {
            charging: charging.take_update_criteria(),
            monitoring: monitoring.take_update_criteria(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.charging.is_empty() && self.monitoring.is_empty()
    }

    /// Replay onto restored checkpoint pools.
    pub fn apply_to(
        &self,
        charging: &mut ChargingCreditPool,
        monitoring: &mut UsageMonitoringCreditPool,
    ) -> Result<()> {
        charging.apply_update_criteria(&self.charging)?;
        monitoring.apply_update_criteria(&self.monitoring)?;
        Ok(())
    }
}
