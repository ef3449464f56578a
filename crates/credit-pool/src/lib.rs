//! Credit and quota accounting for one subscriber session
//!
//! Tracks data usage against grants from two authorities: the online-charging
//! authority (`ChargingCreditPool`, keyed by rating group) and the policy
//! authority (`UsageMonitoringCreditPool`, keyed by monitoring key). Both
//! implement `CreditPool`.
//!
//! Credit lifecycle:
//! 1. First successful grant for a key → credit created
//! 2. Usage accumulates → threshold crossed → usage request, credit reporting
//! 3. Grant response → allowance extended, reporting acknowledged
//! 4. Allowance used up with no grant forthcoming → enforcement action once,
//!    credit disabled
//! 5. New grant for a disabled credit → `Continue` action, service resumes
//! 6. Session ends → termination snapshot of every key's final usage
//!
//! Pools are plain data: no locking, no I/O, no timers. Callers own
//! serialization per session and persistence (see `pool` for the two-phase
//! update discipline).

pub mod action;
pub mod charging;
pub mod credit;
pub mod error;
pub mod messages;
pub mod metrics;
pub mod monitoring;
pub mod pool;
pub mod result_code;
pub mod stored;

pub use action::{ActionKey, ActionKind, ServiceAction};
pub use charging::ChargingCreditPool;
pub use credit::{
    Bucket, CreditUpdateCriteria, Grant, ReAuthState, ServiceState, ServiceTransition,
    SessionCredit,
};
pub use error::{Error, Result};
pub use messages::{
    CreditUpdateResponse, CreditUsage, FinalUnitAction, MonitoringLevel, RedirectAddressType,
    RedirectServer, TerminationSnapshot, UsageMonitorUpdate, UsageMonitoringUpdateResponse,
    UsageReason, UsageRecord,
};
pub use monitoring::{Monitor, UsageMonitoringCreditPool};
pub use pool::{CreditPool, PoolUpdateCriteria, ReAuthResult};
pub use result_code::{GrantOutcome, classify_result_code};
pub use stored::{
    StoredChargingCreditPool, StoredMonitor, StoredSessionCredit, StoredUsageMonitoringCreditPool,
};
