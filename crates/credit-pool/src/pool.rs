//! Generic credit pool contract
//!
//! A pool tracks the credits of one subscriber session, keyed by some key
//! type, fed by some grant-response type and producing some usage-request
//! type. `ChargingCreditPool` and `UsageMonitoringCreditPool` are the two
//! implementations.
//!
//! Pools do no locking and no I/O. All methods that mutate take `&mut self`,
//! so the caller must serialize access per session (one task or one mutex per
//! subscriber). Requests built by `get_updates` are answered later through
//! `receive_credit`; nothing inside the pool pairs them up or times them out.
//! An outstanding report cycle is cancelled only by `reset_reporting_credit`.
//!
//! Persistence follows a two-phase discipline the caller drives:
//! 1. Operate on the live pool
//! 2. `take_update_criteria` drains what changed since the last drain
//! 3. Caller persists the criteria
//! 4. `apply_update_criteria` / `merge_credit_update` replay it onto the
//!    checkpoint restored from the previous snapshot

use policy::RuleLookup;
use serde::{Deserialize, Serialize};

use crate::action::ServiceAction;
use crate::credit::{Bucket, CreditUpdateCriteria};
use crate::error::Result;
use crate::messages::TerminationSnapshot;

/// Outcome of a forced re-authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReAuthResult {
    /// The key(s) will report on the next scan (or already are reporting)
    UpdateInitiated,
    /// `reauth_key` for a key the pool does not hold
    KeyNotFound,
    /// `reauth_all` on an empty pool
    NoEntries,
}

/// Everything that changed in a pool since the previous drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUpdateCriteria<K, E> {
    /// Entries created since the last drain, in full
    pub new_entries: Vec<(K, E)>,
    /// Deltas for entries that already existed at the last drain
    pub credit_updates: Vec<(K, CreditUpdateCriteria)>,
    /// New session-level designation, if it changed
    pub session_level_key: Option<K>,
}

impl<K, E> Default for PoolUpdateCriteria<K, E> {
    fn default() -> Self {
        Self {
            new_entries: Vec::new(),
            credit_updates: Vec::new(),
            session_level_key: None,
        }
    }
}

impl<K, E> PoolUpdateCriteria<K, E> {
    pub fn is_empty(&self) -> bool {
        self.new_entries.is_empty()
            && self.credit_updates.is_empty()
            && self.session_level_key.is_none()
    }
}

/// Operations every credit pool provides.
///
/// Unknown keys are never errors: mutations report `false`, reads report 0.
pub trait CreditPool {
    type Key;
    /// Grant response from the remote authority
    type Response;
    /// Usage request to the remote authority
    type Request;
    /// Persisted form of one entry
    type StoredEntry;

    /// Accumulate usage. `false` if the key is untracked (usage dropped).
    fn add_used_credit(&mut self, key: &Self::Key, used_tx: u64, used_rx: u64) -> bool;

    /// Cancel the key's outstanding report cycle. `false` if the key is untracked.
    fn reset_reporting_credit(&mut self, key: &Self::Key) -> bool;

    /// Scan all entries for needed usage requests and enforcement actions.
    ///
    /// Order of the returned requests and actions is unspecified.
    fn get_updates(
        &mut self,
        ip_addr: &str,
        static_rules: &dyn RuleLookup,
        dynamic_rules: Option<&dyn RuleLookup>,
    ) -> (Vec<Self::Request>, Vec<ServiceAction>);

    /// Final usage of every entry regardless of threshold state.
    fn get_termination_updates(&self, ip_addr: &str) -> TerminationSnapshot;

    /// Ingest a grant, creating the entry if the key is new.
    ///
    /// `false` means the key is refused credit (or was never created) and is
    /// handled as exhausted on the next scan.
    fn receive_credit(&mut self, response: &Self::Response) -> bool;

    /// Read one bucket of a key. 0 for unknown keys.
    fn get_credit(&self, key: &Self::Key, bucket: Bucket) -> u64;

    /// Replay a delta onto the entry. Stale deltas are logged and dropped.
    fn merge_credit_update(&mut self, key: &Self::Key, update: &CreditUpdateCriteria);

    /// Drain the changes made since the previous drain.
    fn take_update_criteria(&mut self) -> PoolUpdateCriteria<Self::Key, Self::StoredEntry>;

    /// Replay drained changes onto this pool (a restored checkpoint).
    ///
    /// Fails only if a new entry cannot be restored; nothing is applied then.
    fn apply_update_criteria(
        &mut self,
        update: &PoolUpdateCriteria<Self::Key, Self::StoredEntry>,
    ) -> Result<()>;
}
