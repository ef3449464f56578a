//! File-backed session checkpoints
//!
//! One JSON document maps each IMSI to the stored state of its two credit
//! pools. Sessions are kept ordered by IMSI so the same state always writes
//! the same bytes. Every change is written to a temp file and renamed into
//! place, and the in-memory map only moves forward once that write landed.
//!
//! The store serializes writers across sessions. Ordering updates within one
//! session is still the caller's job.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use common::CreditConfig;
use credit_pool::{ChargingCreditPool, UsageMonitoringCreditPool};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::state::{SessionUpdate, StoredSessionState};

type Sessions = BTreeMap<String, StoredSessionState>;

/// Checkpoint store for every active session.
pub struct SessionStore {
    path: PathBuf,
    /// Config pools are restored with
    config: CreditConfig,
    sessions: Mutex<Sessions>,
}

impl SessionStore {
    /// Open the checkpoint file with the default credit config.
    pub async fn load(path: PathBuf) -> Result<Self> {
        Self::load_with_config(path, CreditConfig::default()).await
    }

    /// Open the checkpoint file. A missing file is a cold start: an empty
    /// document is written so the path is known-good before the first session.
    pub async fn load_with_config(path: PathBuf, config: CreditConfig) -> Result<Self> {
        let sessions = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading session file: {e}")))?;
            let sessions: Sessions = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing session file: {e}")))?;
            info!(path = %path.display(), sessions = sessions.len(), "loaded session checkpoints");
            sessions
        } else {
            info!(path = %path.display(), "no session file, cold start");
            let sessions = Sessions::new();
            write_atomic(&path, &sessions).await?;
            sessions
        };

        Ok(Self {
            path,
            config,
            sessions: Mutex::new(sessions),
        })
    }

    pub fn config(&self) -> &CreditConfig {
        &self.config
    }

    /// Rewrite the checkpoint file from memory.
    pub async fn save(&self) -> Result<()> {
        let sessions = self.sessions.lock().await;
        write_atomic(&self.path, &sessions).await
    }

    pub async fn get(&self, imsi: &str) -> Option<StoredSessionState> {
        self.sessions.lock().await.get(imsi).cloned()
    }

    /// Rebuild the live pools of a stored session after a restart.
    pub async fn restore(
        &self,
        imsi: &str,
    ) -> Result<(ChargingCreditPool, UsageMonitoringCreditPool)> {
        let stored = self
            .get(imsi)
            .await
            .ok_or_else(|| Error::NotFound(format!("session {imsi} not in store")))?;
        stored.restore(self.config)
    }

    /// Store the initial (or a full replacement) checkpoint of a session.
    pub async fn put(&self, imsi: String, session: StoredSessionState) -> Result<()> {
        self.commit(|sessions| {
            sessions.insert(imsi.clone(), session);
            Ok(())
        })
        .await?;
        debug!(imsi, "stored session checkpoint");
        Ok(())
    }

    /// Drop a terminated session. Returns its last checkpoint if it had one.
    pub async fn remove(&self, imsi: &str) -> Result<Option<StoredSessionState>> {
        let mut sessions = self.sessions.lock().await;
        if !sessions.contains_key(imsi) {
            return Ok(None);
        }
        let mut next = sessions.clone();
        let removed = next.remove(imsi);
        write_atomic(&self.path, &next).await?;
        *sessions = next;
        debug!(imsi, "removed session checkpoint");
        Ok(removed)
    }

    /// Replay drained pool changes onto a stored session and persist.
    ///
    /// The checkpoint is only replaced once both pools restored, replayed and
    /// were written to disk; on error memory and disk keep the old checkpoint.
    pub async fn apply_update(&self, imsi: &str, update: &SessionUpdate) -> Result<()> {
        let config = self.config;
        self.commit(|sessions| {
            let stored = sessions
                .get(imsi)
                .ok_or_else(|| Error::NotFound(format!("session {imsi} not in store")))?;
            let (mut charging, mut monitoring) = stored.restore(config).inspect_err(|e| {
                warn!(imsi, error = %e, "stored session failed to restore");
            })?;
            update.apply_to(&mut charging, &mut monitoring)?;
            sessions.insert(
                imsi.to_string(),
                StoredSessionState::from_pools(&charging, &monitoring),
            );
            Ok(())
        })
        .await?;
        debug!(
            imsi,
            new_credits = update.charging.new_entries.len(),
            credit_updates = update.charging.credit_updates.len(),
            new_monitors = update.monitoring.new_entries.len(),
            monitor_updates = update.monitoring.credit_updates.len(),
            "applied session update"
        );
        Ok(())
    }

    /// Stored IMSIs, in order.
    pub async fn imsis(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Apply `change` to a copy of the sessions, persist the copy, then swap
    /// it in.
    async fn commit<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Sessions) -> Result<()>,
    {
        let mut sessions = self.sessions.lock().await;
        let mut next = sessions.clone();
        change(&mut next)?;
        write_atomic(&self.path, &next).await?;
        *sessions = next;
        Ok(())
    }
}

/// Write the session document via temp file + rename, mode 0600 since it
/// holds subscriber identities and usage.
async fn write_atomic(path: &Path, sessions: &Sessions) -> Result<()> {
    let json = serde_json::to_string_pretty(sessions)
        .map_err(|e| Error::Parse(format!("serializing sessions: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("session path has no parent directory".into()))?;
    let tmp_path = dir.join(format!(".sessions.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp session file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| Error::Io(format!("restricting session file: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp session file: {e}")))?;

    debug!(path = %path.display(), sessions = sessions.len(), "persisted session checkpoints");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use credit_pool::{
        Bucket, CreditPool, CreditUpdateResponse, MonitoringLevel, UsageMonitoringUpdateResponse,
    };
    use policy::{ChargingKey, RuleStore};

    const IMSI: &str = "IMSI001010000000042";
    const IP: &str = "10.0.0.9";

    /// Live pools of a session that received one charging grant.
    fn live_session(imsi: &str, rating_group: u32) -> (ChargingCreditPool, UsageMonitoringCreditPool) {
        let mut charging = ChargingCreditPool::new(imsi);
        charging.receive_credit(&CreditUpdateResponse::granted(
            ChargingKey::new(rating_group),
            1000,
            1000,
        ));
        let mut monitoring = UsageMonitoringCreditPool::new(imsi);
        SessionUpdate::take(&mut charging, &mut monitoring);
        (charging, monitoring)
    }

    fn checkpoint(imsi: &str, rating_group: u32) -> StoredSessionState {
        let (charging, monitoring) = live_session(imsi, rating_group);
        StoredSessionState::from_pools(&charging, &monitoring)
    }

    async fn open_store(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::load(dir.path().join("sessions.json"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn restart_restores_live_pools() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.put(IMSI.into(), checkpoint(IMSI, 1)).await.unwrap();
        drop(store);

        let restarted = open_store(&dir).await;
        let (charging, monitoring) = restarted.restore(IMSI).await.unwrap();
        assert_eq!(charging.imsi(), IMSI);
        assert_eq!(
            charging.get_credit(&ChargingKey::new(1), Bucket::AllowedTotalTx),
            1000
        );
        assert!(monitoring.is_empty());
    }

    #[tokio::test]
    async fn cold_start_has_no_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        assert!(!path.exists());
        let store = SessionStore::load(path.clone()).await.unwrap();
        assert!(store.is_empty().await);
        assert!(matches!(store.restore(IMSI).await, Err(Error::NotFound(_))));

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: Sessions = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let result = SessionStore::load(path).await;
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn loaded_config_is_used_for_restore() {
        let dir = tempfile::tempdir().unwrap();
        let config = CreditConfig {
            usage_reporting_threshold: 0.5,
            ..CreditConfig::default()
        };
        let store = SessionStore::load_with_config(dir.path().join("sessions.json"), config)
            .await
            .unwrap();
        store.put(IMSI.into(), checkpoint(IMSI, 1)).await.unwrap();

        let (mut charging, _) = store.restore(IMSI).await.unwrap();
        assert_eq!(charging.config(), &config);
        // 50% of 1000 reports where the default 80% would not
        charging.add_used_credit(&ChargingKey::new(1), 500, 0);
        let (requests, _) = charging.get_updates(IP, &RuleStore::new(), None);
        assert_eq!(requests.len(), 1);
    }

    #[tokio::test]
    async fn terminated_sessions_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.put("imsi-b".into(), checkpoint("imsi-b", 2)).await.unwrap();
        store.put("imsi-a".into(), checkpoint("imsi-a", 1)).await.unwrap();
        assert_eq!(store.imsis().await, vec!["imsi-a", "imsi-b"]);

        let removed = store.remove("imsi-a").await.unwrap().unwrap();
        assert_eq!(removed.charging.imsi, "imsi-a");
        assert!(store.remove("imsi-a").await.unwrap().is_none());
        assert_eq!(store.imsis().await, vec!["imsi-b"]);

        let restarted = open_store(&dir).await;
        assert_eq!(restarted.imsis().await, vec!["imsi-b"]);
    }

    #[tokio::test]
    async fn apply_update_for_unknown_session_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let result = store.apply_update("nobody", &SessionUpdate::default()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn checkpoint_tracks_live_pools() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let rules = RuleStore::new();

        let (mut charging, mut monitoring) = live_session(IMSI, 1);
        store
            .put(
                IMSI.into(),
                StoredSessionState::from_pools(&charging, &monitoring),
            )
            .await
            .unwrap();

        // one request/response cycle on the live pools
        charging.add_used_credit(&ChargingKey::new(1), 900, 50);
        let (requests, _) = charging.get_updates(IP, &rules, None);
        assert_eq!(requests.len(), 1);
        charging.receive_credit(&CreditUpdateResponse::granted(ChargingKey::new(1), 1000, 0));
        charging.receive_credit(&CreditUpdateResponse::granted(ChargingKey::new(3), 10, 10));
        monitoring.receive_credit(&UsageMonitoringUpdateResponse {
            monitoring_key: "session".into(),
            level: MonitoringLevel::SessionLevel,
            granted_total: 5000,
            success: true,
        });
        monitoring.add_used_credit(&"session".to_string(), 12, 34);

        let update = SessionUpdate::take(&mut charging, &mut monitoring);
        store.apply_update(IMSI, &update).await.unwrap();

        let live = StoredSessionState::from_pools(&charging, &monitoring);
        assert_eq!(store.get(IMSI).await.unwrap(), live);

        let restarted = open_store(&dir).await;
        assert_eq!(restarted.get(IMSI).await.unwrap(), live);
    }

    #[tokio::test]
    async fn malformed_checkpoint_is_never_partially_updated() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let mut broken = checkpoint(IMSI, 1);
        broken.charging.credits[0].1.buckets.remove(&Bucket::UsedRx);
        store.put(IMSI.into(), broken.clone()).await.unwrap();

        let (mut charging, mut monitoring) = live_session(IMSI, 1);
        charging.receive_credit(&CreditUpdateResponse::granted(ChargingKey::new(9), 1, 1));
        let update = SessionUpdate::take(&mut charging, &mut monitoring);

        let result = store.apply_update(IMSI, &update).await;
        assert!(matches!(
            result,
            Err(Error::Pool(credit_pool::Error::MalformedSnapshot(_)))
        ));
        assert_eq!(store.get(IMSI).await.unwrap(), broken);
    }

    #[tokio::test]
    async fn failed_write_keeps_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("sessions.json");
        tokio::fs::create_dir(path.parent().unwrap()).await.unwrap();
        let store = SessionStore::load(path.clone()).await.unwrap();
        let (mut charging, mut monitoring) = live_session(IMSI, 1);
        let original = StoredSessionState::from_pools(&charging, &monitoring);
        store.put(IMSI.into(), original.clone()).await.unwrap();

        // the directory disappears under the store, so the temp write fails
        tokio::fs::remove_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        charging.add_used_credit(&ChargingKey::new(1), 100, 0);
        let update = SessionUpdate::take(&mut charging, &mut monitoring);

        let result = store.apply_update(IMSI, &update).await;
        assert!(matches!(result, Err(Error::Io(_))));
        assert_eq!(store.get(IMSI).await.unwrap(), original);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn checkpoint_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = SessionStore::load(path.clone()).await.unwrap();
        store.put(IMSI.into(), checkpoint(IMSI, 1)).await.unwrap();
        store
            .apply_update(IMSI, &SessionUpdate::default())
            .await
            .unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "session file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn sessions_update_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = std::sync::Arc::new(SessionStore::load(path.clone()).await.unwrap());

        let mut handles = vec![];
        for rating_group in 0..10u32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let imsi = format!("imsi-{rating_group}");
                let (mut charging, mut monitoring) = live_session(&imsi, rating_group);
                store
                    .put(
                        imsi.clone(),
                        StoredSessionState::from_pools(&charging, &monitoring),
                    )
                    .await
                    .unwrap();

                charging.add_used_credit(&ChargingKey::new(rating_group), 100, 0);
                let update = SessionUpdate::take(&mut charging, &mut monitoring);
                store.apply_update(&imsi, &update).await.unwrap();
                (imsi, StoredSessionState::from_pools(&charging, &monitoring))
            }));
        }

        let mut expected = Sessions::new();
        for h in handles {
            let (imsi, state) = h.await.unwrap();
            expected.insert(imsi, state);
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let on_disk: Sessions = serde_json::from_str(&contents).unwrap();
        assert_eq!(on_disk, expected);
    }
}
