use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::fsutil::write_atomic;
use crate::import::{ImportOptions, ImportOutcome};
use crate::{StorageError, StorageResult};

/// Access tokens within five minutes of expiry are treated as stale.
const FRESHNESS_MARGIN_MS: i64 = 300_000;

pub fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialRecord {
    pub refresh_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl CredentialRecord {
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self {
            refresh_token: refresh_token.into(),
            enabled: true,
            created_at: Some(unix_ms()),
            ..Self::default()
        }
    }

    /// True when a usable access token exists and stays valid for more than
    /// the freshness margin.
    pub fn is_fresh(&self, now_ms: i64) -> bool {
        let Some(access_token) = self.access_token.as_deref() else {
            return false;
        };
        if access_token.is_empty() {
            return false;
        }
        let (Some(issued_at), Some(expires_in)) = (self.issued_at, self.expires_in) else {
            return false;
        };
        issued_at + expires_in * 1000 - now_ms > FRESHNESS_MARGIN_MS
    }

    /// Shallow overlay: incoming present fields win, identity and creation
    /// time stay with the existing record.
    pub(crate) fn overlay(&mut self, incoming: &CredentialRecord) {
        if incoming.access_token.is_some() {
            self.access_token = incoming.access_token.clone();
        }
        if incoming.expires_in.is_some() {
            self.expires_in = incoming.expires_in;
        }
        if incoming.issued_at.is_some() {
            self.issued_at = incoming.issued_at;
        }
        if incoming.project_id.is_some() {
            self.project_id = incoming.project_id.clone();
        }
        if incoming.email.is_some() {
            self.email = incoming.email.clone();
        }
        self.enabled = incoming.enabled;
    }
}

/// Durable on-disk credential list. The in-memory list is authoritative
/// between `load` calls; every mutation persists before returning. Positional
/// indexes are only stable within one load/save cycle.
pub struct CredentialStore {
    path: PathBuf,
    records: RwLock<Vec<CredentialRecord>>,
    file_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            records: RwLock::new(Vec::new()),
            file_lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        let _io = self.file_lock.lock().await;
        let list = match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice::<Vec<CredentialRecord>>(&bytes).map_err(
                |err| StorageError::Corrupt {
                    path: self.path.display().to_string(),
                    message: err.to_string(),
                },
            )?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        *self.records.write().await = list;
        Ok(())
    }

    pub async fn enumerate(&self) -> Vec<CredentialRecord> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn get(&self, index: usize) -> Option<CredentialRecord> {
        self.records.read().await.get(index).cloned()
    }

    pub async fn find_by_project_id(&self, project_id: &str) -> Option<CredentialRecord> {
        self.records
            .read()
            .await
            .iter()
            .find(|record| record.project_id.as_deref() == Some(project_id))
            .cloned()
    }

    pub async fn push(&self, record: CredentialRecord) -> StorageResult<()> {
        self.mutate(|records| {
            records.push(record);
            Ok(())
        })
        .await
    }

    pub async fn replace_at(&self, index: usize, record: CredentialRecord) -> StorageResult<()> {
        self.mutate(|records| {
            let slot = records
                .get_mut(index)
                .ok_or(StorageError::IndexOutOfRange(index))?;
            *slot = record;
            Ok(())
        })
        .await
    }

    pub async fn remove_at(&self, index: usize) -> StorageResult<CredentialRecord> {
        self.mutate(|records| {
            if index >= records.len() {
                return Err(StorageError::IndexOutOfRange(index));
            }
            Ok(records.remove(index))
        })
        .await
    }

    pub async fn set_enabled(&self, index: usize, enabled: bool) -> StorageResult<()> {
        self.mutate(|records| {
            let slot = records
                .get_mut(index)
                .ok_or(StorageError::IndexOutOfRange(index))?;
            slot.enabled = enabled;
            Ok(())
        })
        .await
    }

    /// Remove every disabled record; returns how many were swept.
    pub async fn remove_disabled(&self) -> StorageResult<usize> {
        self.mutate(|records| {
            let before = records.len();
            records.retain(|record| record.enabled);
            Ok(before - records.len())
        })
        .await
    }

    /// Persist a refreshed access token for the record owning
    /// `refresh_token`. A rotated refresh token is accepted too.
    pub async fn store_refreshed_token(
        &self,
        refresh_token: &str,
        access_token: String,
        expires_in: i64,
        issued_at: i64,
        new_refresh_token: Option<String>,
    ) -> StorageResult<()> {
        self.mutate(|records| {
            if let Some(slot) = records
                .iter_mut()
                .find(|record| record.refresh_token == refresh_token)
            {
                slot.access_token = Some(access_token);
                slot.expires_in = Some(expires_in);
                slot.issued_at = Some(issued_at);
                if let Some(rotated) = new_refresh_token {
                    slot.refresh_token = rotated;
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn disable_by_refresh_token(&self, refresh_token: &str) -> StorageResult<()> {
        self.mutate(|records| {
            if let Some(slot) = records
                .iter_mut()
                .find(|record| record.refresh_token == refresh_token)
            {
                slot.enabled = false;
            }
            Ok(())
        })
        .await
    }

    /// First successful resolve wins; an already-set project id is never
    /// silently replaced.
    pub async fn set_project_id_if_unset(
        &self,
        refresh_token: &str,
        project_id: String,
    ) -> StorageResult<()> {
        self.mutate(|records| {
            if let Some(slot) = records
                .iter_mut()
                .find(|record| record.refresh_token == refresh_token)
                && slot
                    .project_id
                    .as_deref()
                    .map(|value| value.trim().is_empty())
                    .unwrap_or(true)
            {
                slot.project_id = Some(project_id);
            }
            Ok(())
        })
        .await
    }

    /// Explicit re-resolution from the panel; this is the one path allowed
    /// to replace an existing project id.
    pub async fn set_project_id_at(&self, index: usize, project_id: String) -> StorageResult<()> {
        self.mutate(|records| {
            let slot = records
                .get_mut(index)
                .ok_or(StorageError::IndexOutOfRange(index))?;
            slot.project_id = Some(project_id);
            Ok(())
        })
        .await
    }

    pub async fn import(
        &self,
        incoming: Vec<CredentialRecord>,
        options: ImportOptions,
    ) -> StorageResult<ImportOutcome> {
        let mut outcome = ImportOutcome::default();
        self.mutate(|records| {
            let accepted: Vec<CredentialRecord> = incoming
                .into_iter()
                .filter(|record| {
                    if options.filter_disabled && !record.enabled {
                        outcome.skipped += 1;
                        false
                    } else {
                        true
                    }
                })
                .collect();

            if options.replace_existing {
                outcome.imported = accepted.len();
                *records = accepted;
            } else {
                for record in accepted {
                    let existing = records.iter_mut().find(|current| {
                        current.refresh_token == record.refresh_token
                            || (current.access_token.is_some()
                                && current.access_token == record.access_token)
                    });
                    match existing {
                        Some(current) => current.overlay(&record),
                        None => records.push(record),
                    }
                    outcome.imported += 1;
                }
            }
            outcome.total = records.len();
            Ok(())
        })
        .await?;
        Ok(outcome)
    }

    async fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut Vec<CredentialRecord>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let value = {
            let mut records = self.records.write().await;
            apply(&mut records)?
        };
        self.save().await?;
        Ok(value)
    }

    /// Serialize the current state while holding the file lock so racing
    /// mutations cannot write an older snapshot over a newer one.
    async fn save(&self) -> StorageResult<()> {
        let _io = self.file_lock.lock().await;
        let records = self.records.read().await.clone();
        let body = serde_json::to_vec_pretty(&records)?;
        write_atomic(&self.path, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::ImportOptions;

    fn record(token: &str) -> CredentialRecord {
        CredentialRecord::new(token)
    }

    fn store_in(dir: &tempfile::TempDir) -> CredentialStore {
        CredentialStore::new(dir.path().join("credentials.json"))
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.load().await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn malformed_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = CredentialStore::new(path);
        let err = store.load().await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn round_trip_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.push(record("rt-1")).await.unwrap();
        store.push(record("rt-2")).await.unwrap();

        let reopened = store_in(&dir);
        reopened.load().await.unwrap();
        let records = reopened.enumerate().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].refresh_token, "rt-1");
        assert!(records[0].enabled);
    }

    #[tokio::test]
    async fn import_merges_by_refresh_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut existing = record("rt-1");
        existing.email = Some("old@example.com".to_string());
        store.push(existing).await.unwrap();

        let mut update = record("rt-1");
        update.project_id = Some("proj-9".to_string());
        let mut disabled = record("rt-2");
        disabled.enabled = false;
        let fresh = record("rt-3");

        let outcome = store
            .import(
                vec![update, disabled, fresh],
                ImportOptions {
                    replace_existing: false,
                    filter_disabled: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.imported, 2);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.total, 2);

        let records = store.enumerate().await;
        assert_eq!(records[0].project_id.as_deref(), Some("proj-9"));
        // Overlay keeps fields the incoming record did not carry.
        assert_eq!(records[0].email.as_deref(), Some("old@example.com"));
        assert_eq!(records[1].refresh_token, "rt-3");
    }

    #[tokio::test]
    async fn import_replace_existing_swaps_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.push(record("rt-old")).await.unwrap();

        let outcome = store
            .import(
                vec![record("rt-new")],
                ImportOptions {
                    replace_existing: true,
                    filter_disabled: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.total, 1);
        assert_eq!(store.enumerate().await[0].refresh_token, "rt-new");
    }

    #[tokio::test]
    async fn project_id_not_silently_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut rec = record("rt-1");
        rec.project_id = Some("proj-a".to_string());
        store.push(rec).await.unwrap();

        store
            .set_project_id_if_unset("rt-1", "proj-b".to_string())
            .await
            .unwrap();
        assert_eq!(
            store.enumerate().await[0].project_id.as_deref(),
            Some("proj-a")
        );
    }

    #[tokio::test]
    async fn replace_at_swaps_slot_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.push(record("rt-1")).await.unwrap();
        store.push(record("rt-2")).await.unwrap();

        store.replace_at(0, record("rt-new")).await.unwrap();
        let records = store.enumerate().await;
        assert_eq!(records[0].refresh_token, "rt-new");
        assert_eq!(records[1].refresh_token, "rt-2");

        let err = store.replace_at(9, record("rt-x")).await.unwrap_err();
        assert!(matches!(err, StorageError::IndexOutOfRange(9)));
    }

    #[tokio::test]
    async fn remove_disabled_sweeps() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.push(record("rt-1")).await.unwrap();
        let mut off = record("rt-2");
        off.enabled = false;
        store.push(off).await.unwrap();

        let swept = store.remove_disabled().await.unwrap();
        assert_eq!(swept, 1);
        assert_eq!(store.len().await, 1);
    }

    #[test]
    fn freshness_margin() {
        let now = unix_ms();
        let mut rec = CredentialRecord::new("rt");
        assert!(!rec.is_fresh(now));

        rec.access_token = Some("at".to_string());
        rec.issued_at = Some(now);
        rec.expires_in = Some(3600);
        assert!(rec.is_fresh(now));

        // 299 seconds left: inside the margin, counts as stale.
        rec.issued_at = Some(now - (3600 - 299) * 1000);
        assert!(!rec.is_fresh(now));
    }
}
