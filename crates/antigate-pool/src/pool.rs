use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use antigate_storage::{CredentialRecord, CredentialStore, RequestLog, StorageError, unix_ms};

use crate::oauth::AuthApi;
use crate::usage::UsageCounters;

const USAGE_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no credential available")]
    NoCredentialAvailable,
    #[error("credential not found")]
    CredentialNotFound,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Projection handed to the adapter. Carries routing fields only; the
/// refresh token never leaves the pool.
#[derive(Debug, Clone)]
pub struct CredentialView {
    pub access_token: String,
    pub project_id: String,
    pub email: Option<String>,
    pub session_id: String,
}

enum RefreshFailure {
    Terminal,
    Transient,
}

/// The central concurrency object: selection under quota pressure, in-line
/// refresh with per-credential collapse, disable-on-terminal.
pub struct CredentialPool {
    store: Arc<CredentialStore>,
    auth: Arc<dyn AuthApi>,
    log: Arc<RequestLog>,
    usage: Mutex<UsageCounters>,
    hourly_limit: AtomicU32,
    session_id: String,
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialPool {
    pub fn new(
        store: Arc<CredentialStore>,
        auth: Arc<dyn AuthApi>,
        log: Arc<RequestLog>,
        hourly_limit: u32,
    ) -> Self {
        Self {
            store,
            auth,
            log,
            usage: Mutex::new(UsageCounters::new()),
            hourly_limit: AtomicU32::new(hourly_limit),
            session_id: uuid::Uuid::new_v4().to_string(),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Reload credentials from disk and rebuild the selection counters from
    /// the request log. Safe to call repeatedly.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        self.store.load().await?;
        let mut counters = UsageCounters::new();
        let cutoff = unix_ms() - USAGE_WINDOW.as_millis() as i64;
        for entry in self.log.recent(usize::MAX).await {
            if entry.timestamp >= cutoff && !entry.project_id.is_empty() {
                counters.record(&entry.project_id, entry.timestamp, entry.success, &entry.model);
            }
        }
        *self.usage.lock().await = counters;
        info!(credentials = self.store.len().await, "credential pool initialized");
        Ok(())
    }

    pub fn set_hourly_limit(&self, limit: u32) {
        self.hourly_limit.store(limit, Ordering::Relaxed);
    }

    pub fn hourly_limit(&self) -> u32 {
        self.hourly_limit.load(Ordering::Relaxed)
    }

    pub async fn record_outcome(&self, project_id: &str, success: bool, model: &str) {
        if project_id.is_empty() {
            return;
        }
        let mut usage = self.usage.lock().await;
        usage.record(project_id, unix_ms(), success, model);
    }

    /// Least-loaded selection over the enabled credentials, quota applied,
    /// ties broken by least-recently-used then positional order. A stale
    /// candidate is refreshed in line; terminal refresh failures disable the
    /// record and selection restarts without it.
    pub async fn acquire(&self) -> Result<CredentialView, PoolError> {
        let mut skipped: HashSet<String> = HashSet::new();
        let rounds = self.store.len().await + 1;

        for _ in 0..rounds {
            let Some(record) = self.select_candidate(&skipped).await else {
                return Err(PoolError::NoCredentialAvailable);
            };
            if record.is_fresh(unix_ms()) {
                return self.view_for(record).await;
            }
            match self.refresh_record(&record).await {
                Ok(record) => return self.view_for(record).await,
                Err(RefreshFailure::Terminal) => continue,
                Err(RefreshFailure::Transient) => {
                    skipped.insert(record.refresh_token.clone());
                    continue;
                }
            }
        }
        Err(PoolError::NoCredentialAvailable)
    }

    /// Forced-credential path used by the per-credential URL routes. Skips
    /// load balancing, keeps quota and freshness rules.
    pub async fn acquire_by_project_id(&self, project_id: &str) -> Result<CredentialView, PoolError> {
        let record = self
            .store
            .find_by_project_id(project_id)
            .await
            .ok_or(PoolError::CredentialNotFound)?;
        if !record.enabled {
            return Err(PoolError::CredentialNotFound);
        }

        let limit = self.hourly_limit() as usize;
        if limit > 0 {
            let mut usage = self.usage.lock().await;
            if usage.count_within_window(project_id, unix_ms()) >= limit {
                return Err(PoolError::NoCredentialAvailable);
            }
        }

        if record.is_fresh(unix_ms()) {
            return self.view_for(record).await;
        }
        match self.refresh_record(&record).await {
            Ok(record) => self.view_for(record).await,
            Err(_) => Err(PoolError::NoCredentialAvailable),
        }
    }

    async fn select_candidate(&self, skipped: &HashSet<String>) -> Option<CredentialRecord> {
        let records = self.store.enumerate().await;
        let now = unix_ms();
        let limit = self.hourly_limit() as usize;

        let mut usage = self.usage.lock().await;
        let mut best: Option<(usize, i64, usize)> = None;
        let mut chosen = None;
        for (index, record) in records.into_iter().enumerate() {
            if !record.enabled || skipped.contains(&record.refresh_token) {
                continue;
            }
            let (count, last_used) = match record.project_id.as_deref() {
                Some(project_id) if !project_id.is_empty() => (
                    usage.count_within_window(project_id, now),
                    usage.last_used_at(project_id),
                ),
                _ => (0, 0),
            };
            if limit > 0 && count >= limit {
                continue;
            }
            let key = (count, last_used, index);
            if best.map(|current| key < current).unwrap_or(true) {
                best = Some(key);
                chosen = Some(record);
            }
        }
        chosen
    }

    /// Refreshes are serialized per credential: concurrent acquirers that
    /// both pick the same stale record collapse to a single upstream call.
    async fn refresh_record(
        &self,
        record: &CredentialRecord,
    ) -> Result<CredentialRecord, RefreshFailure> {
        let lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks
                .entry(record.refresh_token.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // Another acquirer may have refreshed while this one waited.
        let current = self
            .store
            .enumerate()
            .await
            .into_iter()
            .find(|candidate| candidate.refresh_token == record.refresh_token)
            .unwrap_or_else(|| record.clone());
        if !current.enabled {
            return Err(RefreshFailure::Terminal);
        }
        if current.is_fresh(unix_ms()) {
            return Ok(current);
        }

        match self.auth.refresh(&current.refresh_token).await {
            Ok(grant) => {
                let issued_at = unix_ms();
                if let Err(err) = self
                    .store
                    .store_refreshed_token(
                        &current.refresh_token,
                        grant.access_token.clone(),
                        grant.expires_in,
                        issued_at,
                        grant.refresh_token.clone(),
                    )
                    .await
                {
                    warn!(error = %err, "failed to persist refreshed token");
                }
                let mut updated = current;
                updated.access_token = Some(grant.access_token);
                updated.expires_in = Some(grant.expires_in);
                updated.issued_at = Some(issued_at);
                if let Some(rotated) = grant.refresh_token {
                    updated.refresh_token = rotated;
                }
                Ok(updated)
            }
            Err(err) if err.is_terminal() => {
                warn!(
                    project_id = record.project_id.as_deref().unwrap_or(""),
                    error = %err,
                    "refresh rejected, disabling credential"
                );
                if let Err(err) = self
                    .store
                    .disable_by_refresh_token(&current.refresh_token)
                    .await
                {
                    warn!(error = %err, "failed to persist disabled credential");
                }
                Err(RefreshFailure::Terminal)
            }
            Err(err) => {
                warn!(error = %err, "transient refresh failure, trying next credential");
                Err(RefreshFailure::Transient)
            }
        }
    }

    /// Build the routing view; resolves and persists a project id on first
    /// use when the record came in without one.
    async fn view_for(&self, record: CredentialRecord) -> Result<CredentialView, PoolError> {
        let access_token = record
            .access_token
            .clone()
            .ok_or(PoolError::NoCredentialAvailable)?;
        let project_id = match record.project_id.as_deref() {
            Some(project_id) if !project_id.trim().is_empty() => project_id.to_string(),
            _ => {
                let resolved = self
                    .auth
                    .resolve_project_id(&access_token, true)
                    .await
                    .map_err(|_| PoolError::NoCredentialAvailable)?;
                self.store
                    .set_project_id_if_unset(&record.refresh_token, resolved.clone())
                    .await?;
                resolved
            }
        };
        Ok(CredentialView {
            access_token,
            project_id,
            email: record.email,
            session_id: self.session_id.clone(),
        })
    }
}

impl CredentialPool {
    /// Per-panel refresh of one slot, bypassing selection. Terminal failures
    /// disable the record like the acquire path does.
    pub async fn refresh_at(&self, index: usize) -> Result<CredentialRecord, RefreshAtError> {
        let record = self
            .store
            .get(index)
            .await
            .ok_or(RefreshAtError::NotFound)?;
        match self.refresh_record(&record).await {
            Ok(updated) => Ok(updated),
            Err(RefreshFailure::Terminal) => Err(RefreshAtError::Terminal),
            Err(RefreshFailure::Transient) => Err(RefreshAtError::Transient),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshAtError {
    #[error("credential not found")]
    NotFound,
    #[error("refresh rejected; credential disabled")]
    Terminal,
    #[error("refresh failed")]
    Transient,
}
