use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use antigate_pool::{AuthApi, AuthError, CredentialPool, PoolError, TokenGrant};
use antigate_storage::{CredentialRecord, CredentialStore, RequestLog, unix_ms};

struct FakeAuth {
    refresh_calls: AtomicU32,
    refresh_result: RefreshBehavior,
}

enum RefreshBehavior {
    Grant,
    Terminal(u16),
    Transient,
}

impl FakeAuth {
    fn granting() -> Self {
        Self {
            refresh_calls: AtomicU32::new(0),
            refresh_result: RefreshBehavior::Grant,
        }
    }

    fn terminal(status: u16) -> Self {
        Self {
            refresh_calls: AtomicU32::new(0),
            refresh_result: RefreshBehavior::Terminal(status),
        }
    }

    fn transient() -> Self {
        Self {
            refresh_calls: AtomicU32::new(0),
            refresh_result: RefreshBehavior::Transient,
        }
    }

    fn calls(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthApi for FakeAuth {
    fn build_auth_url(&self, _redirect_uri: &str, _state: &str) -> String {
        "https://example.invalid/auth".to_string()
    }

    async fn exchange_code(&self, _: &str, _: &str) -> Result<TokenGrant, AuthError> {
        Err(AuthError::ExchangeFailed("not under test".to_string()))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        // A slight delay widens the race window for the collapse test.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        match self.refresh_result {
            RefreshBehavior::Grant => Ok(TokenGrant {
                access_token: format!("at-{refresh_token}"),
                refresh_token: None,
                expires_in: 3600,
            }),
            RefreshBehavior::Terminal(status) => Err(AuthError::RefreshTerminal {
                status,
                message: "invalid_grant".to_string(),
            }),
            RefreshBehavior::Transient => {
                Err(AuthError::RefreshTransient("upstream 502".to_string()))
            }
        }
    }

    async fn resolve_project_id(&self, _: &str, _: bool) -> Result<String, AuthError> {
        Err(AuthError::ProjectIdMissing)
    }

    async fn fetch_user_email(&self, _: &str) -> Option<String> {
        None
    }
}

fn fresh_record(token: &str, project: &str) -> CredentialRecord {
    let mut record = CredentialRecord::new(token);
    record.access_token = Some(format!("at-{token}"));
    record.issued_at = Some(unix_ms());
    record.expires_in = Some(3600);
    record.project_id = Some(project.to_string());
    record
}

fn stale_record(token: &str, project: &str) -> CredentialRecord {
    let mut record = fresh_record(token, project);
    // One second of validity left: inside the five-minute margin.
    record.issued_at = Some(unix_ms() - 3_599_000);
    record
}

async fn pool_with(
    dir: &tempfile::TempDir,
    auth: Arc<FakeAuth>,
    records: Vec<CredentialRecord>,
    hourly_limit: u32,
) -> CredentialPool {
    let store = Arc::new(CredentialStore::new(dir.path().join("credentials.json")));
    for record in records {
        store.push(record).await.unwrap();
    }
    let log = Arc::new(RequestLog::new(dir.path().join("request_log.json"), 1000, 7));
    let pool = CredentialPool::new(store, auth, log, hourly_limit);
    pool.initialize().await.unwrap();
    pool
}

#[tokio::test]
async fn selection_is_fair_round_robin() {
    let dir = tempfile::tempdir().unwrap();
    let auth = Arc::new(FakeAuth::granting());
    let pool = pool_with(
        &dir,
        auth.clone(),
        vec![
            fresh_record("rt-a", "proj-a"),
            fresh_record("rt-b", "proj-b"),
            fresh_record("rt-c", "proj-c"),
        ],
        0,
    )
    .await;

    let mut picks: HashMap<String, u32> = HashMap::new();
    for _ in 0..30 {
        let view = pool.acquire().await.unwrap();
        *picks.entry(view.project_id.clone()).or_default() += 1;
        pool.record_outcome(&view.project_id, true, "gemini-2.5-flash")
            .await;
    }

    assert_eq!(picks["proj-a"], 10);
    assert_eq!(picks["proj-b"], 10);
    assert_eq!(picks["proj-c"], 10);
    assert_eq!(auth.calls(), 0, "fresh credentials never refresh");
}

#[tokio::test]
async fn hourly_quota_hard_stop() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool_with(
        &dir,
        Arc::new(FakeAuth::granting()),
        vec![fresh_record("rt-a", "proj-a")],
        5,
    )
    .await;

    for _ in 0..5 {
        let view = pool.acquire().await.unwrap();
        pool.record_outcome(&view.project_id, true, "gemini-2.5-flash")
            .await;
    }
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::NoCredentialAvailable));

    // The limit is runtime-tunable; raising it unblocks the credential.
    pool.set_hourly_limit(10);
    assert!(pool.acquire().await.is_ok());
}

#[tokio::test]
async fn concurrent_acquires_collapse_to_one_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let auth = Arc::new(FakeAuth::granting());
    let pool = Arc::new(
        pool_with(
            &dir,
            auth.clone(),
            vec![stale_record("rt-a", "proj-a")],
            0,
        )
        .await,
    );

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move { pool.acquire().await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(auth.calls(), 1, "refreshes must collapse per credential");
}

#[tokio::test]
async fn terminal_refresh_disables_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let auth = Arc::new(FakeAuth::terminal(403));
    let store = Arc::new(CredentialStore::new(dir.path().join("credentials.json")));
    store.push(stale_record("rt-a", "proj-a")).await.unwrap();
    let log = Arc::new(RequestLog::new(dir.path().join("request_log.json"), 1000, 7));
    let pool = CredentialPool::new(store.clone(), auth.clone(), log, 0);
    pool.initialize().await.unwrap();

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::NoCredentialAvailable));
    assert!(!store.enumerate().await[0].enabled);
    assert_eq!(auth.calls(), 1);

    // The disabled record is skipped outright: no further refresh attempts.
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::NoCredentialAvailable));
    assert_eq!(auth.calls(), 1);

    // Disable survives a reload from disk.
    let reopened = CredentialStore::new(dir.path().join("credentials.json"));
    reopened.load().await.unwrap();
    assert!(!reopened.enumerate().await[0].enabled);
}

#[tokio::test]
async fn transient_refresh_moves_to_next_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let auth = Arc::new(FakeAuth::transient());
    // First slot stale (refresh will fail transiently), second slot fresh.
    let pool = pool_with(
        &dir,
        auth.clone(),
        vec![stale_record("rt-a", "proj-a"), fresh_record("rt-b", "proj-b")],
        0,
    )
    .await;

    // proj-a is least-recently-used, so it is tried first and skipped.
    pool.record_outcome("proj-b", true, "m").await;
    let view = pool.acquire().await.unwrap();
    assert_eq!(view.project_id, "proj-b");
    assert_eq!(auth.calls(), 1);
}

#[tokio::test]
async fn forced_project_id_applies_quota_and_missing_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool_with(
        &dir,
        Arc::new(FakeAuth::granting()),
        vec![fresh_record("rt-a", "proj-a")],
        1,
    )
    .await;

    let err = pool.acquire_by_project_id("proj-zzz").await.unwrap_err();
    assert!(matches!(err, PoolError::CredentialNotFound));

    let view = pool.acquire_by_project_id("proj-a").await.unwrap();
    pool.record_outcome(&view.project_id, true, "m").await;
    let err = pool.acquire_by_project_id("proj-a").await.unwrap_err();
    assert!(matches!(err, PoolError::NoCredentialAvailable));
}
