use std::sync::Arc;

use tracing::info;

use antigate_common::GatewayConfig;
use antigate_pool::{AuthApi, CredentialPool, OAuthClient};
use antigate_storage::{CredentialStore, RequestLog};
use antigate_transform::SignatureStore;

use crate::engine::GatewayEngine;
use crate::error::GatewayError;
use crate::images::DataUrlImageStore;
use crate::panel::PanelSessions;
use crate::upstream::UpstreamClient;

pub struct Bootstrap {
    pub config: GatewayConfig,
    pub store: Arc<CredentialStore>,
    pub pool: Arc<CredentialPool>,
    pub log: Arc<RequestLog>,
    pub engine: Arc<GatewayEngine>,
    pub sessions: Arc<PanelSessions>,
    pub auth_api: Arc<dyn AuthApi>,
}

/// Wire the stores, pool and engine from validated configuration. Corrupt
/// persisted state is fatal here; runtime storage errors are only logged.
pub async fn bootstrap(config: GatewayConfig) -> Result<Bootstrap, GatewayError> {
    let store = Arc::new(CredentialStore::new(config.credential_file()));
    let log = Arc::new(RequestLog::new(
        config.log_file(),
        config.log_max_items,
        config.log_retention_days,
    ));
    log.load().await?;

    let auth_api: Arc<dyn AuthApi> = Arc::new(
        OAuthClient::new(config.proxy.as_deref())
            .map_err(|err| GatewayError::Transport(err.to_string()))?,
    );
    let pool = Arc::new(CredentialPool::new(
        store.clone(),
        auth_api.clone(),
        log.clone(),
        config.hourly_limit,
    ));
    pool.initialize().await?;

    let upstream = Arc::new(
        UpstreamClient::new(config.upstream_timeout(), config.proxy.as_deref())
            .map_err(|err| GatewayError::Transport(err.to_string()))?,
    );
    let engine = Arc::new(GatewayEngine::new(
        config.clone(),
        pool.clone(),
        log.clone(),
        Arc::new(SignatureStore::new()),
        upstream,
        Arc::new(DataUrlImageStore),
    ));

    let credentials = store.len().await;
    info!(
        credentials,
        hourly_limit = config.hourly_limit,
        "gateway bootstrapped"
    );
    Ok(Bootstrap {
        config,
        store,
        pool,
        log,
        engine,
        sessions: Arc::new(PanelSessions::new()),
        auth_api,
    })
}
