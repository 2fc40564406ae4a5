use std::sync::Arc;

use antigate_common::GatewayConfig;
use antigate_core::{GatewayEngine, PanelSessions};
use antigate_pool::{AuthApi, CredentialPool};
use antigate_storage::{CredentialStore, RequestLog};

#[derive(Clone)]
pub struct RouterState {
    pub config: Arc<GatewayConfig>,
    pub engine: Arc<GatewayEngine>,
    pub store: Arc<CredentialStore>,
    pub pool: Arc<CredentialPool>,
    pub log: Arc<RequestLog>,
    pub sessions: Arc<PanelSessions>,
    pub auth_api: Arc<dyn AuthApi>,
}
