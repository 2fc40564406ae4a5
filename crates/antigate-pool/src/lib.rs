mod oauth;
mod pool;
mod usage;

pub use oauth::{AuthApi, AuthError, OAuthClient, TokenGrant};
pub use pool::{CredentialPool, CredentialView, PoolError, RefreshAtError};
pub use usage::UsageCounters;
