//! Google OAuth client for the Antigravity first-party application. The
//! client id/secret pair is fixed: the upstream only accepts this client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v1/userinfo?alt=json";
const CODE_ASSIST_BASE_URL: &str = "https://daily-cloudcode-pa.sandbox.googleapis.com";
const CLIENT_ID: &str = "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";
const CLIENT_SECRET: &str = "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";
const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform https://www.googleapis.com/auth/userinfo.email https://www.googleapis.com/auth/userinfo.profile";
const USER_AGENT: &str = "antigravity/1.15.8 (Windows; AMD64)";

const ONBOARD_ATTEMPTS: usize = 5;
const ONBOARD_POLL_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("auth exchange failed: {0}")]
    ExchangeFailed(String),
    /// HTTP 400/403 from the token endpoint; the credential is dead and the
    /// caller is expected to disable it.
    #[error("refresh rejected ({status}): {message}")]
    RefreshTerminal { status: u16, message: String },
    #[error("refresh failed: {0}")]
    RefreshTransient(String),
    #[error("project id unresolved")]
    ProjectIdMissing,
    #[error("oauth transport: {0}")]
    Transport(String),
}

impl AuthError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthError::RefreshTerminal { .. })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

/// The OAuth surface the pool depends on; split out so tests can drive the
/// pool against an in-memory fake.
#[async_trait]
pub trait AuthApi: Send + Sync {
    fn build_auth_url(&self, redirect_uri: &str, state: &str) -> String;
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant, AuthError>;
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError>;
    async fn resolve_project_id(
        &self,
        access_token: &str,
        allow_random: bool,
    ) -> Result<String, AuthError>;
    async fn fetch_user_email(&self, access_token: &str) -> Option<String>;
}

pub struct OAuthClient {
    http: wreq::Client,
}

impl OAuthClient {
    pub fn new(proxy: Option<&str>) -> Result<Self, wreq::Error> {
        let mut builder = wreq::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30));
        if let Some(proxy) = proxy {
            builder = builder.proxy(wreq::Proxy::all(proxy)?);
        }
        Ok(Self {
            http: builder.build()?,
        })
    }

    async fn token_request(&self, body: String) -> Result<(u16, Vec<u8>), AuthError> {
        let resp = self
            .http
            .post(TOKEN_URL)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;
        let status = resp.status().as_u16();
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;
        Ok((status, bytes.to_vec()))
    }

    async fn code_assist_call(
        &self,
        access_token: &str,
        path: &str,
        body: &JsonValue,
    ) -> Result<JsonValue, AuthError> {
        let url = format!("{CODE_ASSIST_BASE_URL}{path}");
        let body = serde_json::to_vec(body).map_err(|err| AuthError::Transport(err.to_string()))?;
        let resp = self
            .http
            .post(url)
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Content-Type", "application/json")
            .header("User-Agent", USER_AGENT)
            .header("requestid", make_request_id())
            .body(body)
            .send()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(AuthError::Transport(format!(
                "{path} failed: {status} {}",
                String::from_utf8_lossy(&bytes)
            )));
        }
        serde_json::from_slice(&bytes).map_err(|err| AuthError::Transport(err.to_string()))
    }

    async fn load_code_assist_project(&self, access_token: &str) -> Result<Option<String>, AuthError> {
        let payload = self
            .code_assist_call(access_token, "/v1internal:loadCodeAssist", &onboard_metadata(None))
            .await?;
        if payload
            .get("currentTier")
            .map(|value| value.is_null())
            .unwrap_or(true)
        {
            return Ok(None);
        }
        Ok(payload
            .get("cloudaicompanionProject")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string()))
    }

    async fn onboard_project(&self, access_token: &str) -> Result<Option<String>, AuthError> {
        let tier_id = self.default_tier(access_token).await;
        let body = onboard_metadata(Some(&tier_id));
        for _ in 0..ONBOARD_ATTEMPTS {
            let payload = self
                .code_assist_call(access_token, "/v1internal:onboardUser", &body)
                .await?;
            if payload.get("done").and_then(|value| value.as_bool()) == Some(true) {
                let project = payload
                    .get("response")
                    .and_then(|value| value.get("cloudaicompanionProject"));
                let project_id = project
                    .and_then(|value| value.get("id"))
                    .and_then(|value| value.as_str())
                    .map(|value| value.to_string())
                    .or_else(|| {
                        project
                            .and_then(|value| value.as_str())
                            .map(|value| value.to_string())
                    });
                return Ok(project_id);
            }
            tokio::time::sleep(ONBOARD_POLL_DELAY).await;
        }
        Ok(None)
    }

    async fn default_tier(&self, access_token: &str) -> String {
        let payload = match self
            .code_assist_call(access_token, "/v1internal:loadCodeAssist", &onboard_metadata(None))
            .await
        {
            Ok(payload) => payload,
            Err(_) => return "LEGACY".to_string(),
        };
        payload
            .get("allowedTiers")
            .and_then(|value| value.as_array())
            .and_then(|tiers| {
                tiers.iter().find(|tier| {
                    tier.get("isDefault").and_then(|value| value.as_bool()) == Some(true)
                })
            })
            .and_then(|tier| tier.get("id").and_then(|value| value.as_str()))
            .unwrap_or("LEGACY")
            .to_string()
    }
}

#[async_trait]
impl AuthApi for OAuthClient {
    fn build_auth_url(&self, redirect_uri: &str, state: &str) -> String {
        let params = [
            ("response_type", "code"),
            ("client_id", CLIENT_ID),
            ("redirect_uri", redirect_uri),
            ("scope", OAUTH_SCOPE),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("state", state),
        ];
        let query = params
            .iter()
            .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{AUTH_URL}?{query}")
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant, AuthError> {
        let body = format!(
            "code={}&client_id={}&client_secret={}&redirect_uri={}&grant_type=authorization_code",
            urlencoding::encode(code),
            urlencoding::encode(CLIENT_ID),
            urlencoding::encode(CLIENT_SECRET),
            urlencoding::encode(redirect_uri),
        );
        let (status, bytes) = self.token_request(body).await?;
        if !(200..300).contains(&status) {
            return Err(AuthError::ExchangeFailed(format!(
                "{status} {}",
                String::from_utf8_lossy(&bytes)
            )));
        }
        serde_json::from_slice(&bytes).map_err(|err| AuthError::ExchangeFailed(err.to_string()))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let body = format!(
            "refresh_token={}&client_id={}&client_secret={}&grant_type=refresh_token",
            urlencoding::encode(refresh_token),
            urlencoding::encode(CLIENT_ID),
            urlencoding::encode(CLIENT_SECRET),
        );
        let (status, bytes) = self.token_request(body).await?;
        if status == 400 || status == 403 {
            return Err(AuthError::RefreshTerminal {
                status,
                message: String::from_utf8_lossy(&bytes).to_string(),
            });
        }
        if !(200..300).contains(&status) {
            return Err(AuthError::RefreshTransient(format!(
                "{status} {}",
                String::from_utf8_lossy(&bytes)
            )));
        }
        serde_json::from_slice(&bytes).map_err(|err| AuthError::RefreshTransient(err.to_string()))
    }

    async fn resolve_project_id(
        &self,
        access_token: &str,
        allow_random: bool,
    ) -> Result<String, AuthError> {
        if let Ok(Some(project_id)) = self.load_code_assist_project(access_token).await
            && !project_id.trim().is_empty()
        {
            return Ok(project_id);
        }
        match self.onboard_project(access_token).await {
            Ok(Some(project_id)) if !project_id.trim().is_empty() => return Ok(project_id),
            Ok(_) => {}
            Err(err) => debug!(error = %err, "onboardUser lookup failed"),
        }
        if allow_random {
            return Ok(synthetic_project_id());
        }
        Err(AuthError::ProjectIdMissing)
    }

    async fn fetch_user_email(&self, access_token: &str) -> Option<String> {
        let resp = self
            .http
            .get(USERINFO_URL)
            .header("Authorization", format!("Bearer {access_token}"))
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let payload: JsonValue = serde_json::from_slice(&resp.bytes().await.ok()?).ok()?;
        payload
            .get("email")
            .and_then(|value| value.as_str())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

fn onboard_metadata(tier_id: Option<&str>) -> JsonValue {
    let mut body = serde_json::json!({
        "metadata": {
            "ideType": "ANTIGRAVITY",
            "platform": "PLATFORM_UNSPECIFIED",
            "pluginType": "GEMINI"
        }
    });
    if let Some(tier_id) = tier_id {
        body["tierId"] = serde_json::json!(tier_id);
    }
    body
}

fn synthetic_project_id() -> String {
    let tail = uuid::Uuid::new_v4().simple().to_string();
    format!("antigate-{}", &tail[..12])
}

fn make_request_id() -> String {
    format!("antigate-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UrlOnly;

    #[async_trait]
    impl AuthApi for UrlOnly {
        fn build_auth_url(&self, redirect_uri: &str, state: &str) -> String {
            OAuthClient::new(None).unwrap().build_auth_url(redirect_uri, state)
        }
        async fn exchange_code(&self, _: &str, _: &str) -> Result<TokenGrant, AuthError> {
            unreachable!()
        }
        async fn refresh(&self, _: &str) -> Result<TokenGrant, AuthError> {
            unreachable!()
        }
        async fn resolve_project_id(&self, _: &str, _: bool) -> Result<String, AuthError> {
            unreachable!()
        }
        async fn fetch_user_email(&self, _: &str) -> Option<String> {
            unreachable!()
        }
    }

    #[test]
    fn auth_url_carries_offline_access_and_state() {
        let url = UrlOnly.build_auth_url("http://localhost:1455/callback", "st-123");
        assert!(url.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(url.contains("state=st-123"));
        assert!(url.contains(&format!("client_id={}", urlencoding::encode(CLIENT_ID))));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A1455%2Fcallback"));
    }

    #[test]
    fn synthetic_project_id_shape() {
        let id = synthetic_project_id();
        assert!(id.starts_with("antigate-"));
        assert_eq!(id.len(), "antigate-".len() + 12);
    }
}
