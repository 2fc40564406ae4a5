//! HTTP client for the Antigravity internal API.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use antigate_pool::CredentialView;
use antigate_protocol::upstream::UpstreamRequest;

use crate::error::GatewayError;

const BASE_URL: &str = "https://daily-cloudcode-pa.sandbox.googleapis.com";
const GENERATE_PATH: &str = "/v1internal:generateContent";
const STREAM_PATH: &str = "/v1internal:streamGenerateContent?alt=sse";
const MODELS_PATH: &str = "/v1internal:fetchAvailableModels";
const USER_AGENT: &str = "antigravity/1.15.8 (Windows; AMD64)";
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct UpstreamReply {
    pub status: u16,
    pub body: ReplyBody,
}

pub enum ReplyBody {
    Bytes(Bytes),
    /// Chunks forwarded by a pump task; the channel closes when the upstream
    /// finishes, errors, or goes idle past the read timeout.
    Stream(mpsc::Receiver<Bytes>),
}

pub struct UpstreamClient {
    http: wreq::Client,
}

impl UpstreamClient {
    pub fn new(timeout: Duration, proxy: Option<&str>) -> Result<Self, wreq::Error> {
        let mut builder = wreq::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .read_timeout(STREAM_IDLE_TIMEOUT);
        if let Some(proxy) = proxy {
            builder = builder.proxy(wreq::Proxy::all(proxy)?);
        }
        Ok(Self {
            http: builder.build()?,
        })
    }

    pub async fn generate(
        &self,
        view: &CredentialView,
        envelope: &UpstreamRequest,
        stream: bool,
    ) -> Result<UpstreamReply, GatewayError> {
        let path = if stream { STREAM_PATH } else { GENERATE_PATH };
        let body =
            serde_json::to_vec(envelope).map_err(|err| GatewayError::Transport(err.to_string()))?;
        let resp = self
            .http
            .post(format!("{BASE_URL}{path}"))
            .header("Authorization", format!("Bearer {}", view.access_token))
            .header("Content-Type", "application/json")
            .header(
                "Accept",
                if stream {
                    "text/event-stream"
                } else {
                    "application/json"
                },
            )
            .header("User-Agent", USER_AGENT)
            .header("requestid", envelope.request_id.clone())
            .header("requesttype", envelope.request_type.clone())
            .body(body)
            .send()
            .await
            .map_err(|err| GatewayError::Transport(err.to_string()))?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) || !stream {
            let bytes = resp
                .bytes()
                .await
                .map_err(|err| GatewayError::Transport(err.to_string()))?;
            return Ok(UpstreamReply {
                status,
                body: ReplyBody::Bytes(bytes),
            });
        }

        let (tx, rx) = mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            loop {
                let next = tokio::time::timeout(STREAM_IDLE_TIMEOUT, stream.next()).await;
                let Ok(item) = next else { break };
                let Some(item) = item else { break };
                let Ok(chunk) = item else { break };
                // Receiver gone means the client disconnected; stop reading.
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        Ok(UpstreamReply {
            status,
            body: ReplyBody::Stream(rx),
        })
    }

    pub async fn fetch_models(
        &self,
        view: &CredentialView,
    ) -> Result<serde_json::Value, GatewayError> {
        let resp = self
            .http
            .post(format!("{BASE_URL}{MODELS_PATH}"))
            .header("Authorization", format!("Bearer {}", view.access_token))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT)
            .header("requestid", format!("antigate-{}", uuid::Uuid::new_v4()))
            .body(Bytes::from_static(b"{}"))
            .send()
            .await
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        let status = resp.status().as_u16();
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(GatewayError::Upstream {
                status,
                message: String::from_utf8_lossy(&bytes).to_string(),
            });
        }
        serde_json::from_slice(&bytes).map_err(|err| GatewayError::Transport(err.to_string()))
    }
}
