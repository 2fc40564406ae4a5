use async_trait::async_trait;

use crate::error::GatewayError;

/// Image storage backends collapse to one capability: persist the bytes,
/// hand back a URL the client can render.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn save_image(&self, bytes: &[u8], mime: &str) -> Result<String, GatewayError>;
}

/// Pass-through backend: the "URL" is a data URI carrying the image itself.
#[derive(Debug, Default)]
pub struct DataUrlImageStore;

#[async_trait]
impl ImageStore for DataUrlImageStore {
    async fn save_image(&self, bytes: &[u8], mime: &str) -> Result<String, GatewayError> {
        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Ok(format!("data:{mime};base64,{encoded}"))
    }
}
