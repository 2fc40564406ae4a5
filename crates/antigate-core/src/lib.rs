mod auth;
mod bootstrap;
mod engine;
mod error;
mod images;
mod panel;
mod sink;
mod upstream;

pub use auth::{check_api_key, extract_api_key, requires_api_key};
pub use bootstrap::{Bootstrap, bootstrap};
pub use engine::{ClientResponse, Dialect, GatewayEngine, RequestContext};
pub use error::GatewayError;
pub use images::{DataUrlImageStore, ImageStore};
pub use panel::PanelSessions;
pub use upstream::{ReplyBody, UpstreamClient, UpstreamReply};
