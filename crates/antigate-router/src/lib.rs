mod admin;
mod proxy;
mod state;

pub use admin::admin_router;
pub use proxy::proxy_router;
pub use state::RouterState;
