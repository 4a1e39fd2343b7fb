//! Edge proxy: routes each request by path prefix to the account or booking
//! service, carrying the caller's trace forward.

pub mod dispatcher;
pub mod retry;
pub mod service;

pub use dispatcher::{DispatchError, Dispatcher, ProxyTarget, RouteRule, RuleError};
pub use retry::RetryPolicy;
pub use service::{router, ProxyConfig, ProxyState, MAX_BODY_BYTES};
