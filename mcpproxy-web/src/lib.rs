//! HTTP plumbing for MCPProxy
//!
//! One axum handler tree is served from two accept loops: a TCP listener
//! authenticated by API key and rate-limited, and a local IPC listener
//! (Unix domain socket) authenticated by OS peer credentials at accept.
//! Each connection is tagged with its source so middleware can tell them
//! apart.

pub mod errors;
pub mod events;
pub mod listener;
pub mod middleware;
pub mod response;

pub use errors::{WebError, WebResult};
pub use events::{channels, Event, EventBus};
pub use listener::{ConnectionSource, DualListener};
pub use middleware::{
    api_key_middleware, rate_limit_middleware, request_id_middleware, ApiKeyConfig, RateLimiter,
};
pub use response::ApiResponse;
