//! OAuth 2.0 subsystem for MCPProxy upstreams
//!
//! Implements the client side of the MCP authorization story: RFC 9728
//! protected-resource discovery, RFC 8414 authorization-server metadata,
//! RFC 7591 dynamic client registration, the PKCE authorization-code flow
//! with a loopback callback listener, RFC 8707 resource indicators on token
//! requests, and proactive refresh scheduling with a circuit breaker.

pub mod client;
pub mod dcr;
pub mod discovery;
pub mod error;
pub mod flow;
pub mod refresh;

pub use client::OAuthClient;
pub use dcr::{RegistrationRequest, RegistrationResponse};
pub use discovery::{
    parse_resource_metadata_challenge, AuthServerMetadata, DiscoveryClient,
    ProtectedResourceMetadata,
};
pub use error::{AuthError, AuthErrorClass, AuthResult};
pub use flow::{AuthFlowResult, PendingAuthorization};
pub use refresh::{calculate_backoff, RefreshEvent, RefreshExecutor, RefreshManager, RefreshState};
