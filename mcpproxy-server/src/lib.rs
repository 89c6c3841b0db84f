//! MCPProxy runtime
//!
//! Wires every subsystem together: configuration, storage, the upstream
//! fleet, OAuth, the retrieval index, the data-flow security engine, the
//! dual-listener HTTP surface with its REST and MCP endpoints, the built-in
//! tool surface, and the agent-hook evaluate path.

pub mod activity;
pub mod api;
pub mod auth_bridge;
pub mod builtins;
pub mod hooks;
pub mod mcp_endpoint;
pub mod registry;
pub mod reload;
pub mod router;
pub mod services;
pub mod startup;

pub use services::ServiceContainer;
pub use startup::{ExitCode, Server};
