//! Data-flow security engine for MCPProxy
//!
//! Classifies servers and tools as internal/external/hybrid, hashes tool
//! outputs into per-session origin sets, matches outgoing arguments against
//! those origins, and maps the resulting flow edges to policy decisions.
//! The goal is catching the lethal trifecta: private data, untrusted
//! content, and an external channel in one agent session.

pub mod cache;
pub mod classify;
pub mod flow;
pub mod hash;
pub mod policy;
pub mod sensitive;

pub use cache::{TokenCounter, TtlCache};
pub use classify::{classify, Classification, ClassificationMethod};
pub use flow::{
    DataOrigin, FlowDirection, FlowEdge, FlowSummary, FlowTracker, RiskLevel, SessionSnapshot,
};
pub use hash::{hash_content, hash_json_fields, hash_normalized, hash_variants, HASH_HEX_LEN};
pub use policy::{CoverageMode, PolicyDecision, PolicyEngine};
pub use sensitive::{scan_sensitive, SensitiveMarker};
