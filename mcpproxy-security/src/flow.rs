//! Per-session data-flow tracking
//!
//! Each agent session gets an isolated ring of content-hash → origin
//! records. Tool responses are hashed on the record path; outgoing call
//! arguments are hashed on the check path and matched against the origin
//! map, emitting flow edges with a direction and risk level. Sessions evict
//! after inactivity and their summary is handed back for the activity log.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::classify::Classification;
use crate::hash::{hash_content, hash_json_fields, hash_normalized, hash_variants};
use crate::sensitive::SensitiveMarker;
use mcpproxy_config::{FlowTrackingConfig, ServerClass};

/// Direction of a detected flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowDirection {
    InternalToExternal,
    InternalToInternal,
    ExternalToInternal,
    ExternalToExternal,
    Unknown,
}

impl FlowDirection {
    /// Resolve from source and destination classes
    ///
    /// Hybrid resolves as internal when it is the source and external when
    /// it is the destination (the conservative reading for exfiltration).
    pub fn from_classes(source: ServerClass, dest: ServerClass) -> Self {
        let source_internal = matches!(source, ServerClass::Internal | ServerClass::Hybrid);
        let dest_external = matches!(dest, ServerClass::External | ServerClass::Hybrid);

        match (source, dest) {
            (ServerClass::Unknown, _) | (_, ServerClass::Unknown) => FlowDirection::Unknown,
            _ => match (source_internal, dest_external) {
                (true, true) => FlowDirection::InternalToExternal,
                (true, false) => FlowDirection::InternalToInternal,
                (false, true) => FlowDirection::ExternalToExternal,
                (false, false) => FlowDirection::ExternalToInternal,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowDirection::InternalToExternal => "internal→external",
            FlowDirection::InternalToInternal => "internal→internal",
            FlowDirection::ExternalToInternal => "external→internal",
            FlowDirection::ExternalToExternal => "external→external",
            FlowDirection::Unknown => "unknown",
        }
    }
}

/// Risk attached to a flow edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    None,
    Low,
    Medium,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::None => "none",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::Critical => "critical",
        }
    }
}

/// A recorded data origin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataOrigin {
    /// 128-bit content hash (32 hex chars)
    pub hash: String,

    /// Producing server ("" for agent built-ins)
    pub server: String,

    /// Producing tool
    pub tool: String,

    /// Class of the producer
    pub class: ServerClass,

    /// Sensitive markers found in the content
    pub sensitive: Vec<SensitiveMarker>,

    /// When the origin was recorded
    pub timestamp: DateTime<Utc>,
}

/// A detected flow from a recorded origin to an outgoing call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEdge {
    /// Matching content hash
    pub hash: String,

    /// Producing server/tool
    pub source_server: String,
    pub source_tool: String,

    /// Destination server/tool
    pub dest_server: String,
    pub dest_tool: String,

    /// Flow direction
    pub direction: FlowDirection,

    /// Risk level
    pub risk: RiskLevel,

    /// Whether the flowing content carried sensitive markers
    pub sensitive: Vec<SensitiveMarker>,

    /// When the edge was observed
    pub timestamp: DateTime<Utc>,
}

/// Summary emitted when a session evicts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub origin_count: usize,
    pub edge_count: usize,
    pub max_risk: RiskLevel,
}

/// Read-only view of a session for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub origin_count: usize,
    pub edge_count: usize,
    pub last_activity: DateTime<Utc>,
}

struct FlowSession {
    started_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    /// hash → origin
    origins: HashMap<String, DataOrigin>,
    /// insertion order for oldest-first eviction
    order: VecDeque<String>,
    edges: Vec<FlowEdge>,
}

impl FlowSession {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            last_activity: now,
            origins: HashMap::new(),
            order: VecDeque::new(),
            edges: Vec::new(),
        }
    }

    fn insert_origin(&mut self, origin: DataOrigin, cap: usize) {
        if !self.origins.contains_key(&origin.hash) {
            self.order.push_back(origin.hash.clone());
        }
        self.origins.insert(origin.hash.clone(), origin);

        while self.origins.len() > cap {
            let Some(oldest) = self.order.pop_front() else { break };
            self.origins.remove(&oldest);
        }
    }
}

/// Tracker over all active flow sessions
///
/// Sessions are fully independent; a per-tracker mutex suffices because the
/// critical sections are hash-map inserts and lookups.
pub struct FlowTracker {
    config: FlowTrackingConfig,
    sessions: Mutex<HashMap<String, FlowSession>>,
}

impl FlowTracker {
    pub fn new(config: FlowTrackingConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Whether tracking is enabled at all
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Record a tool response as data origins for a session
    pub fn record_response(
        &self,
        session_id: &str,
        server: &str,
        tool: &str,
        classification: &Classification,
        body: &str,
        markers: Vec<SensitiveMarker>,
    ) {
        if !self.config.enabled {
            return;
        }

        // Truncate before hashing; enormous bodies add nothing
        let body = if body.len() > self.config.max_response_hash_bytes {
            let mut cut = self.config.max_response_hash_bytes;
            while cut > 0 && !body.is_char_boundary(cut) {
                cut -= 1;
            }
            &body[..cut]
        } else {
            body
        };

        let now = Utc::now();
        let mut hashes = Vec::new();
        if body.len() >= self.config.hash_min_length {
            hashes.push(hash_content(body.as_bytes()));
            hashes.push(hash_normalized(body));
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
            for (hash, _path) in hash_json_fields(&value, self.config.hash_min_length) {
                hashes.push(hash);
            }
        }
        hashes.sort_unstable();
        hashes.dedup();
        if hashes.is_empty() {
            return;
        }

        let mut sessions = self.sessions.lock();
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| FlowSession::new(now));
        session.last_activity = now;

        for hash in hashes {
            session.insert_origin(
                DataOrigin {
                    hash,
                    server: server.to_string(),
                    tool: tool.to_string(),
                    class: classification.class,
                    sensitive: markers.clone(),
                    timestamp: now,
                },
                self.config.max_origins_per_session,
            );
        }
    }

    /// Match outgoing arguments against recorded origins
    ///
    /// Every matching hash emits one edge; edges are also appended to the
    /// session's log.
    pub fn check_call(
        &self,
        session_id: &str,
        dest_server: &str,
        dest_tool: &str,
        dest_classification: &Classification,
        arguments: &str,
    ) -> Vec<FlowEdge> {
        if !self.config.enabled {
            return Vec::new();
        }

        let hashes = hash_variants(arguments, self.config.hash_min_length);
        if hashes.is_empty() {
            return Vec::new();
        }

        let now = Utc::now();
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(session_id) else {
            return Vec::new();
        };
        session.last_activity = now;

        let mut edges = Vec::new();
        for hash in hashes {
            let Some(origin) = session.origins.get(&hash) else {
                continue;
            };

            let direction = FlowDirection::from_classes(origin.class, dest_classification.class);
            let sensitive = origin.sensitive.clone();
            let risk = match direction {
                FlowDirection::InternalToExternal if !sensitive.is_empty() => RiskLevel::Critical,
                FlowDirection::InternalToExternal => RiskLevel::Medium,
                FlowDirection::Unknown => RiskLevel::Low,
                _ => RiskLevel::None,
            };

            edges.push(FlowEdge {
                hash,
                source_server: origin.server.clone(),
                source_tool: origin.tool.clone(),
                dest_server: dest_server.to_string(),
                dest_tool: dest_tool.to_string(),
                direction,
                risk,
                sensitive,
                timestamp: now,
            });
        }

        session.edges.extend(edges.clone());
        edges
    }

    /// Link an MCP session to a hook session so both IDs land in one ring
    pub fn touch(&self, session_id: &str) {
        let now = Utc::now();
        let mut sessions = self.sessions.lock();
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| FlowSession::new(now))
            .last_activity = now;
    }

    /// Evict idle sessions; returns their summaries
    pub fn evict_idle(&self) -> Vec<FlowSummary> {
        let cutoff =
            Utc::now() - ChronoDuration::minutes(self.config.session_timeout_minutes as i64);
        let mut sessions = self.sessions.lock();

        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.last_activity < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| sessions.remove(&id).map(|s| summarize(&id, &s)))
            .collect()
    }

    /// Evict everything (daemon shutdown); returns all summaries
    pub fn drain(&self) -> Vec<FlowSummary> {
        let mut sessions = self.sessions.lock();
        sessions
            .drain()
            .map(|(id, s)| summarize(&id, &s))
            .collect()
    }

    /// Diagnostic snapshot of live sessions
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.lock();
        let mut out: Vec<SessionSnapshot> = sessions
            .iter()
            .map(|(id, s)| SessionSnapshot {
                session_id: id.clone(),
                origin_count: s.origins.len(),
                edge_count: s.edges.len(),
                last_activity: s.last_activity,
            })
            .collect();
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        out
    }
}

fn summarize(id: &str, session: &FlowSession) -> FlowSummary {
    FlowSummary {
        session_id: id.to_string(),
        started_at: session.started_at,
        last_activity: session.last_activity,
        origin_count: session.origins.len(),
        edge_count: session.edges.len(),
        max_risk: session
            .edges
            .iter()
            .map(|e| e.risk)
            .max()
            .unwrap_or(RiskLevel::None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use mcpproxy_config::ClassificationConfig;

    fn tracker() -> FlowTracker {
        FlowTracker::new(FlowTrackingConfig::default())
    }

    fn class_of(server: &str) -> Classification {
        classify(server, "x", &ClassificationConfig::default())
    }

    const SECRET_BODY: &str = "token sk-proj-abc123def456ghi789jkl012mno345 found in config";

    #[test]
    fn test_record_then_check_emits_edge() {
        let tracker = tracker();
        let markers = crate::sensitive::scan_sensitive(SECRET_BODY);
        tracker.record_response("s1", "github", "get_file", &class_of("github"), SECRET_BODY, markers);

        let args = format!(r#"{{"text":"{}"}}"#, SECRET_BODY);
        let edges = tracker.check_call("s1", "slack", "post_message", &class_of("slack"), &args);

        assert!(!edges.is_empty());
        let edge = &edges[0];
        assert_eq!(edge.direction, FlowDirection::InternalToExternal);
        assert_eq!(edge.risk, RiskLevel::Critical);
        assert_eq!(edge.source_server, "github");
        assert_eq!(edge.dest_server, "slack");
    }

    #[test]
    fn test_sessions_are_isolated() {
        let tracker = tracker();
        tracker.record_response("s1", "github", "get_file", &class_of("github"), SECRET_BODY, vec![]);

        let args = format!(r#"{{"text":"{}"}}"#, SECRET_BODY);
        let edges = tracker.check_call("s2", "slack", "post_message", &class_of("slack"), &args);
        assert!(edges.is_empty());
    }

    #[test]
    fn test_normalized_match_survives_case_mangling() {
        let tracker = tracker();
        tracker.record_response("s1", "fs", "read_file", &class_of("fs"), "This Is A Long Secret Document", vec![]);

        // Same content, different case and padding
        let edges = tracker.check_call(
            "s1",
            "slack",
            "post",
            &class_of("slack"),
            "  this is a long secret document ",
        );
        assert!(!edges.is_empty());
        assert_eq!(edges[0].risk, RiskLevel::Medium);
    }

    #[test]
    fn test_origin_cap_evicts_oldest() {
        let config = FlowTrackingConfig {
            max_origins_per_session: 4,
            ..Default::default()
        };
        let tracker = FlowTracker::new(config);

        for i in 0..10 {
            tracker.record_response(
                "s1",
                "fs",
                "read_file",
                &class_of("fs"),
                &format!("unique long document number {:04} here", i),
                vec![],
            );
        }

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].origin_count <= 4);
    }

    #[test]
    fn test_internal_to_internal_is_no_risk() {
        let tracker = tracker();
        tracker.record_response("s1", "fs", "read_file", &class_of("fs"), "a long internal document body", vec![]);
        let edges = tracker.check_call(
            "s1",
            "sqlite-db",
            "insert",
            &class_of("sqlite-db"),
            "a long internal document body",
        );
        assert!(!edges.is_empty());
        assert_eq!(edges[0].direction, FlowDirection::InternalToInternal);
        assert_eq!(edges[0].risk, RiskLevel::None);
    }

    #[test]
    fn test_drain_produces_summaries() {
        let tracker = tracker();
        tracker.record_response("s1", "github", "get_file", &class_of("github"), SECRET_BODY, crate::sensitive::scan_sensitive(SECRET_BODY));
        let args = format!(r#"{{"text":"{}"}}"#, SECRET_BODY);
        tracker.check_call("s1", "slack", "post", &class_of("slack"), &args);

        let summaries = tracker.drain();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].max_risk, RiskLevel::Critical);
        assert!(summaries[0].edge_count >= 1);
    }

    #[test]
    fn test_hybrid_resolution() {
        assert_eq!(
            FlowDirection::from_classes(ServerClass::Hybrid, ServerClass::Hybrid),
            FlowDirection::InternalToExternal
        );
        assert_eq!(
            FlowDirection::from_classes(ServerClass::External, ServerClass::Internal),
            FlowDirection::ExternalToInternal
        );
    }
}
