//! Append-only activity log
//!
//! Every tool call, policy decision, quarantine change, and lifecycle event
//! lands here exactly once. Records are keyed by a monotonic sequence so sled
//! iteration yields them in append order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::db::{ProxyDb, TREE_ACTIVITY};
use crate::error::{StorageError, StorageResult};

/// Kind of activity record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    ToolCall,
    PolicyDecision,
    QuarantineChange,
    ServerChange,
    HookEvaluation,
    FlowSummary,
    SystemStart,
    SystemStop,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::ToolCall => "tool_call",
            ActivityType::PolicyDecision => "policy_decision",
            ActivityType::QuarantineChange => "quarantine_change",
            ActivityType::ServerChange => "server_change",
            ActivityType::HookEvaluation => "hook_evaluation",
            ActivityType::FlowSummary => "flow_summary",
            ActivityType::SystemStart => "system_start",
            ActivityType::SystemStop => "system_stop",
        }
    }
}

impl FromStr for ActivityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool_call" => Ok(ActivityType::ToolCall),
            "policy_decision" => Ok(ActivityType::PolicyDecision),
            "quarantine_change" => Ok(ActivityType::QuarantineChange),
            "server_change" => Ok(ActivityType::ServerChange),
            "hook_evaluation" => Ok(ActivityType::HookEvaluation),
            "flow_summary" => Ok(ActivityType::FlowSummary),
            "system_start" => Ok(ActivityType::SystemStart),
            "system_stop" => Ok(ActivityType::SystemStop),
            other => Err(format!("unknown activity type: {}", other)),
        }
    }
}

/// Outcome of the recorded operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Success,
    Error,
    Blocked,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Success => "success",
            ActivityStatus::Error => "error",
            ActivityStatus::Blocked => "blocked",
        }
    }
}

impl FromStr for ActivityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ActivityStatus::Success),
            "error" => Ok(ActivityStatus::Error),
            "blocked" => Ok(ActivityStatus::Blocked),
            other => Err(format!("unknown activity status: {}", other)),
        }
    }
}

/// One activity record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Unique record ID
    pub id: String,

    /// Record kind
    #[serde(rename = "type")]
    pub record_type: ActivityType,

    /// When the event happened
    pub timestamp: DateTime<Utc>,

    /// Upstream server involved, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    /// Tool involved (namespaced), if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,

    /// Agent/flow session the event belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Outcome
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ActivityStatus>,

    /// Wall-clock duration of the operation in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Truncated request arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,

    /// Truncated response body or error message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    /// Token counts of request/response, when the tokenizer is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_counts: Option<TokenCounts>,

    /// Free-form metadata (intent declaration, flow analysis, decision reason)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Request/response token counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub request: usize,
    pub response: usize,
}

impl ActivityRecord {
    /// Create a record with a fresh ID and the current timestamp
    pub fn new(record_type: ActivityType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            record_type,
            timestamp: Utc::now(),
            server: None,
            tool: None,
            session_id: None,
            status: None,
            duration_ms: None,
            request: None,
            response: None,
            token_counts: None,
            metadata: None,
        }
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session_id = Some(session.into());
        self
    }

    pub fn with_status(mut self, status: ActivityStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Filters for activity queries; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_type: Option<ActivityType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ActivityStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,

    /// Match the `flow_type` field of the record metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_type: Option<String>,

    /// Match the `risk` field of the record metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,

    /// Maximum records returned (newest first); 0 means no limit
    #[serde(default)]
    pub limit: usize,

    /// Records skipped from the newest end before collecting
    #[serde(default)]
    pub offset: usize,
}

impl ActivityFilter {
    fn matches(&self, record: &ActivityRecord) -> bool {
        if self.record_type.is_some_and(|t| t != record.record_type) {
            return false;
        }
        if let Some(server) = &self.server {
            if record.server.as_deref() != Some(server.as_str()) {
                return false;
            }
        }
        if self.status.is_some() && self.status != record.status {
            return false;
        }
        if let Some(session) = &self.session_id {
            if record.session_id.as_deref() != Some(session.as_str()) {
                return false;
            }
        }
        if self.since.is_some_and(|since| record.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| record.timestamp > until) {
            return false;
        }
        let metadata_field = |key: &str| {
            record
                .metadata
                .as_ref()
                .and_then(|m| m.get(key))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        if let Some(flow_type) = &self.flow_type {
            if metadata_field("flow_type").as_deref() != Some(flow_type.as_str()) {
                return false;
            }
        }
        if let Some(risk) = &self.risk_level {
            if metadata_field("risk").as_deref() != Some(risk.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Aggregated view over a filtered set of records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub total: usize,
    pub by_type: std::collections::HashMap<String, usize>,
    pub by_status: std::collections::HashMap<String, usize>,
    pub blocked: usize,
}

/// Export serialization format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(format!("unknown export format: {}", other)),
        }
    }
}

/// Activity log store inside `config.db`
#[derive(Clone)]
pub struct ActivityStore {
    db: ProxyDb,
}

impl ActivityStore {
    pub fn new(db: ProxyDb) -> Self {
        Self { db }
    }

    /// Append one record; returns its ID
    pub fn append(&self, record: &ActivityRecord) -> StorageResult<String> {
        let tree = self.db.tree(TREE_ACTIVITY)?;
        let seq = self.db.next_sequence()?;
        tree.insert(seq.to_be_bytes(), serde_json::to_vec(record)?)?;
        Ok(record.id.clone())
    }

    /// Fetch one record by ID
    pub fn get(&self, id: &str) -> StorageResult<ActivityRecord> {
        let tree = self.db.tree(TREE_ACTIVITY)?;
        for entry in tree.iter().rev() {
            let (_, bytes) = entry?;
            let record: ActivityRecord = serde_json::from_slice(&bytes)?;
            if record.id == id {
                return Ok(record);
            }
        }
        Err(StorageError::NotFound(format!("activity record {}", id)))
    }

    /// Query records, newest first
    pub fn query(&self, filter: &ActivityFilter) -> StorageResult<Vec<ActivityRecord>> {
        let tree = self.db.tree(TREE_ACTIVITY)?;
        let mut results = Vec::new();
        let mut skipped = 0usize;

        for entry in tree.iter().rev() {
            let (_, bytes) = entry?;
            let record: ActivityRecord = serde_json::from_slice(&bytes)?;
            if !filter.matches(&record) {
                continue;
            }
            if skipped < filter.offset {
                skipped += 1;
                continue;
            }
            results.push(record);
            if filter.limit > 0 && results.len() >= filter.limit {
                break;
            }
        }

        Ok(results)
    }

    /// Summarize the records matching a filter
    pub fn summary(&self, filter: &ActivityFilter) -> StorageResult<ActivitySummary> {
        let mut unlimited = filter.clone();
        unlimited.limit = 0;
        unlimited.offset = 0;

        let mut summary = ActivitySummary::default();
        for record in self.query(&unlimited)? {
            summary.total += 1;
            *summary
                .by_type
                .entry(record.record_type.as_str().to_string())
                .or_default() += 1;
            if let Some(status) = record.status {
                *summary.by_status.entry(status.as_str().to_string()).or_default() += 1;
                if status == ActivityStatus::Blocked {
                    summary.blocked += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Export records matching a filter as JSON or CSV
    pub fn export(&self, filter: &ActivityFilter, format: ExportFormat) -> StorageResult<String> {
        let records = self.query(filter)?;
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&records)?),
            ExportFormat::Csv => {
                let mut writer = csv::Writer::from_writer(Vec::new());
                writer
                    .write_record([
                        "id",
                        "type",
                        "timestamp",
                        "server",
                        "tool",
                        "session_id",
                        "status",
                        "duration_ms",
                        "request",
                        "response",
                    ])
                    .map_err(|e| StorageError::Export(e.to_string()))?;

                for record in &records {
                    writer
                        .write_record([
                            record.id.as_str(),
                            record.record_type.as_str(),
                            &record.timestamp.to_rfc3339(),
                            record.server.as_deref().unwrap_or(""),
                            record.tool.as_deref().unwrap_or(""),
                            record.session_id.as_deref().unwrap_or(""),
                            record.status.map(|s| s.as_str()).unwrap_or(""),
                            &record.duration_ms.map(|d| d.to_string()).unwrap_or_default(),
                            record.request.as_deref().unwrap_or(""),
                            record.response.as_deref().unwrap_or(""),
                        ])
                        .map_err(|e| StorageError::Export(e.to_string()))?;
                }

                let bytes = writer
                    .into_inner()
                    .map_err(|e| StorageError::Export(e.to_string()))?;
                String::from_utf8(bytes).map_err(|e| StorageError::Export(e.to_string()))
            }
        }
    }
}

impl std::fmt::Debug for ActivityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ActivityStore {
        ActivityStore::new(ProxyDb::open_temporary().unwrap())
    }

    fn tool_call(server: &str, status: ActivityStatus) -> ActivityRecord {
        ActivityRecord::new(ActivityType::ToolCall)
            .with_server(server)
            .with_tool(format!("{}:do_thing", server))
            .with_session("sess-1")
            .with_status(status)
    }

    #[test]
    fn test_append_then_get_by_id() {
        let store = store();
        let record = tool_call("gh", ActivityStatus::Success);
        let id = store.append(&record).unwrap();

        let loaded = store.get(&id).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_query_is_newest_first_with_paging() {
        let store = store();
        for i in 0..5 {
            let mut record = tool_call("gh", ActivityStatus::Success);
            record.request = Some(format!("call-{}", i));
            store.append(&record).unwrap();
        }

        let page = store
            .query(&ActivityFilter {
                limit: 2,
                offset: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].request.as_deref(), Some("call-3"));
        assert_eq!(page[1].request.as_deref(), Some("call-2"));
    }

    #[test]
    fn test_filters_compose() {
        let store = store();
        store.append(&tool_call("gh", ActivityStatus::Success)).unwrap();
        store.append(&tool_call("gh", ActivityStatus::Blocked)).unwrap();
        store.append(&tool_call("slack", ActivityStatus::Blocked)).unwrap();

        let blocked_gh = store
            .query(&ActivityFilter {
                server: Some("gh".into()),
                status: Some(ActivityStatus::Blocked),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(blocked_gh.len(), 1);
        assert_eq!(blocked_gh[0].server.as_deref(), Some("gh"));
    }

    #[test]
    fn test_export_and_requery_agree() {
        let store = store();
        store.append(&tool_call("gh", ActivityStatus::Success)).unwrap();
        store.append(&tool_call("gh", ActivityStatus::Error)).unwrap();

        let filter = ActivityFilter {
            server: Some("gh".into()),
            ..Default::default()
        };
        let exported = store.export(&filter, ExportFormat::Json).unwrap();
        let parsed: Vec<ActivityRecord> = serde_json::from_str(&exported).unwrap();
        assert_eq!(parsed, store.query(&filter).unwrap());
    }

    #[test]
    fn test_csv_export_has_header_and_rows() {
        let store = store();
        store.append(&tool_call("gh", ActivityStatus::Success)).unwrap();

        let csv = store.export(&ActivityFilter::default(), ExportFormat::Csv).unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("id,type,timestamp"));
        assert_eq!(lines.count(), 1);
    }

    #[test]
    fn test_summary_counts() {
        let store = store();
        store.append(&tool_call("gh", ActivityStatus::Success)).unwrap();
        store.append(&tool_call("gh", ActivityStatus::Blocked)).unwrap();
        store
            .append(&ActivityRecord::new(ActivityType::SystemStart))
            .unwrap();

        let summary = store.summary(&ActivityFilter::default()).unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.blocked, 1);
        assert_eq!(summary.by_type.get("tool_call"), Some(&2));
    }
}
