//! Activity recording service
//!
//! Thin layer over the activity store that truncates payload previews,
//! attaches token counts, and mirrors every appended record onto the SSE
//! bus. Every tool call that returns to a client corresponds to exactly one
//! record appended here.

use serde_json::json;

use mcpproxy_security::FlowSummary;
use mcpproxy_storage::{
    ActivityFilter, ActivityRecord, ActivityStatus, ActivityStore, ActivitySummary, ActivityType,
    ExportFormat, StorageResult,
};
use mcpproxy_web::{events::channels, EventBus};

/// Preview budget for request/response excerpts in records
const PREVIEW_BYTES: usize = 1024;

/// Activity log facade shared by router, API and hooks
#[derive(Clone)]
pub struct ActivityService {
    store: ActivityStore,
    events: EventBus,
}

impl ActivityService {
    pub fn new(store: ActivityStore, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Truncate a payload to its activity preview
    pub fn preview(payload: &str) -> String {
        if payload.len() <= PREVIEW_BYTES {
            return payload.to_string();
        }
        let mut cut = PREVIEW_BYTES;
        while cut > 0 && !payload.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &payload[..cut])
    }

    /// Append a record and publish it
    pub fn record(&self, record: ActivityRecord) -> Option<String> {
        let id = match self.store.append(&record) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(error = %e, "Activity append failed");
                return None;
            }
        };

        let channel = match record.status {
            Some(ActivityStatus::Success) | Some(ActivityStatus::Error) => {
                channels::ACTIVITY_COMPLETED
            }
            _ => channels::ACTIVITY,
        };
        self.events.publish(
            channel,
            serde_json::to_value(&record).unwrap_or_else(|_| json!({"id": id})),
        );
        Some(id)
    }

    /// Record an evicted flow session's summary
    pub fn record_flow_summary(&self, summary: &FlowSummary) {
        let record = ActivityRecord::new(ActivityType::FlowSummary)
            .with_session(summary.session_id.clone())
            .with_metadata(serde_json::to_value(summary).unwrap_or_default());
        self.record(record);
    }

    /// Lifecycle markers
    pub fn record_system(&self, record_type: ActivityType) {
        self.record(ActivityRecord::new(record_type));
    }

    pub fn get(&self, id: &str) -> StorageResult<ActivityRecord> {
        self.store.get(id)
    }

    pub fn query(&self, filter: &ActivityFilter) -> StorageResult<Vec<ActivityRecord>> {
        self.store.query(filter)
    }

    pub fn summary(&self, filter: &ActivityFilter) -> StorageResult<ActivitySummary> {
        self.store.summary(filter)
    }

    pub fn export(&self, filter: &ActivityFilter, format: ExportFormat) -> StorageResult<String> {
        self.store.export(filter, format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpproxy_storage::ProxyDb;

    #[test]
    fn test_preview_truncates_long_payloads() {
        let long = "x".repeat(5000);
        let preview = ActivityService::preview(&long);
        assert!(preview.len() < 1100);
        assert!(preview.ends_with('…'));
        assert_eq!(ActivityService::preview("short"), "short");
    }

    #[tokio::test]
    async fn test_record_publishes_on_bus() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let service = ActivityService::new(
            ActivityStore::new(ProxyDb::open_temporary().unwrap()),
            events,
        );

        let record = ActivityRecord::new(ActivityType::ToolCall)
            .with_server("gh")
            .with_status(ActivityStatus::Success);
        let id = service.record(record).unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.channel, channels::ACTIVITY_COMPLETED);
        assert_eq!(service.get(&id).unwrap().server.as_deref(), Some("gh"));
    }
}
