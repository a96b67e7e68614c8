//! Event payloads shared between the Supervisor (C9) and the WebSocket
//! Bridge (C11), mirrored on the upstream crate's `EventHandler`/`AgentEvent`
//! split in `event.rs`: a single sink trait with one method per event kind,
//! default no-ops, callable from both async and synchronous contexts.

use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    Coding,
    Testing,
    Review,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One broadcastable event (§4.11 "Event types emitted"). Serialized as
/// `{"type": ..., "data": ...}` by [`EventEnvelope`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    SystemStatus {
        running: bool,
        current_stage: Option<String>,
        current_agent: Option<String>,
        current_issue: Option<u64>,
        current_branch: Option<String>,
    },
    AgentOutput {
        agent: String,
        content: String,
        level: String,
    },
    PipelineUpdate {
        stage: Stage,
        status: PipelineStageStatus,
        details: serde_json::Value,
    },
    McpLog {
        message: String,
        level: String,
    },
    Error {
        message: String,
        traceback: Option<String>,
    },
}

/// Envelope sent to WebSocket clients, `{type, data, timestamp}` (§6.3).
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: Event,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl EventEnvelope {
    pub fn now(event: Event) -> Self {
        EventEnvelope { event, timestamp: chrono::Utc::now() }
    }
}

/// Receives every event the supervisor and its components emit. The
/// WebSocket hub implements this to fan events out to connected clients;
/// the CLI can implement it to print a plain-text log instead.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// No-op sink for contexts (like unit tests) that don't care about events.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

pub type SharedSink = Arc<dyn EventSink>;
