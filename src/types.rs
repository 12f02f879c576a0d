use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Repository name recorded when the payload names neither a repository nor
/// an organization.
pub const UNKNOWN: &str = "unknown";

/// Repository name recorded for Projects (v2) item events.
pub const PROJECTS_REPOSITORY: &str = "GitHub Projects";

/// One received webhook delivery, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub action: Option<String>,
    /// Source-provided; redeliveries reuse it, so it is not a key.
    pub delivery_id: Option<String>,
    pub signature: Option<String>,
    pub payload: Value,
    pub sender_login: String,
    pub sender_id: Option<i64>,
    pub repository: String,
    pub verified: bool,
}

/// Event fields known before the store assigns an id and timestamp.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub action: Option<String>,
    pub delivery_id: Option<String>,
    pub signature: Option<String>,
    pub payload: Value,
    pub sender_login: String,
    pub sender_id: Option<i64>,
    pub repository: String,
    pub verified: bool,
}

/// Row returned by the paginated event listing (payload omitted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub action: Option<String>,
    pub delivery_id: Option<String>,
    pub sender_login: String,
    pub repository: String,
    pub verified: bool,
}

/// A template rendered against one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedDocument {
    pub id: i64,
    pub webhook_id: i64,
    pub repository: String,
    pub event_type: String,
    pub prompt_template: String,
    pub parsed_content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub webhook_id: i64,
    pub repository: String,
    pub event_type: String,
    pub prompt_template: String,
    pub parsed_content: String,
}

/// Rendered document joined with fields of its owning event. The owning
/// event may have been deleted, in which case the joined fields are absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentView {
    #[serde(flatten)]
    pub document: RenderedDocument,
    pub webhook_timestamp: Option<DateTime<Utc>>,
    pub delivery_id: Option<String>,
    pub sender_login: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Filter and paging for document listings.
#[derive(Debug, Clone, Copy)]
pub struct DocumentQuery {
    pub webhook_id: Option<i64>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    TimedOut,
    LaunchFailed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::LaunchFailed => "launch_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            "launch_failed" => Some(Self::LaunchFailed),
            _ => None,
        }
    }
}

/// Captured result of one agent run over a rendered document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub prompt_id: i64,
    pub response_content: String,
    pub error_message: Option<String>,
    /// Absent when the process never started, timed out, or died by signal.
    pub exit_code: Option<i32>,
    pub execution_time: u64,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewExecution {
    pub prompt_id: i64,
    pub response_content: String,
    pub error_message: Option<String>,
    pub exit_code: Option<i32>,
    pub execution_time: u64,
    pub status: ExecutionStatus,
}

/// Body returned to the webhook sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ack {
    pub received: bool,
    pub event: String,
    pub action: Option<String>,
    pub repository: String,
    pub verified: bool,
}

/// Inbound delivery as handed over by the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub event_type: Option<String>,
    pub delivery_id: Option<String>,
    pub signature: Option<String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}
