//! Canonical job records
//!
//! The cloud has delivered print jobs in two envelopes over time:
//!
//! ```json
//! {"type": "new_message", "message": {"id": "42", "contentType": "text", "content": "hello"}}
//! {"type": "print_job", "message_id": "42", "content_type": "text", "content": {"body": "hello"}}
//! ```
//!
//! Both are absorbed by [`InboundJob::normalize`].

use crate::protocol::{OutboundMessage, PrintState, PrintStatus};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value, json};

const DEFAULT_OWNER: &str = "Someone";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobKind {
    Text,
    Image,
    Ping,
    Claimed,
    TestPrint,
    /// Unsupported message type or content type
    Unknown(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct InboundJob {
    pub job_id: Option<String>,
    pub kind: JobKind,
    pub payload: Value,
    pub sender_label: Option<String>,
}

impl InboundJob {
    /// Normalize any inbound message into a canonical job
    pub fn normalize(message: &Value) -> Self {
        let message_type = message.get("type").and_then(Value::as_str).unwrap_or("");

        match message_type {
            "print_job" | "new_message" => Self::from_print_envelope(message),
            "ping" => Self::inline(JobKind::Ping, None),
            "claimed" => Self::inline(
                JobKind::Claimed,
                Some(
                    message
                        .get("owner_name")
                        .and_then(Value::as_str)
                        .unwrap_or(DEFAULT_OWNER)
                        .to_string(),
                ),
            ),
            "test_print" => Self::inline(JobKind::TestPrint, None),
            other => Self::inline(JobKind::Unknown(other.to_string()), None),
        }
    }

    fn inline(kind: JobKind, sender_label: Option<String>) -> Self {
        Self {
            job_id: None,
            kind,
            payload: Value::Null,
            sender_label,
        }
    }

    fn from_print_envelope(message: &Value) -> Self {
        let empty = Map::new();
        let outer = message.as_object().unwrap_or(&empty);

        // nested envelope wins when present
        let (inner, id_key) = match outer.get("message").and_then(Value::as_object) {
            Some(inner) => (inner, "id"),
            None => (outer, "message_id"),
        };

        let job_id = inner.get(id_key).and_then(id_string);

        let content_type = ["contentType", "content_type"]
            .iter()
            .find_map(|key| inner.get(*key).and_then(Value::as_str))
            .unwrap_or("text");

        let kind = match content_type {
            "text" => JobKind::Text,
            "image" => JobKind::Image,
            other => JobKind::Unknown(other.to_string()),
        };

        let payload = match inner.get("content") {
            Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
                Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed,
                _ => Value::String(text.clone()),
            },
            Some(content) => content.clone(),
            None => Value::Null,
        };

        let payload = match (&kind, payload) {
            (JobKind::Text, Value::String(body)) => json!({ "body": body }),
            (_, payload) => payload,
        };

        let sender_label = [outer, inner]
            .iter()
            .find_map(|map| map.get("sender_name").and_then(Value::as_str))
            .map(str::to_string);

        Self {
            job_id,
            kind,
            payload,
            sender_label,
        }
    }
}

fn id_string(id: &Value) -> Option<String> {
    match id {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutcomeStatus {
    Accepted,
    Succeeded,
    Failed,
}

/// Result of one dispatch step, reported upstream
#[derive(Clone, Debug, PartialEq)]
pub struct JobOutcome {
    pub job_id: String,
    pub status: OutcomeStatus,
    pub error_detail: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl JobOutcome {
    pub fn accepted(job_id: impl Into<String>) -> Self {
        Self::new(job_id.into(), OutcomeStatus::Accepted, None)
    }

    pub fn succeeded(job_id: impl Into<String>) -> Self {
        Self::new(job_id.into(), OutcomeStatus::Succeeded, None)
    }

    pub fn failed(job_id: impl Into<String>, error_detail: impl Into<String>) -> Self {
        Self::new(
            job_id.into(),
            OutcomeStatus::Failed,
            Some(error_detail.into()),
        )
    }

    fn new(job_id: String, status: OutcomeStatus, error_detail: Option<String>) -> Self {
        Self {
            job_id,
            status,
            error_detail,
            completed_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != OutcomeStatus::Accepted
    }

    pub fn to_message(&self) -> OutboundMessage {
        let status = match self.status {
            OutcomeStatus::Accepted => PrintState::Printing,
            OutcomeStatus::Succeeded => PrintState::Printed,
            OutcomeStatus::Failed => PrintState::Failed,
        };

        OutboundMessage::PrintStatus(PrintStatus {
            message_id: self.job_id.clone(),
            status,
            error: self.error_detail.clone(),
            printed_at: self
                .is_terminal()
                .then(|| self.completed_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        })
    }
}
