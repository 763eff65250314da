//! Kernel lifecycle events pushed from the kernel service to project webhooks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a kernel webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelEventType {
    Started,
    Deleted,
    Stopped,
    Error,
    #[serde(other)]
    Unknown,
}

impl KernelEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Deleted => "deleted",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// Webhook payload: `{type, timestamp, kernel_id, status, kernel_url?, error?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelEvent {
    #[serde(rename = "type")]
    pub kind: KernelEventType,
    pub timestamp: DateTime<Utc>,
    pub kernel_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl KernelEvent {
    fn new(kind: KernelEventType, kernel_id: &str) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            kernel_id: kernel_id.to_string(),
            status: kind.as_str().to_string(),
            kernel_url: None,
            error: None,
        }
    }

    /// Sent once a worker has registered and is reachable at `kernel_url`.
    pub fn started(kernel_id: &str, kernel_url: &str) -> Self {
        Self {
            kernel_url: Some(kernel_url.to_string()),
            ..Self::new(KernelEventType::Started, kernel_id)
        }
    }

    /// Sent after an explicit teardown.
    pub fn deleted(kernel_id: &str) -> Self {
        Self::new(KernelEventType::Deleted, kernel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_event_wire_shape() {
        let event = KernelEvent::started("k1", "http://10.0.0.5:9000");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "started");
        assert_eq!(json["status"], "started");
        assert_eq!(json["kernel_id"], "k1");
        assert_eq!(json["kernel_url"], "http://10.0.0.5:9000");
        assert!(json.get("error").is_none());
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn unrecognised_types_deserialize_as_unknown() {
        let event: KernelEvent = serde_json::from_str(
            r#"{"type":"paused","timestamp":"2024-05-01T10:00:00Z","kernel_id":"k1","status":"paused"}"#,
        )
        .unwrap();
        assert_eq!(event.kind, KernelEventType::Unknown);
        assert_eq!(event.kernel_url, None);
    }
}
