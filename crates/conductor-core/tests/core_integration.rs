#![allow(clippy::unwrap_used, clippy::expect_used)]

use conductor_core::*;
use std::time::Duration;

// ---------------------------------------------------------------------------
// 1. Message serialization roundtrip keeps optional envelope fields
// ---------------------------------------------------------------------------

#[test]
fn message_serialization_roundtrip() {
    let msg = Message::request("coordinator", "calendar-agent", serde_json::json!({"task": "t-9"}))
        .with_priority(Priority::Urgent)
        .with_correlation_id("dispatch-1")
        .with_ttl(30);

    let json = serde_json::to_string(&msg).unwrap();
    let deserialized: Message = serde_json::from_str(&json).unwrap();

    assert_eq!(deserialized.id, msg.id);
    assert_eq!(deserialized.kind, MessageKind::Request);
    assert_eq!(deserialized.priority, Some(Priority::Urgent));
    assert_eq!(deserialized.correlation_id.as_deref(), Some("dispatch-1"));
    assert_eq!(deserialized.ttl, Some(30));
    assert_eq!(deserialized.timestamp, msg.timestamp);
    assert_eq!(deserialized.payload["task"], "t-9");
}

// ---------------------------------------------------------------------------
// 2. Optional fields may be omitted on the wire
// ---------------------------------------------------------------------------

#[test]
fn message_optional_fields_default() {
    let json = serde_json::json!({
        "id": "8a7c1f4e-3b61-4a36-b0a2-9f3b2c1d0e55",
        "from": "a",
        "to": "b",
        "kind": "notification",
        "payload": null,
        "timestamp": "2026-01-01T00:00:00Z"
    });
    let msg: Message = serde_json::from_value(json).unwrap();
    assert_eq!(msg.kind, MessageKind::Notification);
    assert!(msg.priority.is_none());
    assert!(msg.correlation_id.is_none());
    assert!(msg.ttl.is_none());
}

// ---------------------------------------------------------------------------
// 3. Error Display and From impls
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    let err = ConductorError::Validation("agent id is required".to_string());
    assert_eq!(err.to_string(), "Validation error: agent id is required");

    let err = ConductorError::Duplicate("agent 'a1' already registered".to_string());
    assert_eq!(err.to_string(), "Duplicate error: agent 'a1' already registered");

    let err = ConductorError::NotFound("plan p1".to_string());
    assert_eq!(err.to_string(), "Not found: plan p1");

    let err = ConductorError::RetryExhausted {
        task_id: "t1".to_string(),
        attempts: 4,
        last_error: "boom".to_string(),
    };
    assert_eq!(err.to_string(), "Task 't1' failed after 4 attempts: boom");

    let err = ConductorError::Timeout {
        task_id: "t2".to_string(),
        after: Duration::from_secs(2),
    };
    assert!(err.to_string().contains("2000ms"));

    let bad_json = serde_json::from_str::<serde_json::Value>("not json");
    let err: ConductorError = bad_json.unwrap_err().into();
    assert!(err.to_string().starts_with("Serialization error:"));

    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
    let err: ConductorError = io_err.into();
    assert!(err.to_string().starts_with("IO error:"));
}

// ---------------------------------------------------------------------------
// 4. Priority serializes as lowercase strings
// ---------------------------------------------------------------------------

#[test]
fn priority_serialization() {
    assert_eq!(serde_json::to_string(&Priority::Urgent).unwrap(), "\"urgent\"");
    let low: Priority = serde_json::from_str("\"low\"").unwrap();
    assert_eq!(low, Priority::Low);
    assert!(serde_json::from_str::<Priority>("\"critical\"").is_err());
}
