use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Urgency of a task or message. Ordered from least to most urgent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low,
    /// The default.
    #[default]
    Medium,
    /// Should run ahead of ordinary work.
    High,
    /// Runs before everything else.
    Urgent,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

/// The kind of a [`Message`] exchanged on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Asks the recipient to do something, usually a task dispatch.
    Request,
    /// Answers an earlier request (same `correlation_id`).
    Response,
    /// One-way informational message.
    Notification,
    /// One copy of a capability-wide broadcast.
    Broadcast,
}

/// An agent-to-agent message. Transient and read-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// Sender agent id.
    pub from: String,
    /// Recipient agent id.
    pub to: String,
    /// What this message is.
    pub kind: MessageKind,
    /// Arbitrary JSON payload.
    pub payload: serde_json::Value,
    /// UTC timestamp of when the message was created.
    pub timestamp: DateTime<Utc>,
    /// Optional delivery priority.
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Links a response to the request it answers.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Time-to-live in seconds; expired messages are never delivered.
    #[serde(default)]
    pub ttl: Option<u64>,
}

impl Message {
    /// Creates a new message.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            to: to.into(),
            kind,
            payload,
            timestamp: Utc::now(),
            priority: None,
            correlation_id: None,
            ttl: None,
        }
    }

    /// Creates a new [`MessageKind::Request`].
    pub fn request(from: impl Into<String>, to: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(from, to, MessageKind::Request, payload)
    }

    /// Creates a new [`MessageKind::Notification`].
    pub fn notification(
        from: impl Into<String>,
        to: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(from, to, MessageKind::Notification, payload)
    }

    /// Builds the response to this message, swapping sender and recipient.
    ///
    /// The correlation id is carried over, falling back to this message's id.
    pub fn reply(&self, payload: serde_json::Value) -> Self {
        let correlation = self
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.id.to_string());
        Self::new(self.to.clone(), self.from.clone(), MessageKind::Response, payload)
            .with_correlation_id(correlation)
    }

    /// Sets the delivery priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Links this message to an earlier request.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Expires the message `seconds` after its timestamp.
    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    /// Whether the TTL has elapsed at `now`. Messages without a TTL never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => {
                // Capped so the conversion below cannot overflow chrono's range.
                let ttl = Duration::seconds(i64::from(u32::try_from(ttl).unwrap_or(u32::MAX)));
                self.timestamp
                    .checked_add_signed(ttl)
                    .is_some_and(|deadline| now >= deadline)
            }
            None => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::request("coordinator", "doc-agent", serde_json::json!({"task": "t1"}));
        assert_eq!(msg.kind, MessageKind::Request);
        assert_eq!(msg.from, "coordinator");
        assert_eq!(msg.to, "doc-agent");
        assert!(msg.correlation_id.is_none());
    }

    #[test]
    fn test_reply_swaps_endpoints_and_correlates() {
        let req = Message::request("a", "b", serde_json::Value::Null).with_correlation_id("d-1");
        let resp = req.reply(serde_json::json!({"ok": true}));
        assert_eq!(resp.kind, MessageKind::Response);
        assert_eq!(resp.from, "b");
        assert_eq!(resp.to, "a");
        assert_eq!(resp.correlation_id.as_deref(), Some("d-1"));

        let bare = Message::request("a", "b", serde_json::Value::Null);
        let resp = bare.reply(serde_json::Value::Null);
        assert_eq!(resp.correlation_id, Some(bare.id.to_string()));
    }

    #[test]
    fn test_ttl_expiry() {
        let msg = Message::notification("a", "b", serde_json::Value::Null).with_ttl(10);
        assert!(!msg.is_expired_at(msg.timestamp + Duration::seconds(9)));
        assert!(msg.is_expired_at(msg.timestamp + Duration::seconds(10)));

        let forever = Message::notification("a", "b", serde_json::Value::Null);
        assert!(!forever.is_expired_at(forever.timestamp + Duration::days(365)));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&MessageKind::Broadcast).unwrap();
        assert_eq!(json, "\"broadcast\"");
    }
}
