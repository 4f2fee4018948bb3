use anyhow::{anyhow, ensure, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Conversation side a message belongs to. Only these two roles are ever
/// submitted downstream; system and tool turns are filtered out upstream.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    User,
    Assistant,
}

impl RoleType {
    pub fn as_str(self) -> &'static str {
        match self {
            RoleType::User => "user",
            RoleType::Assistant => "assistant",
        }
    }
}

/// One message inside a sink submission.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemoryMessage {
    pub role_type: RoleType,
    /// Display name shown in the downstream store (e.g. "User", "Assistant").
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Wire payload for `POST <sink>`: a batch of messages filed under one group.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemoryBatch {
    pub group_id: String,
    pub messages: Vec<MemoryMessage>,
}

impl MemoryBatch {
    pub fn validate(&self) -> Result<()> {
        validate_batch_value(&serde_json::to_value(self)?)
    }
}

/// Validate a batch payload as the sink will see it.
pub fn validate_batch_value(value: &serde_json::Value) -> Result<()> {
    let obj = value.as_object().context("batch must be a JSON object")?;

    let group_id = obj
        .get("group_id")
        .and_then(|v| v.as_str())
        .context("group_id missing or not a string")?;
    ensure!(!group_id.is_empty(), "group_id must be non-empty");

    let messages = obj
        .get("messages")
        .and_then(|v| v.as_array())
        .context("messages must be an array")?;
    ensure!(!messages.is_empty(), "messages must be non-empty");

    for message in messages {
        let msg = message.as_object().context("message must be an object")?;
        let role_type = ensure_string(msg, "role_type")?;
        ensure!(
            matches!(role_type, "user" | "assistant"),
            "role_type must be user or assistant, got {role_type}"
        );
        ensure_string(msg, "role")?;
        let content = ensure_string(msg, "content")?;
        ensure!(
            !content.trim().is_empty(),
            "content must not be blank after trim"
        );
        let timestamp = ensure_string(msg, "timestamp")?;
        DateTime::parse_from_rfc3339(timestamp).context("timestamp must be RFC3339")?;
    }

    Ok(())
}

fn ensure_string<'a>(
    map: &'a serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<&'a str> {
    map.get(key)
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("{key} missing or not a non-empty string"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> MemoryBatch {
        MemoryBatch {
            group_id: "chat-2026-02-01".to_string(),
            messages: vec![MemoryMessage {
                role_type: RoleType::User,
                role: "User".to_string(),
                content: "how do I rotate these logs?".to_string(),
                timestamp: Utc::now(),
            }],
        }
    }

    #[test]
    fn accepts_valid_batch() -> Result<()> {
        sample_batch().validate()
    }

    #[test]
    fn role_type_serializes_lowercase() {
        let json = serde_json::to_value(RoleType::Assistant).unwrap();
        assert_eq!(json, serde_json::json!("assistant"));
    }

    #[test]
    fn rejects_empty_group() {
        let mut batch = sample_batch();
        batch.group_id.clear();
        assert!(batch.validate().is_err());
    }

    #[test]
    fn rejects_blank_content() {
        let invalid = serde_json::json!({
            "group_id": "chat-2026-02-01",
            "messages": [{
                "role_type": "user",
                "role": "User",
                "content": "   ",
                "timestamp": Utc::now().to_rfc3339(),
            }]
        });
        assert!(validate_batch_value(&invalid).is_err());
    }

    #[test]
    fn rejects_unknown_role_type() {
        let invalid = serde_json::json!({
            "group_id": "chat-2026-02-01",
            "messages": [{
                "role_type": "tool",
                "role": "Tool",
                "content": "ran the linter",
                "timestamp": Utc::now().to_rfc3339(),
            }]
        });
        assert!(validate_batch_value(&invalid).is_err());
    }
}
