use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Pull the text out of a message content value. Content is either a flat
/// string or an array of typed segments; only text-bearing segments survive,
/// newline-joined in order. Tool invocations and attachments are dropped.
pub fn text_segments(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.to_string()),
        Value::Array(items) => {
            let mut parts = Vec::new();
            for item in items {
                let is_text = item
                    .get("type")
                    .and_then(Value::as_str)
                    .map(|t| t == "text")
                    .unwrap_or(true);
                if !is_text {
                    continue;
                }
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    if !text.trim().is_empty() {
                        parts.push(text.to_string());
                    }
                } else if let Some(text) = item.as_str() {
                    if !text.trim().is_empty() {
                        parts.push(text.to_string());
                    }
                }
            }
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        _ => None,
    }
}

pub fn parse_timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => n.as_i64().and_then(parse_timestamp_i64),
        _ => None,
    }
}

pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(num) = raw.parse::<i64>() {
        return parse_timestamp_i64(num);
    }
    None
}

pub fn parse_timestamp_i64(num: i64) -> Option<DateTime<Utc>> {
    if num <= 0 {
        return None;
    }
    // Heuristic: treat values over ~year 2286 seconds as milliseconds.
    if num > 10_000_000_000 {
        let secs = num / 1000;
        let nsec = ((num % 1000) * 1_000_000) as u32;
        return Utc.timestamp_opt(secs, nsec).single();
    }
    Utc.timestamp_opt(num, 0).single()
}

/// Cap `text` at `max_chars` characters, marking the cut. Cuts on a char
/// boundary so multi-byte UTF-8 never panics.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let capped: String = text.chars().take(max_chars).collect();
    format!("{capped}...[truncated]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_string_content_passes_through() {
        let value = Value::String("plain text".to_string());
        assert_eq!(text_segments(&value).as_deref(), Some("plain text"));
    }

    #[test]
    fn segments_join_text_and_drop_tools() {
        let value = serde_json::json!([
            {"type": "text", "text": "first"},
            {"type": "tool_use", "name": "bash", "input": {"command": "ls"}},
            {"type": "text", "text": "second"},
            {"type": "image", "source": {"data": "…"}}
        ]);
        assert_eq!(text_segments(&value).as_deref(), Some("first\nsecond"));
    }

    #[test]
    fn all_non_text_segments_yield_none() {
        let value = serde_json::json!([
            {"type": "tool_result", "tool_use_id": "t1", "content": "ok"}
        ]);
        assert_eq!(text_segments(&value), None);
    }

    #[test]
    fn timestamps_accept_rfc3339_and_epoch_millis() {
        let rfc = parse_timestamp_str("2026-02-01T10:00:00Z").unwrap();
        assert_eq!(rfc.timestamp(), 1_769_940_000);

        let millis = parse_timestamp_i64(1_769_940_000_123).unwrap();
        assert_eq!(millis.timestamp(), 1_769_940_000);
        assert_eq!(millis.timestamp_subsec_millis(), 123);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "─".repeat(700);
        let capped = truncate_chars(&long, 500);
        assert!(capped.ends_with("...[truncated]"));
        assert_eq!(capped.chars().count(), 500 + "...[truncated]".chars().count());

        assert_eq!(truncate_chars("short", 500), "short");
    }
}
