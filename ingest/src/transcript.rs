use crate::config::EngramConfig;
use crate::parse::{parse_timestamp_value, text_segments, truncate_chars};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use engram_types::RoleType;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Content prefixes marking automated, non-conversational turns. Messages
/// whose content starts with one of these never reach the sink.
const SYNTHETIC_PREFIXES: [&str; 4] = [
    "<command-name>",
    "<command-message>",
    "<local-command-stdout>",
    "[Request interrupted",
];

/// One transcript line, classified. Anything that is neither session metadata
/// nor a message (including malformed JSON) is `Unrecognized` and dropped
/// without aborting the stream.
#[derive(Debug, Clone)]
pub enum ParsedRecord {
    SessionMeta {
        id: String,
        timestamp: Option<DateTime<Utc>>,
        workdir: Option<String>,
    },
    Message {
        role: String,
        content: String,
        timestamp: Option<DateTime<Utc>>,
    },
    /// A well-formed message whose content carries no text segments (tool
    /// invocations, attachments). Dropped, but not counted as malformed.
    NonText,
    Unrecognized,
}

/// Session metadata resolved from a transcript's header record.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub workdir: Option<String>,
}

/// A message that passed the inclusion filter, ready for batching.
#[derive(Debug, Clone)]
pub struct ExtractedMessage {
    pub role_type: RoleType,
    pub display_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub group_key: String,
}

/// At most one of `cursor` (capture mode) or `cutoff` (backfill `--since`)
/// is set; records at or before the cursor are skipped, and a session dated
/// before the cutoff skips the whole file.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadFilter {
    pub cursor: Option<DateTime<Utc>>,
    pub cutoff: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct Transcript {
    pub session: Option<SessionInfo>,
    pub group_key: String,
    pub messages: Vec<ExtractedMessage>,
    pub malformed_lines: usize,
    /// Set when the session timestamp predates the backfill cutoff; the file
    /// carries no messages in that case.
    pub before_cutoff: bool,
}

pub fn parse_record(raw: &str) -> ParsedRecord {
    let Ok(json) = serde_json::from_str::<Value>(raw) else {
        return ParsedRecord::Unrecognized;
    };

    let record_type = json.get("type").and_then(Value::as_str);
    if record_type == Some("session") {
        let Some(id) = json
            .get("sessionId")
            .or_else(|| json.get("id"))
            .and_then(Value::as_str)
        else {
            return ParsedRecord::Unrecognized;
        };
        return ParsedRecord::SessionMeta {
            id: id.to_string(),
            timestamp: json.get("timestamp").and_then(parse_timestamp_value),
            workdir: json
                .get("cwd")
                .or_else(|| json.get("workdir"))
                .and_then(Value::as_str)
                .map(String::from),
        };
    }

    let role = record_type
        .or_else(|| json.get("role").and_then(Value::as_str))
        .or_else(|| json.pointer("/message/role").and_then(Value::as_str));
    let Some(role) = role else {
        return ParsedRecord::Unrecognized;
    };

    let content = json
        .get("content")
        .or_else(|| json.pointer("/message/content"))
        .and_then(text_segments);
    let Some(content) = content else {
        return ParsedRecord::NonText;
    };

    ParsedRecord::Message {
        role: role.to_string(),
        content,
        timestamp: json
            .get("timestamp")
            .or_else(|| json.get("createdAt"))
            .and_then(parse_timestamp_value),
    }
}

/// Stream one transcript file and extract its qualifying messages. Line read
/// errors and unrecognized lines are counted and dropped; re-reading the same
/// file with the same filter always yields the same message list.
pub fn read_transcript(
    path: &Path,
    file_name: &str,
    filter: &ReadFilter,
    config: &EngramConfig,
) -> Result<Transcript> {
    let file =
        File::open(path).with_context(|| format!("open transcript {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut session: Option<SessionInfo> = None;
    let mut raw_messages: Vec<(RoleType, String, Option<DateTime<Utc>>)> = Vec::new();
    let mut malformed = 0usize;

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => {
                malformed += 1;
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_record(&line) {
            ParsedRecord::SessionMeta {
                id,
                timestamp,
                workdir,
            } => {
                if session.is_none() {
                    if let (Some(cutoff), Some(ts)) = (filter.cutoff, timestamp) {
                        if ts < cutoff {
                            return Ok(Transcript {
                                session: Some(SessionInfo {
                                    id,
                                    timestamp,
                                    workdir,
                                }),
                                group_key: group_key(timestamp, file_name),
                                messages: Vec::new(),
                                malformed_lines: malformed,
                                before_cutoff: true,
                            });
                        }
                    }
                    session = Some(SessionInfo {
                        id,
                        timestamp,
                        workdir,
                    });
                }
            }
            ParsedRecord::Message {
                role,
                content,
                timestamp,
            } => {
                let Some(role_type) = qualify_role(&role) else {
                    continue;
                };
                if !qualifies_content(&content, config.min_content_chars) {
                    continue;
                }
                raw_messages.push((role_type, content, timestamp));
            }
            ParsedRecord::NonText => {}
            ParsedRecord::Unrecognized => {
                malformed += 1;
            }
        }
    }

    let session_ts = session.as_ref().and_then(|s| s.timestamp);
    let group = group_key(session_ts, file_name);

    let mut messages = Vec::new();
    for (role_type, content, timestamp) in raw_messages {
        // A message without its own timestamp inherits the session reference
        // timestamp; with neither it cannot be ordered and is dropped.
        let Some(timestamp) = timestamp.or(session_ts) else {
            malformed += 1;
            continue;
        };
        if let Some(cursor) = filter.cursor {
            if timestamp <= cursor {
                continue;
            }
        }
        let display_name = match role_type {
            RoleType::User => config.user_display_name.clone(),
            RoleType::Assistant => config.agent_display_name.clone(),
        };
        messages.push(ExtractedMessage {
            role_type,
            display_name,
            content: truncate_chars(&content, config.max_content_chars),
            timestamp,
            group_key: group.clone(),
        });
    }

    Ok(Transcript {
        session,
        group_key: group,
        messages,
        malformed_lines: malformed,
        before_cutoff: false,
    })
}

/// Logical bucket a file's messages are stored under downstream: the session
/// day when known, otherwise the file stem. Stable across runs by design.
pub fn group_key(session_ts: Option<DateTime<Utc>>, file_name: &str) -> String {
    match session_ts {
        Some(ts) => format!("chat-{}", ts.format("%Y-%m-%d")),
        None => {
            let stem = file_name.strip_suffix(".jsonl").unwrap_or(file_name);
            format!("chat-{stem}")
        }
    }
}

fn qualify_role(role: &str) -> Option<RoleType> {
    match role {
        "user" => Some(RoleType::User),
        "assistant" => Some(RoleType::Assistant),
        _ => None,
    }
}

fn qualifies_content(content: &str, min_chars: usize) -> bool {
    let trimmed = content.trim();
    if trimmed.chars().count() <= min_chars {
        return false;
    }
    !SYNTHETIC_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn test_config() -> EngramConfig {
        EngramConfig {
            archive_dirs: vec![],
            state_path: std::path::PathBuf::from("/tmp/state.json"),
            sink_url: String::new(),
            batch_size: 5,
            rate_limit_ms: 0,
            rate_limit_ceiling_ms: 0,
            request_timeout_secs: 1,
            max_attempts: 5,
            min_messages: 2,
            min_content_chars: 10,
            max_content_chars: 2_000,
            progress_interval: 25,
            user_display_name: "User".to_string(),
            agent_display_name: "Assistant".to_string(),
        }
    }

    fn write_transcript(lines: &[&str]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("session-1.jsonl");
        let mut file = File::create(&path).expect("create");
        for line in lines {
            writeln!(file, "{line}").expect("write");
        }
        (dir, path)
    }

    #[test]
    fn extracts_messages_under_one_group_key() {
        let (_dir, path) = write_transcript(&[
            r#"{"type":"session","sessionId":"s-1","timestamp":"2026-02-01T09:00:00Z","cwd":"/work/app"}"#,
            r#"{"type":"user","message":{"role":"user","content":"please wire up the retry loop"},"timestamp":"2026-02-01T09:01:00Z"}"#,
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"retry loop added with a bounded budget"}]},"timestamp":"2026-02-01T09:02:00Z"}"#,
        ]);

        let transcript = read_transcript(
            &path,
            "session-1.jsonl",
            &ReadFilter::default(),
            &test_config(),
        )
        .expect("read");

        assert_eq!(transcript.messages.len(), 2);
        assert_eq!(transcript.group_key, "chat-2026-02-01");
        assert!(transcript
            .messages
            .iter()
            .all(|m| m.group_key == "chat-2026-02-01"));
        assert_eq!(transcript.messages[0].role_type, RoleType::User);
        assert_eq!(transcript.messages[1].role_type, RoleType::Assistant);
        let session = transcript.session.expect("session");
        assert_eq!(session.id, "s-1");
        assert_eq!(session.workdir.as_deref(), Some("/work/app"));
    }

    #[test]
    fn malformed_lines_never_abort_the_stream() {
        let (_dir, path) = write_transcript(&[
            r#"{"type":"session","sessionId":"s-2","timestamp":"2026-02-01T09:00:00Z"}"#,
            r#"{"broken json"#,
            r#"{"type":"user","content":"still extracted after the bad line","timestamp":"2026-02-01T09:01:00Z"}"#,
        ]);

        let transcript = read_transcript(
            &path,
            "session-1.jsonl",
            &ReadFilter::default(),
            &test_config(),
        )
        .expect("read");
        assert_eq!(transcript.messages.len(), 1);
        assert_eq!(transcript.malformed_lines, 1);
    }

    #[test]
    fn tool_only_messages_do_not_count_as_malformed() {
        let (_dir, path) = write_transcript(&[
            r#"{"type":"session","sessionId":"s-7","timestamp":"2026-02-01T09:00:00Z"}"#,
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","name":"bash","input":{"command":"ls"}}]},"timestamp":"2026-02-01T09:01:00Z"}"#,
            r#"{"type":"assistant","content":"the listing shows three entries","timestamp":"2026-02-01T09:02:00Z"}"#,
        ]);

        let transcript = read_transcript(
            &path,
            "session-1.jsonl",
            &ReadFilter::default(),
            &test_config(),
        )
        .expect("read");
        assert_eq!(transcript.messages.len(), 1);
        assert_eq!(transcript.malformed_lines, 0);
    }

    #[test]
    fn synthetic_marker_content_is_excluded() {
        let (_dir, path) = write_transcript(&[
            r#"{"type":"session","sessionId":"s-3","timestamp":"2026-02-01T09:00:00Z"}"#,
            r#"{"type":"user","content":"<command-name>/clear</command-name>","timestamp":"2026-02-01T09:01:00Z"}"#,
            r#"{"type":"user","content":"a genuine question about borrowing","timestamp":"2026-02-01T09:02:00Z"}"#,
        ]);

        let transcript = read_transcript(
            &path,
            "session-1.jsonl",
            &ReadFilter::default(),
            &test_config(),
        )
        .expect("read");
        assert_eq!(transcript.messages.len(), 1);
        assert!(transcript.messages[0].content.contains("borrowing"));
    }

    #[test]
    fn system_and_tool_roles_are_excluded() {
        let (_dir, path) = write_transcript(&[
            r#"{"type":"system","content":"session compacted automatically","timestamp":"2026-02-01T09:00:30Z"}"#,
            r#"{"type":"tool","content":"exit code 0 after running tests","timestamp":"2026-02-01T09:00:40Z"}"#,
            r#"{"type":"assistant","content":"the tests pass locally now","timestamp":"2026-02-01T09:01:00Z"}"#,
        ]);

        let transcript = read_transcript(
            &path,
            "session-1.jsonl",
            &ReadFilter::default(),
            &test_config(),
        )
        .expect("read");
        assert_eq!(transcript.messages.len(), 1);
        assert_eq!(transcript.messages[0].role_type, RoleType::Assistant);
    }

    #[test]
    fn cursor_skips_records_at_or_before_it() {
        let cursor = "2026-02-01T09:01:00Z".parse().unwrap();
        let (_dir, path) = write_transcript(&[
            r#"{"type":"session","sessionId":"s-4","timestamp":"2026-02-01T09:00:00Z"}"#,
            r#"{"type":"user","content":"already ingested on a prior run","timestamp":"2026-02-01T09:01:00Z"}"#,
            r#"{"type":"assistant","content":"this one is new since the cursor","timestamp":"2026-02-01T09:03:00Z"}"#,
        ]);

        let transcript = read_transcript(
            &path,
            "session-1.jsonl",
            &ReadFilter {
                cursor: Some(cursor),
                cutoff: None,
            },
            &test_config(),
        )
        .expect("read");
        assert_eq!(transcript.messages.len(), 1);
        assert!(transcript.messages[0].timestamp > cursor);
    }

    #[test]
    fn cutoff_skips_whole_file_without_message_filtering() {
        let cutoff = "2026-03-01T00:00:00Z".parse().unwrap();
        let (_dir, path) = write_transcript(&[
            r#"{"type":"session","sessionId":"s-5","timestamp":"2026-02-01T09:00:00Z"}"#,
            r#"{"type":"user","content":"would otherwise qualify easily","timestamp":"2026-02-01T09:01:00Z"}"#,
        ]);

        let transcript = read_transcript(
            &path,
            "session-1.jsonl",
            &ReadFilter {
                cursor: None,
                cutoff: Some(cutoff),
            },
            &test_config(),
        )
        .expect("read");
        assert!(transcript.before_cutoff);
        assert!(transcript.messages.is_empty());
    }

    #[test]
    fn group_key_falls_back_to_file_stem() {
        assert_eq!(
            group_key(None, "session-abc.jsonl"),
            "chat-session-abc"
        );
    }

    #[test]
    fn short_content_is_excluded_and_long_content_is_capped() {
        let mut config = test_config();
        config.max_content_chars = 20;
        let (_dir, path) = write_transcript(&[
            r#"{"type":"session","sessionId":"s-6","timestamp":"2026-02-01T09:00:00Z"}"#,
            r#"{"type":"user","content":"hi","timestamp":"2026-02-01T09:01:00Z"}"#,
            r#"{"type":"user","content":"a deliberately long message that gets capped","timestamp":"2026-02-01T09:02:00Z"}"#,
        ]);

        let transcript =
            read_transcript(&path, "session-1.jsonl", &ReadFilter::default(), &config)
                .expect("read");
        assert_eq!(transcript.messages.len(), 1);
        assert!(transcript.messages[0].content.ends_with("...[truncated]"));
        assert!(!transcript.messages[0].content.trim().is_empty());
    }
}
