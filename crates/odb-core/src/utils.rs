use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use chrono::{Local, Utc};
use regex::Regex;
use serde::Serialize;

use crate::{domain::UserId, errors::Error, Result};

// ============== Timestamp Helpers ==============

/// RFC3339 timestamp in UTC (for logs/telemetry).
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

/// Local wall-clock timestamp shown in operator notices.
pub fn local_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

// ============== Text Helpers ==============

/// Cut `s` to `max_len` characters, appending `...` when something was cut.
pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

/// Split `s` into consecutive chunks of exactly `max_chars` characters (last one shorter).
///
/// Counting is per `char`, so multi-byte text is never cut inside a code point.
pub fn split_chunks(s: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut cur_chars = 0usize;

    for ch in s.chars() {
        if cur_chars == max_chars {
            out.push(std::mem::take(&mut cur));
            cur_chars = 0;
        }
        cur.push(ch);
        cur_chars += 1;
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

fn url_regex() -> &'static Regex {
    static URL_RE: OnceLock<Regex> = OnceLock::new();
    URL_RE.get_or_init(|| Regex::new(r"https?://\S+").expect("static URL regex"))
}

/// First scheme-prefixed token in `text`.
pub fn first_url(text: &str) -> Option<&str> {
    url_regex().find(text).map(|m| m.as_str())
}

/// Remove every mention token addressing the bot and trim the rest.
pub fn strip_mentions(text: &str, mentions: &[String]) -> String {
    let mut out = text.to_string();
    for m in mentions {
        if !m.is_empty() {
            out = out.replace(m.as_str(), "");
        }
    }
    out.trim().to_string()
}

// ============== Audit Logging ==============

const AUDIT_MAX_TEXT: usize = 500;

/// One moderation/inference event in the audit log.
#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    fn base(event: &str, user_id: UserId, username: &str, group_id: Option<u64>) -> Self {
        Self {
            timestamp: iso_timestamp_utc(),
            event: event.to_string(),
            user_id: Some(user_id.0),
            username: Some(username.to_string()),
            group_id,
            content: None,
            response: None,
            violation_count: None,
            action: None,
            error: None,
        }
    }

    pub fn deleted(user_id: UserId, username: &str, group_id: Option<u64>, content: &str) -> Self {
        Self {
            content: Some(content.to_string()),
            ..Self::base("delete", user_id, username, group_id)
        }
    }

    pub fn violation(user_id: UserId, username: &str, group_id: u64, count: usize) -> Self {
        Self {
            violation_count: Some(count),
            ..Self::base("violation", user_id, username, Some(group_id))
        }
    }

    pub fn sanction(
        user_id: UserId,
        username: &str,
        group_id: Option<u64>,
        count: usize,
        action: &str,
        error: Option<&str>,
    ) -> Self {
        Self {
            violation_count: Some(count),
            action: Some(action.to_string()),
            error: error.map(|s| s.to_string()),
            ..Self::base("sanction", user_id, username, group_id)
        }
    }

    pub fn inference(user_id: UserId, username: &str, prompt: &str, response: &str) -> Self {
        Self {
            content: Some(prompt.to_string()),
            response: Some(response.to_string()),
            ..Self::base("inference", user_id, username, None)
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuditLogger {
    path: PathBuf,
    json: bool,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            path: path.into(),
            json,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, mut event: AuditEvent) -> Result<()> {
        if let Some(s) = &event.content {
            event.content = Some(truncate_text(s, AUDIT_MAX_TEXT));
        }
        if let Some(s) = &event.response {
            event.response = Some(truncate_text(s, AUDIT_MAX_TEXT));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if self.json {
            let line = serde_json::to_string(&event)?;
            writeln!(file, "{line}")?;
            return Ok(());
        }

        // Plain text format for readability.
        let mut out = String::new();
        out.push('\n');
        out.push_str(&"=".repeat(60));

        let value = serde_json::to_value(&event)?;
        let Some(obj) = value.as_object() else {
            return Err(Error::External(
                "audit event is not a JSON object".to_string(),
            ));
        };
        for (k, v) in obj {
            out.push('\n');
            out.push_str(k);
            out.push_str(": ");
            match v {
                serde_json::Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
        }
        out.push('\n');

        file.write_all(out.as_bytes())?;
        Ok(())
    }
}
