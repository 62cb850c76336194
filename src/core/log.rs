use crate::core::model::{LogEntry, Severity};
use chrono::{Local, NaiveTime};
use regex::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;

pub const REDACTED: &str = "[API_KEY_REDACTED]";

const TIME_FORMAT: &str = "%H:%M:%S";

fn hex_run() -> &'static Regex {
    static HEX_RUN: OnceLock<Regex> = OnceLock::new();
    HEX_RUN.get_or_init(|| Regex::new(r"[0-9A-Fa-f]{40,}").expect("static regex"))
}

/// Replaces every run of 40+ hex characters (API token sized) with [`REDACTED`].
pub fn redact(message: &str) -> Cow<'_, str> {
    hex_run().replace_all(message, REDACTED)
}

pub fn local_timestamp() -> String {
    Local::now().format(TIME_FORMAT).to_string()
}

/// Brings a remote "H:M:S" stamp into the local 24-hour format. Anything
/// that does not parse as a time of day is replaced with the local clock.
pub fn normalize_timestamp(raw: &str) -> String {
    let mut parts = raw.trim().splitn(3, ':').map(|p| p.trim().parse::<u32>());
    let parsed = match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(h)), Some(Ok(m)), Some(Ok(s))) => NaiveTime::from_hms_opt(h, m, s),
        _ => None,
    };
    match parsed {
        Some(t) => t.format(TIME_FORMAT).to_string(),
        None => local_timestamp(),
    }
}

/// Append-only log shown to the user.
#[derive(Debug, Default, Clone)]
pub struct LogBook {
    entries: Vec<LogEntry>,
}

impl LogBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, message: &str, severity: Severity) -> &LogEntry {
        self.push(local_timestamp(), message, severity)
    }

    pub fn ingest_remote(&mut self, timestamp: &str, message: &str, severity: Severity) -> &LogEntry {
        self.push(normalize_timestamp(timestamp), message, severity)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    fn push(&mut self, timestamp: String, message: &str, severity: Severity) -> &LogEntry {
        let entry = LogEntry { timestamp, message: redact(message).into_owned(), severity };
        mirror(&entry);
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }
}

fn mirror(entry: &LogEntry) {
    match entry.severity {
        Severity::Info | Severity::Success => {
            tracing::info!(target: "session_log", severity = entry.severity.as_str(), "{}", entry.message)
        }
        Severity::Warning => tracing::warn!(target: "session_log", "{}", entry.message),
        Severity::Error => tracing::error!(target: "session_log", "{}", entry.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_hex_runs_are_redacted() {
        let token = "a".repeat(20) + &"F0".repeat(10);
        let msg = format!("auth with {token} failed");
        assert_eq!(redact(&msg), format!("auth with {REDACTED} failed"));
    }

    #[test]
    fn short_hex_runs_survive() {
        let msg = "commit 3f2a9c0d1e and id deadbeefdeadbeefdeadbeefdeadbeefdeadbee";
        assert_eq!(redact(msg), msg);
    }

    #[test]
    fn remote_timestamps_use_local_format() {
        assert_eq!(normalize_timestamp("13:05:09"), "13:05:09");
        assert_eq!(normalize_timestamp("7:5:9"), "07:05:09");
        let local = local_timestamp();
        assert_eq!(normalize_timestamp("13:05:09").len(), local.len());
    }

    #[test]
    fn garbage_timestamps_fall_back_to_local_clock() {
        let stamp = normalize_timestamp("yesterday");
        assert!(NaiveTime::parse_from_str(&stamp, TIME_FORMAT).is_ok());
        let stamp = normalize_timestamp("25:00:00");
        assert!(NaiveTime::parse_from_str(&stamp, TIME_FORMAT).is_ok());
    }

    #[test]
    fn book_redacts_before_storing_and_clears() {
        let mut book = LogBook::new();
        let key = "0123456789abcdef".repeat(3);
        book.append(&format!("key={key}"), Severity::Info);
        book.ingest_remote("1:02:03", "remote line", Severity::Warning);
        assert_eq!(book.entries().len(), 2);
        assert_eq!(book.entries()[0].message, format!("key={REDACTED}"));
        assert_eq!(book.entries()[1].timestamp, "01:02:03");
        book.clear();
        assert!(book.entries().is_empty());
    }
}
