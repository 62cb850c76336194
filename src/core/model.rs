use serde::{Deserialize, Serialize};

pub type CourseId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub name: String,
}

impl Default for Term {
    fn default() -> Self {
        Self { name: "Unknown Term".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    #[serde(default = "default_course_name")]
    pub name: String,
    #[serde(rename = "course_code", default = "default_course_code")]
    pub code: String,
    #[serde(default, deserialize_with = "term_or_default")]
    pub term: Term,
    #[serde(default)]
    pub file_count: u64,
    #[serde(default)]
    pub folder_count: u64,
}

fn default_course_name() -> String {
    "Unnamed Course".to_string()
}

fn default_course_code() -> String {
    "No Code".to_string()
}

// The backend sends `term: null` for courses outside any term.
fn term_or_default<'de, D>(deserializer: D) -> Result<Term, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Term>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: i64,
    #[serde(default = "default_user_name")]
    pub name: String,
}

fn default_user_name() -> String {
    "Unknown User".to_string()
}

/// Download progress counters. `current` never exceeds `total` once stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    #[serde(rename = "currentFile", alias = "current_file", default)]
    pub current_file: String,
}

impl Progress {
    pub fn is_consistent(&self) -> bool {
        self.current <= self.total
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseFetchProgress {
    #[serde(default)]
    pub current: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default, alias = "courseName")]
    pub course_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadStatus {
    #[default]
    Idle,
    Loading,
    Downloading,
    Completed,
    Error,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    Real,
    Simulated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSession {
    pub status: DownloadStatus,
    pub download_id: Option<String>,
    pub mode: Option<DownloadMode>,
}

/// Transport and backend reachability, as one variant so that "reachable
/// but no channel" cannot be expressed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    ChannelOnly { channel_id: String },
    ReadyReal { channel_id: String },
}

impl ConnectionState {
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            Self::Disconnected => None,
            Self::ChannelOnly { channel_id } | Self::ReadyReal { channel_id } => Some(channel_id),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::ReadyReal { .. })
    }

    /// Backend acknowledged us. Without an open channel there is nothing to promote.
    pub fn promoted(&self) -> Self {
        match self {
            Self::ChannelOnly { channel_id } => Self::ReadyReal { channel_id: channel_id.clone() },
            other => other.clone(),
        }
    }

    pub fn demoted(&self) -> Self {
        match self {
            Self::ReadyReal { channel_id } => Self::ChannelOnly { channel_id: channel_id.clone() },
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    /// Unknown wire values fall back to `Info`.
    pub fn from_wire(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "success" => Self::Success,
            "warning" | "warn" => Self::Warning,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: String,
    pub message: String,
    pub severity: Severity,
}

/// Course list shown whenever the backend cannot provide the real one.
pub fn demo_courses() -> Vec<Course> {
    let course = |id, name: &str, code: &str, file_count, folder_count| Course {
        id,
        name: name.to_string(),
        code: code.to_string(),
        term: Term { name: "Fall 2024".to_string() },
        file_count,
        folder_count,
    };
    vec![
        course(1, "Computer Science 101", "CS101", 45, 8),
        course(2, "Data Structures and Algorithms", "CS201", 32, 6),
        course(3, "Database Systems", "CS301", 28, 5),
    ]
}
