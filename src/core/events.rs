use crate::core::model::{
    ConnectionState, CourseFetchProgress, DownloadStatus, LogEntry, Progress, Severity, User,
};

/// Typed events produced by the connection channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    ConnectionEstablished { channel_id: String, transport: &'static str },
    ConnectionLost { reason: String },
    ConnectionFailed { error: String },
    Welcome { status: String },
    EchoTestResult { status: String, message: String },
    Progress(Progress),
    DownloadStatus { status: String },
    Log { timestamp: String, message: String, severity: Severity },
    UserAuthenticated(User),
    CourseFetchProgress(CourseFetchProgress),
    ChannelError { message: String },
}

impl ChannelEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection-established",
            Self::ConnectionLost { .. } => "connection-lost",
            Self::ConnectionFailed { .. } => "connection-failed",
            Self::Welcome { .. } => "welcome",
            Self::EchoTestResult { .. } => "echo-test-result",
            Self::Progress(_) => "progress",
            Self::DownloadStatus { .. } => "download-status",
            Self::Log { .. } => "log",
            Self::UserAuthenticated(_) => "user-authenticated",
            Self::CourseFetchProgress(_) => "course-fetch-progress",
            Self::ChannelError { .. } => "channel-error",
        }
    }
}

/// Store mutations announced to renderers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    StatusChanged(DownloadStatus),
    Progress(Progress),
    CourseFetchProgress(CourseFetchProgress),
    Log(LogEntry),
    LogCleared,
    CoursesReplaced { count: usize },
    SelectionChanged { count: usize },
    UserChanged(User),
    ConnectionChanged(ConnectionState),
}
