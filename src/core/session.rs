use crate::core::events::SessionUpdate;
use crate::core::log::LogBook;
use crate::core::model::{
    ConnectionState, Course, CourseFetchProgress, CourseId, DownloadMode, DownloadSession,
    DownloadStatus, LogEntry, Progress, Severity, User,
};
use std::collections::BTreeSet;
use tokio::sync::broadcast;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("progress {current}/{total} runs past its total")]
pub struct ProgressRejected {
    pub current: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session: DownloadSession,
    pub connection: ConnectionState,
    pub progress: Progress,
    pub course_fetch: CourseFetchProgress,
    pub user: Option<User>,
    pub courses: Vec<Course>,
    pub selection: BTreeSet<CourseId>,
    pub logs: Vec<LogEntry>,
}

/// Single source of truth for everything the UI shows.
///
/// Every mutation goes through one of the entry points below and is
/// announced as a [`SessionUpdate`]. `epoch` moves whenever a download
/// session begins or is reset, so async work started under an older epoch
/// can tell that its result is stale.
pub struct SessionStore {
    session: DownloadSession,
    connection: ConnectionState,
    progress: Progress,
    course_fetch: CourseFetchProgress,
    user: Option<User>,
    courses: Vec<Course>,
    selection: BTreeSet<CourseId>,
    logs: LogBook,
    epoch: u64,
    updates: broadcast::Sender<SessionUpdate>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            session: DownloadSession::default(),
            connection: ConnectionState::default(),
            progress: Progress::default(),
            course_fetch: CourseFetchProgress::default(),
            user: None,
            courses: vec![],
            selection: BTreeSet::new(),
            logs: LogBook::new(),
            epoch: 0,
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.session.clone(),
            connection: self.connection.clone(),
            progress: self.progress.clone(),
            course_fetch: self.course_fetch.clone(),
            user: self.user.clone(),
            courses: self.courses.clone(),
            selection: self.selection.clone(),
            logs: self.logs.entries().to_vec(),
        }
    }

    fn announce(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }

    // ---- download session ----

    pub fn status(&self) -> DownloadStatus {
        self.session.status
    }

    pub fn mode(&self) -> Option<DownloadMode> {
        self.session.mode
    }

    pub fn download_id(&self) -> Option<&str> {
        self.session.download_id.as_deref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn set_status(&mut self, status: DownloadStatus) {
        if self.session.status != status {
            self.session.status = status;
            self.announce(SessionUpdate::StatusChanged(status));
        }
    }

    /// Enters `downloading` under a fresh epoch and returns it.
    pub fn begin_session(&mut self, mode: DownloadMode) -> u64 {
        self.epoch += 1;
        self.session.mode = Some(mode);
        self.session.download_id = None;
        self.reset_progress();
        self.set_status(DownloadStatus::Downloading);
        self.epoch
    }

    pub fn set_download_id(&mut self, download_id: String) {
        self.session.download_id = Some(download_id);
    }

    /// Back to idle with no download id and zeroed progress.
    pub fn reset_session(&mut self) {
        self.epoch += 1;
        self.session.download_id = None;
        self.session.mode = None;
        self.reset_progress();
        self.set_status(DownloadStatus::Idle);
    }

    // ---- progress ----

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn apply_progress(&mut self, progress: Progress) -> Result<(), ProgressRejected> {
        if !progress.is_consistent() {
            let rejected = ProgressRejected { current: progress.current, total: progress.total };
            self.log(&format!("Ignored progress update: {rejected}"), Severity::Warning);
            return Err(rejected);
        }
        self.progress = progress;
        self.announce(SessionUpdate::Progress(self.progress.clone()));
        Ok(())
    }

    fn reset_progress(&mut self) {
        if self.progress != Progress::default() {
            self.progress = Progress::default();
            self.announce(SessionUpdate::Progress(self.progress.clone()));
        }
    }

    pub fn set_course_fetch(&mut self, progress: CourseFetchProgress) {
        self.course_fetch = progress;
        self.announce(SessionUpdate::CourseFetchProgress(self.course_fetch.clone()));
    }

    pub fn reset_course_fetch(&mut self) {
        self.set_course_fetch(CourseFetchProgress::default());
    }

    // ---- courses, selection, user ----

    pub fn courses(&self) -> &[Course] {
        &self.courses
    }

    /// Replaces the course list wholesale; selected ids that vanished are pruned.
    pub fn replace_courses(&mut self, courses: Vec<Course>) {
        let known: BTreeSet<CourseId> = courses.iter().map(|c| c.id).collect();
        let before = self.selection.len();
        self.selection.retain(|id| known.contains(id));
        self.courses = courses;
        self.announce(SessionUpdate::CoursesReplaced { count: self.courses.len() });
        if self.selection.len() != before {
            self.announce(SessionUpdate::SelectionChanged { count: self.selection.len() });
        }
    }

    pub fn selection(&self) -> &BTreeSet<CourseId> {
        &self.selection
    }

    /// Selected courses in course-list order.
    pub fn selected_courses(&self) -> Vec<Course> {
        self.courses.iter().filter(|c| self.selection.contains(&c.id)).cloned().collect()
    }

    /// Returns false for ids that are not in the current course list.
    pub fn select(&mut self, id: CourseId) -> bool {
        if !self.courses.iter().any(|c| c.id == id) {
            return false;
        }
        if self.selection.insert(id) {
            self.announce(SessionUpdate::SelectionChanged { count: self.selection.len() });
        }
        true
    }

    pub fn deselect(&mut self, id: CourseId) {
        if self.selection.remove(&id) {
            self.announce(SessionUpdate::SelectionChanged { count: self.selection.len() });
        }
    }

    pub fn toggle(&mut self, id: CourseId) -> bool {
        if self.selection.contains(&id) {
            self.deselect(id);
            true
        } else {
            self.select(id)
        }
    }

    /// Selects everything, or clears the selection when everything is already selected.
    pub fn toggle_all(&mut self) {
        if !self.courses.is_empty() && self.selection.len() == self.courses.len() {
            self.selection.clear();
        } else {
            self.selection = self.courses.iter().map(|c| c.id).collect();
        }
        self.announce(SessionUpdate::SelectionChanged { count: self.selection.len() });
    }

    pub fn set_user(&mut self, user: User) {
        self.user = Some(user.clone());
        self.announce(SessionUpdate::UserChanged(user));
    }

    // ---- connection ----

    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    pub fn set_connection(&mut self, connection: ConnectionState) {
        if self.connection != connection {
            self.connection = connection;
            self.announce(SessionUpdate::ConnectionChanged(self.connection.clone()));
        }
    }

    // ---- log ----

    pub fn logs(&self) -> &[LogEntry] {
        self.logs.entries()
    }

    pub fn log(&mut self, message: &str, severity: Severity) {
        let entry = self.logs.append(message, severity).clone();
        self.announce(SessionUpdate::Log(entry));
    }

    pub fn ingest_remote_log(&mut self, timestamp: &str, message: &str, severity: Severity) {
        let entry = self.logs.ingest_remote(timestamp, message, severity).clone();
        self.announce(SessionUpdate::Log(entry));
    }

    pub fn clear_logs(&mut self) {
        self.logs.clear();
        self.announce(SessionUpdate::LogCleared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::demo_courses;

    fn progress(current: u64, total: u64) -> Progress {
        Progress { current, total, current_file: format!("f{current}") }
    }

    #[test]
    fn progress_past_total_is_dropped_with_warning() {
        let mut store = SessionStore::new();
        store.apply_progress(progress(1, 3)).unwrap();
        let err = store.apply_progress(progress(4, 3)).unwrap_err();
        assert_eq!(err, ProgressRejected { current: 4, total: 3 });
        assert_eq!(store.progress(), &progress(1, 3));
        let last = store.logs().last().unwrap();
        assert_eq!(last.severity, Severity::Warning);
        assert!(last.message.contains("4/3"));
    }

    #[test]
    fn refetch_prunes_unknown_selection() {
        let mut store = SessionStore::new();
        store.replace_courses(demo_courses());
        assert!(store.select(1));
        assert!(store.select(3));
        assert!(!store.select(99));

        let mut fewer = demo_courses();
        fewer.retain(|c| c.id != 3);
        store.replace_courses(fewer);
        assert_eq!(store.selection().iter().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn selected_courses_follow_list_order() {
        let mut store = SessionStore::new();
        store.replace_courses(demo_courses());
        store.select(3);
        store.select(1);
        let codes: Vec<_> = store.selected_courses().into_iter().map(|c| c.code).collect();
        assert_eq!(codes, vec!["CS101", "CS301"]);
    }

    #[test]
    fn toggle_all_selects_then_clears() {
        let mut store = SessionStore::new();
        store.replace_courses(demo_courses());
        store.select(2);
        store.toggle_all();
        assert_eq!(store.selection().len(), 3);
        store.toggle_all();
        assert!(store.selection().is_empty());
    }

    #[test]
    fn toggle_flips_a_single_course() {
        let mut store = SessionStore::new();
        store.replace_courses(demo_courses());
        assert!(store.toggle(2));
        assert!(store.selection().contains(&2));
        assert!(store.toggle(2));
        assert!(store.selection().is_empty());
        assert!(!store.toggle(42));

        store.select(1);
        store.deselect(1);
        store.deselect(1);
        assert!(store.selection().is_empty());
    }

    #[test]
    fn clearing_the_log_is_announced() {
        let mut store = SessionStore::new();
        store.log("one", Severity::Info);
        store.ingest_remote_log("9:05:01", "two", Severity::Success);
        assert_eq!(store.logs()[1].timestamp, "09:05:01");

        let mut rx = store.subscribe();
        store.clear_logs();
        assert!(store.logs().is_empty());
        assert_eq!(rx.try_recv().unwrap(), SessionUpdate::LogCleared);
    }

    #[test]
    fn reset_zeroes_session_and_moves_epoch() {
        let mut store = SessionStore::new();
        let epoch = store.begin_session(DownloadMode::Real);
        store.set_download_id("d-1".into());
        store.apply_progress(progress(2, 5)).unwrap();
        store.reset_session();
        assert_ne!(store.epoch(), epoch);
        assert_eq!(store.status(), DownloadStatus::Idle);
        assert_eq!(store.download_id(), None);
        assert_eq!(store.progress(), &Progress::default());
    }

    #[test]
    fn mutations_are_announced() {
        let mut store = SessionStore::new();
        let mut rx = store.subscribe();
        store.set_status(DownloadStatus::Loading);
        store.log("hello", Severity::Info);
        assert_eq!(rx.try_recv().unwrap(), SessionUpdate::StatusChanged(DownloadStatus::Loading));
        assert!(matches!(rx.try_recv().unwrap(), SessionUpdate::Log(e) if e.message == "hello"));
    }
}
