use crate::core::config::Credentials;
use crate::core::events::ChannelEvent;
use crate::core::model::*;
use crate::core::session::{SessionSnapshot, SessionStore};
use crate::core::simulator::{SimulatedEngine, SimulationConfig, SimulationOutcome, SimulationSink};
use crate::plugins::registry::{ApiError, BackendApi, CoursesRequest, StartDownloadRequest};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What a channel event does to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Ignore,
    Connection { state: ConnectionState, log: (String, Severity) },
    Progress(Progress),
    CourseFetch(CourseFetchProgress),
    RemoteStatus(String),
    User(User),
    RemoteLog { timestamp: String, message: String, severity: Severity },
    Log(String, Severity),
}

/// Event → transition table. Progress only counts for a real download in
/// flight and fetch progress only while courses are loading; anything else
/// is stale.
pub fn reduce(
    status: DownloadStatus,
    mode: Option<DownloadMode>,
    connection: &ConnectionState,
    event: &ChannelEvent,
) -> Transition {
    match event {
        ChannelEvent::ConnectionEstablished { channel_id, transport } => Transition::Connection {
            state: ConnectionState::ChannelOnly { channel_id: channel_id.clone() },
            log: (format!("Connected to backend server via {transport}"), Severity::Info),
        },
        ChannelEvent::ConnectionLost { reason } => Transition::Connection {
            state: ConnectionState::Disconnected,
            log: (format!("Disconnected from server: {reason}"), Severity::Warning),
        },
        ChannelEvent::ConnectionFailed { error } => Transition::Connection {
            state: ConnectionState::Disconnected,
            log: (format!("Connection failed: {error}"), Severity::Error),
        },
        ChannelEvent::Welcome { status: server_status } => {
            let msg = if server_status.trim().is_empty() {
                "Connected to server".to_string()
            } else {
                server_status.clone()
            };
            Transition::Connection { state: connection.promoted(), log: (msg, Severity::Info) }
        }
        ChannelEvent::EchoTestResult { .. } => Transition::Connection {
            state: connection.promoted(),
            log: ("Connection test successful!".to_string(), Severity::Info),
        },
        ChannelEvent::Progress(p) => {
            if status == DownloadStatus::Downloading && mode == Some(DownloadMode::Real) {
                Transition::Progress(p.clone())
            } else {
                Transition::Ignore
            }
        }
        ChannelEvent::DownloadStatus { status: remote } => {
            if status == DownloadStatus::Downloading && mode == Some(DownloadMode::Real) {
                Transition::RemoteStatus(remote.clone())
            } else {
                Transition::Ignore
            }
        }
        ChannelEvent::CourseFetchProgress(p) => {
            if status == DownloadStatus::Loading {
                Transition::CourseFetch(p.clone())
            } else {
                Transition::Ignore
            }
        }
        ChannelEvent::UserAuthenticated(user) => Transition::User(user.clone()),
        ChannelEvent::Log { timestamp, message, severity } => Transition::RemoteLog {
            timestamp: timestamp.clone(),
            message: message.clone(),
            severity: *severity,
        },
        ChannelEvent::ChannelError { message } => {
            Transition::Log(format!("Channel error: {message}"), Severity::Error)
        }
    }
}

fn apply(store: &mut SessionStore, transition: Transition) {
    match transition {
        Transition::Ignore => {}
        Transition::Connection { state, log: (message, severity) } => {
            store.set_connection(state);
            store.log(&message, severity);
        }
        Transition::Progress(p) => {
            // rejected updates are logged by the store
            let _ = store.apply_progress(p);
        }
        Transition::CourseFetch(p) => store.set_course_fetch(p),
        Transition::RemoteStatus(status) => apply_remote_status(store, &status),
        Transition::User(user) => {
            let msg = format!("Authenticated as {}", user.name);
            store.set_user(user);
            store.log(&msg, Severity::Info);
        }
        Transition::RemoteLog { timestamp, message, severity } => {
            store.ingest_remote_log(&timestamp, &message, severity)
        }
        Transition::Log(message, severity) => store.log(&message, severity),
    }
}

/// Folds the backend's own status word into the session. Intermediate
/// states (connecting, calculating, ...) leave the session downloading.
fn apply_remote_status(store: &mut SessionStore, status: &str) {
    match status {
        "completed" => {
            store.set_status(DownloadStatus::Completed);
            store.log("Download completed", Severity::Success);
        }
        "error" => {
            store.set_status(DownloadStatus::Error);
            store.log("The backend reported a failed download", Severity::Error);
        }
        "stopped" => {
            store.reset_session();
            store.log("Download stopped by the backend", Severity::Warning);
        }
        _ => {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Credentials incomplete; nothing happened.
    Skipped,
    /// Another operation owns the session.
    Busy,
    /// Backend unreachable; demo courses are shown.
    Demo,
    Remote { count: usize },
    /// Backend refused; demo courses are shown and status is `error`.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Rejected,
    Started(DownloadMode),
    Failed,
    /// A stop arrived while the start request was in flight.
    Superseded,
}

struct ActiveSimulation {
    stop: CancellationToken,
    handle: JoinHandle<SimulationOutcome>,
}

/// Routes simulated events into the store for one session epoch only.
struct SessionSink {
    store: Arc<Mutex<SessionStore>>,
    epoch: u64,
}

#[async_trait]
impl SimulationSink for SessionSink {
    async fn progress(&self, progress: Progress) {
        let mut s = self.store.lock().await;
        if s.epoch() == self.epoch && s.status() == DownloadStatus::Downloading {
            let _ = s.apply_progress(progress);
        }
    }

    async fn log(&self, message: String, severity: Severity) {
        let mut s = self.store.lock().await;
        if s.epoch() == self.epoch {
            s.log(&message, severity);
        }
    }

    async fn complete(&self) {
        let mut s = self.store.lock().await;
        if s.epoch() == self.epoch && s.status() == DownloadStatus::Downloading {
            s.set_status(DownloadStatus::Completed);
        }
    }
}

/// Owns the download session: picks real or simulated mode, talks to the
/// backend and folds channel events into the [`SessionStore`].
///
/// Lock order is `simulation` before `store`; the store lock is never held
/// across a backend call.
#[derive(Clone)]
pub struct Orchestrator {
    backend: Arc<dyn BackendApi>,
    store: Arc<Mutex<SessionStore>>,
    credentials: Credentials,
    simulation_config: SimulationConfig,
    simulation: Arc<Mutex<Option<ActiveSimulation>>>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn BackendApi>,
        credentials: Credentials,
        simulation_config: SimulationConfig,
    ) -> Self {
        Self {
            backend,
            store: Arc::new(Mutex::new(SessionStore::new())),
            credentials,
            simulation_config,
            simulation: Arc::new(Mutex::new(None)),
        }
    }

    pub fn store(&self) -> Arc<Mutex<SessionStore>> {
        self.store.clone()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.store.lock().await.snapshot()
    }

    pub async fn handle_event(&self, event: &ChannelEvent) {
        let mut s = self.store.lock().await;
        let transition = reduce(s.status(), s.mode(), s.connection(), event);
        tracing::debug!(event = event.name(), ?transition, "channel event");
        apply(&mut s, transition);
    }

    /// Feeds every event from `events` through [`handle_event`](Self::handle_event)
    /// until the sender side goes away.
    pub fn attach(&self, mut events: broadcast::Receiver<ChannelEvent>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ev) => this.handle_event(&ev).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "channel events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn fetch_courses(&self) -> FetchOutcome {
        if !self.credentials.is_complete() {
            tracing::debug!("course fetch skipped, credentials incomplete");
            return FetchOutcome::Skipped;
        }

        {
            let mut s = self.store.lock().await;
            match s.status() {
                DownloadStatus::Downloading => {
                    s.log("Stop the running download before refreshing courses", Severity::Warning);
                    return FetchOutcome::Busy;
                }
                DownloadStatus::Loading => return FetchOutcome::Busy,
                _ => {}
            }
            s.set_status(DownloadStatus::Loading);
            s.reset_course_fetch();
            s.log("Fetching courses from the course API...", Severity::Info);
        }

        if let Err(e) = self.backend.health().await {
            tracing::debug!(error = %e, "health probe failed");
            let mut s = self.store.lock().await;
            let demoted = s.connection().demoted();
            s.set_connection(demoted);
            s.log("Backend server not available - using demo mode", Severity::Warning);
            s.replace_courses(demo_courses());
            s.log("Using demo data - start the backend for real functionality", Severity::Warning);
            if s.status() == DownloadStatus::Loading {
                s.set_status(DownloadStatus::Idle);
            }
            return FetchOutcome::Demo;
        }

        let channel_id = {
            let mut s = self.store.lock().await;
            let promoted = s.connection().promoted();
            s.set_connection(promoted);
            s.log("Backend server is running", Severity::Success);
            s.connection().channel_id().map(str::to_string)
        };

        let result = self.backend.courses(&CoursesRequest::new(&self.credentials, channel_id)).await;
        let mut s = self.store.lock().await;
        match result {
            Ok(resp) => {
                let count = resp.courses.len();
                s.log(&format!("Found {} courses for {}", count, resp.user.name), Severity::Success);
                s.replace_courses(resp.courses);
                s.set_user(resp.user);
                if s.status() == DownloadStatus::Loading {
                    s.set_status(DownloadStatus::Idle);
                }
                FetchOutcome::Remote { count }
            }
            Err(e) => {
                s.log(&format!("Failed to fetch courses: {e}"), Severity::Error);
                s.replace_courses(demo_courses());
                s.log("Using demo data - check your API credentials", Severity::Warning);
                if s.status() == DownloadStatus::Loading {
                    s.set_status(DownloadStatus::Error);
                }
                FetchOutcome::Failed
            }
        }
    }

    pub async fn start_download(&self) -> StartOutcome {
        let mut simulation = self.simulation.lock().await;

        let (selected, mode, epoch, channel_id) = {
            let mut s = self.store.lock().await;
            let selected = s.selected_courses();
            if selected.is_empty() {
                s.log("No courses selected for download", Severity::Error);
                return StartOutcome::Rejected;
            }
            match s.status() {
                DownloadStatus::Downloading => {
                    s.log("A download is already running", Severity::Warning);
                    return StartOutcome::Rejected;
                }
                DownloadStatus::Loading => {
                    s.log("Courses are still loading", Severity::Warning);
                    return StartOutcome::Rejected;
                }
                _ => {}
            }

            let mode = if s.connection().is_ready() { DownloadMode::Real } else { DownloadMode::Simulated };
            let epoch = s.begin_session(mode);
            match mode {
                DownloadMode::Real => {
                    s.log(&format!("Starting download of {} courses", selected.len()), Severity::Info)
                }
                DownloadMode::Simulated => {
                    s.log("Not connected to server - starting demo mode", Severity::Warning)
                }
            }
            (selected, mode, epoch, s.connection().channel_id().map(str::to_string))
        };
        tracing::info!(?mode, courses = selected.len(), "download session started");

        if mode == DownloadMode::Simulated {
            if let Some(old) = simulation.take() {
                old.stop.cancel();
            }
            let stop = CancellationToken::new();
            let token = stop.clone();
            let sink = SessionSink { store: self.store.clone(), epoch };
            let mut engine = SimulatedEngine::new(self.simulation_config.clone());
            let handle = tokio::spawn(async move { engine.run(&selected, &sink, &token).await });
            *simulation = Some(ActiveSimulation { stop, handle });
            return StartOutcome::Started(DownloadMode::Simulated);
        }

        // a stop must be able to run while the start request is in flight
        drop(simulation);

        let ids = selected.iter().map(|c| c.id).collect();
        let req = StartDownloadRequest::new(&self.credentials, ids, channel_id);
        let result = self.backend.start_download(&req).await;

        let mut s = self.store.lock().await;
        if s.epoch() != epoch {
            drop(s);
            if let Ok(resp) = result {
                tracing::info!(download_id = %resp.download_id, "start answered after stop, cancelling it");
                if let Err(e) = self.backend.stop_download(&resp.download_id).await {
                    tracing::warn!(download_id = %resp.download_id, error = %e, "late stop failed");
                }
            }
            return StartOutcome::Superseded;
        }

        match result {
            Ok(resp) => {
                s.set_download_id(resp.download_id);
                s.log("Real download started successfully!", Severity::Success);
                StartOutcome::Started(DownloadMode::Real)
            }
            Err(e) => {
                s.log(&format!("Failed to start download: {e}"), Severity::Error);
                s.set_status(DownloadStatus::Error);
                StartOutcome::Failed
            }
        }
    }

    /// Ends the session whatever state it is in. Always leaves idle, no
    /// download id and zeroed progress.
    pub async fn stop_download(&self) {
        let mut simulation = self.simulation.lock().await;
        if let Some(active) = simulation.take() {
            active.stop.cancel();
            let _ = active.handle.await;
        }

        let (mode, download_id) = {
            let s = self.store.lock().await;
            (s.mode(), s.download_id().map(str::to_string))
        };

        match (mode, download_id) {
            (Some(DownloadMode::Real), Some(id)) => {
                let result = self.backend.stop_download(&id).await;
                let mut s = self.store.lock().await;
                match result {
                    Ok(()) => s.log("Download stop requested", Severity::Info),
                    Err(ApiError::Status { .. }) => {
                        s.log("Failed to stop download, but resetting status", Severity::Warning)
                    }
                    Err(e) => s.log(&format!("Failed to stop download: {e}"), Severity::Error),
                }
                s.reset_session();
            }
            _ => {
                let mut s = self.store.lock().await;
                s.reset_session();
                s.log("Download stopped", Severity::Warning);
            }
        }
        tracing::info!("download session reset");
    }

    /// Asks the backend how a real download is doing. The backend forgets a
    /// download once it ends, so "not found" after all files arrived counts
    /// as completion. Transient failures are left for the next poll.
    pub async fn poll_status(&self) {
        let (download_id, epoch) = {
            let s = self.store.lock().await;
            if s.status() != DownloadStatus::Downloading || s.mode() != Some(DownloadMode::Real) {
                return;
            }
            match s.download_id() {
                Some(id) => (id.to_string(), s.epoch()),
                None => return,
            }
        };

        let result = self.backend.download_status(&download_id).await;

        let mut s = self.store.lock().await;
        if s.epoch() != epoch || s.status() != DownloadStatus::Downloading {
            return;
        }
        match result {
            Ok(resp) => {
                if let Some(p) = resp.progress.filter(|p| p != s.progress()) {
                    let _ = s.apply_progress(p);
                }
                apply_remote_status(&mut s, &resp.status);
            }
            Err(ApiError::Status { status, .. }) if status == reqwest::StatusCode::NOT_FOUND => {
                let p = s.progress();
                if p.total > 0 && p.current >= p.total {
                    apply_remote_status(&mut s, "completed");
                } else {
                    s.log(&format!("The backend no longer tracks download {download_id}"), Severity::Error);
                    s.set_status(DownloadStatus::Error);
                }
            }
            Err(e) => tracing::debug!(%download_id, error = %e, "status poll failed"),
        }
    }

    /// Back to idle without telling the backend.
    pub async fn reset(&self) {
        let mut simulation = self.simulation.lock().await;
        if let Some(active) = simulation.take() {
            active.stop.cancel();
            let _ = active.handle.await;
        }
        self.store.lock().await.reset_session();
    }
}
