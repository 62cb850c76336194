use crate::core::config::{AppConfig, Credentials};
use crate::core::model::{Course, CourseId, Progress, User};
use crate::plugins::engineio::{Handshake, Packet};
use async_trait::async_trait;
use clap::{ArgMatches, Command};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Clone)]
pub struct TransportContext {
    pub user_agent: String,
    pub handshake_timeout: Duration,
}

/// An open Engine.IO connection. Pump tasks owned by the transport move
/// packets between the wire and the two queues; dropping the link stops
/// them and releases the socket.
pub struct TransportLink {
    pub transport: &'static str,
    pub handshake: Handshake,
    pub outbound: mpsc::Sender<Packet>,
    pub inbound: mpsc::Receiver<Packet>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

impl TransportLink {
    pub fn sid(&self) -> &str {
        &self.handshake.sid
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for t in &self.tasks {
            t.abort();
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Opens the transport and completes the Engine.IO handshake (open packet).
    async fn connect(&self, base: &Url, ctx: &TransportContext) -> anyhow::Result<TransportLink>;
}

pub trait CliPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn augment_command(&self, cmd: Command) -> Command;
    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut AppConfig) -> anyhow::Result<()>;
}

// ---- backend HTTP contract ----

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Network(#[from] reqwest::Error),

    #[error("{message}")]
    Status { status: StatusCode, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("invalid endpoint: {0}")]
    Endpoint(String),
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoursesRequest {
    pub api_url: String,
    pub api_key: String,
    pub channel_id: Option<String>,
    // the reference backend reads the channel id under this name
    pub socket_id: Option<String>,
}

impl CoursesRequest {
    pub fn new(creds: &Credentials, channel_id: Option<String>) -> Self {
        Self {
            api_url: creds.api_url.clone(),
            api_key: creds.api_key.clone(),
            socket_id: channel_id.clone(),
            channel_id,
        }
    }
}

impl std::fmt::Debug for CoursesRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoursesRequest")
            .field("api_url", &self.api_url)
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoursesResponse {
    pub courses: Vec<Course>,
    pub user: User,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDownloadRequest {
    pub api_url: String,
    pub api_key: String,
    pub output_path: String,
    pub selected_courses: Vec<CourseId>,
    pub channel_id: Option<String>,
    pub socket_id: Option<String>,
}

impl StartDownloadRequest {
    pub fn new(creds: &Credentials, selected_courses: Vec<CourseId>, channel_id: Option<String>) -> Self {
        Self {
            api_url: creds.api_url.clone(),
            api_key: creds.api_key.clone(),
            output_path: creds.output_path.clone(),
            selected_courses,
            socket_id: channel_id.clone(),
            channel_id,
        }
    }
}

impl std::fmt::Debug for StartDownloadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartDownloadRequest")
            .field("api_url", &self.api_url)
            .field("output_path", &self.output_path)
            .field("selected_courses", &self.selected_courses)
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartDownloadResponse {
    pub download_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// `status` is the backend's own vocabulary: initializing, connecting,
/// fetching_courses, calculating, downloading, stopped, completed, error.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadStatusResponse {
    pub status: String,
    #[serde(default)]
    pub progress: Option<Progress>,
}

#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn health(&self) -> Result<(), ApiError>;
    async fn courses(&self, req: &CoursesRequest) -> Result<CoursesResponse, ApiError>;
    async fn start_download(&self, req: &StartDownloadRequest) -> Result<StartDownloadResponse, ApiError>;
    async fn stop_download(&self, download_id: &str) -> Result<(), ApiError>;
    async fn download_status(&self, download_id: &str) -> Result<DownloadStatusResponse, ApiError>;
}

pub struct PluginRegistry {
    transports: Vec<Arc<dyn Transport>>,
    cli_plugins: Vec<Box<dyn CliPlugin>>,
}

impl PluginRegistry {
    pub fn with_defaults() -> Self {
        let mut reg = Self { transports: vec![], cli_plugins: vec![] };

        // order matters: the duplex transport is tried first
        reg.transports.push(Arc::new(crate::plugins::websocket::driver::WebSocketTransport::new()));
        reg.transports.push(Arc::new(crate::plugins::polling::driver::PollingTransport::new()));

        reg.cli_plugins.push(Box::new(crate::plugins::http::cli::HttpCliPlugin::new()));
        reg.cli_plugins.push(Box::new(crate::plugins::websocket::cli::ChannelCliPlugin::new()));
        reg
    }

    pub fn augment_command(&self, cmd: Command) -> Command {
        self.cli_plugins
            .iter()
            .fold(cmd, |c, p| p.augment_command(c))
    }

    pub fn apply_matches(&self, matches: &ArgMatches, cfg: &mut AppConfig) -> anyhow::Result<()> {
        for p in &self.cli_plugins {
            p.apply_matches(matches, cfg)?;
        }
        Ok(())
    }

    /// Transports enabled by `cfg`, in preference order.
    pub fn transports_for(&self, cfg: &AppConfig) -> Vec<Arc<dyn Transport>> {
        self.transports
            .iter()
            .filter(|t| cfg.websocket || t.name() != crate::plugins::websocket::driver::NAME)
            .cloned()
            .collect()
    }
}
