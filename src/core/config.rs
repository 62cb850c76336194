use crate::core::secret::SecretCodec;
use crate::core::simulator::SimulationConfig;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_SERVER: &str = "http://localhost:8000";
pub const DEFAULT_OUTPUT_PATH: &str = "./downloads";
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
/// Same value as [`DEFAULT_TIMEOUT_MS`], for clap defaults.
pub const DEFAULT_TIMEOUT_MS_ARG: &str = "5000";
pub const DEFAULT_USER_AGENT: &str = "CourseDownloader/0.1";

/// Setting keys in the persisted store.
pub mod keys {
    pub const API_URL: &str = "api_url";
    pub const API_KEY: &str = "api_key";
    pub const OUTPUT_PATH: &str = "output_path";
}

/// Environment overrides.
pub mod env {
    pub const API_URL: &str = "COURSE_API_URL";
    pub const API_KEY: &str = "COURSE_API_KEY";
    pub const OUTPUT_PATH: &str = "COURSE_OUTPUT_PATH";
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_url: String,
    pub api_key: String,
    pub output_path: String,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        !self.api_url.trim().is_empty() && !self.api_key.trim().is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_url", &self.api_url)
            .field("api_key", &mask(&self.api_key))
            .field("output_path", &self.output_path)
            .finish()
    }
}

/// Shows the first four characters of a secret and hides the rest.
pub fn mask(secret: &str) -> String {
    if secret.is_empty() {
        return "(not set)".to_string();
    }
    let head: String = secret.chars().take(4).collect();
    format!("{head}…")
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Backend base; the channel connects here and HTTP calls go under `/api`.
    pub server: Url,
    pub credentials: Credentials,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub user_agent: String,
    pub websocket: bool,
    pub simulation: SimulationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: Url::parse(DEFAULT_SERVER).expect("default server url"),
            credentials: Credentials {
                output_path: DEFAULT_OUTPUT_PATH.to_string(),
                ..Default::default()
            },
            request_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            handshake_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            websocket: true,
            simulation: SimulationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Layers persisted settings over the defaults. The stored key is revealed with `codec`.
    pub fn apply_settings(&mut self, settings: &HashMap<String, String>, codec: &SecretCodec) {
        if let Some(v) = settings.get(keys::API_URL).filter(|v| !v.is_empty()) {
            self.credentials.api_url = v.clone();
        }
        if let Some(v) = settings.get(keys::API_KEY).filter(|v| !v.is_empty()) {
            self.credentials.api_key = codec.reveal(v);
        }
        if let Some(v) = settings.get(keys::OUTPUT_PATH).filter(|v| !v.is_empty()) {
            self.credentials.output_path = v.clone();
        }
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(env::API_URL).filter(|v| !v.is_empty()) {
            self.credentials.api_url = v;
        }
        if let Some(v) = lookup(env::API_KEY).filter(|v| !v.is_empty()) {
            self.credentials.api_key = v;
        }
        if let Some(v) = lookup(env::OUTPUT_PATH).filter(|v| !v.is_empty()) {
            self.credentials.output_path = v;
        }
    }
}

/// `<config dir>/course-downloader/settings.sqlite`, or the working directory as a fallback.
pub fn default_db_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("course-downloader"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("settings.sqlite")
}
