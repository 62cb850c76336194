use crate::core::config::{AppConfig, DEFAULT_TIMEOUT_MS_ARG, DEFAULT_USER_AGENT};
use crate::plugins::registry::CliPlugin;
use clap::{Arg, ArgMatches, Command};
use std::time::Duration;

pub struct HttpCliPlugin;

impl HttpCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for HttpCliPlugin {
    fn name(&self) -> &'static str {
        "http"
    }

    fn augment_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("http_timeout_ms")
                .long("timeout-ms")
                .help_heading("HTTP")
                .help("Timeout for backend API requests in milliseconds")
                .default_value(DEFAULT_TIMEOUT_MS_ARG)
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("http_user_agent")
                .long("user-agent")
                .help_heading("HTTP")
                .help("User-Agent sent to the backend")
                .default_value(DEFAULT_USER_AGENT)
                .global(true)
                .num_args(1),
        )
    }

    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut AppConfig) -> anyhow::Result<()> {
        if let Some(s) = matches.get_one::<String>("http_timeout_ms") {
            let ms: u64 = s
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid --timeout-ms {s:?}: {e}"))?;
            cfg.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ua) = matches.get_one::<String>("http_user_agent") {
            cfg.user_agent = ua.clone();
        }
        Ok(())
    }
}
