use crate::core::config::{AppConfig, DEFAULT_TIMEOUT_MS_ARG};
use crate::plugins::registry::CliPlugin;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::time::Duration;

/// Flags for the realtime channel.
pub struct ChannelCliPlugin;

impl ChannelCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for ChannelCliPlugin {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn augment_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("channel_no_websocket")
                .long("no-websocket")
                .help_heading("Channel")
                .help("Skip the websocket transport and use HTTP long-polling only")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("channel_handshake_timeout_ms")
                .long("handshake-timeout-ms")
                .help_heading("Channel")
                .help("Time allowed per transport to open the channel, in milliseconds")
                .default_value(DEFAULT_TIMEOUT_MS_ARG)
                .global(true)
                .num_args(1),
        )
    }

    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut AppConfig) -> anyhow::Result<()> {
        if matches.get_flag("channel_no_websocket") {
            cfg.websocket = false;
        }
        if let Some(s) = matches.get_one::<String>("channel_handshake_timeout_ms") {
            let ms: u64 = s
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid --handshake-timeout-ms {s:?}: {e}"))?;
            cfg.handshake_timeout = Duration::from_millis(ms);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::registry::PluginRegistry;

    #[test]
    fn no_websocket_leaves_polling_only() {
        let registry = PluginRegistry::with_defaults();
        let m = registry
            .augment_command(Command::new("t"))
            .try_get_matches_from(["t", "--no-websocket", "--handshake-timeout-ms", "900"])
            .unwrap();
        let mut cfg = AppConfig::default();
        registry.apply_matches(&m, &mut cfg).unwrap();

        assert!(!cfg.websocket);
        assert_eq!(cfg.handshake_timeout, Duration::from_millis(900));
        let names: Vec<_> = registry.transports_for(&cfg).iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["polling"]);

        cfg.websocket = true;
        let names: Vec<_> = registry.transports_for(&cfg).iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["websocket", "polling"]);
    }

    #[test]
    fn handshake_timeout_defaults_to_five_seconds() {
        let plugin = ChannelCliPlugin::new();
        let m = plugin.augment_command(Command::new("t")).try_get_matches_from(["t"]).unwrap();
        let mut cfg = AppConfig::default();
        cfg.handshake_timeout = Duration::ZERO;
        plugin.apply_matches(&m, &mut cfg).unwrap();
        assert!(cfg.websocket);
        assert_eq!(cfg.handshake_timeout, Duration::from_millis(5000));
    }
}
