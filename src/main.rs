mod core;
mod plugins;

use crate::core::channel::{ChannelHandle, ChannelOptions, DEFAULT_PROBE_MESSAGE};
use crate::core::config::{self, keys, AppConfig, DEFAULT_SERVER};
use crate::core::engine::{FetchOutcome, Orchestrator, StartOutcome};
use crate::core::events::{ChannelEvent, SessionUpdate};
use crate::core::model::{DownloadMode, DownloadStatus, LogEntry, Severity};
use crate::core::secret::SecretCodec;
use crate::core::store::SqliteStore;
use crate::plugins::http::driver::{HttpBackend, HttpContext};
use crate::plugins::registry::{PluginRegistry, TransportContext};
use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use url::Url;

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

fn build_cli(registry: &PluginRegistry) -> Command {
    let config = Command::new("config")
        .about("Show or change stored settings")
        .subcommand_required(true)
        .subcommand(Command::new("show").about("Print the effective configuration"))
        .subcommand(
            Command::new("set")
                .about("Persist settings (the API key is stored obfuscated)")
                .arg(Arg::new("api_url").long("api-url").help("Course API base URL").num_args(1))
                .arg(Arg::new("api_key").long("api-key").help("Course API access token").num_args(1))
                .arg(Arg::new("output_path").long("output-path").help("Download directory").num_args(1)),
        )
        .subcommand(Command::new("forget-key").about("Remove the stored API key"));

    let courses = Command::new("courses").about("Connect, list your courses and print the log");

    let download = Command::new("download")
        .about("Download the given courses, or every course with --all")
        .arg(
            Arg::new("ids")
                .help("Course ids to download")
                .action(ArgAction::Append)
                .value_parser(clap::value_parser!(i64))
                .num_args(1..),
        )
        .arg(
            Arg::new("all")
                .long("all")
                .help("Select every course")
                .action(ArgAction::SetTrue)
                .conflicts_with("ids"),
        );

    let root = Command::new("course-downloader")
        .about("Bulk course file downloader with live progress")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("server")
                .long("server")
                .help("Backend base URL")
                .default_value(DEFAULT_SERVER)
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("db")
                .long("db")
                .help("Settings database (default: user config dir)")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Debug tracing")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("sim_tick_ms")
                .long("sim-tick-ms")
                .help_heading("Demo mode")
                .help("Pause per simulated file in milliseconds")
                .default_value("50")
                .value_parser(clap::value_parser!(u64))
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("sim_warning_prob")
                .long("sim-warning-prob")
                .help_heading("Demo mode")
                .help("Chance of a simulated warning per file")
                .default_value("0.05")
                .value_parser(clap::value_parser!(f64))
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("sim_seed")
                .long("sim-seed")
                .help_heading("Demo mode")
                .help("Seed for reproducible simulated warnings")
                .value_parser(clap::value_parser!(u64))
                .global(true)
                .num_args(1),
        )
        .subcommand(config)
        .subcommand(courses)
        .subcommand(download);

    registry.augment_command(root)
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "debug,hyper=warn,reqwest=warn,sqlx=warn,session_log=off"
    } else {
        "info,hyper=warn,reqwest=warn,sqlx=warn,session_log=off"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

fn apply_root_matches(m: &ArgMatches, cfg: &mut AppConfig) -> anyhow::Result<()> {
    if let Some(s) = m.get_one::<String>("server") {
        cfg.server = Url::parse(s).with_context(|| format!("invalid --server {s:?}"))?;
    }
    if let Some(ms) = m.get_one::<u64>("sim_tick_ms") {
        cfg.simulation.tick = Duration::from_millis(*ms);
    }
    if let Some(p) = m.get_one::<f64>("sim_warning_prob") {
        anyhow::ensure!((0.0..=1.0).contains(p), "--sim-warning-prob must be within 0..=1");
        cfg.simulation.warning_probability = *p;
    }
    cfg.simulation.seed = m.get_one::<u64>("sim_seed").copied();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let registry = PluginRegistry::with_defaults();
    let matches = build_cli(&registry).get_matches();
    init_tracing(matches.get_flag("verbose"));

    let db_path = matches
        .get_one::<String>("db")
        .map(PathBuf::from)
        .unwrap_or_else(config::default_db_path);
    let settings = SqliteStore::open(&db_path).await?;
    let codec = SecretCodec::for_this_device();

    let mut cfg = AppConfig::default();
    cfg.apply_settings(&settings.all().await?, &codec);
    cfg.apply_env(|k| std::env::var(k).ok());
    apply_root_matches(&matches, &mut cfg)?;
    registry.apply_matches(&matches, &mut cfg)?;
    tracing::debug!(?cfg, db = %db_path.display(), "configuration loaded");

    match matches.subcommand() {
        Some(("config", m)) => run_config(m, &settings, &codec, &cfg, &db_path).await,
        Some(("courses", _)) => run_courses(&registry, &cfg).await,
        Some(("download", m)) => run_download(&registry, &cfg, m).await,
        _ => Ok(()),
    }
}

async fn run_config(
    m: &ArgMatches,
    settings: &SqliteStore,
    codec: &SecretCodec,
    cfg: &AppConfig,
    db_path: &std::path::Path,
) -> anyhow::Result<()> {
    match m.subcommand() {
        Some(("show", _)) => {
            println!("settings db     {}", db_path.display());
            println!("server          {}", cfg.server);
            println!("api url         {}", or_unset(&cfg.credentials.api_url));
            let stored = settings.get(keys::API_KEY).await?.is_some();
            println!(
                "api key         {} ({})",
                config::mask(&cfg.credentials.api_key),
                if stored { "stored" } else { "not stored" }
            );
            println!("output path     {}", cfg.credentials.output_path);
            println!("http timeout    {} ms", cfg.request_timeout.as_millis());
            println!("handshake       {} ms", cfg.handshake_timeout.as_millis());
            println!("websocket       {}", if cfg.websocket { "enabled" } else { "disabled" });
        }
        Some(("set", s)) => {
            let mut changed = 0;
            if let Some(v) = s.get_one::<String>("api_url") {
                settings.set(keys::API_URL, v.trim()).await?;
                changed += 1;
            }
            if let Some(v) = s.get_one::<String>("api_key") {
                settings.set(keys::API_KEY, &codec.obfuscate(v.trim())).await?;
                changed += 1;
            }
            if let Some(v) = s.get_one::<String>("output_path") {
                settings.set(keys::OUTPUT_PATH, v.trim()).await?;
                changed += 1;
            }
            anyhow::ensure!(changed > 0, "nothing to set; pass --api-url, --api-key or --output-path");
            println!("Saved {changed} setting(s)");
        }
        Some(("forget-key", _)) => {
            if settings.remove(keys::API_KEY).await? {
                println!("Stored API key removed");
            } else {
                println!("No API key was stored");
            }
        }
        _ => {}
    }
    Ok(())
}

fn or_unset(v: &str) -> &str {
    if v.is_empty() {
        "(not set)"
    } else {
        v
    }
}

/// Wires backend client, session orchestrator and channel together and
/// waits until the channel is ready or has given up.
async fn connect(
    registry: &PluginRegistry,
    cfg: &AppConfig,
) -> anyhow::Result<(Orchestrator, ChannelHandle)> {
    let backend = HttpBackend::new(
        &cfg.server,
        &HttpContext { user_agent: cfg.user_agent.clone(), timeout: cfg.request_timeout },
    )?;
    let orch = Orchestrator::new(Arc::new(backend), cfg.credentials.clone(), cfg.simulation.clone());

    let transports = registry.transports_for(cfg);
    let n = transports.len() as u32;
    let (channel, mut events) = ChannelHandle::open(
        cfg.server.clone(),
        transports,
        ChannelOptions {
            ctx: TransportContext {
                user_agent: cfg.user_agent.clone(),
                handshake_timeout: cfg.handshake_timeout,
            },
            probe_message: DEFAULT_PROBE_MESSAGE.to_string(),
        },
    );

    let limit = cfg.handshake_timeout * n.max(1) + cfg.request_timeout;
    let settled = tokio::time::timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(ev) => {
                    orch.handle_event(&ev).await;
                    match ev {
                        ChannelEvent::Welcome { .. } | ChannelEvent::EchoTestResult { .. } => return true,
                        ChannelEvent::ConnectionFailed { .. } | ChannelEvent::ConnectionLost { .. } => {
                            return false
                        }
                        _ => {}
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);
    tracing::debug!(ready = settled, connected = channel.is_connected(), "channel settled");

    orch.attach(events);
    Ok((orch, channel))
}

fn format_log(entry: &LogEntry) -> String {
    let tag = match entry.severity {
        Severity::Info => "INFO ",
        Severity::Success => "OK   ",
        Severity::Warning => "WARN ",
        Severity::Error => "ERROR",
    };
    format!("[{}] {} {}", entry.timestamp, tag, entry.message)
}

fn print_log(entry: &LogEntry) {
    println!("{}", format_log(entry));
}

async fn load_courses(orch: &Orchestrator) -> anyhow::Result<()> {
    if orch.fetch_courses().await == FetchOutcome::Skipped {
        anyhow::bail!(
            "API URL and key are required: run `config set --api-url .. --api-key ..` or set {} and {}",
            config::env::API_URL,
            config::env::API_KEY
        );
    }
    Ok(())
}

async fn run_courses(registry: &PluginRegistry, cfg: &AppConfig) -> anyhow::Result<()> {
    let (orch, channel) = connect(registry, cfg).await?;
    let result = load_courses(&orch).await;
    let snap = orch.snapshot().await;
    channel.close().await;

    for entry in &snap.logs {
        print_log(entry);
    }
    result?;

    println!();
    if let Some(user) = &snap.user {
        println!("User: {} (id {})", user.name, user.id);
    }
    println!("{:>8}  {:<12} {:<40} {:<16} {:>6} {:>8}", "ID", "CODE", "NAME", "TERM", "FILES", "FOLDERS");
    for c in &snap.courses {
        println!(
            "{:>8}  {:<12} {:<40} {:<16} {:>6} {:>8}",
            c.id, c.code, c.name, c.term.name, c.file_count, c.folder_count
        );
    }
    if snap.session.status == DownloadStatus::Error {
        anyhow::bail!("course listing failed; demo courses shown");
    }
    Ok(())
}

async fn run_download(
    registry: &PluginRegistry,
    cfg: &AppConfig,
    m: &ArgMatches,
) -> anyhow::Result<()> {
    let (orch, channel) = connect(registry, cfg).await?;
    load_courses(&orch).await?;

    if orch.snapshot().await.session.status == DownloadStatus::Error {
        // listing failed and the demo courses are loaded
        orch.reset().await;
    }

    let store = orch.store();
    let mut updates = {
        let mut s = store.lock().await;
        if m.get_flag("all") {
            if s.selection().len() != s.courses().len() {
                s.toggle_all();
            }
        } else if let Some(ids) = m.get_many::<i64>("ids") {
            for id in ids {
                if !s.select(*id) {
                    s.log(&format!("Unknown course id {id}, skipped"), Severity::Warning);
                }
            }
        }
        s.subscribe()
    };

    let mut printed = 0usize;
    for entry in orch.snapshot().await.logs.iter() {
        print_log(entry);
        printed += 1;
    }

    let mode = match orch.start_download().await {
        StartOutcome::Started(mode) => {
            tracing::info!(?mode, "download running");
            mode
        }
        other => {
            for entry in orch.snapshot().await.logs.iter().skip(printed) {
                print_log(entry);
            }
            channel.close().await;
            anyhow::bail!("download did not start ({other:?})");
        }
    };

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {bar:40.cyan/blue} {pos}/{len} files {wide_msg}")?
            .tick_chars("|/-\\ "),
    );
    pb.enable_steady_tick(Duration::from_millis(120));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut poll = tokio::time::interval(STATUS_POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let final_status = loop {
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                pb.println("Stopping...");
                orch.stop_download().await;
            }
            _ = poll.tick(), if mode == DownloadMode::Real => {
                orch.poll_status().await;
            }
            update = updates.recv() => {
                if let Err(broadcast::error::RecvError::Closed) = update {
                    break DownloadStatus::Idle;
                }
                let s = store.lock().await;
                for entry in s.logs().iter().skip(printed) {
                    pb.println(format_log(entry));
                    printed += 1;
                }
                let p = s.progress();
                pb.set_length(p.total);
                pb.set_position(p.current);
                pb.set_message(p.current_file.clone());

                let status_changed = matches!(update, Ok(SessionUpdate::StatusChanged(_)));
                if status_changed && s.status() != DownloadStatus::Downloading {
                    break s.status();
                }
            }
        }
    };
    pb.finish_and_clear();
    tracing::info!(status = final_status.as_str(), "download session ended");

    for entry in orch.snapshot().await.logs.iter().skip(printed) {
        print_log(entry);
    }
    channel.close().await;

    match final_status {
        DownloadStatus::Completed => {
            println!("Download completed");
            Ok(())
        }
        DownloadStatus::Error => anyhow::bail!("download failed"),
        _ => {
            println!("Download stopped");
            Ok(())
        }
    }
}
