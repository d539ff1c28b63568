use anyhow::{Result, anyhow};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use mail_beacon::background::Background;
use mail_beacon::beacon::build_beacon;
use mail_beacon::config::{
    KEY_API_URL, KEY_TRACKING_ENABLED, Settings, load_config, resolve_db_path, socket_path,
};
use mail_beacon::daemon::{DaemonConfig, run_daemon};
use mail_beacon::domain::email::EpochMs;
use mail_beacon::identity;
use mail_beacon::remote::HttpTrackerApi;
use mail_beacon::store::repo::KvStore;
use mail_beacon::store::sqlite::SqliteKv;
use mail_beacon::store::tracked::TrackedStore;

#[derive(Parser)]
#[command(name = "mail_beacon")]
#[command(about = "Email open tracking (background daemon + store tools)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the background: status polling, request socket, desktop notifications
    Daemon {
        /// Seconds between status polls (defaults to the config file)
        #[arg(long)]
        interval: Option<u64>,

        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// List tracked messages
    List,

    /// Ask the tracking server about one message now
    Status { id: String },

    /// Show or change runtime settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Print a fresh message id and its beacon markup
    Beacon,
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Enable,
    Disable,
    /// Point the tracker at another server
    ApiUrl { url: String },
}

fn format_ms(ms: EpochMs) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn print_settings(s: &Settings) {
    println!("apiUrl          {}", s.api_url);
    println!("trackingEnabled {}", s.tracking_enabled);
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let cfg = load_config().map_err(|e| anyhow!("Configuration error: {e}"))?;
    let db_path = resolve_db_path(&cfg)?;
    let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open(&db_path)?);

    match cli.cmd {
        Command::Daemon { interval, socket } => {
            let api = Arc::new(HttpTrackerApi::new()?);
            let bg = Arc::new(Background::new(kv, api, cfg.default_api_url()));

            let (tx, rx) = watch::channel(false);
            ctrlc::set_handler(move || {
                let _ = tx.send(true);
            })?;

            let daemon_cfg = DaemonConfig {
                poll_interval: interval
                    .map(|s| Duration::from_secs(s.max(1)))
                    .unwrap_or(cfg.timing().poll_interval),
                socket: match socket {
                    Some(p) => p,
                    None => socket_path()?,
                },
                desktop_notifications: cfg.desktop_notifications,
                locale: cfg.locale,
            };
            run_daemon(bg, daemon_cfg, rx).await
        }

        Command::List => {
            let all = TrackedStore::new(kv).get_all()?;
            println!("{} tracked message(s)", all.len());
            for m in TrackedStore::by_creation(&all) {
                let state = match m.opened_at {
                    Some(at) if m.opened => format!("opened {}", format_ms(at)),
                    _ if m.opened => "opened".to_string(),
                    _ => "not opened".to_string(),
                };
                println!(
                    "{}  {}  {:<28}  {:?}  ({state})",
                    m.id,
                    format_ms(m.created_at),
                    m.recipient,
                    m.subject
                );
            }
            Ok(())
        }

        Command::Status { id } => {
            let api = Arc::new(HttpTrackerApi::new()?);
            let bg = Background::new(kv, api, cfg.default_api_url());
            let status = bg.check_status(&id).await?;
            println!("{id}: {}", if status.opened { "opened" } else { "not opened" });
            for (k, v) in &status.extra {
                println!("  {k}: {v}");
            }
            Ok(())
        }

        Command::Config { action } => {
            match action.unwrap_or(ConfigAction::Show) {
                ConfigAction::Show => {}
                ConfigAction::Enable => kv.set(KEY_TRACKING_ENABLED, json!(true))?,
                ConfigAction::Disable => kv.set(KEY_TRACKING_ENABLED, json!(false))?,
                ConfigAction::ApiUrl { url } => {
                    build_beacon(&url, &identity::generate())?;
                    kv.set(KEY_API_URL, json!(url.trim_end_matches('/')))?
                }
            }
            print_settings(&Settings::load(kv.as_ref(), cfg.default_api_url())?);
            Ok(())
        }

        Command::Beacon => {
            let settings = Settings::load(kv.as_ref(), cfg.default_api_url())?;
            let id = identity::generate();
            let beacon = build_beacon(&settings.api_url, &id)?;
            println!("{id}");
            println!("{}", beacon.markup());
            Ok(())
        }
    }
}
