use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Command line options for the server.
#[derive(Parser, Debug, Default)]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Runtime configuration resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Base directory holding the SQLite database.
    pub data_dir: PathBuf,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    /// Messages older than this many days are purged by housekeeping.
    pub retention_days: i64,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    retention: FileRetention,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize)]
struct FileRetention {
    #[serde(default = "default_retention_days")]
    days: i64,
}

fn default_port() -> u16 {
    8787
}

fn default_logging() -> bool {
    true
}

fn default_retention_days() -> i64 {
    365
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Default for FileRetention {
    fn default() -> Self {
        Self {
            days: default_retention_days(),
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut port = default_port();
        let mut logging = default_logging();
        let mut retention_days = default_retention_days();

        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("RELAY_CHAT_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/relay_chat.toml"));

        if let Ok(bytes) = fs::read(&config_path) {
            let contents = String::from_utf8_lossy(&bytes);
            let file_cfg: FileConfig = toml::from_str(&contents).context("invalid config file")?;
            port = file_cfg.server.port;
            logging = file_cfg.logging.enabled;
            retention_days = file_cfg.retention.days;
        }

        // environment overrides
        if let Ok(p) = std::env::var("RELAY_CHAT_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("RELAY_CHAT_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }
        if let Ok(d) = std::env::var("RELAY_CHAT_RETENTION_DAYS") {
            if let Ok(d) = d.parse::<i64>() {
                retention_days = d;
            }
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }
        if retention_days < 1 {
            anyhow::bail!("invalid_retention");
        }

        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        Ok(Self {
            bind,
            data_dir,
            logging_enabled: logging,
            retention_days,
        })
    }

    /// Path of the SQLite database file inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chat.db")
    }
}

/// Determine the default data directory for the server.
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/relay_chat");
        p
    } else {
        PathBuf::from("./relay_chat_data")
    }
}
