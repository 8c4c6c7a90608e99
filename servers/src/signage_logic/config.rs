use anyhow::{Context, Result, bail};
use chrono_tz::Tz;
use clap::Parser;
use lib_signage::core::ActiveSource;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_CONFIG_FILE: &str = "server_signage.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Digital signage schedule server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "SIGNAGE_PORT", help = "Port to listen on for HTTP and monitor connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "SIGNAGE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "SIGNAGE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "SIGNAGE_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "SIGNAGE_DATABASE_URL", help = "PostgreSQL URL. Without it the in-memory store is used.")]
    pub database_url: Option<String>,

    #[clap(long, env = "SIGNAGE_DB_MAX_CONNECTIONS", help = "Maximum size of the database connection pool.")]
    pub db_max_connections: Option<usize>,

    #[clap(long, env = "SIGNAGE_SEED_PATH", help = "JSON file with monitors and contents for the in-memory store.")]
    pub seed_path: Option<PathBuf>,

    #[clap(long, env = "SIGNAGE_TIMEZONE", help = "IANA time zone schedules are evaluated in.")]
    pub timezone: Option<String>,

    #[clap(long, env = "SIGNAGE_DISPATCH_INTERVAL_SECONDS", help = "Seconds between dispatch ticks.")]
    pub dispatch_interval_seconds: Option<u64>,

    #[clap(long, env = "SIGNAGE_DISPATCH_SOURCE", help = "Where the dispatcher reads active schedules from (cache or store).")]
    pub dispatch_source: Option<String>,

    #[clap(long, env = "SIGNAGE_ROTATION_PERIOD_SECONDS", help = "Seconds each tied rotation item stays on screen.")]
    pub rotation_period_seconds: Option<u64>,

    #[clap(long, env = "SIGNAGE_REFRESH_EPSILON_SECONDS", help = "Seconds after local midnight the daily refresh runs.")]
    pub refresh_epsilon_seconds: Option<u64>,

    #[clap(long, env = "SIGNAGE_HEARTBEAT_INTERVAL_SECONDS", help = "Seconds between server pings to each monitor.")]
    pub heartbeat_interval_seconds: Option<u64>,

    #[clap(long, env = "SIGNAGE_IDLE_TIMEOUT_SECONDS", help = "Seconds without any inbound frame before a session is closed.")]
    pub idle_timeout_seconds: Option<u64>,

    #[clap(long, env = "SIGNAGE_REGISTER_TIMEOUT_SECONDS", help = "Seconds a new connection has to register.")]
    pub register_timeout_seconds: Option<u64>,

    #[clap(long, env = "SIGNAGE_HORIZON_DAYS", help = "Days of occurrence dates materialized for open-ended schedules.")]
    pub horizon_days: Option<u64>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    fn defaults() -> Config {
        Config {
            port: Some(9003),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            db_max_connections: Some(16),
            timezone: Some("UTC".to_string()),
            dispatch_interval_seconds: Some(30),
            dispatch_source: Some("cache".to_string()),
            rotation_period_seconds: Some(60),
            refresh_epsilon_seconds: Some(5),
            heartbeat_interval_seconds: Some(30),
            idle_timeout_seconds: Some(90),
            register_timeout_seconds: Some(10),
            horizon_days: Some(366),
            ..Default::default()
        }
    }

    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            database_url: other.database_url.or(self.database_url),
            db_max_connections: other.db_max_connections.or(self.db_max_connections),
            seed_path: other.seed_path.or(self.seed_path),
            timezone: other.timezone.or(self.timezone),
            dispatch_interval_seconds: other.dispatch_interval_seconds.or(self.dispatch_interval_seconds),
            dispatch_source: other.dispatch_source.or(self.dispatch_source),
            rotation_period_seconds: other.rotation_period_seconds.or(self.rotation_period_seconds),
            refresh_epsilon_seconds: other.refresh_epsilon_seconds.or(self.refresh_epsilon_seconds),
            heartbeat_interval_seconds: other.heartbeat_interval_seconds.or(self.heartbeat_interval_seconds),
            idle_timeout_seconds: other.idle_timeout_seconds.or(self.idle_timeout_seconds),
            register_timeout_seconds: other.register_timeout_seconds.or(self.register_timeout_seconds),
            horizon_days: other.horizon_days.or(self.horizon_days),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }
}

/// Fully resolved settings the server runs with.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub database_url: Option<String>,
    pub db_max_connections: usize,
    pub seed_path: Option<PathBuf>,
    pub timezone: Tz,
    pub dispatch_interval: Duration,
    pub dispatch_source: ActiveSource,
    pub rotation_period: Duration,
    pub refresh_epsilon: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub register_timeout: Duration,
    pub horizon_days: u64,
    pub tls: Option<(PathBuf, PathBuf)>,
}

fn positive(name: &str, value: Option<u64>) -> Result<Duration> {
    match value {
        Some(0) => bail!("{name} must be greater than zero"),
        Some(secs) => Ok(Duration::from_secs(secs)),
        None => bail!("{name} is not set"),
    }
}

impl TryFrom<Config> for Settings {
    type Error = anyhow::Error;

    fn try_from(config: Config) -> Result<Self> {
        let timezone_name = config.timezone.unwrap_or_else(|| "UTC".to_string());
        let timezone: Tz = timezone_name
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid timezone '{timezone_name}': {e}"))?;

        let dispatch_source = config
            .dispatch_source
            .as_deref()
            .unwrap_or("cache")
            .parse::<ActiveSource>()
            .map_err(anyhow::Error::msg)?;

        let heartbeat_interval = positive("heartbeat interval", config.heartbeat_interval_seconds)?;
        let idle_timeout = positive("idle timeout", config.idle_timeout_seconds)?;
        if idle_timeout <= heartbeat_interval {
            bail!("idle timeout must be longer than the heartbeat interval");
        }

        let tls = match (config.tls_cert_path, config.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert, key)),
            (None, None) => None,
            _ => bail!("TLS needs both a certificate and a key path"),
        };

        Ok(Settings {
            port: config.port.context("port is not set")?,
            log_dir: config.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: config.log_level.unwrap_or_else(|| "info".to_string()),
            database_url: config.database_url.filter(|url| !url.trim().is_empty()),
            db_max_connections: config.db_max_connections.unwrap_or(16).max(1),
            seed_path: config.seed_path,
            timezone,
            dispatch_interval: positive("dispatch interval", config.dispatch_interval_seconds)?,
            dispatch_source,
            rotation_period: positive("rotation period", config.rotation_period_seconds)?,
            refresh_epsilon: Duration::from_secs(config.refresh_epsilon_seconds.unwrap_or(5)),
            heartbeat_interval,
            idle_timeout,
            register_timeout: positive("register timeout", config.register_timeout_seconds)?,
            horizon_days: config.horizon_days.unwrap_or(366).max(1),
            tls,
        })
    }
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Resolves settings from defaults, the JSON file and the parsed CLI/env layer.
pub fn resolve(cli: Config) -> Result<Settings> {
    // 1. Defaults
    let mut current_config = Config::defaults();

    // 2. Config file, whose path the CLI may override
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }

    // 3. Environment variables and CLI arguments
    current_config = current_config.merge(cli);

    Settings::try_from(current_config)
}

pub fn load_config() -> Result<Settings> {
    resolve(Config::parse())
}
