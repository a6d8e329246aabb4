//! Configuration management for the sharelog relay
//!
//! Every tunable is a command line flag that also reads an environment
//! variable. An optional YAML/JSON file fills in whatever the command line
//! and environment left at its default.

use crate::relay::admission::AdmissionLimits;
use crate::sharelog::history::HistorySettings;
use crate::sharelog::watcher::WatcherSettings;
use crate::{Error, Result};
use clap::builder::BoolishValueParser;
use clap::parser::ValueSource;
use clap::{ArgAction, ArgMatches, CommandFactory, FromArgMatches, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// History window bounds applied to stream requests
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamSettings {
    /// Minutes replayed when the request does not say
    pub default_minutes: f64,
    /// Upper bound for requested minutes
    pub max_minutes: f64,
}

/// Complete configuration for the relay
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "sharelog-relay",
    version = env!("CARGO_PKG_VERSION"),
    about = "Sharelog WebSocket relay",
    long_about = "Tails ckpool sharelogs and streams matching shares to authenticated WebSocket subscribers, with bounded history replay"
)]
pub struct Config {
    /// Print the parsed configuration and exit
    #[arg(long)]
    #[serde(skip)]
    pub print_config: bool,

    /// Configuration file path (YAML or JSON)
    #[arg(long, value_name = "FILE", env = "SHARELOG_RELAY_CONFIG")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// Root directory holding one subdirectory per round
    #[arg(long, env = "ROUNDS_DIR", default_value = "/data/ckpool/logs")]
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// Listen interface
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[arg(short = 'p', long, env = "PORT", default_value = "3005")]
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token required on stream upgrades; unset rejects every upgrade
    #[arg(long, env = "WS_TOKEN", hide_env_values = true)]
    #[serde(default, skip_serializing)]
    pub ws_token: Option<String>,

    /// Take the client IP from X-Forwarded-For (only behind a trusted proxy)
    #[arg(long, env = "TRUST_PROXY", action = ArgAction::Set, default_value = "false", value_parser = BoolishValueParser::new())]
    #[serde(default)]
    pub trust_proxy: bool,

    /// Live poll interval in milliseconds
    #[arg(long, env = "TICK_MS", default_value = "1000")]
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Number of most recent rounds tailed live
    #[arg(long, env = "TRACK_LAST_ROUNDS", default_value = "6")]
    #[serde(default = "default_track_last_rounds")]
    pub track_last_rounds: usize,

    /// Maximum lines dispatched per poll cycle
    #[arg(long, env = "MAX_LINES_PER_TICK", default_value = "10000")]
    #[serde(default = "default_max_lines_per_tick")]
    pub max_lines_per_tick: usize,

    /// Files modified this recently are tailed from their start on first sight
    #[arg(long, env = "FRESH_FILE_GRACE_MS", default_value = "5000")]
    #[serde(default = "default_fresh_file_grace_ms")]
    pub fresh_file_grace_ms: u64,

    /// Sharelog file suffix
    #[arg(long, env = "SHARELOG_SUFFIX", default_value = ".sharelog")]
    #[serde(default = "default_sharelog_suffix")]
    pub sharelog_suffix: String,

    /// Replay window used when a request gives none (minutes)
    #[arg(long, env = "HISTORY_DEFAULT_MIN", default_value = "10")]
    #[serde(default = "default_history_default_min")]
    pub history_default_min: f64,

    /// Largest replay window a request may ask for (minutes)
    #[arg(long, env = "HISTORY_MAX_MIN", default_value = "120")]
    #[serde(default = "default_history_max_min")]
    pub history_max_min: f64,

    /// Most recent files read by one replay
    #[arg(long, env = "MAX_HISTORY_FILES", default_value = "200")]
    #[serde(default = "default_max_history_files")]
    pub max_history_files: usize,

    /// Minimum number of rounds scanned for replay candidates
    #[arg(long, env = "HISTORY_MIN_SCAN_ROUNDS", default_value = "15")]
    #[serde(default = "default_history_min_scan_rounds")]
    pub history_min_scan_rounds: usize,

    /// Maximum open stream connections
    #[arg(long, env = "MAX_CONNS_GLOBAL", default_value = "200")]
    #[serde(default = "default_max_conns_global")]
    pub max_conns_global: usize,

    /// Maximum open stream connections per client IP
    #[arg(long, env = "MAX_CONNS_PER_IP", default_value = "30")]
    #[serde(default = "default_max_conns_per_ip")]
    pub max_conns_per_ip: usize,

    /// Upgrade rate window in milliseconds
    #[arg(long, env = "UPGRADE_WINDOW_MS", default_value = "10000")]
    #[serde(default = "default_upgrade_window_ms")]
    pub upgrade_window_ms: u64,

    /// Upgrades allowed per IP per window before a ban
    #[arg(long, env = "MAX_UPGRADES_PER_WINDOW", default_value = "60")]
    #[serde(default = "default_max_upgrades_per_window")]
    pub max_upgrades_per_window: u32,

    /// Ban duration after exceeding the upgrade rate, in milliseconds
    #[arg(long, env = "ABUSE_BAN_MS", default_value = "60000")]
    #[serde(default = "default_abuse_ban_ms")]
    pub abuse_ban_ms: u64,

    /// Interval between sweeps of idle per-IP admission entries, in milliseconds
    #[arg(long, env = "ADMISSION_SWEEP_MS", default_value = "60000")]
    #[serde(default = "default_admission_sweep_ms")]
    pub admission_sweep_ms: u64,

    /// Live frames buffered per connection while its replay runs
    #[arg(long, env = "LIVE_BUFFER", default_value = "1024")]
    #[serde(default = "default_live_buffer")]
    pub live_buffer: usize,

    /// Log level
    #[arg(short = 'l', long, env = "LOG_LEVEL", default_value = "info")]
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Log format
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Also write daily-rotated log files into this directory
    #[arg(long, env = "LOG_DIR", value_name = "DIR")]
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Config {
    /// Parse command line and environment, overlay the config file, validate
    pub async fn load() -> Result<Self> {
        let matches = Self::command().get_matches();
        let mut config = Self::from_arg_matches(&matches)
            .map_err(|e| Error::config(e.to_string()))?;

        if let Some(config_file) = config.config_file.clone() {
            let file_config = Self::load_from_file(&config_file).await?;
            config = config.merge_with_file(file_config, |id| explicitly_set(&matches, id));
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;

        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(Error::from)
        } else {
            // Default to YAML
            serde_yaml::from_str(&content).map_err(Error::from)
        }
    }

    /// Take file values for every setting not given on the command line or
    /// in the environment
    fn merge_with_file(mut self, file: Self, explicit: impl Fn(&str) -> bool) -> Self {
        macro_rules! fill {
            ($($field:ident),* $(,)?) => {
                $(
                    if !explicit(stringify!($field)) {
                        self.$field = file.$field;
                    }
                )*
            };
        }

        fill!(
            logs_dir,
            host,
            port,
            ws_token,
            trust_proxy,
            tick_ms,
            track_last_rounds,
            max_lines_per_tick,
            fresh_file_grace_ms,
            sharelog_suffix,
            history_default_min,
            history_max_min,
            max_history_files,
            history_min_scan_rounds,
            max_conns_global,
            max_conns_per_ip,
            upgrade_window_ms,
            max_upgrades_per_window,
            abuse_ban_ms,
            admission_sweep_ms,
            live_buffer,
            log_level,
            log_format,
            log_dir,
        );
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;

        if self.tick_ms == 0 {
            return Err(Error::config("Tick interval must be greater than 0"));
        }
        if self.track_last_rounds == 0 {
            return Err(Error::config("Tracked round count must be greater than 0"));
        }
        if self.max_lines_per_tick == 0 {
            return Err(Error::config("Per-tick line budget must be greater than 0"));
        }
        if self.sharelog_suffix.trim().is_empty() {
            return Err(Error::config("Sharelog suffix must not be empty"));
        }
        if !(self.history_max_min >= 0.0 && self.history_max_min.is_finite()) {
            return Err(Error::config("History maximum must be a non-negative number of minutes"));
        }
        if !(0.0..=self.history_max_min).contains(&self.history_default_min) {
            return Err(Error::config(format!(
                "History default ({}) must lie within [0, {}]",
                self.history_default_min, self.history_max_min
            )));
        }
        if self.max_history_files == 0 {
            return Err(Error::config("History file cap must be greater than 0"));
        }
        if self.max_conns_global == 0 || self.max_conns_per_ip == 0 {
            return Err(Error::config("Connection caps must be greater than 0"));
        }
        if self.upgrade_window_ms == 0 || self.max_upgrades_per_window == 0 {
            return Err(Error::config("Upgrade rate window and ceiling must be greater than 0"));
        }
        if self.admission_sweep_ms == 0 {
            return Err(Error::config("Admission sweep interval must be greater than 0"));
        }
        if self.live_buffer == 0 {
            return Err(Error::config("Live buffer must be greater than 0"));
        }

        Ok(())
    }

    /// Get listen socket address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|e| Error::config(format!("Invalid listen interface: {}", e)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Get poll interval duration
    pub fn tick_duration(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Get admission sweep interval
    pub fn admission_sweep_duration(&self) -> Duration {
        Duration::from_millis(self.admission_sweep_ms)
    }

    /// Settings for the live tailer and scheduler
    pub fn watcher_settings(&self) -> WatcherSettings {
        WatcherSettings {
            logs_dir: self.logs_dir.clone(),
            suffix: self.sharelog_suffix.clone(),
            track_last_rounds: self.track_last_rounds,
            max_lines_per_tick: self.max_lines_per_tick,
            fresh_file_grace: Duration::from_millis(self.fresh_file_grace_ms),
        }
    }

    /// Settings for the history replayer
    pub fn history_settings(&self) -> HistorySettings {
        HistorySettings {
            logs_dir: self.logs_dir.clone(),
            suffix: self.sharelog_suffix.clone(),
            scan_rounds: self.track_last_rounds.max(self.history_min_scan_rounds),
            max_files: self.max_history_files,
        }
    }

    /// History window bounds for stream requests
    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            default_minutes: self.history_default_min,
            max_minutes: self.history_max_min,
        }
    }

    /// Rate limits and connection caps
    pub fn admission_limits(&self) -> AdmissionLimits {
        AdmissionLimits {
            upgrade_window: Duration::from_millis(self.upgrade_window_ms),
            max_upgrades_per_window: self.max_upgrades_per_window,
            ban_duration: Duration::from_millis(self.abuse_ban_ms),
            max_conns_global: self.max_conns_global,
            max_conns_per_ip: self.max_conns_per_ip,
        }
    }
}

/// Whether a flag came from the command line or environment rather than a default
fn explicitly_set(matches: &ArgMatches, id: &str) -> bool {
    matches!(
        matches.value_source(id),
        Some(ValueSource::CommandLine) | Some(ValueSource::EnvVariable)
    )
}

// Default value functions for serde
fn default_logs_dir() -> PathBuf { PathBuf::from("/data/ckpool/logs") }
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 3005 }
fn default_tick_ms() -> u64 { 1000 }
fn default_track_last_rounds() -> usize { 6 }
fn default_max_lines_per_tick() -> usize { 10_000 }
fn default_fresh_file_grace_ms() -> u64 { 5000 }
fn default_sharelog_suffix() -> String { ".sharelog".to_string() }
fn default_history_default_min() -> f64 { 10.0 }
fn default_history_max_min() -> f64 { 120.0 }
fn default_max_history_files() -> usize { 200 }
fn default_history_min_scan_rounds() -> usize { 15 }
fn default_max_conns_global() -> usize { 200 }
fn default_max_conns_per_ip() -> usize { 30 }
fn default_upgrade_window_ms() -> u64 { 10_000 }
fn default_max_upgrades_per_window() -> u32 { 60 }
fn default_abuse_ban_ms() -> u64 { 60_000 }
fn default_admission_sweep_ms() -> u64 { 60_000 }
fn default_live_buffer() -> usize { 1024 }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_log_format() -> LogFormat { LogFormat::Text }

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["sharelog-relay"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = parse(&[]);

        assert_eq!(config.port, 3005);
        assert_eq!(config.tick_ms, 1000);
        assert_eq!(config.track_last_rounds, 6);
        assert_eq!(config.max_lines_per_tick, 10_000);
        assert_eq!(config.history_default_min, 10.0);
        assert_eq!(config.history_max_min, 120.0);
        assert_eq!(config.max_upgrades_per_window, 60);
        assert!(!config.trust_proxy);
        assert!(config.ws_token.is_none());
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_trust_proxy_accepts_boolish_values() {
        assert!(parse(&["--trust-proxy", "1"]).trust_proxy);
        assert!(parse(&["--trust-proxy", "true"]).trust_proxy);
        assert!(!parse(&["--trust-proxy", "0"]).trust_proxy);
    }

    #[test]
    fn test_derived_settings() {
        let config = parse(&["--track-last-rounds", "20", "--max-history-files", "7"]);

        let history = config.history_settings();
        assert_eq!(history.scan_rounds, 20);
        assert_eq!(history.max_files, 7);

        let config = parse(&[]);
        assert_eq!(config.history_settings().scan_rounds, 15);

        let limits = config.admission_limits();
        assert_eq!(limits.upgrade_window, Duration::from_secs(10));
        assert_eq!(limits.ban_duration, Duration::from_secs(60));
        assert_eq!(config.watcher_settings().fresh_file_grace, Duration::from_secs(5));
        assert_eq!(config.stream_settings().max_minutes, 120.0);
    }

    #[test]
    fn test_validation_failures() {
        assert!(parse(&["--tick-ms", "0"]).validate().is_err());
        assert!(parse(&["--host", "not-an-ip"]).validate().is_err());
        assert!(parse(&["--history-default-min", "200"]).validate().is_err());
        assert!(parse(&["--max-conns-per-ip", "0"]).validate().is_err());
        assert!(parse(&["--sharelog-suffix", " "]).validate().is_err());
    }

    #[tokio::test]
    async fn test_config_from_yaml() {
        let yaml_content = r#"
logs_dir: "/srv/ckpool/logs"
port: 4000
ws_token: "s3cret"
trust_proxy: true
max_upgrades_per_window: 3
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = Config::load_from_file(temp_file.path()).await.unwrap();

        assert_eq!(config.logs_dir, PathBuf::from("/srv/ckpool/logs"));
        assert_eq!(config.port, 4000);
        assert_eq!(config.ws_token.as_deref(), Some("s3cret"));
        assert!(config.trust_proxy);
        assert_eq!(config.max_upgrades_per_window, 3);
        assert_eq!(config.tick_ms, 1000);
    }

    #[tokio::test]
    async fn test_file_fills_only_defaulted_settings() {
        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, r#"{{"port": 4000, "tick_ms": 250, "ws_token": "from-file"}}"#).unwrap();

        let file_config = Config::load_from_file(temp_file.path()).await.unwrap();
        let matches = Config::command()
            .try_get_matches_from(["sharelog-relay", "--port", "5000"])
            .unwrap();
        let cli = Config::from_arg_matches(&matches).unwrap();

        let merged = cli.merge_with_file(file_config, |id| explicitly_set(&matches, id));
        assert_eq!(merged.port, 5000);
        assert_eq!(merged.tick_ms, 250);
        assert_eq!(merged.ws_token.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_printed_config_omits_token() {
        let config = parse(&["--ws-token", "s3cret"]);
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(!yaml.contains("s3cret"));
        assert!(yaml.contains("tick_ms"));
    }
}
