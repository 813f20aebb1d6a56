//! Configuration for the tapwire handlers and driver.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values. The resolved
//! [`Settings`] travel behind a [`SharedSettings`] handle; handlers read
//! through the handle on every I/O event rather than caching a copy, so an
//! edit takes effect from the next event on.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Command-line arguments for the tapwire driver
#[derive(Parser, Debug)]
#[command(name = "tapwire")]
#[command(version = "0.1.0")]
#[command(about = "A raw TCP test tool", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen for a single client on this port (server mode)
    #[arg(short, long)]
    pub listen: Option<u16>,

    /// Connect to host:port (client mode)
    #[arg(short = 'C', long)]
    pub connect: Option<String>,

    /// Read buffer size in bytes
    #[arg(short, long)]
    pub buffer_size: Option<usize>,

    /// Wrap outgoing messages in STX (0x02) / ETX (0x03)
    #[arg(long)]
    pub stx_etx: bool,

    /// Append a trailing newline (0x0A) to outgoing messages
    #[arg(long)]
    pub newline: bool,

    /// Connect timeout in milliseconds (client mode)
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Message to send as soon as the connection is established
    #[arg(long)]
    pub on_connect: Option<String>,

    /// Incoming message that triggers an automatic reply
    #[arg(long)]
    pub reply_trigger: Option<String>,

    /// Automatic reply sent when the trigger matches
    #[arg(long)]
    pub reply_with: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub framing: FramingConfig,
    #[serde(default)]
    pub auto: AutoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Transport-related configuration
#[derive(Debug, Deserialize)]
pub struct TransportConfig {
    /// Read buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Outgoing message framing
#[derive(Debug, Deserialize, Default)]
pub struct FramingConfig {
    /// Wrap outgoing messages in STX/ETX
    #[serde(default)]
    pub stx_etx: bool,
    /// Append a trailing newline to outgoing messages
    #[serde(default)]
    pub newline: bool,
}

/// Scripted behavior (message on connect, conditional reply)
#[derive(Debug, Deserialize, Default)]
pub struct AutoConfig {
    /// Sent right after the connection is established
    pub on_connect: Option<String>,
    /// Incoming text that triggers the automatic reply
    pub reply_trigger: Option<String>,
    /// Reply sent when the trigger matches
    pub reply_with: Option<String>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_buffer_size() -> usize {
    4096
}

fn default_connect_timeout_ms() -> u64 {
    4000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A single "if the peer sends this, answer with that" rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRule {
    /// Incoming text that triggers the reply (compared after `\n` unescaping)
    pub trigger: String,
    /// Text sent back, with the configured framing applied
    pub response: String,
}

/// Resolved runtime policy consulted by both connection handlers.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Read chunk size in bytes, must be > 0
    pub buffer_size: usize,
    /// Wrap outgoing payloads in STX (0x02) / ETX (0x03)
    pub wrap_stx_etx: bool,
    /// Append a trailing newline (0x0A) to outgoing payloads
    pub append_newline: bool,
    /// Budget for the client connect attempt
    pub connect_timeout_ms: u64,
    /// Sent by the client handler right after establishment; None = off
    pub on_connect_message: Option<String>,
    /// Conditional auto-reply rule; None = off
    pub reply_rule: Option<ReplyRule>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            wrap_stx_etx: false,
            append_newline: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            on_connect_message: None,
            reply_rule: None,
        }
    }
}

impl Settings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize);
        }
        Ok(())
    }
}

/// Thread-safe settings handle shared between a settings editor and the
/// handlers. Cheap to clone; all clones see the same values.
#[derive(Debug, Clone)]
pub struct SharedSettings {
    inner: Arc<RwLock<Settings>>,
}

impl SharedSettings {
    /// Wrap validated settings in a shared handle.
    pub fn new(settings: Settings) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(settings)),
        })
    }

    /// Current settings by value.
    pub fn snapshot(&self) -> Settings {
        self.inner.read().unwrap().clone()
    }

    /// Apply an edit. An edit that violates an invariant is rejected and
    /// the previous values stay in place.
    pub fn update<F>(&self, edit: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut Settings),
    {
        let mut guard = self.inner.write().unwrap();
        let mut candidate = guard.clone();
        edit(&mut candidate);
        candidate.validate()?;
        *guard = candidate;
        Ok(())
    }
}

impl Default for SharedSettings {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Settings::default())),
        }
    }
}

/// Which side of the conversation the driver runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Client { host: String, port: u16 },
    Server { port: u16 },
}

/// Final resolved configuration for the driver binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub settings: Settings,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mode = match (cli.listen, cli.connect) {
            (Some(port), None) => Mode::Server { port },
            (None, Some(ref addr)) => {
                let (host, port) = split_host_port(addr)?;
                Mode::Client { host, port }
            }
            _ => return Err(ConfigError::ModeRequired),
        };

        let reply_rule = match (
            cli.reply_trigger.or(toml_config.auto.reply_trigger),
            cli.reply_with.or(toml_config.auto.reply_with),
        ) {
            (Some(trigger), Some(response)) => Some(ReplyRule { trigger, response }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteReplyRule),
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        let settings = Settings {
            buffer_size: cli
                .buffer_size
                .unwrap_or(toml_config.transport.buffer_size),
            wrap_stx_etx: cli.stx_etx || toml_config.framing.stx_etx,
            append_newline: cli.newline || toml_config.framing.newline,
            connect_timeout_ms: cli
                .connect_timeout_ms
                .unwrap_or(toml_config.transport.connect_timeout_ms),
            on_connect_message: cli.on_connect.or(toml_config.auto.on_connect),
            reply_rule,
        };
        settings.validate()?;

        let log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level
        };

        Ok(Config {
            mode,
            settings,
            log_level,
        })
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidAddress(addr.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))?;
    if host.is_empty() || port == 0 {
        return Err(ConfigError::InvalidAddress(addr.to_string()));
    }
    Ok((host.to_string(), port))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidBufferSize,
    InvalidAddress(String),
    IncompleteReplyRule,
    ModeRequired,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidBufferSize => {
                write!(f, "Read buffer size must be greater than zero")
            }
            ConfigError::InvalidAddress(addr) => {
                write!(f, "Invalid address '{}', expected host:port", addr)
            }
            ConfigError::IncompleteReplyRule => {
                write!(f, "Reply trigger and reply text must be set together")
            }
            ConfigError::ModeRequired => {
                write!(
                    f,
                    "Either --listen <port> or --connect <host:port> is required"
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli_defaults() -> CliArgs {
        CliArgs {
            config: None,
            listen: Some(7070),
            connect: None,
            buffer_size: None,
            stx_etx: false,
            newline: false,
            connect_timeout_ms: None,
            on_connect: None,
            reply_trigger: None,
            reply_with: None,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.buffer_size, 4096);
        assert_eq!(settings.connect_timeout_ms, 4000);
        assert!(!settings.wrap_stx_etx);
        assert!(!settings.append_newline);
        assert!(settings.on_connect_message.is_none());
        assert!(settings.reply_rule.is_none());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [transport]
            buffer_size = 1024
            connect_timeout_ms = 1500

            [framing]
            stx_etx = true
            newline = true

            [auto]
            on_connect = "HELLO"
            reply_trigger = "PING"
            reply_with = "PONG"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.transport.buffer_size, 1024);
        assert_eq!(config.transport.connect_timeout_ms, 1500);
        assert!(config.framing.stx_etx);
        assert!(config.framing.newline);
        assert_eq!(config.auto.on_connect.as_deref(), Some("HELLO"));
        assert_eq!(config.auto.reply_trigger.as_deref(), Some("PING"));
        assert_eq!(config.auto.reply_with.as_deref(), Some("PONG"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_toml_sections_are_optional() {
        let config: TomlConfig = toml::from_str("").unwrap();
        assert_eq!(config.transport.buffer_size, 4096);
        assert_eq!(config.transport.connect_timeout_ms, 4000);
        assert!(!config.framing.stx_etx);
        assert!(config.auto.on_connect.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_shared_settings_rejects_zero_buffer() {
        let settings = Settings {
            buffer_size: 0,
            ..Settings::default()
        };
        assert!(matches!(
            SharedSettings::new(settings),
            Err(ConfigError::InvalidBufferSize)
        ));
    }

    #[test]
    fn test_update_rejects_invalid_edit_and_keeps_old_values() {
        let shared = SharedSettings::default();
        let result = shared.update(|s| s.buffer_size = 0);
        assert!(matches!(result, Err(ConfigError::InvalidBufferSize)));
        assert_eq!(shared.snapshot().buffer_size, 4096);
    }

    #[test]
    fn test_update_is_visible_through_clones() {
        let shared = SharedSettings::default();
        let other = shared.clone();
        shared.update(|s| s.buffer_size = 512).unwrap();
        assert_eq!(other.snapshot().buffer_size, 512);
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("example.com:8080").unwrap(),
            ("example.com".to_string(), 8080)
        );
        assert!(split_host_port("no-port").is_err());
        assert!(split_host_port(":8080").is_err());
        assert!(split_host_port("host:0").is_err());
        assert!(split_host_port("host:notanumber").is_err());
    }

    #[test]
    fn test_resolve_requires_a_mode() {
        let mut cli = cli_defaults();
        cli.listen = None;
        assert!(matches!(
            Config::resolve(cli),
            Err(ConfigError::ModeRequired)
        ));
    }

    #[test]
    fn test_resolve_rejects_half_a_reply_rule() {
        let mut cli = cli_defaults();
        cli.reply_trigger = Some("PING".to_string());
        assert!(matches!(
            Config::resolve(cli),
            Err(ConfigError::IncompleteReplyRule)
        ));
    }

    #[test]
    fn test_resolve_builds_reply_rule() {
        let mut cli = cli_defaults();
        cli.reply_trigger = Some("PING".to_string());
        cli.reply_with = Some("PONG".to_string());
        let config = Config::resolve(cli).unwrap();
        assert_eq!(
            config.settings.reply_rule,
            Some(ReplyRule {
                trigger: "PING".to_string(),
                response: "PONG".to_string(),
            })
        );
    }
}
