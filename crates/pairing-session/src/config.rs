use crate::error::ConfigError;
use crate::telemetry::logging::{LogConfig, LogLevel};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8080/ws";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// What happens once a partner is gone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PairingMode {
    /// Random-stranger pairing: immediately ask the relay for someone new.
    #[default]
    AutoFind,
    /// Call-by-name: return to an idle, callable state.
    Directory,
}

impl FromStr for PairingMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto-find" | "auto" | "random" => Ok(PairingMode::AutoFind),
            "directory" | "call" => Ok(PairingMode::Directory),
            other => Err(format!("unknown pairing mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub relay_url: String,
    pub pairing_mode: PairingMode,
    pub username: Option<String>,
    pub negotiation_timeout: Duration,
    pub ice_servers: Vec<String>,
    pub heartbeat_interval: Duration,
    pub log_level: LogLevel,
    pub log_file: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            pairing_mode: PairingMode::AutoFind,
            username: None,
            negotiation_timeout: Duration::from_secs(30),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            heartbeat_interval: Duration::from_secs(30),
            log_level: LogLevel::Warn,
            log_file: None,
        }
    }
}

impl SessionConfig {
    /// Read `.env` if present, then the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let defaults = Self::default();
        let relay_url = lookup("PAIRING_RELAY_URL")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(defaults.relay_url);
        let pairing_mode = parse_var(&lookup, "PAIRING_MODE")?.unwrap_or(defaults.pairing_mode);
        let username = lookup("PAIRING_USERNAME")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let negotiation_timeout = parse_secs(&lookup, "PAIRING_NEGOTIATION_TIMEOUT_SECS")?
            .unwrap_or(defaults.negotiation_timeout);
        let ice_servers = lookup("PAIRING_ICE_SERVERS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or(defaults.ice_servers);
        let heartbeat_interval = parse_secs(&lookup, "PAIRING_HEARTBEAT_SECS")?
            .unwrap_or(defaults.heartbeat_interval);
        let log_level = parse_var(&lookup, "PAIRING_LOG_LEVEL")?.unwrap_or(defaults.log_level);
        let log_file = lookup("PAIRING_LOG_FILE")
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            relay_url,
            pairing_mode,
            username,
            negotiation_timeout,
            ice_servers,
            heartbeat_interval,
            log_level,
            log_file,
        })
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            file: self.log_file.clone(),
        }
    }
}

/// A whole number of seconds; zero is rejected.
fn parse_secs<F>(lookup: &F, var: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&'static str) -> Option<String>,
{
    match parse_var::<u64, _>(lookup, var)? {
        Some(0) => Err(ConfigError::Invalid {
            var,
            value: "0".into(),
            reason: "must be greater than zero".into(),
        }),
        secs => Ok(secs.map(Duration::from_secs)),
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&'static str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|err: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: err.to_string(),
        })
}
