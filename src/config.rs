//! Configuration schema, defaults, and loading.
//!
//! Precedence: defaults < config file (JSON) < CLI flags.
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::MAX_CHUNK_SIZE;

pub const DEFAULT_PORT: u16 = 5001;
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5001";
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:5001";
pub const DEFAULT_ROOT: &str = "files";

/// Exponential backoff between reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    #[serde(with = "human_duration")]
    pub initial: Duration,
    /// No delay ever exceeds this, jitter included
    #[serde(with = "human_duration")]
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay applied as +/- random spread
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.initial.is_zero(), "backoff initial delay must be > 0");
        ensure!(
            self.max >= self.initial,
            "backoff max ({}) must be >= initial ({})",
            humantime::format_duration(self.max),
            humantime::format_duration(self.initial)
        );
        ensure!(self.multiplier >= 1.0, "backoff multiplier must be >= 1.0");
        ensure!(
            (0.0..1.0).contains(&self.jitter),
            "backoff jitter must be in [0, 1)"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Directory holding the served files
    pub root: PathBuf,
    pub chunk_size: usize,
    /// Uploads announcing more bytes than this are refused
    pub max_file_size: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            root: PathBuf::from(DEFAULT_ROOT),
            chunk_size: MAX_CHUNK_SIZE,
            max_file_size: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        validate_chunk_size(self.chunk_size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// host:port of the server
    pub server: String,
    pub chunk_size: usize,
    pub backoff: BackoffPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER_ADDR.to_string(),
            chunk_size: MAX_CHUNK_SIZE,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.server.is_empty(), "server address must not be empty");
        validate_chunk_size(self.chunk_size)?;
        self.backoff.validate()
    }
}

/// Config file layout: both sections optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl Config {
    /// Load from a JSON file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        Ok(config)
    }
}

fn validate_chunk_size(chunk_size: usize) -> Result<()> {
    ensure!(
        chunk_size > 0 && chunk_size <= MAX_CHUNK_SIZE,
        "chunk_size must be between 1 and {} bytes, got {}",
        MAX_CHUNK_SIZE,
        chunk_size
    );
    Ok(())
}

/// Durations as humantime strings ("1s", "250ms")
mod human_duration {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(de::Error::custom)
    }
}
