//! Configuration file support
//!
//! Loads configuration from ~/.config/dualspeed/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub client: ClientDefaults,

    #[serde(default)]
    pub server: ServerDefaults,
}

/// Default settings for client mode
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientDefaults {
    /// Server address; skips discovery when set
    pub host: Option<String>,

    /// Bytes requested per connection (e.g., "1M", "500K")
    pub file_size: Option<String>,

    pub tcp_connections: Option<u32>,

    pub udp_connections: Option<u32>,

    /// Server ports used with `host`
    pub tcp_port: Option<u16>,

    pub udp_port: Option<u16>,

    /// Port to listen on for offers
    pub discovery_port: Option<u16>,

    /// Discovery wait (e.g., "30s")
    pub discovery_timeout: Option<String>,

    /// UDP silence timeout (e.g., "1s", "500ms")
    pub silence_timeout: Option<String>,

    pub tcp_nodelay: Option<bool>,

    /// Default to JSON output
    pub json_output: Option<bool>,

    /// Log file path (e.g., "~/.config/dualspeed/dualspeed.log")
    pub log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: Option<String>,
}

/// Default settings for server mode
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerDefaults {
    pub tcp_port: Option<u16>,

    pub udp_port: Option<u16>,

    /// Port offers are sent to
    pub discovery_port: Option<u16>,

    /// Segment payload size in bytes
    pub segment_size: Option<usize>,

    /// Pause between UDP segments (e.g., "1ms")
    pub pace: Option<String>,

    /// Offer interval (e.g., "1s")
    pub broadcast_interval: Option<String>,

    /// Offer destination, 255.255.255.255 unless set
    pub broadcast_addr: Option<String>,

    /// Log file path
    pub log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from the default path.
    /// Returns default config if file doesn't exist.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dualspeed")
            .join("config.toml")
    }
}
