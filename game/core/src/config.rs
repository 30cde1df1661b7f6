//! Server configuration: a TOML file with defaults for everything, plus
//! overrides from the data provider's settings store. The recognized keys
//! are the contract; unknown settings are ignored.

use ember::logging::{self, Logger};
use ember::store::DataProvider;
use serde_derive::{Deserialize, Serialize};
use std::net::{AddrParseError, SocketAddr};
use std::path::Path;

pub const DEFAULT_PORT: u16 = 25565;

/// Settings keys the core consumes from the provider's settings store.
pub const RECOGNIZED_KEYS: &[&str] = &[
    "binds",
    "num_threads",
    "io_workers",
    "max_bytes",
    "max_players",
    "world_unload_interval",
    "tick_length",
    "tick_threshold",
    "offline_freeze",
    "view_distance",
    "world_type",
    "keepalive_interval",
    "idle_timeout",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Semicolon-separated list of `ip:port` endpoints.
    pub binds: String,
    /// Application pool size.
    pub num_threads: usize,
    /// I/O worker threads; zero means one per hardware thread.
    pub io_workers: usize,
    /// Per-connection send-buffer cap in bytes; zero means unlimited.
    pub max_bytes: usize,
    /// Admission cap; zero means unlimited.
    pub max_players: usize,
    /// Maintenance period in milliseconds.
    pub world_unload_interval: u64,
    /// World tick period in milliseconds.
    pub tick_length: u64,
    /// Percent over budget before a tick is flagged.
    pub tick_threshold: u32,
    /// Freeze the time of day while no one is logged in.
    pub offline_freeze: bool,
    /// Radius, in columns, of the view square served at login.
    pub view_distance: i32,
    /// World type used to pick generators.
    pub world_type: String,
    /// Keepalive probe period in milliseconds.
    pub keepalive_interval: u64,
    /// Disconnect peers idle longer than this; zero disables.
    pub idle_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            binds: format!("0.0.0.0:{}", DEFAULT_PORT),
            num_threads: 10,
            io_workers: 0,
            max_bytes: 0,
            max_players: 0,
            world_unload_interval: 60_000,
            tick_length: 50,
            tick_threshold: 10,
            offline_freeze: true,
            view_distance: 2,
            world_type: "default".to_owned(),
            keepalive_interval: 3_000,
            idle_timeout: 30_000,
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ServerConfig {
        serdeconv::from_toml_file(path).expect("Error loading server configuration file")
    }

    pub fn from_toml_str(toml: &str) -> ServerConfig {
        serdeconv::from_toml_str(toml).expect("Error parsing server configuration")
    }

    /// Parses the bind list. Empty entries are skipped; an empty list falls
    /// back to all interfaces on the default port.
    pub fn parse_binds(&self) -> Result<Vec<SocketAddr>, AddrParseError> {
        let mut addrs = Vec::new();
        for entry in self.binds.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            addrs.push(entry.parse()?);
        }

        if addrs.is_empty() {
            addrs.push(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)));
        }
        Ok(addrs)
    }

    /// Applies one recognized setting. Returns false for unknown keys or
    /// unparseable values.
    pub fn apply_setting(&mut self, key: &str, value: &str) -> bool {
        fn truthy(value: &str) -> bool {
            matches!(
                value.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        }

        match key {
            "binds" => self.binds = value.to_owned(),
            "num_threads" => match value.parse() {
                Ok(parsed) => self.num_threads = parsed,
                Err(_) => return false,
            },
            "io_workers" => match value.parse() {
                Ok(parsed) => self.io_workers = parsed,
                Err(_) => return false,
            },
            "max_bytes" => match value.parse() {
                Ok(parsed) => self.max_bytes = parsed,
                Err(_) => return false,
            },
            "max_players" => match value.parse() {
                Ok(parsed) => self.max_players = parsed,
                Err(_) => return false,
            },
            "world_unload_interval" => match value.parse() {
                Ok(parsed) => self.world_unload_interval = parsed,
                Err(_) => return false,
            },
            "tick_length" => match value.parse() {
                Ok(parsed) => self.tick_length = parsed,
                Err(_) => return false,
            },
            "tick_threshold" => match value.parse() {
                Ok(parsed) => self.tick_threshold = parsed,
                Err(_) => return false,
            },
            "offline_freeze" => self.offline_freeze = truthy(value),
            "view_distance" => match value.parse() {
                Ok(parsed) => self.view_distance = parsed,
                Err(_) => return false,
            },
            "world_type" => self.world_type = value.to_owned(),
            "keepalive_interval" => match value.parse() {
                Ok(parsed) => self.keepalive_interval = parsed,
                Err(_) => return false,
            },
            "idle_timeout" => match value.parse() {
                Ok(parsed) => self.idle_timeout = parsed,
                Err(_) => return false,
            },
            _ => return false,
        }
        true
    }

    /// Overlays settings stored with the data provider.
    pub fn apply_provider(&mut self, data: &dyn DataProvider, log: &Logger) {
        for key in RECOGNIZED_KEYS {
            match data.get_setting(key) {
                Ok(Some(value)) => {
                    if !self.apply_setting(key, &value) {
                        logging::warn!(log, "ignoring unparseable setting";
                                       "key" => *key, "value" => %value);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    logging::warn!(log, "failed to read setting";
                                   "key" => *key, "error" => %err);
                }
            }
        }
    }
}
