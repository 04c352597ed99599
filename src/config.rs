//! Startup configuration.
//!
//! Read once from `config.yml`, with `MGW_`-prefixed environment variables
//! layered on top. A missing file yields the built-in defaults, so the
//! gateway always comes up on port 8080 out of the box.

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::Deserialize;

/// Default configuration file path.
pub const CONFIG_FILE: &str = "config.yml";

/// Listener address: either a bare TCP port on the wildcard interface or a
/// full `[network/]host:port` string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Listen {
    Port(u16),
    Addr(String),
}

impl Listen {
    /// The address string handed to the listener parser.
    pub fn address(&self) -> String {
        match self {
            Listen::Port(port) => port.to_string(),
            Listen::Addr(addr) => addr.clone(),
        }
    }
}

impl Default for Listen {
    fn default() -> Self {
        Listen::Port(8080)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Enables verbose error logging.
    pub debug: bool,

    /// Listener address; a bare integer means a TCP port on the wildcard
    /// interface.
    pub listen: Listen,

    /// Upstream read deadline and admin body-read deadline, seconds.
    #[serde(rename = "ReadTimeout", alias = "readtimeout")]
    pub read_timeout: u64,

    /// Header read deadline, seconds.
    #[serde(rename = "ReadHeaderTimeout", alias = "readheadertimeout")]
    pub read_header_timeout: u64,

    /// Upstream write deadline, seconds.
    #[serde(rename = "WriteTimeout", alias = "writetimeout")]
    pub write_timeout: u64,

    /// Keep-alive idle timeout, seconds.
    #[serde(rename = "IdleTimeout", alias = "idletimeout")]
    pub idle_timeout: u64,

    /// Maximum accepted request header size, bytes.
    #[serde(rename = "MaxHeaderBytes", alias = "maxheaderbytes")]
    pub max_header_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: true,
            listen: Listen::default(),
            read_timeout: 10,
            read_header_timeout: 2,
            write_timeout: 10,
            idle_timeout: 4,
            max_header_bytes: 20480,
        }
    }
}

impl Config {
    /// Loads the configuration from `path`, then from `MGW_*` environment
    /// variables. Missing file or missing keys fall back to the defaults.
    pub fn load(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("MGW_"))
            .extract()
    }
}
