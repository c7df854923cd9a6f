//! Startup configuration loaded from `.config` files.
//!
//! A config file is JSON: device identity (`Name`, `Model`, `Type`), the
//! channel descriptors (`Channels`), and the links to establish when the
//! named peers are discovered (`Connections`). Configuration errors are
//! fatal at startup.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use virgil_types::Parameter;

use crate::connections::DeviceConnection;

/// Extension used by node configuration files.
pub const CONFIG_EXTENSION: &str = "config";

#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Model")]
    pub model: String,
    #[serde(rename = "Type")]
    pub device_type: String,
    #[serde(rename = "Channels", default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(rename = "Connections", default)]
    pub connections: Vec<ConnectionConfig>,
}

/// One channel descriptor: its address plus its parameter descriptors as
/// top-level keys.
#[derive(Debug, Deserialize)]
pub struct ChannelConfig {
    #[serde(rename = "channelIndex")]
    pub index: i32,
    #[serde(rename = "channelType")]
    pub channel_type: String,
    #[serde(flatten)]
    pub parameters: BTreeMap<String, Parameter>,
}

/// A known link: a peer we want to link to whenever it is on the network.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub name: String,
    pub self_index: i32,
    pub self_type: String,
    #[serde(default)]
    pub channel_index: Option<i32>,
    #[serde(default)]
    pub channel_type: Option<String>,
}

impl ConnectionConfig {
    pub fn to_connection(&self) -> DeviceConnection {
        DeviceConnection {
            peer_name: self.name.clone(),
            self_index: self.self_index,
            self_type: self.self_type.clone(),
            remote_index: self.channel_index,
            remote_type: self.channel_type.clone(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "could not read config: {e}"),
            ConfigError::Parse(e) => write!(f, "malformed config: {e}"),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = serde_json::from_str(contents).map_err(ConfigError::Parse)?;
        if config.name.is_empty() {
            return Err(ConfigError::Invalid("'Name' must not be empty".into()));
        }
        let mut seen = Vec::new();
        for channel in &config.channels {
            let key = (channel.index, channel.channel_type.clone());
            if seen.contains(&key) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate channel {}/{}",
                    channel.index, channel.channel_type
                )));
            }
            seen.push(key);
        }
        Ok(config)
    }
}

/// All `*.config` files directly inside `dir`, sorted by file name.
pub fn list_config_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file() && path.extension().is_some_and(|ext| ext == CONFIG_EXTENSION)
        })
        .collect();
    files.sort();
    Ok(files)
}
