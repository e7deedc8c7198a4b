//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP server to (0 scans the default range).
    /// Override: `DUOCAST_BIND_PORT`
    pub bind_port: u16,

    /// IP address advertised in artifact URLs. This should be the IP
    /// other devices on the network can reach. If not specified,
    /// auto-detection will be attempted.
    /// Override: `DUOCAST_ADVERTISE_IP`
    pub advertise_ip: Option<IpAddr>,

    /// Directory holding one subdirectory per ingested track.
    /// Override: `DUOCAST_AUDIO_ROOT`
    pub audio_root: PathBuf,

    /// Directory for persistent state (`sessions.json`).
    /// Override: `DUOCAST_DATA_DIR`
    pub data_dir: PathBuf,

    /// External fetcher command.
    pub fetcher_bin: String,

    /// External transcoder command.
    pub transcoder_bin: String,

    /// External probe command.
    pub probe_bin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = duocast_core::Config::default();
        Self {
            bind_port: 0,
            advertise_ip: None,
            audio_root: core.audio_root,
            data_dir: core.data_dir,
            fetcher_bin: core.fetcher_bin,
            transcoder_bin: core.transcoder_bin,
            probe_bin: core.probe_bin,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("DUOCAST_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }

        if let Ok(val) = std::env::var("DUOCAST_ADVERTISE_IP") {
            if let Ok(ip) = val.parse() {
                self.advertise_ip = Some(ip);
            }
        }

        if let Ok(val) = std::env::var("DUOCAST_AUDIO_ROOT") {
            self.audio_root = PathBuf::from(val);
        }

        // Note: DUOCAST_DATA_DIR is handled by clap via #[arg(env = ...)] in main.rs
    }

    /// Converts to duocast-core's Config type.
    pub fn to_core_config(&self) -> duocast_core::Config {
        duocast_core::Config {
            audio_root: self.audio_root.clone(),
            data_dir: self.data_dir.clone(),
            fetcher_bin: self.fetcher_bin.clone(),
            transcoder_bin: self.transcoder_bin.clone(),
            probe_bin: self.probe_bin.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_core_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_port, 0);
        assert_eq!(config.fetcher_bin, "fetcher");
        assert_eq!(config.transcoder_bin, "transcoder");
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("duocast.yaml");
        std::fs::write(
            &path,
            "bind_port: 4407\naudio_root: /srv/duocast/audio\nfetcher_bin: yt-dlp-wrapper\n",
        )
        .unwrap();

        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.bind_port, 4407);
        assert_eq!(config.audio_root, PathBuf::from("/srv/duocast/audio"));
        assert_eq!(config.fetcher_bin, "yt-dlp-wrapper");
        // Untouched keys keep their defaults
        assert_eq!(config.probe_bin, "probe");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(ServerConfig::load(Some(Path::new("/nonexistent/duocast.yaml"))).is_err());
    }

    #[test]
    fn core_config_carries_tool_commands() {
        let config = ServerConfig::default();
        let core = config.to_core_config();
        assert_eq!(core.fetcher_bin, config.fetcher_bin);
        assert_eq!(core.audio_root, config.audio_root);
        assert!(core.validate().is_ok());
    }
}
