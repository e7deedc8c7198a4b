//! Network configuration context for the coordinator.
//!
//! Artifact URLs in `audio_ready` envelopes must be reachable from
//! *other* devices on the network, so the server needs to know the IP
//! it should advertise. [`NetworkContext`] supports explicit
//! configuration (server deployment) and auto-detection.

use std::net::IpAddr;
#[cfg(test)]
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::RwLock;

use duocast_proto::Channel;

/// Network configuration shared across services.
#[derive(Clone)]
pub struct NetworkContext {
    /// Server port (initially 0 if auto-assigned, set when the listener binds).
    port: Arc<RwLock<u16>>,
    /// IP address other devices can reach us at.
    local_ip: Arc<RwLock<String>>,
}

impl NetworkContext {
    /// Creates a `NetworkContext` with explicit configuration.
    #[must_use]
    pub fn explicit(bind_port: u16, advertise_ip: IpAddr) -> Self {
        Self {
            port: Arc::new(RwLock::new(bind_port)),
            local_ip: Arc::new(RwLock::new(advertise_ip.to_string())),
        }
    }

    /// Creates a `NetworkContext` by auto-detecting the local IP.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial IP detection fails.
    pub fn auto_detect(
        preferred_port: u16,
        detector: Arc<dyn IpDetector>,
    ) -> Result<Self, NetworkError> {
        let local_ip = detector.detect()?;
        Ok(Self {
            port: Arc::new(RwLock::new(preferred_port)),
            local_ip: Arc::new(RwLock::new(local_ip)),
        })
    }

    /// Creates a `NetworkContext` for testing with a fixed address.
    #[cfg(test)]
    pub fn for_test() -> Self {
        Self::explicit(4400, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)))
    }

    /// Returns the current port value.
    #[must_use]
    pub fn get_port(&self) -> u16 {
        *self.port.read()
    }

    /// Returns the current local IP.
    #[must_use]
    pub fn get_local_ip(&self) -> String {
        self.local_ip.read().clone()
    }

    /// Sets the port once the listener has bound.
    pub fn set_port(&self, port: u16) {
        *self.port.write() = port;
    }

    /// Returns a `UrlBuilder` for the current network configuration.
    #[must_use]
    pub fn url_builder(&self) -> UrlBuilder {
        UrlBuilder::new(self.get_local_ip(), self.get_port())
    }

    /// Absolute URL for one channel artifact of a track.
    #[must_use]
    pub fn artifact_url(&self, track_id: &str, channel: Channel) -> String {
        self.url_builder().artifact_url(track_id, channel)
    }
}

/// Trait for detecting the local IP address.
///
/// Different environments may need different detection strategies.
pub trait IpDetector: Send + Sync {
    /// Detects the local IP address.
    fn detect(&self) -> Result<String, NetworkError>;
}

/// Default IP detector using the system's network interfaces.
#[derive(Debug, Clone, Default)]
pub struct LocalIpDetector;

impl LocalIpDetector {
    /// Creates a new `LocalIpDetector` wrapped in an Arc.
    #[must_use]
    pub fn arc() -> Arc<dyn IpDetector> {
        Arc::new(Self)
    }
}

impl IpDetector for LocalIpDetector {
    fn detect(&self) -> Result<String, NetworkError> {
        local_ip_address::local_ip()
            .map(|ip| ip.to_string())
            .map_err(|e| NetworkError::Detection(e.to_string()))
    }
}

/// Errors that can occur during network configuration.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Could not detect local IP address.
    #[error("Failed to detect local IP: {0}")]
    Detection(String),
}

/// Builder for URLs the coordinator hands out to clients.
pub struct UrlBuilder {
    ip: String,
    port: u16,
}

impl UrlBuilder {
    /// Creates a new `UrlBuilder` for the given server address.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// Returns the base URL for the server (e.g., `http://192.168.1.100:4400`).
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }

    /// Absolute URL for one channel artifact of a track.
    #[must_use]
    pub fn artifact_url(&self, track_id: &str, channel: Channel) -> String {
        format!(
            "{}/audio/{}/{}",
            self.base_url(),
            track_id,
            channel.artifact_file()
        )
    }

    /// Returns the WebSocket URL clients dial.
    #[must_use]
    pub fn websocket_url(&self) -> String {
        format!("ws://{}:{}/ws", self.ip, self.port)
    }
}
