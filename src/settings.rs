//! Runtime configuration
//!
//! Settings ship with the documented defaults and can be overridden by a
//! `settings.json` in the user config directory. Every timeout and
//! threshold the subsystems consume lives here so tests can shrink them.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const SETTINGS_FILE: &str = "settings.json";

const QUALIFIER: &str = "io";
const ORGANIZATION: &str = "lanrage";
const APPLICATION: &str = "lanrage";

/// Top-level runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub network: NetworkSettings,
    pub nat: NatSettings,
    pub monitor: MonitorSettings,
    pub broadcast: BroadcastSettings,
    pub control: ControlSettings,
}

/// Overlay network parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Base subnet virtual IPs are allocated from
    pub base_subnet: Ipv4Net,
    /// Overlay interface name
    pub interface: String,
    pub mtu: u16,
    /// UDP port WireGuard listens on (shared with the hole puncher)
    pub listen_port: u16,
    /// Persistent keepalive applied to every peer behind NAT, seconds
    pub persistent_keepalive_s: u16,
    /// UDP port the broadcast carrier listens on (overlay side)
    pub carrier_port: u16,
}

/// NAT discovery parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatSettings {
    /// Ordered STUN server list, tried first to last
    pub stun_servers: Vec<String>,
    pub stun_timeout_s: u64,
    pub punch_probe_count: u32,
    pub punch_spacing_ms: u64,
    pub punch_ack_window_s: u64,
}

/// Connection health monitoring parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub interval_s: u64,
    pub degraded_threshold_ms: u64,
    pub failed_threshold_ms: u64,
    /// Consecutive failed probes before a reconnect is attempted
    pub failure_strikes: u32,
    pub max_reconnect_attempts: u32,
    pub cleanup_grace_s: u64,
    pub latency_probe_timeout_s: u64,
    pub latency_samples: u32,
    pub relay_probe_timeout_s: u64,
    /// A candidate relay must beat the current one by this fraction
    pub relay_switch_improvement: f64,
}

/// Broadcast emulation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    pub dedup_window_s: u64,
    /// Bounded per-peer forward queue; a slow peer drops its own packets
    pub channel_capacity: usize,
}

/// Control plane parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub url: String,
    pub heartbeat_interval_s: u64,
    /// Operator-configured relay, used when the directory is unreachable
    pub fallback_relay: Option<String>,
    /// Last-resort relay endpoint
    pub default_relay: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            network: NetworkSettings::default(),
            nat: NatSettings::default(),
            monitor: MonitorSettings::default(),
            broadcast: BroadcastSettings::default(),
            control: ControlSettings::default(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            base_subnet: "10.66.0.0/16".parse().expect("valid default subnet"),
            interface: "lanrage0".to_string(),
            mtu: 1420,
            listen_port: 51820,
            persistent_keepalive_s: 25,
            carrier_port: 51821,
        }
    }
}

impl Default for NatSettings {
    fn default() -> Self {
        NatSettings {
            stun_servers: vec![
                "stun.l.google.com:19302".to_string(),
                "stun1.l.google.com:19302".to_string(),
                "stun2.l.google.com:19302".to_string(),
                "stun.cloudflare.com:3478".to_string(),
                "stun.ekiga.net:3478".to_string(),
            ],
            stun_timeout_s: 3,
            punch_probe_count: 5,
            punch_spacing_ms: 100,
            punch_ack_window_s: 2,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        MonitorSettings {
            interval_s: 30,
            degraded_threshold_ms: 200,
            failed_threshold_ms: 2000,
            failure_strikes: 3,
            max_reconnect_attempts: 3,
            cleanup_grace_s: 60,
            latency_probe_timeout_s: 2,
            latency_samples: 3,
            relay_probe_timeout_s: 1,
            relay_switch_improvement: 0.20,
        }
    }
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        BroadcastSettings {
            dedup_window_s: 5,
            channel_capacity: 256,
        }
    }
}

impl Default for ControlSettings {
    fn default() -> Self {
        ControlSettings {
            url: "https://party.lanrage.io".to_string(),
            heartbeat_interval_s: 30,
            fallback_relay: None,
            default_relay: "relay.lanrage.io:51820".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from the given file, or defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings = match fs::read_to_string(path) {
            Ok(json) => {
                serde_json::from_str::<Settings>(&json).map_err(|e| ConfigError::ParseError {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No settings file, using defaults");
                Settings::default()
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Load from the default location in the user config directory
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(&config_dir()?.join(SETTINGS_FILE))
    }

    /// Reject configurations the subsystems cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.base_subnet.prefix_len() > 24 {
            return Err(ConfigError::InvalidSubnet {
                value: self.network.base_subnet.to_string(),
                reason: "prefix must leave room for at least one /24".to_string(),
            });
        }
        if self.monitor.degraded_threshold_ms >= self.monitor.failed_threshold_ms {
            return Err(ConfigError::Conflicting {
                message: format!(
                    "degraded threshold ({} ms) must be below failed threshold ({} ms)",
                    self.monitor.degraded_threshold_ms, self.monitor.failed_threshold_ms
                ),
            });
        }
        if self.network.listen_port == self.network.carrier_port {
            return Err(ConfigError::Conflicting {
                message: "listen_port and carrier_port must differ".to_string(),
            });
        }
        if self.nat.stun_servers.is_empty() {
            return Err(ConfigError::Conflicting {
                message: "at least one STUN server is required".to_string(),
            });
        }
        if let Some(relay) = &self.control.fallback_relay {
            if !relay.contains(':') {
                return Err(ConfigError::Conflicting {
                    message: format!("fallback relay `{relay}` is missing a port"),
                });
            }
        }
        Ok(())
    }

    pub fn stun_timeout(&self) -> Duration {
        Duration::from_secs(self.nat.stun_timeout_s)
    }

    pub fn punch_ack_window(&self) -> Duration {
        Duration::from_secs(self.nat.punch_ack_window_s)
    }

    pub fn punch_spacing(&self) -> Duration {
        Duration::from_millis(self.nat.punch_spacing_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.interval_s)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs(self.monitor.cleanup_grace_s)
    }

    pub fn latency_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.latency_probe_timeout_s)
    }

    pub fn relay_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.relay_probe_timeout_s)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.broadcast.dedup_window_s)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.control.heartbeat_interval_s)
    }
}

/// Resolve (and create) the user config directory
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    let dirs =
        ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION).ok_or(ConfigError::NoConfigDir)?;
    let dir = dirs.config_dir().to_path_buf();
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.network.base_subnet.to_string(), "10.66.0.0/16");
        assert_eq!(settings.network.mtu, 1420);
        assert_eq!(settings.network.listen_port, 51820);
        assert_eq!(settings.monitor.interval_s, 30);
        assert_eq!(settings.monitor.cleanup_grace_s, 60);
        assert_eq!(settings.nat.stun_servers.len(), 5);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let settings = Settings::load(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.broadcast.dedup_window_s, 5);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"monitor": {"interval_s": 5}}"#).unwrap();
        file.flush().unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.monitor.interval_s, 5);
        // untouched sections keep defaults
        assert_eq!(settings.monitor.cleanup_grace_s, 60);
        assert_eq!(settings.network.interface, "lanrage0");
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        file.flush().unwrap();

        let err = Settings::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_subnet_without_room_for_a_slash_24_is_rejected() {
        let mut settings = Settings::default();
        settings.network.base_subnet = "10.66.0.0/28".parse().unwrap();
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSubnet { .. }));
    }

    #[test]
    fn test_inverted_thresholds_are_rejected() {
        let mut settings = Settings::default();
        settings.monitor.degraded_threshold_ms = 3000;
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Conflicting { .. }));
    }

    #[test]
    fn test_fallback_relay_needs_a_port() {
        let mut settings = Settings::default();
        settings.control.fallback_relay = Some("relay.example.net".to_string());
        assert!(settings.validate().is_err());

        settings.control.fallback_relay = Some("relay.example.net:51820".to_string());
        settings.validate().unwrap();
    }
}
