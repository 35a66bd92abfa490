//! Monitored port management
//!
//! The set of UDP ports under capture is the union of the ports declared
//! by active game profiles and a user-maintained whitelist persisted as
//! JSON. Ownership is reference-counted by tag, so a port shared by two
//! games only stops listening when both release it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Owner tag of the user-maintained whitelist; survives profile churn
pub const USER_WHITELIST_OWNER: &str = "user-whitelist";

/// File name of the persisted whitelist in the config directory
pub const WHITELIST_FILE: &str = "custom_broadcast_ports.json";

/// A built-in game profile's discovery ports
#[derive(Debug, Clone, Copy)]
pub struct GameProfile {
    pub name: &'static str,
    pub ports: &'static [u16],
    /// Whether the game discovers sessions via UDP broadcast/multicast
    pub broadcast: bool,
}

/// Games LANrage knows out of the box
pub const GAME_PROFILES: &[GameProfile] = &[
    GameProfile { name: "minecraft", ports: &[4445], broadcast: true },
    GameProfile { name: "terraria", ports: &[7777], broadcast: true },
    GameProfile { name: "factorio", ports: &[34197], broadcast: true },
    GameProfile { name: "warcraft3", ports: &[6112], broadcast: true },
    GameProfile { name: "quake3", ports: &[27960], broadcast: true },
    GameProfile { name: "valheim", ports: &[2456, 2457], broadcast: true },
    GameProfile { name: "stardew", ports: &[24642], broadcast: true },
    // multiplayer is invite-only, nothing to capture
    GameProfile { name: "fortresscraft", ports: &[], broadcast: false },
];

pub fn profile(name: &str) -> Option<&'static GameProfile> {
    GAME_PROFILES.iter().find(|p| p.name == name)
}

/// Reference-counted port ownership
#[derive(Default)]
pub struct PortRegistry {
    owners: HashMap<u16, HashSet<String>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest; returns true when the port was not listened on
    pub fn add(&mut self, port: u16, owner: &str) -> bool {
        let owners = self.owners.entry(port).or_default();
        let fresh = owners.is_empty();
        owners.insert(owner.to_string());
        fresh
    }

    /// Drop one owner's interest in every port it holds; returns the ports
    /// whose refcount reached zero
    pub fn release_owner(&mut self, owner: &str) -> Vec<u16> {
        let mut released = Vec::new();
        self.owners.retain(|port, owners| {
            owners.remove(owner);
            if owners.is_empty() {
                released.push(*port);
                false
            } else {
                true
            }
        });
        released.sort_unstable();
        released
    }

    /// Ports currently under capture, sorted
    pub fn ports(&self) -> Vec<u16> {
        let set: BTreeSet<u16> = self.owners.keys().copied().collect();
        set.into_iter().collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WhitelistFile {
    ports: Vec<WhitelistEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WhitelistEntry {
    port: u16,
    protocol: String,
}

/// Read the persisted whitelist; a missing file is an empty whitelist
pub fn load_whitelist(path: &Path) -> Result<Vec<u16>, ConfigError> {
    let json = match fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ConfigError::Io(e)),
    };
    let file: WhitelistFile = serde_json::from_str(&json).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(file
        .ports
        .into_iter()
        .filter(|entry| entry.protocol.eq_ignore_ascii_case("udp"))
        .map(|entry| entry.port)
        .collect())
}

/// Persist the whitelist atomically (write-temp-then-rename)
pub fn save_whitelist(path: &Path, ports: &[u16]) -> Result<(), ConfigError> {
    let file = WhitelistFile {
        ports: ports
            .iter()
            .map(|&port| WhitelistEntry {
                port,
                protocol: "udp".to_string(),
            })
            .collect(),
    };
    let json = serde_json::to_string_pretty(&file).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_add_reports_fresh_only_once() {
        let mut registry = PortRegistry::new();
        assert!(registry.add(7777, "game:terraria"));
        assert!(!registry.add(7777, USER_WHITELIST_OWNER));
        assert_eq!(registry.ports(), vec![7777]);
    }

    #[test]
    fn test_shared_port_survives_one_owner_leaving() {
        let mut registry = PortRegistry::new();
        registry.add(7777, "game:terraria");
        registry.add(7777, USER_WHITELIST_OWNER);
        registry.add(4445, "game:minecraft");

        // terraria leaves: 7777 still whitelisted, nothing torn down
        assert!(registry.release_owner("game:terraria").is_empty());
        assert_eq!(registry.ports(), vec![4445, 7777]);

        // whitelist cleared: 7777 finally released
        assert_eq!(registry.release_owner(USER_WHITELIST_OWNER), vec![7777]);
        assert_eq!(registry.ports(), vec![4445]);
    }

    #[test]
    fn test_release_unknown_owner_is_noop() {
        let mut registry = PortRegistry::new();
        registry.add(4445, "game:minecraft");
        assert!(registry.release_owner("game:ghost").is_empty());
        assert_eq!(registry.ports(), vec![4445]);
    }

    #[test]
    fn test_builtin_profiles_resolve() {
        let minecraft = profile("minecraft").unwrap();
        assert!(minecraft.broadcast);
        assert_eq!(minecraft.ports, &[4445]);
        assert!(profile("solitaire").is_none());
    }

    #[test]
    fn test_whitelist_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(WHITELIST_FILE);

        save_whitelist(&path, &[7777, 27015]).unwrap();
        assert_eq!(load_whitelist(&path).unwrap(), vec![7777, 27015]);

        // shape matches the documented format
        let json = fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"port\": 7777"));
        assert!(json.contains("\"protocol\": \"udp\""));
    }

    #[test]
    fn test_missing_whitelist_is_empty() {
        let dir = tempdir().unwrap();
        assert!(load_whitelist(&dir.path().join(WHITELIST_FILE)).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_whitelist_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(WHITELIST_FILE);
        fs::write(&path, "[]").unwrap();
        assert!(matches!(
            load_whitelist(&path).unwrap_err(),
            ConfigError::ParseError { .. }
        ));
    }

    #[test]
    fn test_non_udp_entries_are_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(WHITELIST_FILE);
        fs::write(
            &path,
            r#"{"ports":[{"port":7777,"protocol":"udp"},{"port":8080,"protocol":"tcp"}]}"#,
        )
        .unwrap();
        assert_eq!(load_whitelist(&path).unwrap(), vec![7777]);
    }

    #[test]
    fn test_save_replaces_atomically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(WHITELIST_FILE);
        save_whitelist(&path, &[1111]).unwrap();
        save_whitelist(&path, &[2222]).unwrap();

        assert_eq!(load_whitelist(&path).unwrap(), vec![2222]);
        // no temp file left behind
        assert!(!path.with_extension("json.tmp").exists());
    }
}
