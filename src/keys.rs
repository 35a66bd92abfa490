//! WireGuard key management
//!
//! Generates and persists the host's Curve25519 keypair. Key files are raw
//! 32-byte values; the base64 rendering is only used for interchange with
//! WireGuard tooling and the control plane.

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::ConfigError;

/// Key length for X25519 (both private and public keys are 32 bytes)
pub const KEY_LEN: usize = 32;

const PRIVATE_KEY_FILE: &str = "private.key";
const PUBLIC_KEY_FILE: &str = "public.key";

/// The host's static WireGuard keypair
#[derive(Clone)]
pub struct KeyPair {
    private: [u8; KEY_LEN],
    public: [u8; KEY_LEN],
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never expose the private half
        f.debug_struct("KeyPair")
            .field("public", &self.public_base64())
            .finish()
    }
}

impl KeyPair {
    /// Generate a fresh keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        KeyPair {
            private: secret.to_bytes(),
            public: public.to_bytes(),
        }
    }

    fn from_private(private: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret).to_bytes();
        KeyPair { private, public }
    }

    pub fn public_bytes(&self) -> [u8; KEY_LEN] {
        self.public
    }

    /// Interchange rendering of the public key
    pub fn public_base64(&self) -> String {
        BASE64.encode(self.public)
    }

    pub fn private_base64(&self) -> String {
        BASE64.encode(self.private)
    }

    /// Load the keypair from `dir`, generating and persisting a new one if
    /// absent or unreadable
    ///
    /// The directory is created mode `0700`, the private key file `0600`.
    pub fn load_or_generate(dir: &Path) -> Result<Self, ConfigError> {
        match read_key_file(&dir.join(PRIVATE_KEY_FILE)) {
            Some(private) => {
                let pair = KeyPair::from_private(private);
                // re-derive in case the public file is stale or missing
                let public_path = dir.join(PUBLIC_KEY_FILE);
                if read_key_file(&public_path) != Some(pair.public) {
                    write_key_file(&public_path, &pair.public, 0o644)?;
                }
                Ok(pair)
            }
            None => {
                let pair = KeyPair::generate();
                persist(dir, &pair)?;
                tracing::info!(public_key = %pair.public_base64(), "Generated new WireGuard keypair");
                Ok(pair)
            }
        }
    }
}

/// Decode a base64 interchange key into raw bytes
pub fn decode_public_key(encoded: &str) -> Option<[u8; KEY_LEN]> {
    let bytes = BASE64.decode(encoded).ok()?;
    let key: [u8; KEY_LEN] = bytes.try_into().ok()?;
    // all-zero is the identity point, never a valid peer key
    if key.iter().all(|&b| b == 0) {
        return None;
    }
    Some(key)
}

fn read_key_file(path: &Path) -> Option<[u8; KEY_LEN]> {
    let bytes = fs::read(path).ok()?;
    bytes.try_into().ok()
}

fn write_key_file(path: &Path, key: &[u8; KEY_LEN], mode: u32) -> Result<(), ConfigError> {
    fs::write(path, key)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

fn persist(dir: &Path, pair: &KeyPair) -> Result<(), ConfigError> {
    fs::create_dir_all(dir).map_err(|_| ConfigError::KeysDirUnreadable {
        path: dir.display().to_string(),
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    write_key_file(&dir.join(PRIVATE_KEY_FILE), &pair.private, 0o600)?;
    write_key_file(&dir.join(PUBLIC_KEY_FILE), &pair.public, 0o644)?;
    Ok(())
}

/// Default keys directory under the user config dir
pub fn keys_dir() -> Result<PathBuf, ConfigError> {
    Ok(crate::settings::config_dir()?.join("keys"))
}

/// Write the private key to a file `wg set` can read
///
/// WireGuard tooling takes the base64 form, not raw bytes.
pub fn write_private_key_for_wg(dir: &Path, pair: &KeyPair) -> std::io::Result<PathBuf> {
    let path = dir.join("private.wg");
    fs::write(&path, pair.private_base64())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_derives_matching_public() {
        let pair = KeyPair::generate();
        assert!(!pair.private.iter().all(|&b| b == 0));
        assert_eq!(KeyPair::from_private(pair.private).public, pair.public);
    }

    #[test]
    fn test_load_or_generate_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let first = KeyPair::load_or_generate(dir.path()).unwrap();
        let second = KeyPair::load_or_generate(dir.path()).unwrap();
        assert_eq!(first.public, second.public);
        assert_eq!(first.private, second.private);
    }

    #[test]
    fn test_truncated_private_key_is_regenerated() {
        let dir = tempdir().unwrap();
        let first = KeyPair::load_or_generate(dir.path()).unwrap();

        fs::write(dir.path().join(PRIVATE_KEY_FILE), [0u8; 7]).unwrap();
        let second = KeyPair::load_or_generate(dir.path()).unwrap();
        assert_ne!(first.public, second.public);
    }

    #[test]
    fn test_stale_public_file_is_rewritten() {
        let dir = tempdir().unwrap();
        let pair = KeyPair::load_or_generate(dir.path()).unwrap();

        fs::write(dir.path().join(PUBLIC_KEY_FILE), [9u8; KEY_LEN]).unwrap();
        let reloaded = KeyPair::load_or_generate(dir.path()).unwrap();
        assert_eq!(reloaded.public, pair.public);
        assert_eq!(
            fs::read(dir.path().join(PUBLIC_KEY_FILE)).unwrap(),
            pair.public.to_vec()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        KeyPair::load_or_generate(dir.path()).unwrap();

        let mode = fs::metadata(dir.path().join(PRIVATE_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_decode_public_key_roundtrip() {
        let pair = KeyPair::generate();
        let decoded = decode_public_key(&pair.public_base64()).unwrap();
        assert_eq!(decoded, pair.public);
    }

    #[test]
    fn test_decode_public_key_rejects_garbage() {
        assert!(decode_public_key("not base64!!!").is_none());
        assert!(decode_public_key(&BASE64.encode([0u8; 32])).is_none());
        assert!(decode_public_key(&BASE64.encode([1u8; 16])).is_none());
    }
}
