//! Error types for the LANrage core

use thiserror::Error;

/// Main error type for LANrage
#[derive(Error, Debug)]
pub enum LanrageError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Platform / WireGuard tooling errors
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    /// NAT discovery and traversal errors
    #[error("NAT error: {0}")]
    Nat(#[from] NatError),

    /// Virtual IP allocation errors
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    /// Control plane errors
    #[error("Control plane error: {0}")]
    Control(#[from] ControlError),

    /// Per-peer connection errors
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    /// Party lifecycle errors
    #[error("Party error: {0}")]
    Party(#[from] PartyError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration errors: fatal at initialization, non-fatal on reload
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid base subnet {value}: {reason}")]
    InvalidSubnet { value: String, reason: String },

    #[error("Keys directory unreadable: {path}")]
    KeysDirUnreadable { path: String },

    #[error("Invalid settings at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Conflicting parameters: {message}")]
    Conflicting { message: String },

    #[error("Unable to determine the user config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// WireGuard tooling / interface errors
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("WireGuard tooling not installed (missing `{tool}`)")]
    NotInstalled { tool: String },

    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("Interface {name} already exists")]
    InterfaceConflict { name: String },

    #[error("Platform not supported: {platform}")]
    Unsupported { platform: String },

    #[error("`{command}` failed with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// NAT discovery and hole-punching errors
#[derive(Error, Debug)]
pub enum NatError {
    /// Every configured STUN server timed out or answered garbage
    #[error("No STUN server responded ({attempted} attempted)")]
    StunFailed { attempted: usize },

    #[error("Hole punch to {peer} got no answer within the ack window")]
    HolePunchFailed { peer: std::net::SocketAddr },

    #[error("Hole punch socket error: {0}")]
    PunchSocket(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Virtual IP allocation errors
#[derive(Error, Debug)]
pub enum IpamError {
    /// The base subnet has no /24 left to materialize
    #[error("Address pool exhausted in {subnet}")]
    PoolExhausted { subnet: String },

    #[error("{ip} is outside the base subnet {subnet}")]
    OutOfRange { ip: String, subnet: String },
}

/// Control plane communication errors
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Control plane unreachable: {message}")]
    Unreachable { message: String },

    #[error("Party {party_id} not found")]
    PartyNotFound { party_id: String },

    #[error("Peer {peer_id} not found")]
    PeerNotFound { peer_id: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors of a single connect attempt, consumed by the orchestrator
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Peer {peer_id} not found in party")]
    PeerNotFound { peer_id: String },

    #[error("No relay reachable")]
    RelayUnreachable,

    #[error("Peer {peer_id} published an invalid public key")]
    InvalidPublicKey { peer_id: String },

    #[error(transparent)]
    Ipam(#[from] IpamError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Control(#[from] ControlError),
}

/// Party lifecycle errors
#[derive(Error, Debug)]
pub enum PartyError {
    #[error("Already in party {party_id}; leave it first")]
    AlreadyInParty { party_id: String },

    #[error("No active party")]
    NoActiveParty,

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Connect(#[from] ConnectError),
}

impl LanrageError {
    /// Check if this error is recoverable
    ///
    /// Recoverable errors are converted into state-machine transitions by
    /// the orchestrator; unrecoverable ones propagate to the caller.
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Fatal errors
            Self::Config(_) => false,
            Self::Platform(PlatformError::NotInstalled { .. }) => false,
            Self::Platform(PlatformError::PermissionDenied { .. }) => false,
            Self::Platform(PlatformError::Unsupported { .. }) => false,
            Self::Ipam(IpamError::PoolExhausted { .. }) => false,

            // Recoverable errors
            Self::Nat(_) => true,
            Self::Control(_) => true,
            Self::Connect(ConnectError::RelayUnreachable) => true,

            // Default to non-recoverable for safety
            _ => false,
        }
    }
}

/// Result type alias for LANrage operations
pub type Result<T> = std::result::Result<T, LanrageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let stun = LanrageError::Nat(NatError::StunFailed { attempted: 5 });
        assert!(stun.is_recoverable());

        let exhausted = LanrageError::Ipam(IpamError::PoolExhausted {
            subnet: "10.66.0.0/16".to_string(),
        });
        assert!(!exhausted.is_recoverable());

        let missing = LanrageError::Platform(PlatformError::NotInstalled {
            tool: "wg".to_string(),
        });
        assert!(!missing.is_recoverable());

        let relay = LanrageError::Connect(ConnectError::RelayUnreachable);
        assert!(relay.is_recoverable());
    }

    #[test]
    fn test_error_display_includes_context() {
        let err = PlatformError::CommandFailed {
            command: "ip link add lanrage0 type wireguard".to_string(),
            status: 2,
            stderr: "RTNETLINK answers: File exists".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("ip link add"));
        assert!(message.contains("File exists"));
    }
}
