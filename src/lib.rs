//! LANrage - peer-to-peer mesh VPN overlay for LAN gaming
//!
//! Gives a party of hosts a virtual LAN (one /16, a /32 per host) carried
//! over WireGuard tunnels across the public Internet: STUN-based NAT
//! discovery, UDP hole punching with relay fallback, per-peer connection
//! monitoring, deterministic virtual IP allocation, and LAN broadcast
//! emulation between tunneled peers.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use lanrage::{PartyRuntime, Settings};
//! use lanrage::control::http::HttpControlPlane;
//! use lanrage::wg::SystemBackend;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load_default()?;
//!     let control = Arc::new(HttpControlPlane::new(&settings.control.url));
//!     let runtime = PartyRuntime::new(
//!         settings,
//!         control,
//!         Arc::new(SystemBackend::new()),
//!         lanrage::keys::keys_dir()?,
//!         "player-one",
//!     )
//!     .await?;
//!     runtime.start().await?;
//!     let party_id = runtime.create_party("lan night").await?;
//!     println!("party {party_id}");
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod control;
pub mod error;
pub mod ipam;
pub mod keys;
pub mod nat;
pub mod orchestrator;
pub mod party;
pub mod peer;
pub mod settings;
pub mod wg;

pub use error::{LanrageError, Result};
pub use party::{PartyRuntime, PartyStatus};
pub use settings::Settings;
